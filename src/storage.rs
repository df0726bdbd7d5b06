use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{SettingsFile, TasksFile, Timestamp};

const TASKS_FILE: &str = "tasks.json";
const SETTINGS_FILE: &str = "settings.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_LIMIT: usize = 5;

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Json(serde_json::Error),
    InvalidBackupName(String),
    /// The file parsed but its contents are unusable.
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "io error: {err}"),
            StorageError::Json(err) => write!(f, "json error: {err}"),
            StorageError::InvalidBackupName(name) => write!(f, "invalid backup name: {name}"),
            StorageError::Corrupt(message) => write!(f, "corrupt data: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            StorageError::Json(err) => Some(err),
            StorageError::InvalidBackupName(_) | StorageError::Corrupt(_) => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        StorageError::Json(value)
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.root.join(BACKUP_DIR))?;
        Ok(())
    }

    /// `Ok(None)` when the file has never been written.
    pub fn load_tasks(&self) -> Result<Option<TasksFile>, StorageError> {
        self.load_optional(self.root.join(TASKS_FILE))
    }

    pub fn load_settings(&self) -> Result<Option<SettingsFile>, StorageError> {
        self.load_optional(self.root.join(SETTINGS_FILE))
    }

    /// With `backup_at`, the previous file is first copied to a backup stamped with that time.
    pub fn save_tasks(
        &self,
        data: &TasksFile,
        backup_at: Option<Timestamp>,
    ) -> Result<(), StorageError> {
        if let Some(at) = backup_at {
            return self.write_with_backup(TASKS_FILE, data, at);
        }
        self.write_atomic(self.root.join(TASKS_FILE), data)
    }

    pub fn save_settings(&self, data: &SettingsFile) -> Result<(), StorageError> {
        self.write_atomic(self.root.join(SETTINGS_FILE), data)
    }

    fn load_optional<T: DeserializeOwned>(&self, path: PathBuf) -> Result<Option<T>, StorageError> {
        match self.load_json(path) {
            Ok(data) => Ok(Some(data)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn load_json<T: DeserializeOwned>(&self, path: PathBuf) -> Result<T, StorageError> {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(serde_json::from_str(&buf)?)
    }

    fn write_with_backup<T: Serialize>(
        &self,
        filename: &str,
        data: &T,
        at: Timestamp,
    ) -> Result<(), StorageError> {
        let path = self.root.join(filename);
        if path.exists() {
            self.create_backup(&path, at)?;
        }
        self.write_atomic(path, data)
    }

    fn write_atomic<T: Serialize>(&self, path: PathBuf, data: &T) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(data)?;
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }

    /// Copies the current tasks file into `backups/`. Returns the backup file name,
    /// or `None` when there is nothing on disk to back up yet.
    pub fn backup_current(&self, at: Timestamp) -> Result<Option<String>, StorageError> {
        let path = self.root.join(TASKS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        self.create_backup(&path, at).map(Some)
    }

    fn create_backup(&self, path: &Path, at: Timestamp) -> Result<String, StorageError> {
        let timestamp = at.with_timezone(&chrono::Local).format("%Y%m%d-%H%M%S%3f");
        let backup_name = format!("tasks-{timestamp}.json");
        let backup_path = self.root.join(BACKUP_DIR).join(&backup_name);
        fs::copy(path, backup_path)?;
        self.trim_backups()?;
        log::info!("storage: backup created name={backup_name}");
        Ok(backup_name)
    }

    pub fn list_backups(&self) -> Result<Vec<(String, i64)>, StorageError> {
        let mut results = Vec::new();
        for entry in self.sorted_backups()? {
            if let Some(name) = entry.file_name().to_str() {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|dur| dur.as_secs() as i64)
                    .unwrap_or(0);
                results.push((name.to_string(), modified));
            }
        }
        Ok(results)
    }

    /// Reads a backup without touching the live tasks file.
    pub fn read_backup(&self, filename: &str) -> Result<TasksFile, StorageError> {
        if !is_plain_file_name(filename) {
            return Err(StorageError::InvalidBackupName(filename.to_string()));
        }
        self.load_json(self.root.join(BACKUP_DIR).join(filename))
    }

    pub fn read_external(&self, source: &Path) -> Result<TasksFile, StorageError> {
        self.load_json(source.to_path_buf())
    }

    fn trim_backups(&self) -> Result<(), StorageError> {
        let entries = self.sorted_backups()?;
        let to_remove = entries.len().saturating_sub(BACKUP_LIMIT);
        for entry in entries.into_iter().take(to_remove) {
            if let Err(err) = fs::remove_file(entry.path()) {
                log::warn!(
                    "storage: failed to trim backup path={} err={err}",
                    entry.path().display()
                );
            }
        }
        Ok(())
    }

    /// Backup entries, oldest first. Names carry the creation time and break mtime ties.
    fn sorted_backups(&self) -> Result<Vec<fs::DirEntry>, StorageError> {
        let mut entries: Vec<_> = fs::read_dir(self.root.join(BACKUP_DIR))?
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok();
                (modified, entry.file_name(), entry)
            })
            .collect();
        entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        Ok(entries.into_iter().map(|(_, _, entry)| entry).collect())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path.file_name().and_then(|n| n.to_str()) == Some(name)
        && name != "."
        && name != ".."
}
