use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Datelike, Local, Utc};

use crate::dates::{parse_due_date, sort_by_due_date};
use crate::models::{
    BackupSchedule, NewTask, ParsePriorityError, Priority, Settings, SettingsFile, Task, TaskId,
    TaskUpdate, TaskView, TasksFile, Timestamp, SCHEMA_VERSION,
};
use crate::storage::{Storage, StorageError};

#[derive(Debug)]
pub enum StoreError {
    Validation(String),
    NotFound(TaskId),
    Storage(StorageError),
}

impl StoreError {
    /// Stable code reported to callers next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Validation(_) => "validation",
            StoreError::NotFound(_) => "not_found",
            StoreError::Storage(_) => "storage",
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Validation(message) => write!(f, "validation error: {message}"),
            StoreError::NotFound(id) => write!(f, "task not found: {id}"),
            StoreError::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(value: StorageError) -> Self {
        StoreError::Storage(value)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
struct StoreData {
    next_id: TaskId,
    tasks: Vec<Task>,
    settings: Settings,
}

impl StoreData {
    fn tasks_file(&self) -> TasksFile {
        TasksFile {
            schema_version: SCHEMA_VERSION,
            next_id: self.next_id,
            tasks: self.tasks.clone(),
        }
    }

    fn settings_file(&self) -> SettingsFile {
        SettingsFile {
            schema_version: SCHEMA_VERSION,
            settings: self.settings.clone(),
        }
    }

    fn find_mut(&mut self, id: TaskId) -> Result<&mut Task, StoreError> {
        self.tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

/// Shared handle to the task collection.
///
/// Every mutation runs under the write lock against a copy of the data; the copy
/// replaces the live data only after it has been persisted, so a failed call leaves
/// both memory and disk as they were.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<RwLock<StoreData>>,
    storage: Option<Storage>,
    clock: Arc<dyn Clock>,
}

impl TaskStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::from_parts(None, 1, Vec::new(), Settings::default(), Arc::new(SystemClock))
    }

    /// Opens (or initialises) the store persisted under `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        Self::open_with_clock(root, Arc::new(SystemClock))
    }

    pub fn open_with_clock(root: &Path, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let storage = Storage::new(root.to_path_buf());
        storage.ensure_dirs()?;
        let mut tasks = storage.load_tasks()?.unwrap_or_else(TasksFile::empty);
        let settings = storage
            .load_settings()?
            .map(|data| data.settings)
            .unwrap_or_default();
        let next_id = match validate_tasks_file(&mut tasks) {
            Ok(next_id) => next_id,
            Err(err) => return Err(StorageError::Corrupt(err.to_string()).into()),
        };
        log::info!(
            "store: opened root={} tasks={} next_id={next_id}",
            root.display(),
            tasks.tasks.len(),
        );
        Ok(Self::from_parts(Some(storage), next_id, tasks.tasks, settings, clock))
    }

    /// Builds a store over already loaded data. Fails with `Validation` when the tasks
    /// carry blank titles, duplicate ids, `createdAt > updatedAt` or no free next id.
    pub fn with_clock(
        storage: Option<Storage>,
        mut tasks: TasksFile,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let next_id = validate_tasks_file(&mut tasks)?;
        Ok(Self::from_parts(storage, next_id, tasks.tasks, settings, clock))
    }

    fn from_parts(
        storage: Option<Storage>,
        next_id: TaskId,
        tasks: Vec<Task>,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreData {
                next_id,
                tasks,
                settings,
            })),
            storage,
            clock,
        }
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    // Mutations commit a fully built copy, so a poisoned lock still guards whole data.
    fn read(&self) -> RwLockReadGuard<'_, StoreData> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreData> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut StoreData, Timestamp) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.write();
        let now = self.clock.now();
        let mut next = guard.clone();
        let out = op(&mut next, now)?;
        self.persist(&mut next, now)?;
        *guard = next;
        Ok(out)
    }

    fn persist(&self, data: &mut StoreData, now: Timestamp) -> Result<(), StoreError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let with_backup = should_auto_backup(&data.settings, now);
        if with_backup {
            // A recorded backup time without the backup only delays the next one.
            data.settings.last_backup_at = Some(now);
            storage.save_settings(&data.settings_file())?;
        }
        storage.save_tasks(&data.tasks_file(), with_backup.then_some(now))?;
        Ok(())
    }

    pub fn list_all(&self) -> Vec<Task> {
        self.read().tasks.clone()
    }

    pub fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.read()
            .tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub fn view(&self) -> TaskView {
        let (mut completed, mut pending): (Vec<Task>, Vec<Task>) =
            self.list_all().into_iter().partition(|task| task.done);
        sort_by_due_date(&mut pending);
        sort_by_due_date(&mut completed);
        TaskView { pending, completed }
    }

    pub fn add(&self, input: NewTask) -> Result<Task, StoreError> {
        let title = validate_title(&input.title)?;
        let priority = validate_priority(&input.priority)?;
        let due_date = validate_due_date(&input.due_date)?;
        let task = self.mutate(|data, now| {
            let id = data.next_id;
            data.next_id = id
                .checked_add(1)
                .ok_or_else(|| StoreError::Validation("task ids are exhausted".to_string()))?;
            let task = Task {
                id,
                title,
                done: false,
                priority,
                due_date,
                created_at: now,
                updated_at: now,
            };
            data.tasks.push(task.clone());
            Ok(task)
        })?;
        log::info!("store: add id={} priority={}", task.id, task.priority);
        Ok(task)
    }

    pub fn update(&self, input: TaskUpdate) -> Result<Task, StoreError> {
        let task = self.mutate(|data, now| {
            let task = data.find_mut(input.id)?;
            let title = validate_title(&input.title)?;
            let priority = validate_priority(&input.priority)?;
            let due_date = validate_due_date(&input.due_date)?;
            task.title = title;
            task.priority = priority;
            task.due_date = due_date;
            touch(task, now);
            Ok(task.clone())
        })?;
        log::info!("store: update id={}", task.id);
        Ok(task)
    }

    pub fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.mutate(|data, _| {
            let before = data.tasks.len();
            data.tasks.retain(|task| task.id != id);
            if data.tasks.len() == before {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })?;
        log::info!("store: delete id={id}");
        Ok(())
    }

    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let removed = self.mutate(|data, _| {
            let removed = data.tasks.len();
            data.tasks.clear();
            Ok(removed)
        })?;
        log::info!("store: delete_all removed={removed}");
        Ok(removed)
    }

    pub fn toggle_completion(&self, id: TaskId) -> Result<Task, StoreError> {
        let task = self.mutate(|data, now| {
            let task = data.find_mut(id)?;
            task.done = !task.done;
            touch(task, now);
            Ok(task.clone())
        })?;
        log::info!("store: toggle id={} done={}", task.id, task.done);
        Ok(task)
    }

    pub fn clear_completed(&self) -> Result<usize, StoreError> {
        let removed = self.mutate(|data, _| {
            let before = data.tasks.len();
            data.tasks.retain(|task| !task.done);
            Ok(before - data.tasks.len())
        })?;
        log::info!("store: clear_completed removed={removed}");
        Ok(removed)
    }

    /// Replaces the whole collection, e.g. from a backup. Ids already handed out stay retired.
    /// Rejects the same data `with_clock` rejects and leaves the collection unchanged.
    pub fn replace_tasks(&self, mut file: TasksFile) -> Result<Vec<Task>, StoreError> {
        let next_id = validate_tasks_file(&mut file)?;
        let tasks = self.mutate(|data, _| {
            data.tasks = file.tasks;
            data.next_id = next_id.max(data.next_id);
            Ok(data.tasks.clone())
        })?;
        log::info!("store: replace_tasks count={}", tasks.len());
        Ok(tasks)
    }

    pub fn settings(&self) -> Settings {
        self.read().settings.clone()
    }

    pub fn update_settings(&self, settings: Settings) -> Result<Settings, StoreError> {
        let mut guard = self.write();
        let mut next = guard.clone();
        next.settings = settings;
        if let Some(storage) = &self.storage {
            storage.save_settings(&next.settings_file())?;
        }
        *guard = next;
        Ok(guard.settings.clone())
    }

    /// Writes a backup of the persisted tasks now and records the time.
    /// Returns `None` for in-memory stores.
    pub fn create_backup(&self) -> Result<Option<String>, StoreError> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let mut guard = self.write();
        let now = self.clock.now();
        let mut next = guard.clone();
        storage.save_tasks(&next.tasks_file(), None)?;
        let name = storage.backup_current(now)?;
        next.settings.last_backup_at = Some(now);
        storage.save_settings(&next.settings_file())?;
        *guard = next;
        Ok(name)
    }
}

fn touch(task: &mut Task, now: Timestamp) {
    task.updated_at = now.max(task.updated_at);
}

fn validate_title(title: &str) -> Result<String, StoreError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation("title must not be blank".to_string()));
    }
    Ok(trimmed.to_string())
}

fn validate_priority(priority: &str) -> Result<Priority, StoreError> {
    priority
        .parse()
        .map_err(|err: ParsePriorityError| StoreError::Validation(err.to_string()))
}

fn validate_due_date(due_date: &str) -> Result<Timestamp, StoreError> {
    parse_due_date(due_date).map_err(|err| StoreError::Validation(err.to_string()))
}

/// Checks tasks coming from a file and trims their titles. Returns the next free id.
fn validate_tasks_file(file: &mut TasksFile) -> Result<TaskId, StoreError> {
    for task in &mut file.tasks {
        task.title = validate_title(&task.title)
            .map_err(|_| StoreError::Validation(format!("task {} has a blank title", task.id)))?;
        if task.created_at > task.updated_at {
            return Err(StoreError::Validation(format!(
                "task {} was updated before it was created",
                task.id
            )));
        }
    }
    validate_unique_ids(&file.tasks)?;
    file.effective_next_id()
        .ok_or_else(|| StoreError::Validation(format!("task id {} is out of range", TaskId::MAX)))
}

fn validate_unique_ids(tasks: &[Task]) -> Result<(), StoreError> {
    let mut ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
    ids.sort_unstable();
    if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(StoreError::Validation(format!(
            "duplicate task id {}",
            pair[0]
        )));
    }
    Ok(())
}

fn should_auto_backup(settings: &Settings, now: Timestamp) -> bool {
    let Some(last) = settings.last_backup_at else {
        return settings.backup_schedule != BackupSchedule::None;
    };
    let last = last.with_timezone(&Local);
    let now = now.with_timezone(&Local);
    match settings.backup_schedule {
        BackupSchedule::None => false,
        BackupSchedule::Daily => last.date_naive() != now.date_naive(),
        BackupSchedule::Weekly => last.iso_week() != now.iso_week(),
        BackupSchedule::Monthly => (last.year(), last.month()) != (now.year(), now.month()),
    }
}
