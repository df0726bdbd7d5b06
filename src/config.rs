use std::path::PathBuf;

pub const DATA_DIR_ENV: &str = "TODO_APP_DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = "todo-data";

/// Data directory: first CLI argument, then `TODO_APP_DATA_DIR`, then `./todo-data`.
pub fn resolve_data_dir(cli_arg: Option<String>, env_value: Option<String>) -> PathBuf {
    cli_arg
        .filter(|value| !value.trim().is_empty())
        .or_else(|| env_value.filter(|value| !value.trim().is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}
