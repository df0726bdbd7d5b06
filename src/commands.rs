use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::StatePayload;
use crate::models::{NewTask, Settings, Task, TaskId, TaskUpdate, TaskView};
use crate::store::{StoreError, TaskStore};

const CODE_VALIDATION: &str = "validation";

#[derive(Debug, Serialize)]
pub struct CommandResult<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub code: Option<&'static str>,
}

/// What a command needs from the process hosting it.
pub trait CommandCtx {
    fn emit_state_updated(&self, payload: StatePayload);
}

fn ok<T>(data: T) -> CommandResult<T> {
    CommandResult {
        ok: true,
        data: Some(data),
        error: None,
        code: None,
    }
}

fn err<T>(message: &str, code: &'static str) -> CommandResult<T> {
    CommandResult {
        ok: false,
        data: None,
        error: Some(message.to_string()),
        code: Some(code),
    }
}

fn store_err<T>(command: &str, error: StoreError) -> CommandResult<T> {
    log::warn!("commands: {command} failed kind={} err={error}", error.kind());
    err(&error.to_string(), error.kind())
}

fn notify(ctx: &impl CommandCtx, store: &TaskStore) {
    ctx.emit_state_updated(StatePayload {
        tasks: store.list_all(),
    });
}

fn get_all_tasks_impl(store: &TaskStore) -> CommandResult<Vec<Task>> {
    ok(store.list_all())
}

fn get_task_impl(store: &TaskStore, id: TaskId) -> CommandResult<Task> {
    match store.get(id) {
        Ok(task) => ok(task),
        Err(error) => store_err("get_task", error),
    }
}

fn get_task_view_impl(store: &TaskStore) -> CommandResult<TaskView> {
    ok(store.view())
}

fn add_task_impl(ctx: &impl CommandCtx, store: &TaskStore, input: NewTask) -> CommandResult<Task> {
    match store.add(input) {
        Ok(task) => {
            notify(ctx, store);
            ok(task)
        }
        Err(error) => store_err("add_task", error),
    }
}

fn update_task_impl(
    ctx: &impl CommandCtx,
    store: &TaskStore,
    input: TaskUpdate,
) -> CommandResult<Task> {
    match store.update(input) {
        Ok(task) => {
            notify(ctx, store);
            ok(task)
        }
        Err(error) => store_err("update_task", error),
    }
}

fn delete_task_impl(ctx: &impl CommandCtx, store: &TaskStore, id: TaskId) -> CommandResult<bool> {
    match store.delete(id) {
        Ok(()) => {
            notify(ctx, store);
            ok(true)
        }
        Err(error) => store_err("delete_task", error),
    }
}

fn delete_all_tasks_impl(ctx: &impl CommandCtx, store: &TaskStore) -> CommandResult<usize> {
    match store.delete_all() {
        Ok(removed) => {
            notify(ctx, store);
            ok(removed)
        }
        Err(error) => store_err("delete_all_tasks", error),
    }
}

fn toggle_task_completion_impl(
    ctx: &impl CommandCtx,
    store: &TaskStore,
    id: TaskId,
) -> CommandResult<Task> {
    match store.toggle_completion(id) {
        Ok(task) => {
            notify(ctx, store);
            ok(task)
        }
        Err(error) => store_err("toggle_task_completion", error),
    }
}

fn clear_completed_tasks_impl(ctx: &impl CommandCtx, store: &TaskStore) -> CommandResult<usize> {
    match store.clear_completed() {
        Ok(removed) => {
            notify(ctx, store);
            ok(removed)
        }
        Err(error) => store_err("clear_completed_tasks", error),
    }
}

fn get_settings_impl(store: &TaskStore) -> CommandResult<Settings> {
    ok(store.settings())
}

fn update_settings_impl(store: &TaskStore, settings: Settings) -> CommandResult<Settings> {
    match store.update_settings(settings) {
        Ok(settings) => ok(settings),
        Err(error) => store_err("update_settings", error),
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub name: String,
    pub modified_at: i64,
}

fn list_backups_impl(store: &TaskStore) -> CommandResult<Vec<BackupEntry>> {
    let Some(storage) = store.storage() else {
        return ok(Vec::new());
    };

    // If the backup directory does not exist yet, create it and return an empty list.
    let list = match storage.list_backups() {
        Ok(list) => list,
        Err(error) if error.is_not_found() => {
            if let Err(error) = storage.ensure_dirs() {
                return store_err("list_backups", error.into());
            }
            Vec::new()
        }
        Err(error) => return store_err("list_backups", error.into()),
    };

    ok(list
        .into_iter()
        .map(|(name, modified_at)| BackupEntry { name, modified_at })
        .collect())
}

fn create_backup_impl(store: &TaskStore) -> CommandResult<Option<String>> {
    match store.create_backup() {
        Ok(name) => ok(name),
        Err(error) => store_err("create_backup", error),
    }
}

fn restore_backup_impl(
    ctx: &impl CommandCtx,
    store: &TaskStore,
    filename: &str,
) -> CommandResult<Vec<Task>> {
    let Some(storage) = store.storage() else {
        return err("store has no data directory", "storage");
    };
    let restored = storage
        .read_backup(filename)
        .map_err(StoreError::from)
        .and_then(|data| store.replace_tasks(data));
    match restored {
        Ok(tasks) => {
            notify(ctx, store);
            ok(tasks)
        }
        Err(error) => store_err("restore_backup", error),
    }
}

fn import_backup_impl(
    ctx: &impl CommandCtx,
    store: &TaskStore,
    path: &Path,
) -> CommandResult<Vec<Task>> {
    let Some(storage) = store.storage() else {
        return err("store has no data directory", "storage");
    };
    let imported = storage
        .read_external(path)
        .map_err(StoreError::from)
        .and_then(|data| store.replace_tasks(data));
    match imported {
        Ok(tasks) => {
            notify(ctx, store);
            ok(tasks)
        }
        Err(error) => store_err("import_backup", error),
    }
}

/// A named command call as sent by the UI.
#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub cmd: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    pub id: Option<Value>,
    pub result: Value,
}

#[derive(Deserialize)]
struct IdArgs {
    id: TaskId,
}

#[derive(Deserialize)]
struct UpdateArgs {
    task: TaskUpdate,
}

#[derive(Deserialize)]
struct SettingsArgs {
    settings: Settings,
}

#[derive(Deserialize)]
struct FilenameArgs {
    filename: String,
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

fn respond<T: Serialize>(result: CommandResult<T>) -> Value {
    serde_json::to_value(result).unwrap_or_else(|error| {
        serde_json::json!({
            "ok": false,
            "data": null,
            "error": format!("json error: {error}"),
            "code": "storage",
        })
    })
}

fn with_args<A: DeserializeOwned, T: Serialize>(
    cmd: &str,
    args: Value,
    run: impl FnOnce(A) -> CommandResult<T>,
) -> Value {
    match serde_json::from_value::<A>(args) {
        Ok(args) => respond(run(args)),
        Err(error) => {
            log::warn!("commands: {cmd} invalid args err={error}");
            respond(err::<()>(
                &format!("invalid arguments for {cmd}: {error}"),
                CODE_VALIDATION,
            ))
        }
    }
}

pub fn dispatch(ctx: &impl CommandCtx, store: &TaskStore, request: InvokeRequest) -> InvokeResponse {
    let InvokeRequest { id, cmd, args } = request;
    log::debug!("commands: invoke cmd={cmd}");
    let result = match cmd.as_str() {
        "get_all_tasks" => respond(get_all_tasks_impl(store)),
        "get_task" => with_args(&cmd, args, |a: IdArgs| get_task_impl(store, a.id)),
        "get_task_view" => respond(get_task_view_impl(store)),
        "add_task" => with_args(&cmd, args, |input: NewTask| add_task_impl(ctx, store, input)),
        "update_task" => with_args(&cmd, args, |a: UpdateArgs| {
            update_task_impl(ctx, store, a.task)
        }),
        "delete_task" => with_args(&cmd, args, |a: IdArgs| delete_task_impl(ctx, store, a.id)),
        "delete_all_tasks" => respond(delete_all_tasks_impl(ctx, store)),
        "toggle_task_completion" => with_args(&cmd, args, |a: IdArgs| {
            toggle_task_completion_impl(ctx, store, a.id)
        }),
        "clear_completed_tasks" => respond(clear_completed_tasks_impl(ctx, store)),
        "get_settings" => respond(get_settings_impl(store)),
        "update_settings" => with_args(&cmd, args, |a: SettingsArgs| {
            update_settings_impl(store, a.settings)
        }),
        "list_backups" => respond(list_backups_impl(store)),
        "create_backup" => respond(create_backup_impl(store)),
        "restore_backup" => with_args(&cmd, args, |a: FilenameArgs| {
            restore_backup_impl(ctx, store, &a.filename)
        }),
        "import_backup" => with_args(&cmd, args, |a: PathArgs| {
            import_backup_impl(ctx, store, Path::new(&a.path))
        }),
        other => {
            log::warn!("commands: unknown cmd={other}");
            respond(err::<()>(&format!("unknown command: {other}"), CODE_VALIDATION))
        }
    };
    InvokeResponse { id, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupSchedule, Priority};
    use serde_json::json;
    use std::fs;
    use std::sync::Mutex;

    struct TestCtx {
        emitted: Mutex<Vec<StatePayload>>,
    }

    impl TestCtx {
        fn new() -> Self {
            Self {
                emitted: Mutex::new(Vec::new()),
            }
        }

        fn emitted_count(&self) -> usize {
            self.emitted.lock().unwrap().len()
        }
    }

    impl CommandCtx for TestCtx {
        fn emit_state_updated(&self, payload: StatePayload) {
            self.emitted.lock().unwrap().push(payload);
        }
    }

    fn invoke(ctx: &TestCtx, store: &TaskStore, cmd: &str, args: Value) -> Value {
        let request = InvokeRequest {
            id: Some(json!(1)),
            cmd: cmd.to_string(),
            args,
        };
        let response = dispatch(ctx, store, request);
        assert_eq!(response.id, Some(json!(1)));
        response.result
    }

    fn new_task(title: &str, due: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            priority: "Medium".to_string(),
            due_date: due.to_string(),
        }
    }

    #[test]
    fn ok_and_err_helpers_construct_expected_shape() {
        let r = ok(123);
        assert!(r.ok);
        assert_eq!(r.data, Some(123));
        assert_eq!(r.error, None);
        assert_eq!(r.code, None);

        let r: CommandResult<i32> = err("nope", "not_found");
        assert!(!r.ok);
        assert_eq!(r.data, None);
        assert_eq!(r.error, Some("nope".to_string()));
        assert_eq!(r.code, Some("not_found"));
    }

    #[test]
    fn mutations_emit_state_and_failures_do_not() {
        let ctx = TestCtx::new();
        let store = TaskStore::in_memory();

        let res = add_task_impl(&ctx, &store, new_task("a", "2025-01-01"));
        assert!(res.ok);
        let task = res.data.unwrap();
        assert_eq!(ctx.emitted_count(), 1);
        assert_eq!(ctx.emitted.lock().unwrap()[0].tasks.len(), 1);

        let res = add_task_impl(&ctx, &store, new_task("", "2025-01-01"));
        assert!(!res.ok);
        assert_eq!(res.code, Some("validation"));
        assert_eq!(ctx.emitted_count(), 1);

        let res = toggle_task_completion_impl(&ctx, &store, task.id);
        assert!(res.data.unwrap().done);
        assert_eq!(ctx.emitted_count(), 2);

        let res = toggle_task_completion_impl(&ctx, &store, 404);
        assert_eq!(res.code, Some("not_found"));
        assert_eq!(res.error, Some("task not found: 404".to_string()));

        let res = clear_completed_tasks_impl(&ctx, &store);
        assert_eq!(res.data, Some(1));
        assert_eq!(ctx.emitted_count(), 3);
        assert!(ctx.emitted.lock().unwrap()[2].tasks.is_empty());

        let res = delete_task_impl(&ctx, &store, task.id);
        assert_eq!(res.code, Some("not_found"));
        assert_eq!(ctx.emitted_count(), 3);
    }

    #[test]
    fn dispatch_runs_the_full_task_lifecycle() {
        let ctx = TestCtx::new();
        let store = TaskStore::in_memory();

        let created = invoke(
            &ctx,
            &store,
            "add_task",
            json!({"title": "Buy milk", "priority": "High", "dueDate": "2025-01-01T10:00:00Z"}),
        );
        assert_eq!(created["ok"], json!(true));
        assert_eq!(created["data"]["title"], json!("Buy milk"));
        assert_eq!(created["data"]["priority"], json!("High"));
        assert_eq!(created["data"]["dueDate"], json!("2025-01-01T10:00:00Z"));
        assert_eq!(created["data"]["done"], json!(false));
        let id = created["data"]["id"].clone();

        let mut edited = created["data"].clone();
        edited["title"] = json!("Buy oat milk");
        edited["dueDate"] = json!("2025-01-02T08:00");
        edited["done"] = json!(true);
        let updated = invoke(&ctx, &store, "update_task", json!({ "task": edited }));
        assert_eq!(updated["ok"], json!(true));
        assert_eq!(updated["data"]["title"], json!("Buy oat milk"));
        assert_eq!(updated["data"]["dueDate"], json!("2025-01-02T08:00:00Z"));
        assert_eq!(updated["data"]["done"], json!(false));

        let toggled = invoke(&ctx, &store, "toggle_task_completion", json!({ "id": id }));
        assert_eq!(toggled["data"]["done"], json!(true));

        let fetched = invoke(&ctx, &store, "get_task", json!({ "id": id }));
        assert_eq!(fetched["data"]["done"], json!(true));

        let cleared = invoke(&ctx, &store, "clear_completed_tasks", Value::Null);
        assert_eq!(cleared["data"], json!(1));

        let listed = invoke(&ctx, &store, "get_all_tasks", Value::Null);
        assert_eq!(listed["data"], json!([]));
        // add, update, toggle and clear each emitted once.
        assert_eq!(ctx.emitted_count(), 4);
    }

    #[test]
    fn dispatch_reports_not_found_and_leaves_collection_unchanged() {
        let ctx = TestCtx::new();
        let store = TaskStore::in_memory();
        store.add(new_task("keep", "2025-01-01")).unwrap();
        let before = store.list_all();

        let res = invoke(
            &ctx,
            &store,
            "update_task",
            json!({"task": {"id": 77, "title": "x", "priority": "Low", "dueDate": "2025-01-01"}}),
        );
        assert_eq!(res["ok"], json!(false));
        assert_eq!(res["code"], json!("not_found"));
        assert_eq!(store.list_all(), before);

        let res = invoke(&ctx, &store, "delete_task", json!({"id": 77}));
        assert_eq!(res["code"], json!("not_found"));
    }

    #[test]
    fn dispatch_rejects_unknown_commands_and_bad_args() {
        let ctx = TestCtx::new();
        let store = TaskStore::in_memory();

        let res = invoke(&ctx, &store, "launch_rockets", Value::Null);
        assert_eq!(res["ok"], json!(false));
        assert_eq!(res["code"], json!("validation"));
        assert!(res["error"].as_str().unwrap().contains("launch_rockets"));

        let res = invoke(&ctx, &store, "delete_task", json!({"id": "seven"}));
        assert_eq!(res["code"], json!("validation"));

        let res = invoke(&ctx, &store, "add_task", Value::Null);
        assert_eq!(res["code"], json!("validation"));
        assert!(store.list_all().is_empty());
    }

    #[test]
    fn task_view_and_delete_all_through_dispatch() {
        let ctx = TestCtx::new();
        let store = TaskStore::in_memory();
        let feb = store.add(new_task("feb", "2025-02-01")).unwrap();
        let jan = store.add(new_task("jan", "2025-01-01")).unwrap();
        let done = store.add(new_task("done", "2024-12-01")).unwrap();
        store.toggle_completion(done.id).unwrap();

        let view = invoke(&ctx, &store, "get_task_view", Value::Null);
        assert_eq!(view["data"]["pending"][0]["id"], json!(jan.id));
        assert_eq!(view["data"]["pending"][1]["id"], json!(feb.id));
        assert_eq!(view["data"]["completed"][0]["id"], json!(done.id));

        let res = invoke(&ctx, &store, "delete_all_tasks", Value::Null);
        assert_eq!(res["data"], json!(3));
        assert!(store.list_all().is_empty());
        let res = invoke(&ctx, &store, "delete_all_tasks", Value::Null);
        assert_eq!(res["ok"], json!(true));
        assert_eq!(res["data"], json!(0));
    }

    #[test]
    fn settings_commands_round_trip() {
        let ctx = TestCtx::new();
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        let res = invoke(
            &ctx,
            &store,
            "update_settings",
            json!({"settings": {"backup_schedule": "weekly"}}),
        );
        assert_eq!(res["ok"], json!(true));
        assert_eq!(store.settings().backup_schedule, BackupSchedule::Weekly);

        let res = invoke(&ctx, &store, "get_settings", Value::Null);
        assert_eq!(res["data"]["backup_schedule"], json!("weekly"));

        let reopened = TaskStore::open(dir.path()).unwrap();
        assert_eq!(reopened.settings().backup_schedule, BackupSchedule::Weekly);
    }

    #[test]
    fn backup_commands_list_create_restore_and_import_cover_paths() {
        let ctx = TestCtx::new();
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();

        // Nothing saved yet.
        let res = list_backups_impl(&store);
        assert_eq!(res.data, Some(Vec::new()));
        let res = create_backup_impl(&store);
        assert!(res.ok);

        let a = store.add(new_task("a", "2025-01-01")).unwrap();
        let res = create_backup_impl(&store);
        let name = res.data.flatten().expect("backup name");
        assert!(store.settings().last_backup_at.is_some());
        let listed = list_backups_impl(&store).data.unwrap();
        assert!(listed.iter().any(|entry| entry.name == name));

        let b = store.add(new_task("b", "2025-01-02")).unwrap();
        assert_eq!(store.list_all().len(), 2);

        let res = restore_backup_impl(&ctx, &store, &name);
        assert!(res.ok);
        let ids: Vec<TaskId> = store.list_all().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id]);
        let c = store.add(new_task("c", "2025-01-03")).unwrap();
        assert!(c.id > b.id);

        let res = restore_backup_impl(&ctx, &store, "../tasks.json");
        assert_eq!(res.code, Some("storage"));
        let res = restore_backup_impl(&ctx, &store, "missing.json");
        assert_eq!(res.code, Some("storage"));

        let import_path = dir.path().join("import.json");
        fs::write(
            &import_path,
            serde_json::to_vec(&json!({
                "schema_version": 1,
                "tasks": [{
                    "id": 50,
                    "title": "imported",
                    "done": true,
                    "priority": "Low",
                    "dueDate": "2025-05-05T00:00:00Z",
                    "createdAt": "2025-01-01T00:00:00Z",
                    "updatedAt": "2025-01-02T00:00:00Z"
                }]
            }))
            .unwrap(),
        )
        .unwrap();
        let res = import_backup_impl(&ctx, &store, &import_path);
        let tasks = res.data.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, Priority::Low);
        assert!(store.add(new_task("d", "2025-01-01")).unwrap().id > 50);

        let res = import_backup_impl(&ctx, &store, &dir.path().join("nope.json"));
        assert!(!res.ok);

        let blank_path = dir.path().join("blank.json");
        fs::write(
            &blank_path,
            br#"{"schema_version":1,"tasks":[{"id":60,"title":" ","done":false,"priority":"Low","dueDate":"2025-05-05T00:00:00Z","createdAt":"2025-01-01T00:00:00Z","updatedAt":"2025-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        let res = import_backup_impl(&ctx, &store, &blank_path);
        assert_eq!(res.code, Some("validation"));
        assert!(store.list_all().iter().all(|task| task.id != 60));
    }

    #[test]
    fn backup_commands_without_data_directory() {
        let ctx = TestCtx::new();
        let store = TaskStore::in_memory();
        assert_eq!(list_backups_impl(&store).data, Some(Vec::new()));
        assert_eq!(create_backup_impl(&store).data, Some(None));
        assert!(!restore_backup_impl(&ctx, &store, "x.json").ok);
        assert!(!import_backup_impl(&ctx, &store, Path::new("x.json")).ok);
        assert_eq!(ctx.emitted_count(), 0);
    }
}
