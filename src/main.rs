fn main() {
    if let Err(err) = todo_app_lib::run() {
        log::error!("todo-app: fatal error: {err}");
        eprintln!("todo-app: {err}");
        std::process::exit(1);
    }
}
