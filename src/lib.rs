pub mod commands;
pub mod config;
pub mod dates;
pub mod events;
pub mod logging;
pub mod models;
pub mod storage;
pub mod store;

use std::cell::RefCell;
use std::io::{self, BufRead, Write};

use serde::Serialize;

use crate::commands::{dispatch, CommandCtx, InvokeRequest, InvokeResponse};
use crate::events::{EventEnvelope, StatePayload, EVENT_STATE_UPDATED};
use crate::store::TaskStore;

pub use crate::models::{NewTask, Priority, Task, TaskId, TaskUpdate, TaskView};
pub use crate::store::StoreError;

/// Writes responses and events as JSON lines on one output.
struct BridgeCtx<W: Write> {
    out: RefCell<W>,
}

impl<W: Write> BridgeCtx<W> {
    fn write_line<T: Serialize>(&self, value: &T) -> io::Result<()> {
        let mut out = self.out.borrow_mut();
        serde_json::to_writer(&mut *out, value)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

impl<W: Write> CommandCtx for BridgeCtx<W> {
    fn emit_state_updated(&self, payload: StatePayload) {
        let envelope = EventEnvelope {
            event: EVENT_STATE_UPDATED,
            payload,
        };
        if let Err(err) = self.write_line(&envelope) {
            log::warn!("bridge: failed to emit {EVENT_STATE_UPDATED}: {err}");
        }
    }
}

/// Answers one invoke request per input line until EOF.
pub fn serve<R: BufRead, W: Write>(store: &TaskStore, input: R, output: W) -> io::Result<()> {
    let ctx = BridgeCtx {
        out: RefCell::new(output),
    };
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<InvokeRequest>(&line) {
            Ok(request) => dispatch(&ctx, store, request),
            Err(err) => {
                log::warn!("bridge: malformed request err={err}");
                InvokeResponse {
                    id: None,
                    result: serde_json::json!({
                        "ok": false,
                        "data": null,
                        "error": format!("malformed request: {err}"),
                        "code": "validation",
                    }),
                }
            }
        };
        ctx.write_line(&response)?;
    }
    log::info!("bridge: input closed");
    Ok(())
}

#[cfg(feature = "app")]
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = config::resolve_data_dir(
        std::env::args().nth(1),
        std::env::var(config::DATA_DIR_ENV).ok(),
    );
    logging::init_logging(&data_dir)?;
    let store = TaskStore::open(&data_dir)?;
    let stdin = io::stdin();
    serve(&store, stdin.lock(), io::stdout().lock())?;
    Ok(())
}
