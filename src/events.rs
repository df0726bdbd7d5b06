use crate::models::Task;

pub const EVENT_STATE_UPDATED: &str = "state_updated";

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatePayload {
    pub tasks: Vec<Task>,
}

/// One line written to the bridge's output for an emitted event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventEnvelope<'a, P> {
    pub event: &'a str,
    pub payload: P,
}
