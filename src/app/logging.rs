use tracing_subscriber::{EnvFilter, fmt};

use crate::app::AppError;

/// Default directives when `RUST_LOG` is unset: the logger's own modules
/// at info, the HTTP/WebSocket plumbing capped at warn so per-tick
/// acquisition noise does not bury state transitions and session events.
const DEFAULT_FILTER: &str =
    "info,actix_server=warn,actix_web=warn,reqwest=warn,hyper=warn,tungstenite=warn";

pub fn init() -> Result<(), AppError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // Thread names carry the vehicle context here: the poll loop runs as
    // `poll-loop` and each push link as `stream-<vehicle_id>`.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(AppError::logging_init)
}
