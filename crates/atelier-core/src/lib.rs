mod event_log;
mod registry;
mod storage;

pub use event_log::{EventLog, Subscription};
pub use registry::{CancellationRegistry, RunActivity};
pub use storage::{CoreError, CreateOutcome, CreateRunParams, Storage};

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
