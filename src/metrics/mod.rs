pub mod cursor;
pub mod freshness;
pub mod merger;
pub mod mock;
pub mod pipeline;
pub mod poller;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod telemetry;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
