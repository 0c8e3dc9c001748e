pub mod byte_buffer;

pub use byte_buffer::ByteBuffer;

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static CLOCK_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since process start.
///
/// Every liveness and keepalive decision in the worker compares values from
/// this clock; mixing it with wall-clock time would break the comparisons
/// across NTP adjustments.
pub fn now_millis() -> i64 {
    CLOCK_ANCHOR.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// Wall-clock milliseconds since the Unix epoch, used only for the `ts`
/// fields stamped on outbound signalling messages.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
