//! The two interchangeable non-blocking I/O engines behind `HttpMiddleware`.
//!
//! Both implementations share one contract: `event_loop_tick` makes whatever
//! progress it can without blocking longer than a short internal poll, and
//! reports whether it made any.

mod multiplexed;
mod socket;

pub use multiplexed::MultiplexedTransport;
pub use socket::SocketTransport;

use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::state::ClientState;

/// The short poll budget a single `event_loop_tick` call may block for while
/// waiting on socket readiness. Ticks never block longer than this regardless of
/// how many requests are in flight.
pub const TICK_POLL_BUDGET: Duration = Duration::from_millis(50);

pub trait Transport {
    /// One pass through the non-blocking I/O logic: checks timeouts, starts
    /// connections for ENQUEUED requests with a free concurrency slot, and drives
    /// every non-terminal request one step further. Returns whether any request
    /// made observable progress (a state transition or a pending event was set).
    fn event_loop_tick(&mut self, state: &mut ClientState, config: &ClientConfig) -> Result<bool>;
}

/// Shared timeout check used by both transports: marks a request FAILED with
/// `Timeout` if its absolute deadline (connect start + `timeout_ms`) has passed.
pub(crate) fn enforce_timeouts(state: &mut ClientState, config: &ClientConfig) -> bool {
    let mut progressed = false;
    for id in state.non_terminal_ids() {
        let Some(started_at) = state.connection(id).map(|c| c.started_at) else { continue };
        if started_at.elapsed() >= Duration::from_millis(config.timeout_ms) {
            tracing::warn!(request_id = id, timeout_ms = config.timeout_ms, "request failed: timeout");
            if let Some(req) = state.request_mut(id) {
                req.fail(crate::error::Error::Timeout);
            }
            state.pending_mut(id).failed = true;
            state.release_connection(id);
            progressed = true;
        }
    }
    progressed
}
