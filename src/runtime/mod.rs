//! Single-threaded readiness runtime.
//!
//! - `Reactor`: the mio event loop owning the control socket
//! - `Connection`: per-client buffering state machine
//! - `Endpoint`: token encoding for clients and data channels

mod connection;
mod reactor;
mod token;

use crate::config::Config;
use mio::Waker;
use reactor::Reactor;
use std::io;
use std::sync::Arc;
use tracing::info;

/// Bind the control socket and serve until `stop` returns true.
///
/// `on_bound` receives the loop's waker before the first wait; waking it
/// makes the loop re-check `stop`.
pub fn run(
    config: &Config,
    on_bound: impl FnOnce(Arc<Waker>) -> io::Result<()>,
    stop: impl FnMut() -> bool,
) -> io::Result<()> {
    let mut reactor = Reactor::bind(config)?;
    on_bound(reactor.waker())?;

    info!(
        addr = %reactor.local_addr()?,
        root = %config.root.display(),
        max_connections = config.max_connections,
        "Listening"
    );

    reactor.run_until(stop)
}
