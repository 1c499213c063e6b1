//! Client side of the bridge.
//!
//! - [`Channel`]: one multiplexed, authenticated transport.
//! - [`ConnectionSession`]: a single-shot session with its event stream.
//! - [`PuppetClient`]: the owner that restarts sessions and runs the
//!   heartbeat watchdog.

mod channel;
mod puppet;
mod session;

pub use channel::{CallSink, CallStream, Channel, StreamEvent};
pub use puppet::PuppetClient;
pub use session::{ConnectionSession, SessionEvent};
