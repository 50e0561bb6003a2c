//! Test fixtures shared by the integration suites.

mod raw_peer;
mod recorder;
mod two_peer;

pub use raw_peer::RawPeer;
pub use recorder::{Event, Recorder};
pub use two_peer::{SERVER, TwoPeerFixture};
