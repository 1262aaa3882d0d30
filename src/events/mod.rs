//! Warning-event pipeline: correlation caches plus the reporter that builds
//! and delivers events to the cluster.

pub mod correlator;
pub mod lru;
pub mod reporter;

pub use correlator::{Clock, CorrelateResult, CorrelatorOptions, EventCorrelator, SystemClock};
pub use reporter::{resolve_receiver, EventReporter, Receiver, ReceiverKind};
