pub mod poller;
pub mod visibility;

pub use poller::{Poller, PollingOptions, PollingState};
pub use visibility::VisibilitySignal;
