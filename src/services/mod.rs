pub mod chunk;
pub mod destination;
pub mod loader;
pub mod processor;
pub mod sync_state;

pub use chunk::chunk;
pub use destination::Destination;
pub use loader::{CheckResult, Loader, create_loader};
pub use processor::SyncProcessor;
pub use sync_state::{StreamProgress, SyncPhase, SyncTracker, Transition};
