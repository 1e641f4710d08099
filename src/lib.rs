pub mod cli;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use cli::{Cli, Commands};
pub use error::{BackendError, ConfigError, SyncError};
pub use services::{Destination, SyncProcessor};
