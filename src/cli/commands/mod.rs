mod check;
mod write;

pub use check::CheckArgs;
pub use write::{WriteArgs, read_messages};

pub use check::handle_check;
pub use write::handle_write;
