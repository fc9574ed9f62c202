//! Process management utilities.

mod session;
mod tracker;

pub use session::{key_token, KeyToken, SessionController, ARCHIVE_TIMESTAMP_FORMAT};
pub use tracker::TrackedProcess;
