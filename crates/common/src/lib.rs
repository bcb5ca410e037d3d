pub mod config;
pub mod logging;
pub mod poll;

pub use config::Environment;
pub use logging::setup_logging;
pub use poll::{join_timeout, poll_until};
