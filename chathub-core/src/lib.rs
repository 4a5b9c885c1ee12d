//! Channel hierarchy core for a team chat backend
//!
//! See [`core_channel`] for the hierarchy itself; the remaining modules carry
//! configuration, logging, metrics and shutdown.

pub mod config;
pub mod core_channel;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod test_utils;

pub use config::Config;
pub use core_channel::{ChannelError, ChannelId, ChannelManager, UserId};
pub use logging::{init_logging, LogLevel};
