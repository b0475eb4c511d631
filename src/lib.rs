//! Keep the published ports of containers on a remote Docker host forwarded
//! to localhost over SSH, and resolve local port conflicts.

pub mod cli;
pub mod config;
pub mod conflict;
pub mod discovery;
pub mod error;
pub mod forward;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod process;
pub mod ssh;
pub mod sync;
pub mod transport;
pub mod view;

pub use error::{DockforwardError, Result};
