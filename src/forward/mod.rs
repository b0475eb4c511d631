pub mod registry;
pub mod session;

pub use registry::TunnelRegistry;
pub use session::{SessionInfo, SessionState};
