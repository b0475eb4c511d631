use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockforwardError {
    #[error("SSH connection failed: {0}")]
    Connection(String),

    #[error("SSH authentication failed: {0}")]
    Auth(String),

    #[error("SSH key error: {0}")]
    Key(String),

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("Service discovery failed: {0}")]
    Discovery(String),

    #[error("Tunnel for remote port {port} failed: {message}")]
    Tunnel { port: u16, message: String },

    #[error("Invalid port specification: {0}")]
    InvalidPort(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service {service} does not expose port {port}")]
    UnknownPort { service: String, port: String },

    #[error("Local port {port} is already in use by {owner}")]
    PortOccupied { port: u16, owner: String },

    #[error("Conflict resolution failed: {0}")]
    ConflictResolution(String),

    #[error("Local port scan failed: {0}")]
    Scan(String),

    #[error("Failed to kill process: {0}")]
    ProcessKill(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DockforwardError {
    /// Errors that reject a user action before any state was touched.
    pub fn is_conflict_resolution(&self) -> bool {
        matches!(
            self,
            Self::UnknownService(_)
                | Self::UnknownPort { .. }
                | Self::PortOccupied { .. }
                | Self::ConflictResolution(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DockforwardError>;
