use russh::client::Handler;
use russh::keys::PublicKey;
use tracing::debug;

/// russh callbacks for the single control connection.
///
/// Host keys are accepted without a known_hosts check, matching
/// `ssh -o StrictHostKeyChecking=no`.
#[derive(Debug, Default)]
pub struct ClientHandler;

impl ClientHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("accepting server host key");
        Ok(true)
    }
}
