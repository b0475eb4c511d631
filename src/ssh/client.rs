use crate::config::ServerConfig;
use crate::error::{DockforwardError, Result};
use crate::ssh::handler::ClientHandler;
use crate::transport::{ByteStream, Transport};
use async_trait::async_trait;
use dialoguer::Password;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{load_secret_key, PrivateKey};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

/// One authenticated SSH session to the Docker host.
pub struct SshTransport {
    handle: Handle<ClientHandler>,
    closed: AtomicBool,
    user: String,
    host: String,
}

impl SshTransport {
    pub async fn connect(server: &ServerConfig) -> Result<Self> {
        let (host, port) = server.host_and_port();
        let key_path = server.expanded_key_path();

        info!("Connecting to {}@{}:{}", server.user, host, port);

        let addr = format!("{}:{}", host, port)
            .to_socket_addrs()
            .map_err(|e| DockforwardError::Connection(format!("Failed to resolve host: {}", e)))?
            .next()
            .ok_or_else(|| {
                DockforwardError::Connection("Could not resolve host address".to_string())
            })?;

        let russh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        });

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DockforwardError::Connection(format!("TCP connection failed: {}", e)))?;

        let mut handle = client::connect_stream(russh_config, stream, ClientHandler::new())
            .await
            .map_err(|e| DockforwardError::Connection(e.to_string()))?;

        if let Ok(true) = try_agent_auth(&mut handle, &server.user).await {
            info!("Authenticated via SSH agent");
        } else {
            let key = load_key(&key_path).await?;
            let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            let auth_result = handle
                .authenticate_publickey(&server.user, key_with_alg)
                .await
                .map_err(|e| DockforwardError::Auth(e.to_string()))?;

            if !auth_result.success() {
                return Err(DockforwardError::Auth(format!(
                    "public key {:?} rejected for {}",
                    key_path, server.user
                )));
            }
            info!("Authenticated via key: {:?}", key_path);
        }

        Ok(Self {
            handle,
            closed: AtomicBool::new(false),
            user: server.user.clone(),
            host,
        })
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[async_trait]
impl Transport for SshTransport {
    #[instrument(skip(self), fields(target = %self.target()))]
    async fn open_socket(&self, path: &str) -> Result<ByteStream> {
        let channel = self
            .handle
            .channel_open_direct_streamlocal(path)
            .await
            .map_err(|e| {
                DockforwardError::Channel(format!("Failed to open socket {}: {}", path, e))
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<ByteStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| DockforwardError::Tunnel {
                port,
                message: format!("Failed to open direct-tcpip channel: {}", e),
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn exec(&self, command: &str) -> Result<String> {
        let mut channel =
            self.handle.channel_open_session().await.map_err(|e| {
                DockforwardError::Channel(format!("Failed to open channel: {}", e))
            })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| DockforwardError::Channel(format!("Failed to exec command: {}", e)))?;

        let mut output = Vec::new();

        loop {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => {
                    output.extend_from_slice(&data);
                }
                Some(russh::ChannelMsg::ExtendedData { data, .. }) => {
                    output.extend_from_slice(&data);
                }
                Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => {
                    break;
                }
                _ => {}
            }
        }

        String::from_utf8(output)
            .map_err(|e| DockforwardError::Channel(format!("Invalid UTF-8 in output: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(target = %self.target(), "disconnecting");
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| DockforwardError::Connection(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }
}

#[cfg(unix)]
async fn try_agent_auth(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool> {
    if std::env::var("SSH_AUTH_SOCK").is_err() {
        return Ok(false);
    }

    let mut agent = russh::keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| DockforwardError::Auth(format!("Failed to connect to agent: {}", e)))?;

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| DockforwardError::Auth(format!("Failed to get agent identities: {}", e)))?;

    for identity in identities {
        let auth_result = handle
            .authenticate_publickey_with(user, identity, None, &mut agent)
            .await;
        match auth_result {
            Ok(result) if result.success() => return Ok(true),
            _ => continue,
        }
    }

    Ok(false)
}

#[cfg(windows)]
async fn try_agent_auth(_handle: &mut Handle<ClientHandler>, _user: &str) -> Result<bool> {
    Ok(false)
}

/// Load a private key, prompting for a passphrase if it is encrypted.
async fn load_key(path: &Path) -> Result<PrivateKey> {
    if !path.exists() {
        return Err(DockforwardError::Key(format!("key file {:?} not found", path)));
    }

    match load_secret_key(path, None) {
        Ok(key) => return Ok(key),
        Err(e) => {
            let message = e.to_string();
            if !message.contains("encrypted")
                && !message.contains("passphrase")
                && !message.contains("decrypt")
            {
                return Err(DockforwardError::Key(format!(
                    "Failed to load key {:?}: {}",
                    path, e
                )));
            }
        }
    }

    let prompt_path: PathBuf = path.to_path_buf();
    let passphrase = tokio::task::spawn_blocking(move || {
        Password::new()
            .with_prompt(format!("Passphrase for {:?}", prompt_path))
            .allow_empty_password(true)
            .interact()
    })
    .await
    .map_err(|e| DockforwardError::Key(format!("Passphrase prompt panicked: {}", e)))?
    .map_err(|e| DockforwardError::Key(format!("Passphrase input failed: {}", e)))?;

    load_secret_key(path, Some(&passphrase))
        .map_err(|e| DockforwardError::Key(format!("Failed to load key {:?}: {}", path, e)))
}
