//! Shell transport seam
//!
//! The interactive client in [`super::client`] is written against a plain
//! byte stream so unit tests can drive it with `tokio::io::duplex`. The only
//! production implementation opens a russh session with a pty and shell and
//! hands back the channel stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh_keys::key;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{Error, Result};

/// Byte stream carrying an interactive shell
pub trait ShellStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ShellStream for T {}

/// Owned, type-erased shell stream
pub type BoxedShellStream = Box<dyn ShellStream>;

/// Something that can open (and re-open) a shell to one host
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Open a fresh shell stream. Called again on reconnect.
    async fn open(&self) -> Result<BoxedShellStream>;

    /// Host this connector dials, for error context
    fn host(&self) -> &str;
}

/// Address and credentials for one SSH endpoint
#[derive(Debug, Clone)]
pub struct HostAccess {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl HostAccess {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Lab controllers present per-lab host keys; the harness pins nothing.
struct AcceptAllKeys;

#[async_trait]
impl client::Handler for AcceptAllKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &key::PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens password-authenticated SSH shells via russh
pub struct SshConnector {
    access: HostAccess,
    /// Inactivity timeout pushed down to the russh session keepalive
    pub inactivity_timeout: Duration,
}

impl SshConnector {
    pub fn new(access: HostAccess) -> Self {
        Self {
            access,
            inactivity_timeout: Duration::from_secs(3600),
        }
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn open(&self) -> Result<BoxedShellStream> {
        let host = &self.access.host;
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.inactivity_timeout),
            ..Default::default()
        });
        debug!(host = %host, port = self.access.port, "opening ssh session");

        let mut session =
            client::connect(config, (host.as_str(), self.access.port), AcceptAllKeys)
                .await
                .map_err(|e| Error::ssh(host, format!("connect: {e}")))?;

        let authed = session
            .authenticate_password(&self.access.user, &self.access.password)
            .await
            .map_err(|e| Error::ssh(host, format!("auth: {e}")))?;
        if !authed {
            return Err(Error::ssh(host, "password rejected"));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| Error::ssh(host, format!("channel: {e}")))?;
        // A wide pty keeps the CLIs from wrapping their tables.
        channel
            .request_pty(false, "xterm", 250, 50, 0, 0, &[])
            .await
            .map_err(|e| Error::ssh(host, format!("pty: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| Error::ssh(host, format!("shell: {e}")))?;

        Ok(Box::new(channel.into_stream()))
    }

    fn host(&self) -> &str {
        &self.access.host
    }
}
