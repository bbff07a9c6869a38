//! NNTP wire client.
//!
//! One client owns one connection to one provider and speaks the small
//! command set the streaming core needs: authentication, group selection,
//! body fetch by message id, and the existence probe. Transport failures and
//! mid-session `480` replies trigger a reconnect that replays
//! authentication, retried up to twice per logical operation.

use crate::config::ProviderConfig;
use crate::error::{NntpError, Result};
use crate::response::{self, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Deadline for establishing a TCP/TLS connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-operation deadline.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for the existence probe; probes must fail fast.
pub const STAT_TIMEOUT: Duration = Duration::from_secs(2);
/// Reconnect-and-replay retries per logical operation.
const MAX_OP_RETRIES: u32 = 2;
/// Hard cap on a single article body.
const MAX_BODY_SIZE: usize = 64 << 20;

trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// A single multiplexed NNTP connection.
pub struct NntpClient {
    stream: BufStream<Box<dyn RawStream>>,
    config: Arc<ProviderConfig>,
    last_used: Instant,
}

impl NntpClient {
    /// Dial, read the greeting, and authenticate when credentials are
    /// configured.
    pub async fn connect(config: Arc<ProviderConfig>) -> Result<Self> {
        let stream = Self::dial(&config).await?;
        let mut client = Self {
            stream,
            config,
            last_used: Instant::now(),
        };
        match timeout(OPERATION_TIMEOUT, client.handshake()).await {
            Ok(r) => r?,
            Err(_) => return Err(NntpError::Timeout(OPERATION_TIMEOUT)),
        }
        debug!(
            provider = client.config.display_name(),
            "nntp connection established"
        );
        Ok(client)
    }

    /// Select a newsgroup. Callers treat failures as advisory: body fetch by
    /// message id works without a selected group on most servers.
    pub async fn select_group(&mut self, group: &str) -> Result<()> {
        self.touch();
        let mut attempts = 0;
        loop {
            let result = match timeout(OPERATION_TIMEOUT, self.select_group_once(group)).await {
                Ok(r) => r,
                Err(_) => Err(NntpError::Timeout(OPERATION_TIMEOUT)),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => self.recover(e, &mut attempts).await?,
            }
        }
    }

    async fn select_group_once(&mut self, group: &str) -> Result<()> {
        let resp = self.round_trip(&format!("GROUP {group}")).await?;
        match resp.code {
            response::GROUP_SELECTED => Ok(()),
            response::AUTH_REQUIRED => Err(NntpError::AuthRequired),
            _ => Err(resp.into_unexpected()),
        }
    }

    /// Fetch an article body by message id, returning the dot-unstuffed
    /// payload with line terminators intact.
    pub async fn body(&mut self, message_id: &str) -> Result<Vec<u8>> {
        self.touch();
        let mut attempts = 0;
        loop {
            let result = match timeout(OPERATION_TIMEOUT, self.body_once(message_id)).await {
                Ok(r) => r,
                Err(_) => Err(NntpError::Timeout(OPERATION_TIMEOUT)),
            };
            match result {
                Ok(body) => return Ok(body),
                Err(e) => self.recover(e, &mut attempts).await?,
            }
        }
    }

    async fn body_once(&mut self, message_id: &str) -> Result<Vec<u8>> {
        let resp = self.round_trip(&format!("BODY <{message_id}>")).await?;
        match resp.code {
            response::BODY_FOLLOWS => self.read_dot_body().await,
            response::NOT_FOUND => Err(NntpError::NotFound(message_id.to_string())),
            response::AUTH_REQUIRED => Err(NntpError::AuthRequired),
            _ => Err(resp.into_unexpected()),
        }
    }

    /// Probe for an article's existence. `Ok(false)` means the provider
    /// definitively does not carry it; transport problems surface as errors.
    pub async fn stat(&mut self, message_id: &str) -> Result<bool> {
        self.touch();
        let mut attempts = 0;
        loop {
            let result = match timeout(STAT_TIMEOUT, self.stat_once(message_id)).await {
                Ok(r) => r,
                Err(_) => Err(NntpError::Timeout(STAT_TIMEOUT)),
            };
            match result {
                Ok(exists) => return Ok(exists),
                Err(e) => self.recover(e, &mut attempts).await?,
            }
        }
    }

    async fn stat_once(&mut self, message_id: &str) -> Result<bool> {
        let resp = self.round_trip(&format!("STAT <{message_id}>")).await?;
        match resp.code {
            response::ARTICLE_EXISTS => Ok(true),
            response::NOT_FOUND => Ok(false),
            response::AUTH_REQUIRED => Err(NntpError::AuthRequired),
            _ => Err(resp.into_unexpected()),
        }
    }

    /// Best-effort session teardown.
    pub async fn quit(mut self) {
        let _ = timeout(Duration::from_secs(5), async {
            self.stream.write_all(b"QUIT\r\n").await?;
            self.stream.flush().await
        })
        .await;
    }

    /// Stamp the connection as recently used.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// How long the connection has sat unused.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, age: Duration) {
        self.last_used = Instant::now() - age;
    }

    /// Reconnect-and-replay recovery shared by the logical operations.
    ///
    /// Consumes transport errors and `480` replies while the retry budget
    /// lasts; everything else (including `430`) surfaces unchanged.
    async fn recover(&mut self, error: NntpError, attempts: &mut u32) -> Result<()> {
        let recoverable = error.is_transport() || matches!(error, NntpError::AuthRequired);
        if !recoverable || *attempts >= MAX_OP_RETRIES {
            return Err(error);
        }
        *attempts += 1;
        debug!(
            provider = self.config.display_name(),
            error = %error,
            attempt = *attempts,
            "reconnecting nntp session"
        );
        self.stream = Self::dial(&self.config).await?;
        match timeout(OPERATION_TIMEOUT, self.handshake()).await {
            Ok(r) => r,
            Err(_) => Err(NntpError::Timeout(OPERATION_TIMEOUT)),
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let greeting = self.read_response().await?;
        if !greeting.is_ready() {
            return Err(greeting.into_unexpected());
        }
        if self.config.username.is_some() {
            self.authenticate().await?;
        }
        Ok(())
    }

    /// Two-step AUTHINFO exchange. Servers may accept the user name alone.
    async fn authenticate(&mut self) -> Result<()> {
        let Some(user) = self.config.username.clone() else {
            return Ok(());
        };
        let resp = self.round_trip(&format!("AUTHINFO USER {user}")).await?;
        match resp.code {
            response::AUTH_ACCEPTED => return Ok(()),
            response::PASSWORD_REQUIRED => {}
            _ => return Err(NntpError::AuthRejected(resp.text)),
        }

        let pass = self.config.password.clone().unwrap_or_default();
        trace!(provider = self.config.display_name(), "> AUTHINFO PASS ***");
        self.stream
            .write_all(format!("AUTHINFO PASS {pass}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;
        let resp = self.read_response().await?;
        if resp.code == response::AUTH_ACCEPTED {
            Ok(())
        } else {
            Err(NntpError::AuthRejected(resp.text))
        }
    }

    async fn round_trip(&mut self, command: &str) -> Result<Response> {
        trace!(provider = self.config.display_name(), "> {command}");
        self.stream
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Response> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(NntpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        trace!(provider = self.config.display_name(), "< {}", line.trim_end());
        Response::parse(&line)
    }

    /// Read a dot-terminated multi-line payload, unstuffing leading `..`.
    async fn read_dot_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = self.stream.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(NntpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                )));
            }
            if line == b".\r\n" || line == b".\n" {
                return Ok(body);
            }
            let data: &[u8] = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line
            };
            if body.len() + data.len() > MAX_BODY_SIZE {
                return Err(NntpError::BodyTooLarge {
                    limit: MAX_BODY_SIZE,
                });
            }
            body.extend_from_slice(data);
        }
    }

    async fn dial(config: &ProviderConfig) -> Result<BufStream<Box<dyn RawStream>>> {
        let tcp = match timeout(CONNECT_TIMEOUT, TcpStream::connect(config.addr())).await {
            Ok(r) => r?,
            Err(_) => return Err(NntpError::Timeout(CONNECT_TIMEOUT)),
        };
        tcp.set_nodelay(true)?;

        let raw: Box<dyn RawStream> = if config.tls {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| NntpError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

            let name = rustls::pki_types::ServerName::try_from(config.host.clone())
                .map_err(|_| NntpError::InvalidServerName(config.host.clone()))?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let tls = match timeout(CONNECT_TIMEOUT, connector.connect(name, tcp)).await {
                Ok(r) => r?,
                Err(_) => return Err(NntpError::Timeout(CONNECT_TIMEOUT)),
            };
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        Ok(BufStream::new(raw))
    }
}

impl std::fmt::Debug for NntpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NntpClient")
            .field("provider", &self.config.display_name())
            .field("idle_for", &self.idle_for())
            .finish_non_exhaustive()
    }
}
