//! Scripted in-process NNTP server for tests.
//!
//! Binds to an ephemeral localhost port and speaks just enough of the
//! protocol to exercise the client and pools: greeting, two-step AUTHINFO,
//! GROUP, STAT, BODY with dot-stuffing, QUIT. Downstream crates enable the
//! `test-server` feature to drive end-to-end scenarios against it.

use crate::config::ProviderConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the server reacts to a BODY request for one article.
#[derive(Debug, Clone)]
pub enum ArticleBehavior {
    /// Serve this payload (dot-stuffing applied on the wire).
    Body(Vec<u8>),
    /// Reply 430.
    Missing,
    /// Close the connection without replying.
    Disconnect,
    /// Step through behaviors per request; the last one repeats.
    Script(Vec<ArticleBehavior>),
}

struct ServerState {
    articles: Mutex<HashMap<String, ArticleBehavior>>,
    auth: Option<(String, String)>,
    connections: AtomicUsize,
    body_requests: Mutex<Vec<String>>,
}

/// A running mock server.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    pub async fn start_with_auth(user: &str, pass: &str) -> Self {
        Self::start_inner(Some((user.to_string(), pass.to_string()))).await
    }

    #[allow(clippy::expect_used)]
    async fn start_inner(auth: Option<(String, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Operation should succeed");
        let addr = listener.local_addr().expect("Operation should succeed");
        let state = Arc::new(ServerState {
            articles: Mutex::new(HashMap::new()),
            auth,
            connections: AtomicUsize::new(0),
            body_requests: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(socket, conn_state).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Provider configuration pointing at this server.
    pub fn provider_config(&self, max_connections: usize) -> ProviderConfig {
        ProviderConfig {
            name: "mock".to_string(),
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            tls: false,
            username: self.state.auth.as_ref().map(|(u, _)| u.clone()),
            password: self.state.auth.as_ref().map(|(_, p)| p.clone()),
            max_connections,
        }
    }

    pub fn add_article(&self, message_id: &str, behavior: ArticleBehavior) {
        self.state
            .articles
            .lock()
            .insert(message_id.to_string(), behavior);
    }

    /// Total connections ever accepted.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// How many BODY requests were made for one article.
    pub fn body_request_count(&self, message_id: &str) -> usize {
        self.state
            .body_requests
            .lock()
            .iter()
            .filter(|id| id.as_str() == message_id)
            .count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

enum Resolved {
    Body(Vec<u8>),
    Missing,
    Disconnect,
}

impl ServerState {
    /// Resolve the behavior for one BODY request, advancing scripts.
    fn next_behavior(&self, message_id: &str) -> Resolved {
        let mut articles = self.articles.lock();
        let Some(behavior) = articles.get_mut(message_id) else {
            return Resolved::Missing;
        };
        let step = match behavior {
            ArticleBehavior::Script(steps) if steps.len() > 1 => steps.remove(0),
            ArticleBehavior::Script(steps) => {
                steps.first().cloned().unwrap_or(ArticleBehavior::Missing)
            }
            other => other.clone(),
        };
        match step {
            ArticleBehavior::Body(b) => Resolved::Body(b),
            ArticleBehavior::Disconnect => Resolved::Disconnect,
            ArticleBehavior::Missing | ArticleBehavior::Script(_) => Resolved::Missing,
        }
    }
}

async fn handle_connection(socket: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let mut stream = BufStream::new(socket);
    stream
        .write_all(b"200 newsreel test server ready\r\n")
        .await?;
    stream.flush().await?;

    let mut authed = state.auth.is_none();
    let mut pending_user: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end();
        let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));

        match verb.to_ascii_uppercase().as_str() {
            "AUTHINFO" => {
                let (kind, value) = rest.split_once(' ').unwrap_or((rest, ""));
                match kind.to_ascii_uppercase().as_str() {
                    "USER" => {
                        pending_user = Some(value.to_string());
                        stream.write_all(b"381 password required\r\n").await?;
                    }
                    "PASS" => {
                        let ok = state.auth.as_ref().is_some_and(|(user, pass)| {
                            pending_user.as_deref() == Some(user.as_str()) && value == pass
                        });
                        if ok {
                            authed = true;
                            stream.write_all(b"281 authentication accepted\r\n").await?;
                        } else {
                            stream.write_all(b"481 authentication failed\r\n").await?;
                        }
                    }
                    _ => stream.write_all(b"501 syntax error\r\n").await?,
                }
            }
            "GROUP" => {
                if authed {
                    stream
                        .write_all(format!("211 0 0 0 {rest}\r\n").as_bytes())
                        .await?;
                } else {
                    stream.write_all(b"480 authentication required\r\n").await?;
                }
            }
            "STAT" => {
                let id = rest.trim_matches(['<', '>']);
                if !authed {
                    stream.write_all(b"480 authentication required\r\n").await?;
                } else if state.articles.lock().contains_key(id) {
                    stream
                        .write_all(format!("223 0 <{id}>\r\n").as_bytes())
                        .await?;
                } else {
                    stream.write_all(b"430 no such article\r\n").await?;
                }
            }
            "BODY" => {
                let id = rest.trim_matches(['<', '>']);
                if !authed {
                    stream.write_all(b"480 authentication required\r\n").await?;
                    stream.flush().await?;
                    continue;
                }
                state.body_requests.lock().push(id.to_string());
                match state.next_behavior(id) {
                    Resolved::Missing => {
                        stream.write_all(b"430 no such article\r\n").await?;
                    }
                    Resolved::Disconnect => return Ok(()),
                    Resolved::Body(payload) => {
                        stream
                            .write_all(format!("222 0 <{id}> body follows\r\n").as_bytes())
                            .await?;
                        stream.write_all(&dot_stuffed(&payload)).await?;
                        stream.write_all(b".\r\n").await?;
                    }
                }
            }
            "QUIT" => {
                stream.write_all(b"205 bye\r\n").await?;
                stream.flush().await?;
                return Ok(());
            }
            _ => stream.write_all(b"500 unknown command\r\n").await?,
        }
        stream.flush().await?;
    }
}

/// Apply wire dot-stuffing and guarantee a trailing line break so the
/// terminator sits on its own line.
fn dot_stuffed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    let mut at_line_start = true;
    for &b in payload {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }
    if !out.ends_with(b"\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}
