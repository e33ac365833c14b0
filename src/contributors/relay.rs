//! Local TCP endpoint receiving contributor batches from the push relay.
//!
//! Protocol: the peer connects, writes one JSON object
//! `{login: {"name": ..., "email": ...}}` and closes its write side. Nothing
//! is written back.

use super::fetcher::ContributorSource;
use super::ledger::Ledger;
use super::notifier::Notifier;
use super::record::{is_bot_login, ContributorRecord, Mapping};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Larger payloads are dropped unread past this size.
const MAX_PAYLOAD: u64 = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedAuthor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

pub type PushPayload = IndexMap<String, PushedAuthor>;

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(default)]
    commits: Vec<PushCommit>,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    author: PushCommitAuthor,
}

#[derive(Debug, Deserialize)]
struct PushCommitAuthor {
    username: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
}

/// Collects `{username: {name, email}}` from a GitHub `push` webhook payload.
/// Commits whose author has no GitHub account are left out.
pub fn authors_from_push_event(raw: &str) -> serde_json::Result<PushPayload> {
    let event: PushEvent = serde_json::from_str(raw)?;
    Ok(event
        .commits
        .into_iter()
        .filter_map(|commit| {
            let author = commit.author;
            author.username.filter(|u| !u.is_empty()).map(|username| {
                (
                    username,
                    PushedAuthor {
                        name: author.name,
                        email: author.email,
                    },
                )
            })
        })
        .collect())
}

/// Sends one batch to a running relay: connect, write, close.
pub async fn send_batch(addr: SocketAddr, payload: &PushPayload) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Handle to the running accept loop.
pub struct RelayHandle {
    pub local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stops accepting, abandons the connection in progress, and waits for
    /// the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Relay: accept loop ended abnormally: {}", e);
        }
    }
}

pub struct IntakeRelay {
    ledger: Arc<Ledger>,
    source: Arc<dyn ContributorSource>,
    notifier: Arc<Notifier>,
}

impl IntakeRelay {
    pub fn new(
        ledger: Arc<Ledger>,
        source: Arc<dyn ContributorSource>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            ledger,
            source,
            notifier,
        }
    }

    /// Binds `addr` and serves connections one at a time until stopped.
    pub async fn spawn(self, addr: SocketAddr) -> anyhow::Result<RelayHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        info!("Relay: listening on {}", local_addr);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Relay: shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Relay: connection from {}", peer);
                            tokio::select! {
                                _ = self.handle_connection(stream) => {}
                                _ = shutdown_rx.changed() => {
                                    info!("Relay: shutting down, dropping connection from {}", peer);
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!("Relay: accept failed: {}", e),
                    }
                }
            }
        });

        Ok(RelayHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    async fn handle_connection(&self, stream: TcpStream) {
        let mut raw = Vec::new();
        let mut limited = stream.take(MAX_PAYLOAD + 1);
        match tokio::time::timeout(READ_TIMEOUT, limited.read_to_end(&mut raw)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("Relay: failed to read payload: {}", e);
                return;
            }
            Err(_) => {
                warn!("Relay: peer did not finish writing within {:?}", READ_TIMEOUT);
                return;
            }
        }
        if raw.len() as u64 > MAX_PAYLOAD {
            warn!("Relay: payload larger than {} bytes dropped", MAX_PAYLOAD);
            return;
        }
        if let Err(e) = self.handle_payload(&raw).await {
            warn!("Relay: dropped batch: {}", e);
        }
    }

    /// Processes one raw payload. Returns the records that became pending.
    pub async fn handle_payload(&self, raw: &[u8]) -> anyhow::Result<Vec<ContributorRecord>> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            debug!("Relay: empty payload");
            return Ok(Vec::new());
        }
        let payload: PushPayload = serde_json::from_slice(raw)?;

        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for (login, author) in payload {
            if is_bot_login(&login) {
                debug!("Relay: skipping automation account {}", login);
                continue;
            }
            match self.ledger.resolve_login(&login).await {
                Some(id) => match self.ledger.locate(&id).await {
                    Some(Mapping::Added) | Some(Mapping::LeftGuild) => {
                        debug!("Relay: {} is already handled", login);
                    }
                    _ => known.push((login, author, id)),
                },
                None => unknown.push((login, author)),
            }
        }

        let mut records: Vec<ContributorRecord> = known
            .into_iter()
            .map(|(login, author, id)| {
                ContributorRecord::new(&id, &login, &display_name(&author, &login), &author.email)
            })
            .collect();

        if !unknown.is_empty() {
            let logins: Vec<String> = unknown.iter().map(|(login, _)| login.clone()).collect();
            let accounts = self.source.lookup_users(&logins).await?;
            for (login, author) in unknown {
                match accounts.get(&login) {
                    Some(account) => records.push(ContributorRecord::new(
                        &account.id,
                        &account.login,
                        &display_name(&author, &account.login),
                        &author.email,
                    )),
                    None => warn!("Relay: could not resolve GitHub login {}", login),
                }
            }
        }

        if records.is_empty() {
            return Ok(Vec::new());
        }

        let inserted = self.ledger.merge_pending(records).await?;
        self.notifier.notify(&inserted).await;
        Ok(inserted)
    }
}

fn display_name(author: &PushedAuthor, login: &str) -> String {
    if author.name.trim().is_empty() {
        login.to_string()
    } else {
        author.name.clone()
    }
}
