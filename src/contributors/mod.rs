//! New-contributor tracking: fetch commit authors, accept pushes from the
//! relay, announce newcomers and link them to guild members.

pub mod fetcher;
pub mod ledger;
pub mod notifier;
pub mod reconciler;
pub mod record;
pub mod relay;

use fetcher::{CommitFetcher, ContributorSource};
use ledger::{Ledger, LedgerError};
use notifier::{ChannelSink, Notifier};
use reconciler::Reconciler;
use record::ContributorRecord;
use relay::{IntakeRelay, RelayHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::db::Database;

pub struct ContributorsPlugin {
    pub ledger: Arc<Ledger>,
    pub fetcher: CommitFetcher,
    pub reconciler: Reconciler,
    source: Arc<dyn ContributorSource>,
    notifier: Mutex<Option<Arc<Notifier>>>,
    relay: Mutex<Option<RelayHandle>>,
    shutdown: watch::Sender<bool>,
}

impl ContributorsPlugin {
    pub async fn load(db: Database, source: Arc<dyn ContributorSource>) -> Result<Self, LedgerError> {
        let ledger = Arc::new(Ledger::load(db).await?);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            fetcher: CommitFetcher::new(Arc::clone(&source), Arc::clone(&ledger)),
            reconciler: Reconciler::new(Arc::clone(&ledger)),
            ledger,
            source,
            notifier: Mutex::new(None),
            relay: Mutex::new(None),
            shutdown,
        })
    }

    /// Wires the notification sink and starts listening for relay pushes.
    pub async fn start(&self, sink: Arc<dyn ChannelSink>, relay_addr: SocketAddr) -> anyhow::Result<()> {
        let notifier = Arc::new(Notifier::new(Arc::clone(&self.ledger), sink));
        *self.notifier.lock().await = Some(Arc::clone(&notifier));

        let mut relay = self.relay.lock().await;
        if relay.is_some() {
            return Ok(());
        }
        let handle = IntakeRelay::new(Arc::clone(&self.ledger), Arc::clone(&self.source), notifier)
            .spawn(relay_addr)
            .await?;
        *relay = Some(handle);
        Ok(())
    }

    /// Cancelled when the plugin unloads.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn notify(&self, records: &[ContributorRecord]) -> usize {
        let notifier = self.notifier.lock().await.clone();
        match notifier {
            Some(notifier) => notifier.notify(records).await,
            None => {
                warn!("Contributors: {} record(s) not announced, no sink yet", records.len());
                0
            }
        }
    }

    pub async fn on_member_join(&self, member_id: u64) -> Result<(), LedgerError> {
        let returned = self.ledger.member_joined(member_id).await?;
        if !returned.is_empty() {
            info!(
                "Contributors: member {} rejoined, {} record(s) back to pending",
                member_id,
                returned.len()
            );
            self.notify(&returned).await;
        }
        Ok(())
    }

    pub async fn on_member_leave(&self, member_id: u64) -> Result<(), LedgerError> {
        let departed = self.ledger.member_left(member_id).await?;
        if !departed.is_empty() {
            info!(
                "Contributors: member {} left, {} record(s) moved to left_guild",
                member_id,
                departed.len()
            );
        }
        Ok(())
    }

    /// Stops the relay, cancels an interactive session, and waits for the
    /// ledger to go quiet.
    pub async fn unload(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.relay.lock().await.take() {
            handle.stop().await;
        }
        self.ledger.close().await;
        info!("Contributors: unloaded");
    }
}
