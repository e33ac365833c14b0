//! Persisted pending / added / left-guild contributor sets.

use super::record::{ContributorRecord, Mapping};
use crate::db::Database;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const NAMESPACE: &str = "new_contributors";
const LOGIN_TO_ID_KEY: &str = "login_to_id";
const OUTPUT_CHANNELS_KEY: &str = "output_channels";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("`{id}` was not found in {mapping}")]
    NotFound { id: String, mapping: Mapping },
    #[error("no contributor is known by the login `{0}`")]
    UnknownLogin(String),
    #[error("`{0}` is not ignored")]
    NotIgnored(String),
    #[error("`{id}` is already tracked in {actual}")]
    WrongMapping { id: String, actual: Mapping },
    #[error("ledger storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerState {
    pub pending: IndexMap<String, ContributorRecord>,
    pub added: IndexMap<String, ContributorRecord>,
    pub left_guild: IndexMap<String, ContributorRecord>,
    /// Lowercased GitHub login to node id.
    pub login_to_id: HashMap<String, String>,
    pub output_channels: Vec<u64>,
}

impl LedgerState {
    pub fn mapping(&self, mapping: Mapping) -> &IndexMap<String, ContributorRecord> {
        match mapping {
            Mapping::Pending => &self.pending,
            Mapping::Added => &self.added,
            Mapping::LeftGuild => &self.left_guild,
        }
    }

    fn mapping_mut(&mut self, mapping: Mapping) -> &mut IndexMap<String, ContributorRecord> {
        match mapping {
            Mapping::Pending => &mut self.pending,
            Mapping::Added => &mut self.added,
            Mapping::LeftGuild => &mut self.left_guild,
        }
    }

    pub fn locate(&self, id: &str) -> Option<Mapping> {
        Mapping::ALL
            .into_iter()
            .find(|m| self.mapping(*m).contains_key(id))
    }

    fn id_for_login(&self, login: &str) -> Result<String, LedgerError> {
        self.login_to_id
            .get(&login.to_lowercase())
            .cloned()
            .ok_or_else(|| LedgerError::UnknownLogin(login.to_string()))
    }

    fn move_record(
        &mut self,
        id: &str,
        from: Mapping,
        to: Mapping,
        transform: impl FnOnce(&mut ContributorRecord),
    ) -> Result<ContributorRecord, LedgerError> {
        let mut record = self
            .mapping_mut(from)
            .shift_remove(id)
            .ok_or_else(|| LedgerError::NotFound {
                id: id.to_string(),
                mapping: from,
            })?;
        transform(&mut record);
        self.mapping_mut(to).insert(id.to_string(), record.clone());
        Ok(record)
    }

    fn load(db: &Database) -> anyhow::Result<Self> {
        let mut state = LedgerState::default();
        for mapping in Mapping::ALL {
            if let Some(records) = db.get_json(NAMESPACE, mapping.key())? {
                *state.mapping_mut(mapping) = records;
            }
        }
        state.login_to_id = db.get_json(NAMESPACE, LOGIN_TO_ID_KEY)?.unwrap_or_default();
        state.output_channels = db.get_json(NAMESPACE, OUTPUT_CHANNELS_KEY)?.unwrap_or_default();
        Ok(state)
    }

    fn save(&self, db: &Database) -> anyhow::Result<()> {
        db.set_values(
            NAMESPACE,
            &[
                (Mapping::Pending.key(), serde_json::to_string(&self.pending)?),
                (Mapping::Added.key(), serde_json::to_string(&self.added)?),
                (Mapping::LeftGuild.key(), serde_json::to_string(&self.left_guild)?),
                (LOGIN_TO_ID_KEY, serde_json::to_string(&self.login_to_id)?),
                (OUTPUT_CHANNELS_KEY, serde_json::to_string(&self.output_channels)?),
            ],
        )
    }
}

/// Contributor ledger shared by the fetcher, the relay, commands and events.
///
/// A single lock guards the whole state. Each mutation works on a copy which
/// replaces the live state only after it has been written to the database.
pub struct Ledger {
    db: Database,
    state: Arc<Mutex<LedgerState>>,
}

impl Ledger {
    pub async fn load(db: Database) -> Result<Self, LedgerError> {
        let state = db.run_blocking(|db| LedgerState::load(db)).await?;
        info!(
            "Ledger: loaded {} pending, {} added, {} left-guild contributors",
            state.pending.len(),
            state.added.len(),
            state.left_guild.len()
        );
        Ok(Self {
            db,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Runs one read-modify-write.
    ///
    /// The work happens on its own task, so a caller dropped mid-way (plugin
    /// teardown) cannot leave a half-applied change behind.
    async fn transact<R, F>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&mut LedgerState) -> Result<R, LedgerError> + Send + 'static,
        R: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let db = self.db.clone();
        let task = tokio::spawn(async move {
            let mut guard = state.lock_owned().await;
            let mut draft = guard.clone();
            let out = f(&mut draft)?;
            if draft != *guard {
                let snapshot = draft.clone();
                db.run_blocking(move |db| snapshot.save(db)).await?;
                *guard = draft;
            }
            Ok::<R, LedgerError>(out)
        });
        task.await
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("ledger task failed: {}", e)))?
    }

    pub async fn get(&self, mapping: Mapping, id: &str) -> Option<ContributorRecord> {
        self.state.lock().await.mapping(mapping).get(id).cloned()
    }

    pub async fn locate(&self, id: &str) -> Option<Mapping> {
        self.state.lock().await.locate(id)
    }

    /// Inserts or replaces a record in `mapping`.
    ///
    /// Fails with [`LedgerError::WrongMapping`] when the identity currently
    /// lives in another mapping; use [`Ledger::move_record`] for that.
    pub async fn upsert(
        &self,
        mapping: Mapping,
        id: &str,
        record: ContributorRecord,
    ) -> Result<(), LedgerError> {
        let id = id.to_string();
        self.transact(move |state| {
            if let Some(actual) = state.locate(&id) {
                if actual != mapping {
                    return Err(LedgerError::WrongMapping { id, actual });
                }
            }
            state
                .login_to_id
                .insert(record.username.to_lowercase(), id.clone());
            state.mapping_mut(mapping).insert(id, record);
            Ok(())
        })
        .await
    }

    pub async fn move_record<F>(
        &self,
        id: &str,
        from: Mapping,
        to: Mapping,
        transform: F,
    ) -> Result<ContributorRecord, LedgerError>
    where
        F: FnOnce(&mut ContributorRecord) + Send + 'static,
    {
        let id = id.to_string();
        let record = self
            .transact(move |state| state.move_record(&id, from, to, transform))
            .await?;
        debug!("Ledger: moved {} from {} to {}", record.id, from, to);
        Ok(record)
    }

    /// Adds unseen identities to `pending`, first one wins.
    ///
    /// Identities already tracked in any mapping keep their existing record.
    /// Every login is remembered. Returns the records that were inserted.
    pub async fn merge_pending(
        &self,
        records: Vec<ContributorRecord>,
    ) -> Result<Vec<ContributorRecord>, LedgerError> {
        let inserted = self
            .transact(move |state| {
                let mut inserted = Vec::new();
                for record in records {
                    state
                        .login_to_id
                        .insert(record.username.to_lowercase(), record.id.clone());
                    if state.locate(&record.id).is_some() {
                        continue;
                    }
                    state.pending.insert(record.id.clone(), record.clone());
                    inserted.push(record);
                }
                Ok(inserted)
            })
            .await?;
        if !inserted.is_empty() {
            info!("Ledger: {} new pending contributor(s)", inserted.len());
        }
        Ok(inserted)
    }

    /// `pending → added`, attaching `member` (or `None` to ignore).
    pub async fn link(
        &self,
        id: &str,
        member: Option<u64>,
    ) -> Result<ContributorRecord, LedgerError> {
        self.move_record(id, Mapping::Pending, Mapping::Added, move |record| {
            record.discord_user_id = member;
        })
        .await
    }

    pub async fn link_login(
        &self,
        login: &str,
        member: Option<u64>,
    ) -> Result<ContributorRecord, LedgerError> {
        let login = login.to_string();
        self.transact(move |state| {
            let id = state.id_for_login(&login)?;
            state.move_record(&id, Mapping::Pending, Mapping::Added, |record| {
                record.discord_user_id = member;
            })
        })
        .await
    }

    pub async fn ignore(&self, login: &str) -> Result<ContributorRecord, LedgerError> {
        self.link_login(login, None).await
    }

    /// `added → pending` for a record that was ignored.
    pub async fn unignore(&self, login: &str) -> Result<ContributorRecord, LedgerError> {
        let login = login.to_string();
        self.transact(move |state| {
            let id = state.id_for_login(&login)?;
            let ignored = state.added.get(&id).map(ContributorRecord::is_ignored);
            match ignored {
                Some(false) => Err(LedgerError::NotIgnored(login)),
                Some(true) => state.move_record(&id, Mapping::Added, Mapping::Pending, |_| {}),
                None => Err(LedgerError::NotFound {
                    id,
                    mapping: Mapping::Added,
                }),
            }
        })
        .await
    }

    /// `added → left_guild` for every record linked to `member_id`.
    pub async fn member_left(&self, member_id: u64) -> Result<Vec<ContributorRecord>, LedgerError> {
        self.transact(move |state| {
            let ids: Vec<String> = state
                .added
                .iter()
                .filter(|(_, r)| r.discord_user_id == Some(member_id))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .map(|id| state.move_record(id, Mapping::Added, Mapping::LeftGuild, |_| {}))
                .collect()
        })
        .await
    }

    /// `left_guild → pending` for every record linked to `member_id`.
    ///
    /// The member id stays on the record as the previously observed link.
    pub async fn member_joined(&self, member_id: u64) -> Result<Vec<ContributorRecord>, LedgerError> {
        self.transact(move |state| {
            let ids: Vec<String> = state
                .left_guild
                .iter()
                .filter(|(_, r)| r.discord_user_id == Some(member_id))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .map(|id| state.move_record(id, Mapping::LeftGuild, Mapping::Pending, |_| {}))
                .collect()
        })
        .await
    }

    pub async fn resolve_login(&self, login: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .login_to_id
            .get(&login.to_lowercase())
            .cloned()
    }

    pub async fn remember_logins(&self, pairs: Vec<(String, String)>) -> Result<(), LedgerError> {
        self.transact(move |state| {
            for (login, id) in pairs {
                state.login_to_id.insert(login.to_lowercase(), id);
            }
            Ok(())
        })
        .await
    }

    /// Returns `false` if the channel was already configured.
    pub async fn add_output_channel(&self, channel_id: u64) -> Result<bool, LedgerError> {
        self.transact(move |state| {
            if state.output_channels.contains(&channel_id) {
                return Ok(false);
            }
            state.output_channels.push(channel_id);
            Ok(true)
        })
        .await
    }

    /// Returns `false` if the channel was not configured.
    pub async fn remove_output_channel(&self, channel_id: u64) -> Result<bool, LedgerError> {
        self.transact(move |state| {
            let before = state.output_channels.len();
            state.output_channels.retain(|c| *c != channel_id);
            Ok(state.output_channels.len() != before)
        })
        .await
    }

    pub async fn output_channels(&self) -> Vec<u64> {
        self.state.lock().await.output_channels.clone()
    }

    /// Pending records in insertion order.
    pub async fn pending(&self) -> Vec<ContributorRecord> {
        self.state.lock().await.pending.values().cloned().collect()
    }

    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    /// Waits for any in-flight transaction to finish.
    pub async fn close(&self) {
        let _guard = self.state.lock().await;
        debug!("Ledger: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, login: &str) -> ContributorRecord {
        ContributorRecord::new(id, login, &format!("{} Name", login), &format!("{}@x.com", login))
    }

    async fn test_ledger() -> (Ledger, Database) {
        let db = Database::in_memory().unwrap();
        (Ledger::load(db.clone()).await.unwrap(), db)
    }

    fn assert_disjoint(state: &LedgerState) {
        for (id, _) in state.pending.iter().chain(&state.added).chain(&state.left_guild) {
            let count = Mapping::ALL
                .into_iter()
                .filter(|m| state.mapping(*m).contains_key(id))
                .count();
            assert_eq!(count, 1, "{} is in {} mappings", id, count);
        }
    }

    #[tokio::test]
    async fn test_merge_keeps_existing_pending_record() {
        let (ledger, _db) = test_ledger().await;
        let inserted = ledger.merge_pending(vec![record("U1", "alice")]).await.unwrap();
        assert_eq!(inserted.len(), 1);

        let mut changed = record("U1", "alice");
        changed.display_name = "Someone Else".to_string();
        let inserted = ledger.merge_pending(vec![changed]).await.unwrap();
        assert!(inserted.is_empty());

        let kept = ledger.get(Mapping::Pending, "U1").await.unwrap();
        assert_eq!(kept.display_name, "alice Name");
    }

    #[tokio::test]
    async fn test_merge_first_seen_wins_within_batch() {
        let (ledger, _db) = test_ledger().await;
        let mut second = record("U1", "alice");
        second.email = "other@x.com".to_string();
        let inserted = ledger
            .merge_pending(vec![record("U1", "alice"), second])
            .await
            .unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(ledger.get(Mapping::Pending, "U1").await.unwrap().email, "alice@x.com");
    }

    #[tokio::test]
    async fn test_merge_skips_added_and_left_guild() {
        let (ledger, _db) = test_ledger().await;
        ledger.merge_pending(vec![record("U1", "alice"), record("U2", "bob")]).await.unwrap();
        ledger.link("U1", Some(10)).await.unwrap();
        ledger.link("U2", Some(20)).await.unwrap();
        ledger.member_left(20).await.unwrap();

        let inserted = ledger
            .merge_pending(vec![record("U1", "alice"), record("U2", "bob")])
            .await
            .unwrap();
        assert!(inserted.is_empty());
        assert_disjoint(&ledger.snapshot().await);
    }

    #[tokio::test]
    async fn test_add_by_login() {
        let (ledger, _db) = test_ledger().await;
        ledger.merge_pending(vec![record("U1", "alice")]).await.unwrap();

        let linked = ledger.link_login("Alice", Some(42)).await.unwrap();
        assert_eq!(linked.discord_user_id, Some(42));
        assert!(ledger.get(Mapping::Pending, "U1").await.is_none());
        assert_eq!(
            ledger.get(Mapping::Added, "U1").await.unwrap().discord_user_id,
            Some(42)
        );
    }

    #[tokio::test]
    async fn test_unknown_login() {
        let (ledger, _db) = test_ledger().await;
        let err = ledger.link_login("nobody", Some(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownLogin(login) if login == "nobody"));
    }

    #[tokio::test]
    async fn test_move_missing_is_not_found() {
        let (ledger, _db) = test_ledger().await;
        let before = ledger.snapshot().await;
        let err = ledger
            .move_record("U9", Mapping::Pending, Mapping::Added, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { mapping: Mapping::Pending, .. }));
        assert_eq!(ledger.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_ignore_and_unignore() {
        let (ledger, _db) = test_ledger().await;
        ledger.merge_pending(vec![record("U1", "alice"), record("U2", "bob")]).await.unwrap();

        let ignored = ledger.ignore("alice").await.unwrap();
        assert!(ignored.is_ignored());
        assert!(ledger.get(Mapping::Added, "U1").await.is_some());

        ledger.unignore("alice").await.unwrap();
        assert!(ledger.get(Mapping::Pending, "U1").await.is_some());

        ledger.link_login("bob", Some(7)).await.unwrap();
        let err = ledger.unignore("bob").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotIgnored(_)));
        assert!(ledger.get(Mapping::Added, "U2").await.is_some());
    }

    #[tokio::test]
    async fn test_member_leave_and_rejoin_round_trip() {
        let (ledger, _db) = test_ledger().await;
        let original = record("U1", "alice");
        ledger.merge_pending(vec![original.clone()]).await.unwrap();
        ledger.link("U1", Some(99)).await.unwrap();

        let left = ledger.member_left(99).await.unwrap();
        assert_eq!(left.len(), 1);
        assert!(ledger.get(Mapping::LeftGuild, "U1").await.is_some());
        assert!(ledger.get(Mapping::Added, "U1").await.is_none());

        let rejoined = ledger.member_joined(99).await.unwrap();
        assert_eq!(rejoined.len(), 1);
        let back = ledger.get(Mapping::Pending, "U1").await.unwrap();
        assert_eq!(back.discord_user_id, Some(99));
        assert_eq!(
            ContributorRecord { discord_user_id: None, ..back },
            original
        );
        assert_disjoint(&ledger.snapshot().await);
    }

    #[tokio::test]
    async fn test_member_events_for_unknown_member_are_noops() {
        let (ledger, _db) = test_ledger().await;
        ledger.merge_pending(vec![record("U1", "alice")]).await.unwrap();
        assert!(ledger.member_left(5).await.unwrap().is_empty());
        assert!(ledger.member_joined(5).await.unwrap().is_empty());
        assert!(ledger.get(Mapping::Pending, "U1").await.is_some());
    }

    #[tokio::test]
    async fn test_upsert_rejects_other_mapping() {
        let (ledger, _db) = test_ledger().await;
        ledger.upsert(Mapping::Pending, "U1", record("U1", "alice")).await.unwrap();
        let err = ledger
            .upsert(Mapping::Added, "U1", record("U1", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::WrongMapping { actual: Mapping::Pending, .. }));
        assert_eq!(ledger.resolve_login("ALICE").await.as_deref(), Some("U1"));
    }

    #[tokio::test]
    async fn test_output_channels() {
        let (ledger, _db) = test_ledger().await;
        assert!(ledger.add_output_channel(1).await.unwrap());
        assert!(ledger.add_output_channel(2).await.unwrap());
        assert!(!ledger.add_output_channel(1).await.unwrap());
        assert_eq!(ledger.output_channels().await, vec![1, 2]);

        assert!(ledger.remove_output_channel(1).await.unwrap());
        assert!(!ledger.remove_output_channel(1).await.unwrap());
        assert_eq!(ledger.output_channels().await, vec![2]);
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let (ledger, db) = test_ledger().await;
        ledger
            .merge_pending(vec![record("U1", "alice"), record("U2", "bob"), record("U3", "carol")])
            .await
            .unwrap();
        ledger.link("U2", Some(2)).await.unwrap();
        ledger.add_output_channel(55).await.unwrap();
        ledger.close().await;

        let reloaded = Ledger::load(db).await.unwrap();
        let ids: Vec<String> = reloaded.pending().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["U1", "U3"]);
        assert!(reloaded.get(Mapping::Added, "U2").await.is_some());
        assert_eq!(reloaded.output_channels().await, vec![55]);
        assert_eq!(reloaded.resolve_login("carol").await.as_deref(), Some("U3"));
    }

    #[tokio::test]
    async fn test_concurrent_links_stay_disjoint() {
        let (ledger, _db) = test_ledger().await;
        let ledger = Arc::new(ledger);
        ledger.merge_pending(vec![record("U1", "alice")]).await.unwrap();

        let mut handles = Vec::new();
        for member in 0..8u64 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move { ledger.link("U1", Some(member)).await }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_disjoint(&ledger.snapshot().await);
    }
}
