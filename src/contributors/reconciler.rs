//! Interactive session linking pending contributors to guild members.

use super::ledger::{Ledger, LedgerError};
use super::record::{ContributorRecord, Mapping};
use async_trait::async_trait;
use crate::outgoing::OutgoingPipeline;
use poise::serenity_prelude as serenity;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// The operator on the other side of the session.
#[async_trait]
pub trait OperatorPrompt: Send {
    async fn say(&mut self, text: &str) -> anyhow::Result<()>;

    /// Waits for the operator's next message. `None` means the wait was
    /// cancelled and the session must end.
    async fn next_reply(&mut self) -> Option<String>;
}

/// Resolves an operator-supplied member reference to a Discord user id.
#[async_trait]
pub trait MemberLookup: Send + Sync {
    async fn resolve(&self, reference: &MemberRef) -> Option<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRef {
    Id(u64),
    Name(String),
}

impl MemberRef {
    /// Accepts `<@id>`, `<@!id>`, a raw id, or anything else as a name.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        let digits = input
            .strip_prefix("<@")
            .and_then(|rest| rest.strip_suffix('>'))
            .map(|rest| rest.trim_start_matches('!'))
            .unwrap_or(input);
        Some(match digits.parse::<u64>() {
            Ok(id) if id != 0 => MemberRef::Id(id),
            _ => MemberRef::Name(input.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Exit,
    Skip,
    Link(MemberRef),
}

impl Reply {
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        match trimmed.to_lowercase().as_str() {
            "exit" => return Some(Reply::Exit),
            "skip" => return Some(Reply::Skip),
            _ => {}
        }
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let head = parts.next().unwrap_or_default().to_lowercase();
        let reference = match (head.as_str(), parts.next()) {
            ("link" | "add", Some(rest)) => rest,
            _ => trimmed,
        };
        MemberRef::parse(reference).map(Reply::Link)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("an interactive session is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("could not talk to the operator: {0}")]
    Prompt(#[from] anyhow::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub linked: Vec<(String, u64)>,
    pub skipped: usize,
    pub exited_early: bool,
}

pub fn render_prompt(record: &ContributorRecord, position: usize, total: usize) -> String {
    let mut text = format!(
        "**[{}/{}]** {} (`{}`, <{}>)",
        position,
        total,
        record.display_name,
        record.username,
        record.profile_url()
    );
    if !record.email.is_empty() {
        text.push_str(&format!("\nEmail: `{}`", record.email));
    }
    if let Some(member_id) = record.discord_user_id {
        text.push_str(&format!("\nPreviously linked to <@{}>", member_id));
    }
    text.push_str("\nReply with a member (mention, id or name), `skip` or `exit`.");
    text
}

pub struct Reconciler {
    ledger: Arc<Ledger>,
    gate: Mutex<()>,
}

impl Reconciler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            gate: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Walks every pending record once. A concurrent call fails immediately
    /// with [`ReconcileError::AlreadyRunning`].
    pub async fn run(
        &self,
        prompt: &mut dyn OperatorPrompt,
        members: &dyn MemberLookup,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let _session = self
            .gate
            .try_lock()
            .map_err(|_| ReconcileError::AlreadyRunning)?;

        let pending = self.ledger.pending().await;
        let mut summary = ReconcileSummary::default();
        if pending.is_empty() {
            prompt.say("📭 There are no pending contributors.").await?;
            return Ok(summary);
        }
        info!("Reconciler: session started with {} pending", pending.len());

        let total = pending.len();
        'records: for (index, record) in pending.iter().enumerate() {
            if self.ledger.locate(&record.id).await != Some(Mapping::Pending) {
                debug!("Reconciler: {} left pending during the session", record.id);
                continue;
            }
            prompt.say(&render_prompt(record, index + 1, total)).await?;

            loop {
                let Some(reply) = prompt.next_reply().await else {
                    summary.exited_early = true;
                    break 'records;
                };
                match Reply::parse(&reply) {
                    Some(Reply::Exit) => {
                        summary.exited_early = true;
                        break 'records;
                    }
                    Some(Reply::Skip) => {
                        summary.skipped += 1;
                        break;
                    }
                    Some(Reply::Link(reference)) => {
                        let Some(member_id) = members.resolve(&reference).await else {
                            prompt
                                .say("❌ I couldn't find that member, try again (or `skip` / `exit`).")
                                .await?;
                            continue;
                        };
                        match self.ledger.link(&record.id, Some(member_id)).await {
                            Ok(_) => {
                                prompt
                                    .say(&format!("✅ Linked `{}` to <@{}>.", record.username, member_id))
                                    .await?;
                                summary.linked.push((record.id.clone(), member_id));
                            }
                            Err(LedgerError::NotFound { .. }) => {
                                prompt
                                    .say(&format!("⚠️ `{}` is no longer pending.", record.username))
                                    .await?;
                            }
                            Err(e) => return Err(e.into()),
                        }
                        break;
                    }
                    None => {
                        prompt
                            .say("❌ Reply with a member, `skip` or `exit`.")
                            .await?;
                    }
                }
            }
        }

        prompt
            .say(&format!(
                "Session finished: {} linked, {} skipped.",
                summary.linked.len(),
                summary.skipped
            ))
            .await?;
        info!(
            "Reconciler: session ended ({} linked, {} skipped, exited early: {})",
            summary.linked.len(),
            summary.skipped,
            summary.exited_early
        );
        Ok(summary)
    }
}

/// Talks to one operator in one channel. Replies from anyone else are ignored.
pub struct ChannelPrompt {
    ctx: serenity::Context,
    outgoing: Arc<OutgoingPipeline>,
    channel_id: serenity::ChannelId,
    operator: serenity::UserId,
    shutdown: watch::Receiver<bool>,
}

impl ChannelPrompt {
    pub fn new(
        ctx: serenity::Context,
        outgoing: Arc<OutgoingPipeline>,
        channel_id: serenity::ChannelId,
        operator: serenity::UserId,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            outgoing,
            channel_id,
            operator,
            shutdown,
        }
    }
}

#[async_trait]
impl OperatorPrompt for ChannelPrompt {
    async fn say(&mut self, text: &str) -> anyhow::Result<()> {
        self.outgoing.send(&self.ctx.http, self.channel_id, text).await
    }

    async fn next_reply(&mut self) -> Option<String> {
        let cancelled = *self.shutdown.borrow();
        if cancelled {
            return None;
        }
        let collector = self
            .channel_id
            .await_reply(&self.ctx)
            .author_id(self.operator)
            .into_future();
        tokio::select! {
            message = collector => message.map(|m| m.content),
            _ = self.shutdown.changed() => {
                debug!("Reconciler: wait cancelled by shutdown");
                None
            }
        }
    }
}

/// Resolves member references against a single guild.
pub struct GuildMembers {
    http: Arc<serenity::Http>,
    guild_id: serenity::GuildId,
}

impl GuildMembers {
    pub fn new(http: Arc<serenity::Http>, guild_id: serenity::GuildId) -> Self {
        Self { http, guild_id }
    }
}

#[async_trait]
impl MemberLookup for GuildMembers {
    async fn resolve(&self, reference: &MemberRef) -> Option<u64> {
        match reference {
            MemberRef::Id(id) => self
                .guild_id
                .member(&self.http, serenity::UserId::new(*id))
                .await
                .ok()
                .map(|m| m.user.id.get()),
            MemberRef::Name(name) => {
                let found = match self.guild_id.search_members(&self.http, name, Some(10)).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("Reconciler: member search for {} failed: {}", name, e);
                        return None;
                    }
                };
                let wanted = name.to_lowercase();
                let exact = found.iter().find(|m| {
                    m.user.name.to_lowercase() == wanted
                        || m.nick.as_deref().map(str::to_lowercase).as_deref() == Some(wanted.as_str())
                        || m.user.global_name.as_deref().map(str::to_lowercase).as_deref()
                            == Some(wanted.as_str())
                });
                match (exact, found.len()) {
                    (Some(member), _) => Some(member.user.id.get()),
                    (None, 1) => Some(found[0].user.id.get()),
                    _ => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Replays scripted replies; ends the session when the script runs out.
    #[derive(Default)]
    struct ScriptedPrompt {
        replies: VecDeque<String>,
        said: Vec<String>,
    }

    impl ScriptedPrompt {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_string()).collect(),
                said: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl OperatorPrompt for ScriptedPrompt {
        async fn say(&mut self, text: &str) -> anyhow::Result<()> {
            self.said.push(text.to_string());
            Ok(())
        }

        async fn next_reply(&mut self) -> Option<String> {
            self.replies.pop_front()
        }
    }

    /// Prompt fed from a channel so a test can hold the session open.
    struct QueuePrompt {
        replies: mpsc::Receiver<String>,
    }

    #[async_trait]
    impl OperatorPrompt for QueuePrompt {
        async fn say(&mut self, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn next_reply(&mut self) -> Option<String> {
            self.replies.recv().await
        }
    }

    /// Links U2 from another task while the operator answers the first prompt.
    struct InterferingPrompt {
        ledger: Arc<Ledger>,
        inner: ScriptedPrompt,
        linked: bool,
    }

    #[async_trait]
    impl OperatorPrompt for InterferingPrompt {
        async fn say(&mut self, text: &str) -> anyhow::Result<()> {
            self.inner.say(text).await
        }

        async fn next_reply(&mut self) -> Option<String> {
            if !self.linked {
                self.linked = true;
                let ledger = Arc::clone(&self.ledger);
                tokio::spawn(async move { ledger.link("U2", Some(77)).await })
                    .await
                    .unwrap()
                    .unwrap();
            }
            self.inner.next_reply().await
        }
    }

    struct Members(HashMap<String, u64>);

    #[async_trait]
    impl MemberLookup for Members {
        async fn resolve(&self, reference: &MemberRef) -> Option<u64> {
            match reference {
                MemberRef::Id(id) => self.0.values().find(|v| *v == id).copied(),
                MemberRef::Name(name) => self.0.get(name).copied(),
            }
        }
    }

    fn members() -> Members {
        Members(HashMap::from([("Bob".to_string(), 42), ("Carol".to_string(), 43)]))
    }

    async fn seeded() -> Arc<Ledger> {
        let ledger = Arc::new(Ledger::load(Database::in_memory().unwrap()).await.unwrap());
        ledger
            .merge_pending(vec![
                ContributorRecord::new("U1", "alice", "Alice", "a@x.com"),
                ContributorRecord::new("U2", "dave", "Dave", "d@x.com"),
                ContributorRecord::new("U3", "erin", "Erin", "e@x.com"),
            ])
            .await
            .unwrap();
        ledger
    }

    #[test]
    fn test_reply_parsing() {
        assert_eq!(Reply::parse(" EXIT "), Some(Reply::Exit));
        assert_eq!(Reply::parse("skip"), Some(Reply::Skip));
        assert_eq!(Reply::parse("<@42>"), Some(Reply::Link(MemberRef::Id(42))));
        assert_eq!(Reply::parse("<@!42>"), Some(Reply::Link(MemberRef::Id(42))));
        assert_eq!(Reply::parse("link <@42>"), Some(Reply::Link(MemberRef::Id(42))));
        assert_eq!(Reply::parse("add Bob"), Some(Reply::Link(MemberRef::Name("Bob".to_string()))));
        assert_eq!(Reply::parse("Bob"), Some(Reply::Link(MemberRef::Name("Bob".to_string()))));
        assert_eq!(Reply::parse("0"), Some(Reply::Link(MemberRef::Name("0".to_string()))));
        assert_eq!(Reply::parse("   "), None);
    }

    #[tokio::test]
    async fn test_exit_keeps_earlier_links() {
        let ledger = seeded().await;
        let reconciler = Reconciler::new(Arc::clone(&ledger));
        let mut prompt = ScriptedPrompt::new(&["link Bob", "exit"]);

        let summary = reconciler.run(&mut prompt, &members()).await.unwrap();
        assert!(summary.exited_early);
        assert_eq!(summary.linked, vec![("U1".to_string(), 42)]);
        assert_eq!(ledger.get(Mapping::Added, "U1").await.unwrap().discord_user_id, Some(42));
        assert!(ledger.get(Mapping::Pending, "U2").await.is_some());
        assert!(ledger.get(Mapping::Pending, "U3").await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_member_reprompts_same_record() {
        let ledger = seeded().await;
        let reconciler = Reconciler::new(Arc::clone(&ledger));
        let mut prompt = ScriptedPrompt::new(&["Nobody", "<@43>", "skip", "skip"]);

        let summary = reconciler.run(&mut prompt, &members()).await.unwrap();
        assert!(!summary.exited_early);
        assert_eq!(summary.skipped, 2);
        assert_eq!(ledger.get(Mapping::Added, "U1").await.unwrap().discord_user_id, Some(43));
        assert!(prompt.said.iter().any(|s| s.contains("couldn't find that member")));
    }

    #[tokio::test]
    async fn test_record_linked_elsewhere_is_not_prompted() {
        let ledger = seeded().await;
        let reconciler = Reconciler::new(Arc::clone(&ledger));
        let mut prompt = InterferingPrompt {
            ledger: Arc::clone(&ledger),
            inner: ScriptedPrompt::new(&["skip", "skip"]),
            linked: false,
        };

        let summary = reconciler.run(&mut prompt, &members()).await.unwrap();
        assert!(!summary.exited_early);
        assert_eq!(summary.skipped, 2);
        let said = &prompt.inner.said;
        assert_eq!(said.len(), 2);
        assert!(said[0].contains("`alice`"));
        assert!(said[1].contains("`erin`"));
        assert!(!said.iter().any(|s| s.contains("dave")));
        assert_eq!(ledger.get(Mapping::Added, "U2").await.unwrap().discord_user_id, Some(77));
    }

    #[tokio::test]
    async fn test_empty_pending() {
        let ledger = Arc::new(Ledger::load(Database::in_memory().unwrap()).await.unwrap());
        let reconciler = Reconciler::new(ledger);
        let mut prompt = ScriptedPrompt::new(&[]);
        let summary = reconciler.run(&mut prompt, &members()).await.unwrap();
        assert_eq!(summary, ReconcileSummary::default());
    }

    #[tokio::test]
    async fn test_second_session_is_rejected() {
        let ledger = seeded().await;
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&ledger)));

        let (tx, rx) = mpsc::channel(4);
        let running = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                let mut prompt = QueuePrompt { replies: rx };
                reconciler.run(&mut prompt, &members()).await
            })
        };

        for _ in 0..100 {
            if reconciler.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reconciler.is_running());

        let mut other = ScriptedPrompt::new(&["skip"]);
        let err = reconciler.run(&mut other, &members()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::AlreadyRunning));

        tx.send("exit".to_string()).await.unwrap();
        let summary = running.await.unwrap().unwrap();
        assert!(summary.exited_early);
        assert!(!reconciler.is_running());
    }
}
