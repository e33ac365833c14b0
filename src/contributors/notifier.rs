use super::ledger::Ledger;
use super::record::ContributorRecord;
use crate::outgoing::OutgoingPipeline;
use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivers text to a channel by id.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Returns `Ok(false)` when the channel no longer resolves.
    async fn deliver(&self, channel_id: u64, content: &str) -> anyhow::Result<bool>;
}

/// Sends through Discord, passing every message through the outgoing middleware.
pub struct DiscordSink {
    http: Arc<serenity::Http>,
    outgoing: Arc<OutgoingPipeline>,
}

impl DiscordSink {
    pub fn new(http: Arc<serenity::Http>, outgoing: Arc<OutgoingPipeline>) -> Self {
        Self { http, outgoing }
    }
}

#[async_trait]
impl ChannelSink for DiscordSink {
    async fn deliver(&self, channel_id: u64, content: &str) -> anyhow::Result<bool> {
        let channel_id = serenity::ChannelId::new(channel_id);
        if channel_id.to_channel(&self.http).await.is_err() {
            return Ok(false);
        }
        self.outgoing.send(&self.http, channel_id, content).await?;
        Ok(true)
    }
}

pub fn render_notification(record: &ContributorRecord) -> String {
    let mut message = format!(
        "🆕 New contributor: **{}** ([{}](<{}>))",
        record.display_name,
        record.username,
        record.profile_url()
    );
    if !record.email.is_empty() {
        message.push_str(&format!("\nEmail: `{}`", record.email));
    }
    if let Some(member_id) = record.discord_user_id {
        message.push_str(&format!(
            "\nPreviously linked to <@{}> (`{}`)",
            member_id, member_id
        ));
    }
    message
}

pub struct Notifier {
    ledger: Arc<Ledger>,
    sink: Arc<dyn ChannelSink>,
}

impl Notifier {
    pub fn new(ledger: Arc<Ledger>, sink: Arc<dyn ChannelSink>) -> Self {
        Self { ledger, sink }
    }

    /// Fans every record out to every output channel. Returns how many
    /// messages were delivered.
    pub async fn notify(&self, records: &[ContributorRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }
        let channels = self.ledger.output_channels().await;
        let mut delivered = 0;
        for record in records {
            let content = render_notification(record);
            for channel_id in &channels {
                match self.sink.deliver(*channel_id, &content).await {
                    Ok(true) => delivered += 1,
                    Ok(false) => debug!("Notifier: output channel {} no longer resolves", channel_id),
                    Err(e) => warn!(
                        "Notifier: failed to notify channel {} about {}: {}",
                        channel_id, record.username, e
                    ),
                }
            }
        }
        delivered
    }
}
