//! Toggleable layers applied to everything the bot sends.

use crate::config::{DISCORD_EMBED_LIMIT, DISCORD_MAX_EMBEDS, DISCORD_MESSAGE_LIMIT};
use crate::db::Database;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use std::sync::RwLock;
use tracing::{debug, info};

const NAMESPACE: &str = "outgoing";
const ENABLED_KEY: &str = "enabled";
const ZERO_WIDTH_SPACE: &str = "\u{200b}";
const HEADER_PREFIX: &str = "# ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    /// Embed descriptions.
    pub embeds: Vec<String>,
}

impl OutgoingMessage {
    pub fn text(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            embeds: Vec::new(),
        }
    }
}

pub trait OutgoingMiddleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn apply(&self, messages: Vec<OutgoingMessage>) -> Vec<OutgoingMessage>;
}

/// Splits one line into pieces of at most `max` characters, breaking on
/// spaces where possible.
fn split_on_spaces(line: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in line.split(' ') {
        let word_len = word.chars().count();
        let needed = if current_len == 0 { word_len } else { current_len + 1 + word_len };
        if needed <= max {
            if current_len > 0 {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
            continue;
        }
        if current_len > 0 {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        // A single word longer than the limit is cut hard
        let chars: Vec<char> = word.chars().collect();
        let mut chunks = chars.chunks(max.max(1)).peekable();
        while let Some(chunk) = chunks.next() {
            if chunks.peek().is_some() {
                pieces.push(chunk.iter().collect());
            } else {
                current = chunk.iter().collect();
                current_len = chunk.len();
            }
        }
    }
    if current_len > 0 || pieces.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Packs lines into pages of at most `max` characters.
fn paginate_lines(lines: Vec<String>, max: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut page = String::new();
    let mut page_len = 0;
    for line in lines {
        let line_len = line.chars().count();
        let needed = if page.is_empty() { line_len } else { page_len + 1 + line_len };
        if needed > max && !page.is_empty() {
            pages.push(std::mem::take(&mut page));
            page_len = 0;
        }
        if !page.is_empty() {
            page.push('\n');
            page_len += 1;
        }
        page.push_str(&line);
        page_len += line_len;
    }
    if !page.is_empty() {
        pages.push(page);
    }
    pages
}

fn paginate_text(text: &str, max: usize) -> Vec<String> {
    paginate_lines(
        text.lines().flat_map(|line| split_on_spaces(line, max)).collect(),
        max,
    )
}

/// Spreads `embeds` over `pages`, attaching them to the last page.
fn with_pages(pages: Vec<String>, embeds: Vec<String>) -> Vec<OutgoingMessage> {
    let count = pages.len();
    let mut embeds = Some(embeds);
    pages
        .into_iter()
        .enumerate()
        .map(|(i, page)| OutgoingMessage {
            content: Some(page),
            embeds: if i + 1 == count {
                embeds.take().unwrap_or_default()
            } else {
                Vec::new()
            },
        })
        .collect()
}

/// Renders every line as a Markdown header.
pub struct HeaderSend;

impl OutgoingMiddleware for HeaderSend {
    fn name(&self) -> &'static str {
        "header"
    }

    fn description(&self) -> &'static str {
        "Send every line as a header"
    }

    fn apply(&self, messages: Vec<OutgoingMessage>) -> Vec<OutgoingMessage> {
        let width = DISCORD_MESSAGE_LIMIT - HEADER_PREFIX.len();
        let mut out = Vec::new();
        for message in messages {
            let Some(content) = message.content.filter(|c| !c.trim().is_empty()) else {
                out.push(OutgoingMessage {
                    content: None,
                    embeds: message.embeds,
                });
                continue;
            };
            let lines: Vec<String> = content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .flat_map(|line| split_on_spaces(line.trim(), width))
                .map(|line| format!("{}{}", HEADER_PREFIX, line))
                .collect();
            out.extend(with_pages(
                paginate_lines(lines, DISCORD_MESSAGE_LIMIT),
                message.embeds,
            ));
        }
        out
    }
}

/// Moves message text into embeds.
pub struct EmbedVomit;

impl OutgoingMiddleware for EmbedVomit {
    fn name(&self) -> &'static str {
        "embed"
    }

    fn description(&self) -> &'static str {
        "Send text inside embeds"
    }

    fn apply(&self, messages: Vec<OutgoingMessage>) -> Vec<OutgoingMessage> {
        let mut out = Vec::new();
        for message in messages {
            let mut embeds = match message.content {
                Some(content) if !content.trim().is_empty() => {
                    paginate_text(&content, DISCORD_EMBED_LIMIT)
                }
                _ if message.embeds.is_empty() => vec![ZERO_WIDTH_SPACE.to_string()],
                _ => Vec::new(),
            };
            embeds.extend(message.embeds);
            out.extend(embeds.chunks(DISCORD_MAX_EMBEDS).map(|group| OutgoingMessage {
                content: None,
                embeds: group.to_vec(),
            }));
        }
        out
    }
}

pub struct SmileySend;

impl OutgoingMiddleware for SmileySend {
    fn name(&self) -> &'static str {
        "smiley"
    }

    fn description(&self) -> &'static str {
        "End every message with a smiley"
    }

    fn apply(&self, messages: Vec<OutgoingMessage>) -> Vec<OutgoingMessage> {
        messages
            .into_iter()
            .map(|mut message| {
                message.content = Some(match message.content.take() {
                    Some(content) if !content.is_empty() => format!("{} 😃", content),
                    _ => "😃".to_string(),
                });
                message
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutgoingError {
    #[error("there is no middleware called `{0}`")]
    UnknownMiddleware(String),
    #[error("could not save middleware settings: {0}")]
    Storage(#[from] anyhow::Error),
}

/// The enabled layers, applied in registration order.
pub struct OutgoingPipeline {
    db: Database,
    layers: Vec<Box<dyn OutgoingMiddleware>>,
    enabled: RwLock<Vec<String>>,
    /// Serializes toggles across read, persist and swap.
    toggle: tokio::sync::Mutex<()>,
}

impl OutgoingPipeline {
    pub fn builtin_layers() -> Vec<Box<dyn OutgoingMiddleware>> {
        vec![Box::new(SmileySend), Box::new(HeaderSend), Box::new(EmbedVomit)]
    }

    pub async fn load(db: Database) -> anyhow::Result<Self> {
        let enabled: Vec<String> = db
            .run_blocking(|db| db.get_json(NAMESPACE, ENABLED_KEY))
            .await?
            .unwrap_or_default();
        if !enabled.is_empty() {
            info!("Outgoing: enabled middleware: {}", enabled.join(", "));
        }
        Ok(Self {
            db,
            layers: Self::builtin_layers(),
            enabled: RwLock::new(enabled),
            toggle: tokio::sync::Mutex::new(()),
        })
    }

    /// `(name, description, enabled)` for every registered layer.
    pub fn layers(&self) -> Vec<(&'static str, &'static str, bool)> {
        self.layers
            .iter()
            .map(|l| (l.name(), l.description(), self.is_enabled(l.name())))
            .collect()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled
            .read()
            .map(|enabled| enabled.iter().any(|n| n == name))
            .unwrap_or(false)
    }

    /// Returns whether the setting changed.
    pub async fn set_enabled(&self, name: &str, on: bool) -> Result<bool, OutgoingError> {
        let name = name.to_lowercase();
        if !self.layers.iter().any(|l| l.name() == name) {
            return Err(OutgoingError::UnknownMiddleware(name));
        }
        let _toggle = self.toggle.lock().await;
        if self.is_enabled(&name) == on {
            return Ok(false);
        }

        let mut updated: Vec<String> = self
            .enabled
            .read()
            .map(|enabled| enabled.clone())
            .unwrap_or_default();
        if on {
            updated.push(name.clone());
        } else {
            updated.retain(|n| *n != name);
        }
        let persisted = updated.clone();
        self.db
            .run_blocking(move |db| db.set_json(NAMESPACE, ENABLED_KEY, &persisted))
            .await?;
        if let Ok(mut enabled) = self.enabled.write() {
            *enabled = updated;
        }
        info!("Outgoing: {} {}", name, if on { "enabled" } else { "disabled" });
        Ok(true)
    }

    /// Turns `content` into the messages that will actually be sent.
    pub fn render(&self, content: &str) -> Vec<OutgoingMessage> {
        let mut messages = vec![OutgoingMessage::text(content)];
        for layer in &self.layers {
            if self.is_enabled(layer.name()) {
                messages = layer.apply(messages);
            }
        }
        messages
            .into_iter()
            .flat_map(|message| match message.content {
                Some(ref text) if text.chars().count() > DISCORD_MESSAGE_LIMIT => {
                    with_pages(paginate_text(text, DISCORD_MESSAGE_LIMIT), message.embeds)
                }
                _ => vec![message],
            })
            .collect()
    }

    pub async fn send(
        &self,
        http: &serenity::Http,
        channel_id: serenity::ChannelId,
        content: &str,
    ) -> anyhow::Result<()> {
        let messages = self.render(content);
        debug!("Outgoing: sending {} message(s) to {}", messages.len(), channel_id);
        for message in messages {
            let mut builder = serenity::CreateMessage::new();
            if let Some(content) = message.content {
                builder = builder.content(content);
            }
            for description in message.embeds {
                builder = builder.embed(serenity::CreateEmbed::new().description(description));
            }
            channel_id.send_message(http, builder).await?;
        }
        Ok(())
    }

    /// Replies to a command invocation through the enabled layers.
    pub async fn say(&self, ctx: Context<'_>, content: &str) -> Result<(), Error> {
        for message in self.render(content) {
            let mut reply = poise::CreateReply::default();
            if let Some(content) = message.content {
                reply = reply.content(content);
            }
            for description in message.embeds {
                reply = reply.embed(serenity::CreateEmbed::new().description(description));
            }
            ctx.send(reply).await?;
        }
        Ok(())
    }
}
