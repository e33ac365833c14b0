pub mod board;
pub mod commands;
pub mod config;
pub mod contributors;
pub mod db;
pub mod github;
pub mod outgoing;

use std::sync::Arc;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub github: Arc<github::GitHubClient>,
    pub contributors: Arc<contributors::ContributorsPlugin>,
    /// Every reply and notification goes through this
    pub outgoing: Arc<outgoing::OutgoingPipeline>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
