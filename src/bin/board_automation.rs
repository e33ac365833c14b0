//! Keeps the review project board in sync with pull request activity.
//!
//! Takes the webhook event type and its JSON payload; how the webhook reaches
//! this binary is up to whoever deploys it.

use clap::Parser;
use redhelper::board::{BoardAutomation, BoardConfig, BoardError, Outcome};
use redhelper::config::GitHubConfig;
use redhelper::github::GitHubClient;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "board_automation")]
#[command(about = "Move reviewed pull requests back to 'Updated since review'")]
struct Cli {
    /// `issue_comment`, `pull_request`, `pull_request_review` or `pull_request_review_comment`
    event_type: String,

    /// Raw JSON payload of the webhook event
    payload: String,

    #[arg(long, env = "BOARD_PROJECT_NUMBER", default_value_t = 9)]
    project_number: u64,

    #[arg(long, env = "BOARD_CHANGES_REQUESTED_COLUMN", default_value = "MDEzOlByb2plY3RDb2x1bW4xMDkwMzE2OA==")]
    changes_requested_column: String,

    #[arg(long, env = "BOARD_UPDATED_SINCE_REVIEW_COLUMN", default_value = "MDEzOlByb2plY3RDb2x1bW4xMDkxMjAxNw==")]
    updated_since_review_column: String,

    /// Events sent by this login are ignored
    #[arg(long, env = "BOARD_OWNER", default_value = "jack1142")]
    board_owner: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("board_automation=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let client = GitHubClient::new(reqwest::Client::new(), GitHubConfig::from_env()?);
    let automation = BoardAutomation::new(
        client,
        BoardConfig {
            project_number: cli.project_number,
            changes_requested_column: cli.changes_requested_column,
            updated_since_review_column: cli.updated_since_review_column,
            board_owner: cli.board_owner,
        },
    );

    match automation.handle(&cli.event_type, &cli.payload).await {
        Ok(Outcome::Skipped(reason)) => info!("Ignoring event: {}", reason),
        Ok(Outcome::Moved { pr_number, .. }) => info!("Updated board for PR #{}", pr_number),
        Err(BoardError::UnsupportedEvent(event)) => {
            error!("Unsupported event type: {}", event);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(ExitCode::SUCCESS)
}
