//! Moves pull requests back to "Updated since review" on a project board when
//! their author reacts to a review.

use crate::github::{GitHubClient, GitHubError, ProjectCard};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub project_number: u64,
    pub changes_requested_column: String,
    pub updated_since_review_column: String,
    /// Events triggered by this login are ignored.
    pub board_owner: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("unsupported event type `{0}`")]
    UnsupportedEvent(String),
    #[error("malformed webhook payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("payload carries neither a pull request nor an issue")]
    MissingPullRequest,
    #[error(transparent)]
    GitHub(#[from] GitHubError),
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    action: String,
    sender: Sender,
    pull_request: Option<Numbered>,
    issue: Option<Issue>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Numbered {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    /// Present only when the issue is a pull request.
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    PullRequest(u64),
    Skip(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped(String),
    Moved { pr_number: u64, card_id: String },
}

/// Decides whether a webhook event should touch the board.
pub fn evaluate_event(
    event_type: &str,
    raw_payload: &str,
    board_owner: &str,
) -> Result<Trigger, BoardError> {
    let payload: WebhookPayload = serde_json::from_str(raw_payload)?;
    let pr_number = payload
        .pull_request
        .as_ref()
        .map(|pr| pr.number)
        .or_else(|| payload.issue.as_ref().map(|issue| issue.number))
        .ok_or(BoardError::MissingPullRequest)?;

    if payload.sender.login.eq_ignore_ascii_case(board_owner) {
        return Ok(Trigger::Skip("event sent by the board owner".to_string()));
    }

    let action = payload.action.as_str();
    let skip_action = || Ok(Trigger::Skip(format!("action type ({}) skipped", action)));
    match event_type {
        "issue_comment" => {
            if action != "created" {
                return skip_action();
            }
            if payload.issue.as_ref().and_then(|i| i.pull_request.as_ref()).is_none() {
                return Ok(Trigger::Skip("comment on a non-PR".to_string()));
            }
        }
        "pull_request" => {
            if !matches!(action, "synchronize" | "review_requested") {
                return skip_action();
            }
        }
        "pull_request_review" => {
            if action == "edited" {
                return skip_action();
            }
        }
        "pull_request_review_comment" => {
            if action != "created" {
                return skip_action();
            }
        }
        other => return Err(BoardError::UnsupportedEvent(other.to_string())),
    }
    Ok(Trigger::PullRequest(pr_number))
}

/// The card to move, if the pull request sits in the "Changes requested"
/// column of the configured project.
pub fn card_to_move<'a>(
    cards: &'a [ProjectCard],
    config: &BoardConfig,
) -> Result<&'a ProjectCard, String> {
    let card = cards
        .iter()
        .find(|c| c.project_number == config.project_number)
        .ok_or_else(|| "pull request isn't on the project board".to_string())?;
    if card.column_id.as_deref() != Some(config.changes_requested_column.as_str()) {
        return Err("pull request isn't in the 'Changes requested' column".to_string());
    }
    Ok(card)
}

pub struct BoardAutomation {
    client: GitHubClient,
    config: BoardConfig,
}

impl BoardAutomation {
    pub fn new(client: GitHubClient, config: BoardConfig) -> Self {
        Self { client, config }
    }

    pub async fn handle(&self, event_type: &str, raw_payload: &str) -> Result<Outcome, BoardError> {
        let pr_number = match evaluate_event(event_type, raw_payload, &self.config.board_owner)? {
            Trigger::PullRequest(number) => number,
            Trigger::Skip(reason) => return Ok(Outcome::Skipped(reason)),
        };

        let cards = self.client.project_cards_for_pull_request(pr_number).await?;
        let card = match card_to_move(&cards, &self.config) {
            Ok(card) => card,
            Err(reason) => return Ok(Outcome::Skipped(reason)),
        };

        self.client
            .move_project_card(&card.id, &self.config.updated_since_review_column)
            .await?;
        info!("Board: moved PR #{} (card {}) to 'Updated since review'", pr_number, card.id);
        Ok(Outcome::Moved {
            pr_number,
            card_id: card.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BoardConfig {
        BoardConfig {
            project_number: 9,
            changes_requested_column: "COL_CR".to_string(),
            updated_since_review_column: "COL_USR".to_string(),
            board_owner: "jack1142".to_string(),
        }
    }

    fn payload(action: &str, sender: &str) -> String {
        format!(
            r#"{{"action": "{}", "sender": {{"login": "{}"}}, "pull_request": {{"number": 42}}}}"#,
            action, sender
        )
    }

    #[test]
    fn test_event_filtering() {
        let owner = "jack1142";
        assert_eq!(
            evaluate_event("pull_request", &payload("synchronize", "alice"), owner).unwrap(),
            Trigger::PullRequest(42)
        );
        assert!(matches!(
            evaluate_event("pull_request", &payload("opened", "alice"), owner).unwrap(),
            Trigger::Skip(_)
        ));
        assert!(matches!(
            evaluate_event("pull_request_review", &payload("edited", "alice"), owner).unwrap(),
            Trigger::Skip(_)
        ));
        assert_eq!(
            evaluate_event("pull_request_review", &payload("submitted", "alice"), owner).unwrap(),
            Trigger::PullRequest(42)
        );
        assert!(matches!(
            evaluate_event("pull_request_review_comment", &payload("deleted", "alice"), owner).unwrap(),
            Trigger::Skip(_)
        ));
        assert!(matches!(
            evaluate_event("pull_request", &payload("synchronize", "Jack1142"), owner).unwrap(),
            Trigger::Skip(_)
        ));
        assert!(matches!(
            evaluate_event("push", &payload("synchronize", "alice"), owner),
            Err(BoardError::UnsupportedEvent(_))
        ));
    }

    #[test]
    fn test_issue_comments_only_count_on_pull_requests() {
        let on_pr = r#"{"action": "created", "sender": {"login": "alice"},
            "issue": {"number": 7, "pull_request": {"url": "x"}}}"#;
        let on_issue = r#"{"action": "created", "sender": {"login": "alice"},
            "issue": {"number": 8}}"#;
        assert_eq!(
            evaluate_event("issue_comment", on_pr, "jack1142").unwrap(),
            Trigger::PullRequest(7)
        );
        assert!(matches!(
            evaluate_event("issue_comment", on_issue, "jack1142").unwrap(),
            Trigger::Skip(_)
        ));
    }

    #[test]
    fn test_card_selection() {
        let cards = vec![
            ProjectCard {
                id: "other".to_string(),
                project_number: 3,
                column_id: Some("COL_CR".to_string()),
            },
            ProjectCard {
                id: "mine".to_string(),
                project_number: 9,
                column_id: Some("COL_CR".to_string()),
            },
        ];
        assert_eq!(card_to_move(&cards, &config()).unwrap().id, "mine");

        let elsewhere = vec![ProjectCard {
            id: "mine".to_string(),
            project_number: 9,
            column_id: Some("COL_DONE".to_string()),
        }];
        assert!(card_to_move(&elsewhere, &config()).is_err());
        assert!(card_to_move(&[], &config()).is_err());
    }
}
