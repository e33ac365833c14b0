//! GitHub GraphQL client.
//!
//! Wraps the handful of queries the bot and the helper binaries need. Raw
//! response shapes stay private to this module; callers get the small domain
//! types below.

use crate::config::GitHubConfig;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

const COMMIT_HISTORY_QUERY: &str = r#"
query getCommitHistory($owner: String!, $name: String!, $after: String) {
  repository(owner: $owner, name: $name) {
    defaultBranchRef {
      target {
        ... on Commit {
          history(first: 100, after: $after) {
            nodes {
              oid
              author {
                name
                email
                user { id login name }
              }
              associatedPullRequests(first: 1) {
                nodes {
                  author {
                    ... on User { id login name }
                  }
                }
              }
            }
            pageInfo {
              endCursor
              hasNextPage
            }
          }
        }
      }
    }
  }
}
"#;

const MILESTONE_CONTRIBUTORS_QUERY: &str = r#"
query getContributors($owner: String!, $name: String!, $milestone: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    milestone(number: $milestone) {
      pullRequests(first: 100, after: $after) {
        nodes {
          author {
            login
          }
        }
        pageInfo {
          endCursor
          hasNextPage
        }
      }
    }
  }
}
"#;

const PROJECT_CARDS_FOR_PR_QUERY: &str = r#"
query getProjectCardsForPullRequest($owner: String!, $name: String!, $pr_number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $pr_number) {
      projectCards(first: 100) {
        nodes {
          id
          project {
            number
          }
          column {
            id
          }
        }
      }
    }
  }
}
"#;

const MOVE_PROJECT_CARD_MUTATION: &str = r#"
mutation moveProjectCard($card_id: ID!, $column_id: ID!) {
  moveProjectCard(input: {cardId: $card_id, columnId: $column_id}) {
    cardEdge {
      node {
        id
      }
    }
  }
}
"#;

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("GitHub GraphQL error: {}", .0.join("; "))]
    GraphQl(Vec<String>),
    #[error("GitHub response did not contain the expected data")]
    MissingData,
    #[error("could not decode GitHub response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A GitHub account as seen through the API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// One commit of the default branch, reduced to what contributor resolution needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub oid: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub author: Option<Account>,
    pub pull_request_author: Option<Account>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPage {
    pub commits: Vec<CommitInfo>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCard {
    pub id: String,
    pub project_number: u64,
    pub column_id: Option<String>,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlErrorEntry>,
}

#[derive(Deserialize)]
struct GraphQlErrorEntry {
    message: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl<T> GraphQlResponse<T> {
    /// Errors next to partial data are logged and the data is kept. Errors
    /// without data fail the request.
    fn into_data(self) -> Result<T, GitHubError> {
        match self.data {
            Some(data) => {
                for e in &self.errors {
                    if e.kind.as_deref() == Some("NOT_FOUND") {
                        debug!("GitHub: {}", e.message);
                    } else {
                        warn!("GitHub: partial response error: {}", e.message);
                    }
                }
                Ok(data)
            }
            None if self.errors.is_empty() => Err(GitHubError::MissingData),
            None => Err(GitHubError::GraphQl(
                self.errors.into_iter().map(|e| e.message).collect(),
            )),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    end_cursor: Option<String>,
    has_next_page: bool,
}

#[derive(Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitHistoryData {
    repository: Option<RepositoryRef>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryRef {
    default_branch_ref: Option<BranchRef>,
}

#[derive(Deserialize)]
struct BranchRef {
    target: Option<CommitTarget>,
}

#[derive(Deserialize)]
struct CommitTarget {
    history: Option<History>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct History {
    nodes: Vec<CommitNode>,
    page_info: PageInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitNode {
    oid: String,
    author: Option<GitActor>,
    associated_pull_requests: Option<Nodes<PullRequestNode>>,
}

#[derive(Deserialize)]
struct GitActor {
    name: Option<String>,
    email: Option<String>,
    user: Option<Account>,
}

#[derive(Deserialize)]
struct PullRequestNode {
    author: Option<MaybeUser>,
}

/// Bots and mannequins come back as empty objects from the `... on User` fragment.
#[derive(Deserialize)]
struct MaybeUser {
    id: Option<String>,
    login: Option<String>,
    name: Option<String>,
}

impl MaybeUser {
    fn into_account(self) -> Option<Account> {
        Some(Account {
            id: self.id?,
            login: self.login?,
            name: self.name,
        })
    }
}

#[derive(Deserialize)]
struct MilestoneData {
    repository: Option<MilestoneRepository>,
}

#[derive(Deserialize)]
struct MilestoneRepository {
    milestone: Option<Milestone>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Milestone {
    pull_requests: PullRequestConnection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestConnection {
    nodes: Vec<MilestonePullRequest>,
    page_info: PageInfo,
}

#[derive(Deserialize)]
struct MilestonePullRequest {
    author: Option<LoginOnly>,
}

#[derive(Deserialize)]
struct LoginOnly {
    login: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectCardsData {
    repository: Option<PullRequestRepository>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestRepository {
    pull_request: Option<PullRequestCards>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestCards {
    project_cards: Nodes<ProjectCardNode>,
}

#[derive(Deserialize)]
struct ProjectCardNode {
    id: String,
    project: ProjectNumber,
    column: Option<ColumnId>,
}

#[derive(Deserialize)]
struct ProjectNumber {
    number: u64,
}

#[derive(Deserialize)]
struct ColumnId {
    id: String,
}

/// Builds a single query resolving every login through aliased `user` fields.
///
/// `logins[i]` is looked up under the alias `u{i}`.
pub fn build_user_lookup_query(logins: &[String]) -> String {
    let mut query = String::from("query {");
    for (i, login) in logins.iter().enumerate() {
        // serde_json quoting doubles as GraphQL string escaping
        let quoted = Value::String(login.clone()).to_string();
        query.push_str(&format!(" u{}: user(login: {}) {{ id login name }}", i, quoted));
    }
    query.push_str(" }");
    query
}

#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    config: GitHubConfig,
}

impl GitHubClient {
    pub fn new(http: reqwest::Client, config: GitHubConfig) -> Self {
        Self { http, config }
    }

    pub fn repository(&self) -> String {
        format!("{}/{}", self.config.owner, self.config.repo)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<GraphQlResponse<T>, GitHubError> {
        let response = self
            .http
            .post(&self.config.graphql_url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::USER_AGENT, "redhelper")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!("GitHub API returned {}: {}", status, body);
            return Err(GitHubError::Status { status, body });
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn query<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, GitHubError> {
        self.post::<T>(query, variables).await?.into_data()
    }

    pub async fn commit_history_page(&self, after: Option<&str>) -> Result<CommitPage, GitHubError> {
        let data: CommitHistoryData = self
            .query(
                COMMIT_HISTORY_QUERY,
                json!({
                    "owner": self.config.owner,
                    "name": self.config.repo,
                    "after": after,
                }),
            )
            .await?;

        let history = data
            .repository
            .and_then(|r| r.default_branch_ref)
            .and_then(|b| b.target)
            .and_then(|t| t.history)
            .ok_or(GitHubError::MissingData)?;

        let commits = history
            .nodes
            .into_iter()
            .map(|node| {
                let pull_request_author = node
                    .associated_pull_requests
                    .and_then(|prs| prs.nodes.into_iter().next())
                    .and_then(|pr| pr.author)
                    .and_then(MaybeUser::into_account);
                let (author_name, author_email, author) = match node.author {
                    Some(actor) => (actor.name, actor.email, actor.user),
                    None => (None, None, None),
                };
                CommitInfo {
                    oid: node.oid,
                    author_name,
                    author_email,
                    author,
                    pull_request_author,
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "GitHub: fetched {} commits (has_next_page: {})",
            commits.len(),
            history.page_info.has_next_page
        );

        Ok(CommitPage {
            commits,
            end_cursor: history.page_info.end_cursor,
            has_next_page: history.page_info.has_next_page,
        })
    }

    /// Resolves logins to accounts in one round trip. Unknown logins are absent
    /// from the returned map.
    pub async fn lookup_users(&self, logins: &[String]) -> Result<HashMap<String, Account>, GitHubError> {
        if logins.is_empty() {
            return Ok(HashMap::new());
        }

        // Unknown logins surface as NOT_FOUND errors next to a null alias.
        let data = self
            .query::<HashMap<String, Option<Account>>>(&build_user_lookup_query(logins), json!({}))
            .await?;

        let mut accounts = HashMap::new();
        for (i, login) in logins.iter().enumerate() {
            match data.get(&format!("u{}", i)).cloned().flatten() {
                Some(account) => {
                    accounts.insert(login.clone(), account);
                }
                None => debug!("GitHub: no user found for login {}", login),
            }
        }
        Ok(accounts)
    }

    /// Logins of every pull request author in a milestone, sorted case-insensitively.
    pub async fn milestone_contributors(&self, milestone: u64) -> Result<Vec<String>, GitHubError> {
        let mut after: Option<String> = None;
        let mut authors = BTreeSet::new();

        loop {
            let data: MilestoneData = self
                .query(
                    MILESTONE_CONTRIBUTORS_QUERY,
                    json!({
                        "owner": self.config.owner,
                        "name": self.config.repo,
                        "milestone": milestone,
                        "after": after,
                    }),
                )
                .await?;

            let pull_requests = data
                .repository
                .and_then(|r| r.milestone)
                .ok_or(GitHubError::MissingData)?
                .pull_requests;

            authors.extend(
                pull_requests
                    .nodes
                    .into_iter()
                    .filter_map(|pr| pr.author.map(|a| a.login)),
            );

            if !pull_requests.page_info.has_next_page {
                break;
            }
            after = pull_requests.page_info.end_cursor;
        }

        Ok(sort_logins(authors))
    }

    pub async fn project_cards_for_pull_request(
        &self,
        pr_number: u64,
    ) -> Result<Vec<ProjectCard>, GitHubError> {
        let data: ProjectCardsData = self
            .query(
                PROJECT_CARDS_FOR_PR_QUERY,
                json!({
                    "owner": self.config.owner,
                    "name": self.config.repo,
                    "pr_number": pr_number,
                }),
            )
            .await?;

        let cards = data
            .repository
            .and_then(|r| r.pull_request)
            .ok_or(GitHubError::MissingData)?
            .project_cards
            .nodes
            .into_iter()
            .map(|node| ProjectCard {
                id: node.id,
                project_number: node.project.number,
                column_id: node.column.map(|c| c.id),
            })
            .collect();
        Ok(cards)
    }

    pub async fn move_project_card(&self, card_id: &str, column_id: &str) -> Result<(), GitHubError> {
        let _: Value = self
            .query(
                MOVE_PROJECT_CARD_MUTATION,
                json!({ "card_id": card_id, "column_id": column_id }),
            )
            .await?;
        Ok(())
    }
}

fn sort_logins(authors: BTreeSet<String>) -> Vec<String> {
    let mut sorted: Vec<String> = authors.into_iter().collect();
    sorted.sort_by_key(|login| login.to_lowercase());
    sorted
}
