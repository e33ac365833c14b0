use super::ledger::{Ledger, LedgerError};
use super::record::ContributorRecord;
use crate::github::{Account, CommitInfo, CommitPage, GitHubClient, GitHubError};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Where commits and account lookups come from.
#[async_trait]
pub trait ContributorSource: Send + Sync {
    async fn commit_page(&self, after: Option<&str>) -> Result<CommitPage, GitHubError>;

    /// Resolves many logins in a single round trip; unknown logins are absent.
    async fn lookup_users(&self, logins: &[String]) -> Result<HashMap<String, Account>, GitHubError>;
}

#[async_trait]
impl ContributorSource for GitHubClient {
    async fn commit_page(&self, after: Option<&str>) -> Result<CommitPage, GitHubError> {
        self.commit_history_page(after).await
    }

    async fn lookup_users(&self, logins: &[String]) -> Result<HashMap<String, Account>, GitHubError> {
        GitHubClient::lookup_users(self, logins).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    GitHub(#[from] GitHubError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub commits_scanned: usize,
    pub new_pending: Vec<ContributorRecord>,
    pub unresolved_commits: Vec<String>,
}

impl FetchReport {
    pub fn needs_review(&self) -> bool {
        !self.unresolved_commits.is_empty()
    }

    /// The single status line shown to whoever started the fetch.
    pub fn status_message(&self) -> String {
        let mut message = format!(
            "✅ Scanned {} commit(s), {} new pending contributor(s).",
            self.commits_scanned,
            self.new_pending.len()
        );
        if self.needs_review() {
            message.push_str(&format!(
                "\n⚠️ {} commit(s) could not be matched to a GitHub account, check the logs.",
                self.unresolved_commits.len()
            ));
        }
        message
    }
}

/// Picks the account a commit is credited to: the commit's own user, else the
/// author of its first pull request.
pub fn resolve_commit_author(commit: &CommitInfo) -> Option<&Account> {
    commit.author.as_ref().or(commit.pull_request_author.as_ref())
}

fn record_for(commit: &CommitInfo, account: &Account) -> ContributorRecord {
    let display_name = account
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| commit.author_name.clone())
        .unwrap_or_else(|| account.login.clone());
    ContributorRecord::new(
        &account.id,
        &account.login,
        &display_name,
        commit.author_email.as_deref().unwrap_or_default(),
    )
}

/// Walks the commit history and feeds unseen authors into `pending`.
pub struct CommitFetcher {
    source: Arc<dyn ContributorSource>,
    ledger: Arc<Ledger>,
}

impl CommitFetcher {
    pub fn new(source: Arc<dyn ContributorSource>, ledger: Arc<Ledger>) -> Self {
        Self { source, ledger }
    }

    /// Each page is merged before the next one is requested, so an API failure
    /// part-way keeps what was already merged.
    pub async fn run(&self) -> Result<FetchReport, FetchError> {
        let mut report = FetchReport::default();
        let mut after: Option<String> = None;

        loop {
            let page = self.source.commit_page(after.as_deref()).await?;
            report.commits_scanned += page.commits.len();

            let mut batch: IndexMap<String, ContributorRecord> = IndexMap::new();
            for commit in &page.commits {
                let Some(account) = resolve_commit_author(commit) else {
                    warn!(
                        "Fetcher: commit {} has no linked account or pull request author",
                        commit.oid
                    );
                    report.unresolved_commits.push(commit.oid.clone());
                    continue;
                };
                batch
                    .entry(account.id.clone())
                    .or_insert_with(|| record_for(commit, account));
            }

            if !batch.is_empty() {
                let inserted = self
                    .ledger
                    .merge_pending(batch.into_values().collect())
                    .await?;
                report.new_pending.extend(inserted);
            }

            if !page.has_next_page {
                break;
            }
            after = page.end_cursor;
        }

        info!(
            "Fetcher: scanned {} commits, {} new pending, {} unresolved",
            report.commits_scanned,
            report.new_pending.len(),
            report.unresolved_commits.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::contributors::record::Mapping;
    use crate::db::Database;
    use std::sync::Mutex;

    pub fn account(id: &str, login: &str) -> Account {
        Account {
            id: id.to_string(),
            login: login.to_string(),
            name: None,
        }
    }

    pub fn commit(oid: &str, author: Option<Account>, pr_author: Option<Account>) -> CommitInfo {
        CommitInfo {
            oid: oid.to_string(),
            author_name: Some(format!("{} author", oid)),
            author_email: Some(format!("{}@example.com", oid)),
            author,
            pull_request_author: pr_author,
        }
    }

    /// In-memory stand-in for the GitHub API.
    #[derive(Default)]
    pub struct FakeSource {
        pub pages: Vec<CommitPage>,
        pub fail_on_page: Option<usize>,
        pub users: HashMap<String, Account>,
        pub lookups: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ContributorSource for FakeSource {
        async fn commit_page(&self, after: Option<&str>) -> Result<CommitPage, GitHubError> {
            let index = after.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
            if self.fail_on_page == Some(index) {
                return Err(GitHubError::GraphQl(vec!["rate limited".to_string()]));
            }
            Ok(self.pages[index].clone())
        }

        async fn lookup_users(&self, logins: &[String]) -> Result<HashMap<String, Account>, GitHubError> {
            self.lookups.lock().unwrap().push(logins.to_vec());
            Ok(logins
                .iter()
                .filter_map(|l| self.users.get(l).map(|a| (l.clone(), a.clone())))
                .collect())
        }
    }

    fn paged(pages: Vec<Vec<CommitInfo>>) -> Vec<CommitPage> {
        let count = pages.len();
        pages
            .into_iter()
            .enumerate()
            .map(|(i, commits)| CommitPage {
                commits,
                end_cursor: Some((i + 1).to_string()),
                has_next_page: i + 1 < count,
            })
            .collect()
    }

    async fn ledger() -> Arc<Ledger> {
        Arc::new(Ledger::load(Database::in_memory().unwrap()).await.unwrap())
    }

    #[test]
    fn test_resolution_order() {
        let own = account("U1", "alice");
        let pr = account("U2", "bob");
        assert_eq!(
            resolve_commit_author(&commit("a", Some(own.clone()), Some(pr.clone()))),
            Some(&own)
        );
        assert_eq!(resolve_commit_author(&commit("b", None, Some(pr.clone()))), Some(&pr));
        assert_eq!(resolve_commit_author(&commit("c", None, None)), None);
    }

    #[tokio::test]
    async fn test_fetch_walks_all_pages() {
        let ledger = ledger().await;
        let source = FakeSource {
            pages: paged(vec![
                vec![commit("a", Some(account("U1", "alice")), None)],
                vec![
                    commit("b", None, Some(account("U2", "bob"))),
                    commit("c", Some(account("U1", "alice")), None),
                ],
            ]),
            ..Default::default()
        };
        let fetcher = CommitFetcher::new(Arc::new(source), Arc::clone(&ledger));

        let report = fetcher.run().await.unwrap();
        assert_eq!(report.commits_scanned, 3);
        assert_eq!(report.new_pending.len(), 2);
        assert!(!report.needs_review());
        assert!(ledger.get(Mapping::Pending, "U2").await.is_some());
        assert_eq!(ledger.resolve_login("bob").await.as_deref(), Some("U2"));
    }

    #[tokio::test]
    async fn test_unresolvable_commit_flags_review() {
        let ledger = ledger().await;
        let source = FakeSource {
            pages: paged(vec![vec![
                commit("orphan", None, None),
                commit("ok", Some(account("U1", "alice")), None),
            ]]),
            ..Default::default()
        };
        let fetcher = CommitFetcher::new(Arc::new(source), Arc::clone(&ledger));

        let report = fetcher.run().await.unwrap();
        assert!(report.needs_review());
        assert_eq!(report.unresolved_commits, vec!["orphan"]);
        assert!(report.status_message().contains("check the logs"));
        assert!(ledger.get(Mapping::Pending, "U1").await.is_some());
    }

    #[tokio::test]
    async fn test_added_contributors_are_skipped() {
        let ledger = ledger().await;
        ledger
            .merge_pending(vec![ContributorRecord::new("U1", "alice", "Alice", "a@x.com")])
            .await
            .unwrap();
        ledger.link("U1", Some(5)).await.unwrap();

        let source = FakeSource {
            pages: paged(vec![vec![commit("a", Some(account("U1", "alice")), None)]]),
            ..Default::default()
        };
        let report = CommitFetcher::new(Arc::new(source), Arc::clone(&ledger))
            .run()
            .await
            .unwrap();
        assert!(report.new_pending.is_empty());
        assert!(ledger.get(Mapping::Pending, "U1").await.is_none());
    }

    #[tokio::test]
    async fn test_failure_keeps_earlier_pages() {
        let ledger = ledger().await;
        let source = FakeSource {
            pages: paged(vec![
                vec![commit("a", Some(account("U1", "alice")), None)],
                vec![commit("b", Some(account("U2", "bob")), None)],
            ]),
            fail_on_page: Some(1),
            ..Default::default()
        };
        let result = CommitFetcher::new(Arc::new(source), Arc::clone(&ledger)).run().await;
        assert!(matches!(result, Err(FetchError::GitHub(_))));
        assert!(ledger.get(Mapping::Pending, "U1").await.is_some());
        assert!(ledger.get(Mapping::Pending, "U2").await.is_none());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut named = account("U1", "alice");
        named.name = Some("Alice Liddell".to_string());
        let c = commit("a", Some(named.clone()), None);
        assert_eq!(record_for(&c, &named).display_name, "Alice Liddell");

        let unnamed = account("U2", "bob");
        let c = commit("b", Some(unnamed.clone()), None);
        assert_eq!(record_for(&c, &unnamed).display_name, "b author");
        assert_eq!(record_for(&c, &unnamed).email, "b@example.com");
    }
}
