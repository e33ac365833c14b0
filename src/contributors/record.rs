use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A contributor keyed by their GitHub node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorRecord {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub discord_user_id: Option<u64>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
}

impl ContributorRecord {
    pub fn new(id: &str, username: &str, display_name: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            email: email.to_string(),
            discord_user_id: None,
            first_seen: Some(Utc::now()),
        }
    }

    pub fn profile_url(&self) -> String {
        format!("https://github.com/{}", self.username)
    }

    /// Ignored records live in `added` with no linked member.
    pub fn is_ignored(&self) -> bool {
        self.discord_user_id.is_none()
    }
}

/// The three disjoint sets a contributor can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mapping {
    Pending,
    Added,
    LeftGuild,
}

impl Mapping {
    pub const ALL: [Mapping; 3] = [Mapping::Pending, Mapping::Added, Mapping::LeftGuild];

    /// Key under which the mapping is persisted.
    pub fn key(self) -> &'static str {
        match self {
            Mapping::Pending => "pending",
            Mapping::Added => "added",
            Mapping::LeftGuild => "left_guild",
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Whether a login belongs to an automation account.
pub fn is_bot_login(login: &str) -> bool {
    login.ends_with("[bot]")
}
