use dotenvy::dotenv;
use std::env;
use std::net::SocketAddr;

pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8888";

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub owner_id: Option<u64>,
    pub guild_id: Option<u64>,
    pub org_member_role_id: Option<u64>,
    pub database_url: String,
    pub status_message: String,
    pub command_prefix: String,
    pub relay_addr: SocketAddr,
    pub github: GitHubConfig,
}

/// Everything needed to talk to the GitHub GraphQL API.
///
/// Split out of [`Config`] so the standalone binaries can load it without a
/// Discord token.
#[derive(Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub graphql_url: String,
    pub owner: String,
    pub repo: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            owner_id: env::var("OWNER_ID").ok().and_then(|id| id.parse().ok()),
            guild_id: env::var("GUILD_ID").ok().and_then(|id| id.parse().ok()),
            org_member_role_id: env::var("ORG_MEMBER_ROLE_ID")
                .ok()
                .and_then(|id| id.parse().ok()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/redhelper.db".to_string()),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Watching for new contributors".to_string()),
            command_prefix: env::var("COMMAND_PREFIX").unwrap_or_else(|_| "!".to_string()),
            relay_addr: env::var("RELAY_ADDR")
                .unwrap_or_else(|_| DEFAULT_RELAY_ADDR.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RELAY_ADDR must be a valid socket address"))?,
            github: GitHubConfig::build()?,
        })
    }
}

impl GitHubConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(GitHubConfig {
            token: env::var("GITHUB_TOKEN")
                .map_err(|_| anyhow::anyhow!("GITHUB_TOKEN must be set"))?,
            graphql_url: env::var("GITHUB_GRAPHQL_URL")
                .unwrap_or_else(|_| DEFAULT_GRAPHQL_URL.to_string()),
            owner: env::var("GITHUB_OWNER").unwrap_or_else(|_| "Cog-Creators".to_string()),
            repo: env::var("GITHUB_REPO").unwrap_or_else(|_| "Red-DiscordBot".to_string()),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("owner_id", &self.owner_id)
            .field("guild_id", &self.guild_id)
            .field("org_member_role_id", &self.org_member_role_id)
            .field("database_url", &self.database_url)
            .field("status_message", &self.status_message)
            .field("command_prefix", &self.command_prefix)
            .field("relay_addr", &self.relay_addr)
            .field("github", &self.github)
            .finish()
    }
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"[REDACTED]")
            .field("graphql_url", &self.graphql_url)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .finish()
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
/// Embed description limit is 4096 characters
pub const DISCORD_EMBED_LIMIT: usize = 4096;
/// Discord rejects messages carrying more embeds than this
pub const DISCORD_MAX_EMBEDS: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Test missing vars
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("GITHUB_TOKEN");
        assert!(
            Config::build().is_err(),
            "Should fail when required vars are missing"
        );

        // 2. Test defaults
        env::set_var("DISCORD_TOKEN", "test_token");
        env::set_var("GITHUB_TOKEN", "ghp_secret");
        env::remove_var("RELAY_ADDR");
        env::remove_var("COMMAND_PREFIX");
        let config = Config::build().unwrap();
        assert_eq!(config.command_prefix, "!");
        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.relay_addr, DEFAULT_RELAY_ADDR.parse().unwrap());
        assert_eq!(config.github.graphql_url, DEFAULT_GRAPHQL_URL);

        // 3. Test debug redaction
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("test_token"));
        assert!(!debug_output.contains("ghp_secret"));
        assert!(debug_output.contains("[REDACTED]"));

        // 4. Invalid relay address is rejected
        env::set_var("RELAY_ADDR", "not an address");
        assert!(Config::build().is_err());

        // Cleanup
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("GITHUB_TOKEN");
        env::remove_var("RELAY_ADDR");
    }
}
