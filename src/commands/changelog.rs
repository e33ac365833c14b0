use super::is_owner;
use crate::config::DISCORD_EMBED_LIMIT;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

const EMBED_FIELD_LIMIT: usize = 1024;

/// Comma-separated profile links, cut short with `…` when they do not fit.
fn profile_links(logins: &[String]) -> String {
    let mut description = String::new();
    for (i, login) in logins.iter().enumerate() {
        let link = format!("[{0}](https://github.com/{0})", login);
        let separator = if i == 0 { "" } else { ", " };
        if description.len() + separator.len() + link.len() + ", …".len() > DISCORD_EMBED_LIMIT {
            description.push_str(", …");
            break;
        }
        description.push_str(separator);
        description.push_str(&link);
    }
    description
}

fn rst_list(logins: &[String]) -> String {
    logins
        .iter()
        .map(|login| format!(":ghuser:`{}`", login))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Get contributors for the given milestone
#[poise::command(prefix_command, slash_command, check = "is_owner")]
pub async fn getcontributors(
    ctx: Context<'_>,
    #[description = "Milestone number"] milestone: u32,
) -> Result<(), Error> {
    ctx.defer().await?;
    let logins = match ctx.data().github.milestone_contributors(milestone.into()).await {
        Ok(logins) => logins,
        Err(e) => {
            ctx.data()
                .outgoing
                .say(ctx, &format!("❌ Could not fetch milestone {}: {}", milestone, e))
                .await?;
            return Ok(());
        }
    };
    if logins.is_empty() {
        ctx.data()
            .outgoing
            .say(ctx, &format!("📭 Milestone {} has no pull requests.", milestone))
            .await?;
        return Ok(());
    }
    info!(
        "Milestone {} of {} has {} contributor(s)",
        milestone,
        ctx.data().github.repository(),
        logins.len()
    );

    let rst = format!("```\n{}\n```", rst_list(&logins));
    let mut embed = serenity::CreateEmbed::new()
        .title(format!("Contributors to milestone {}", milestone))
        .description(profile_links(&logins))
        .color(0x5865F2);
    let mut reply = poise::CreateReply::default();
    if rst.chars().count() <= EMBED_FIELD_LIMIT {
        embed = embed.field("RST formatted list", rst, false);
    } else {
        reply = reply.attachment(serenity::CreateAttachment::bytes(
            rst_list(&logins).into_bytes(),
            "contributors.rst",
        ));
    }
    ctx.send(reply.embed(embed)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatting() {
        let logins = vec!["alice".to_string(), "Bob".to_string()];
        assert_eq!(
            profile_links(&logins),
            "[alice](https://github.com/alice), [Bob](https://github.com/Bob)"
        );
        assert_eq!(rst_list(&logins), ":ghuser:`alice`, :ghuser:`Bob`");
    }

    #[test]
    fn test_links_fit_in_an_embed() {
        let logins: Vec<String> = (0..500).map(|i| format!("contributor{}", i)).collect();
        let description = profile_links(&logins);
        assert!(description.len() <= DISCORD_EMBED_LIMIT);
        assert!(description.ends_with(", …"));
    }
}
