pub mod changelog;
pub mod contributors;
pub mod sendmode;

use crate::{Context, Error};
use poise::serenity_prelude as serenity;

fn author_is_owner(ctx: Context<'_>) -> bool {
    let author = ctx.author().id;
    ctx.data().config.owner_id.map(serenity::UserId::new) == Some(author)
        || ctx.framework().options().owners.contains(&author)
}

/// Passes for the bot owner.
pub async fn is_owner(ctx: Context<'_>) -> Result<bool, Error> {
    if author_is_owner(ctx) {
        return Ok(true);
    }
    ctx.data()
        .outgoing
        .say(ctx, "❌ Only the bot owner can use this command.")
        .await?;
    Ok(false)
}

/// Passes for the bot owner and for holders of the organisation-member role.
pub async fn is_owner_or_org_member(ctx: Context<'_>) -> Result<bool, Error> {
    if author_is_owner(ctx) {
        return Ok(true);
    }
    if let Some(role_id) = ctx.data().config.org_member_role_id {
        if let Some(member) = ctx.author_member().await {
            if member.roles.contains(&serenity::RoleId::new(role_id)) {
                return Ok(true);
            }
        }
    }
    ctx.data()
        .outgoing
        .say(ctx, "❌ Only organisation members can use this command.")
        .await?;
    Ok(false)
}
