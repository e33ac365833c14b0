use super::{is_owner, is_owner_or_org_member};
use crate::contributors::ledger::LedgerError;
use crate::contributors::reconciler::{ChannelPrompt, GuildMembers, MemberRef, ReconcileError};
use crate::contributors::record::ContributorRecord;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{error, info};

/// Track first-time contributors to the repository
#[poise::command(
    prefix_command,
    slash_command,
    subcommands(
        "fetch",
        "list",
        "add",
        "hackadd",
        "ignore",
        "unignore",
        "addoutput",
        "removeoutput",
        "outputs",
        "interactive"
    ),
    guild_only
)]
pub async fn newcontributors(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

async fn say(ctx: Context<'_>, content: &str) -> Result<(), Error> {
    ctx.data().outgoing.say(ctx, content).await
}

/// Reports domain failures to the operator; anything else propagates.
async fn report(
    ctx: Context<'_>,
    result: Result<ContributorRecord, LedgerError>,
    success: String,
) -> Result<(), Error> {
    match result {
        Ok(_) => say(ctx, &success).await,
        Err(LedgerError::Storage(e)) => Err(e.into()),
        Err(e) => say(ctx, &format!("❌ {}", e)).await,
    }
}

fn describe(record: &ContributorRecord) -> String {
    let mut line = format!("• **{}** (`{}`)", record.display_name, record.username);
    if !record.email.is_empty() {
        line.push_str(&format!(" {}", record.email));
    }
    if let Some(member_id) = record.discord_user_id {
        line.push_str(&format!(", previously <@{}>", member_id));
    }
    line
}

/// Accepts `<#id>` or a raw channel id.
fn parse_channel_ref(input: &str) -> Option<u64> {
    let input = input.trim();
    input
        .strip_prefix("<#")
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(input)
        .parse()
        .ok()
        .filter(|id| *id != 0)
}

/// Scan the repository's commit history for new contributors
#[poise::command(prefix_command, slash_command, check = "is_owner")]
pub async fn fetch(ctx: Context<'_>) -> Result<(), Error> {
    info!("Fetch requested by {}", ctx.author().name);
    ctx.defer().await?;
    let plugin = &ctx.data().contributors;
    match plugin.fetcher.run().await {
        Ok(report) => say(ctx, &report.status_message()).await,
        Err(e) => {
            error!("Fetch failed: {}", e);
            say(ctx, &format!("❌ Fetch failed: {}", e)).await
        }
    }
}

/// List contributors waiting to be linked
#[poise::command(prefix_command, slash_command, check = "is_owner_or_org_member")]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let pending = ctx.data().contributors.ledger.pending().await;
    if pending.is_empty() {
        return say(ctx, "📭 There are no pending contributors.").await;
    }
    let mut response = format!("## Pending contributors ({})\n", pending.len());
    response.push_str(&pending.iter().map(describe).collect::<Vec<_>>().join("\n"));
    say(ctx, &response).await
}

/// Link a pending contributor to a guild member
#[poise::command(prefix_command, slash_command, check = "is_owner_or_org_member")]
pub async fn add(
    ctx: Context<'_>,
    #[description = "GitHub login"] login: String,
    #[description = "Guild member"] member: serenity::Member,
) -> Result<(), Error> {
    let member_id = member.user.id.get();
    let result = ctx
        .data()
        .contributors
        .ledger
        .link_login(&login, Some(member_id))
        .await;
    report(ctx, result, format!("✅ Linked `{}` to <@{}>.", login, member_id)).await
}

/// Link a pending contributor to a user id, member or not
#[poise::command(prefix_command, slash_command, check = "is_owner")]
pub async fn hackadd(
    ctx: Context<'_>,
    #[description = "GitHub login"] login: String,
    #[description = "Discord user mention or id"] user: String,
) -> Result<(), Error> {
    let Some(MemberRef::Id(user_id)) = MemberRef::parse(&user) else {
        return say(ctx, "❌ That is not a user mention or id.").await;
    };
    let result = ctx
        .data()
        .contributors
        .ledger
        .link_login(&login, Some(user_id))
        .await;
    report(ctx, result, format!("✅ Linked `{}` to user id `{}`.", login, user_id)).await
}

/// Mark a pending contributor as handled without linking anyone
#[poise::command(prefix_command, slash_command, check = "is_owner_or_org_member")]
pub async fn ignore(
    ctx: Context<'_>,
    #[description = "GitHub login"] login: String,
) -> Result<(), Error> {
    let result = ctx.data().contributors.ledger.ignore(&login).await;
    report(ctx, result, format!("✅ Ignored `{}`.", login)).await
}

/// Put an ignored contributor back into the pending list
#[poise::command(prefix_command, slash_command, check = "is_owner_or_org_member")]
pub async fn unignore(
    ctx: Context<'_>,
    #[description = "GitHub login"] login: String,
) -> Result<(), Error> {
    let result = ctx.data().contributors.ledger.unignore(&login).await;
    report(ctx, result, format!("✅ `{}` is pending again.", login)).await
}

/// Send new-contributor notifications to a channel
#[poise::command(prefix_command, slash_command, check = "is_owner")]
pub async fn addoutput(
    ctx: Context<'_>,
    #[description = "Channel (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let channel_id = channel.map(|c| c.id).unwrap_or_else(|| ctx.channel_id());
    let added = ctx
        .data()
        .contributors
        .ledger
        .add_output_channel(channel_id.get())
        .await?;
    if added {
        say(ctx, &format!("✅ Notifications will be sent to <#{}>.", channel_id)).await
    } else {
        say(ctx, &format!("ℹ️ <#{}> already receives notifications.", channel_id)).await
    }
}

/// Stop sending notifications to a channel
#[poise::command(prefix_command, slash_command, check = "is_owner")]
pub async fn removeoutput(
    ctx: Context<'_>,
    #[description = "Channel mention or id"] channel: String,
) -> Result<(), Error> {
    let Some(channel_id) = parse_channel_ref(&channel) else {
        return say(ctx, "❌ That is not a channel mention or id.").await;
    };
    let removed = ctx
        .data()
        .contributors
        .ledger
        .remove_output_channel(channel_id)
        .await?;
    if removed {
        say(ctx, &format!("✅ Removed `{}` from the output channels.", channel_id)).await
    } else {
        say(ctx, &format!("❌ `{}` is not an output channel.", channel_id)).await
    }
}

/// Show where notifications are sent
#[poise::command(prefix_command, slash_command, check = "is_owner_or_org_member")]
pub async fn outputs(ctx: Context<'_>) -> Result<(), Error> {
    let channels = ctx.data().contributors.ledger.output_channels().await;
    if channels.is_empty() {
        return say(ctx, "📭 No output channels configured.").await;
    }
    let lines: Vec<String> = channels
        .iter()
        .map(|id| format!("• <#{}> (`{}`)", id, id))
        .collect();
    say(ctx, &format!("## Output channels\n{}", lines.join("\n"))).await
}

/// Walk through pending contributors and link them one by one
#[poise::command(prefix_command, slash_command, check = "is_owner_or_org_member")]
pub async fn interactive(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let data = ctx.data();
    let plugin = &data.contributors;
    if plugin.reconciler.is_running() {
        return say(ctx, "❌ An interactive session is already running.").await;
    }
    say(ctx, "Starting an interactive session. Reply in this channel.").await?;

    let serenity_ctx = ctx.serenity_context();
    let mut prompt = ChannelPrompt::new(
        serenity_ctx.clone(),
        Arc::clone(&data.outgoing),
        ctx.channel_id(),
        ctx.author().id,
        plugin.shutdown_signal(),
    );
    let members = GuildMembers::new(Arc::clone(&serenity_ctx.http), guild_id);

    match plugin.reconciler.run(&mut prompt, &members).await {
        Ok(summary) => {
            info!(
                "Interactive session by {} linked {} contributor(s)",
                ctx.author().name,
                summary.linked.len()
            );
            Ok(())
        }
        Err(ReconcileError::AlreadyRunning) => {
            say(ctx, "❌ An interactive session is already running.").await
        }
        Err(e) => Err(e.into()),
    }
}
