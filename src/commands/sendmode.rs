use super::is_owner;
use crate::outgoing::OutgoingError;
use crate::{Context, Error};

/// Toggle how the bot's messages are sent, or list the available modes
#[poise::command(prefix_command, slash_command, check = "is_owner")]
pub async fn sendmode(
    ctx: Context<'_>,
    #[description = "Middleware name"] middleware: Option<String>,
    #[description = "Enable or disable it"] enabled: Option<bool>,
) -> Result<(), Error> {
    let outgoing = &ctx.data().outgoing;
    let (Some(name), Some(on)) = (middleware, enabled) else {
        let lines: Vec<String> = outgoing
            .layers()
            .into_iter()
            .map(|(name, description, on)| {
                format!("{} `{}`: {}", if on { "🟢" } else { "🔴" }, name, description)
            })
            .collect();
        return outgoing
            .say(ctx, &format!("## Send modes\n{}", lines.join("\n")))
            .await;
    };

    match outgoing.set_enabled(&name, on).await {
        Ok(true) => {
            let state = if on { "enabled" } else { "disabled" };
            outgoing.say(ctx, &format!("✅ `{}` {}.", name, state)).await
        }
        Ok(false) => outgoing.say(ctx, &format!("ℹ️ `{}` was already set.", name)).await,
        Err(e @ OutgoingError::UnknownMiddleware(_)) => {
            outgoing.say(ctx, &format!("❌ {}", e)).await
        }
        Err(e) => Err(e.into()),
    }
}
