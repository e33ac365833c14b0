use poise::serenity_prelude as serenity;
use redhelper::commands::{changelog, contributors, sendmode};
use redhelper::contributors::notifier::DiscordSink;
use redhelper::contributors::ContributorsPlugin;
use redhelper::db::Database;
use redhelper::github::GitHubClient;
use redhelper::outgoing::OutgoingPipeline;
use redhelper::{config::Config, Data, Error};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

fn is_tracked_guild(data: &Data, guild_id: serenity::GuildId) -> bool {
    data.config
        .guild_id
        .map_or(true, |tracked| tracked == guild_id.get())
}

async fn handle_event(event: &serenity::FullEvent, data: &Data) -> Result<(), Error> {
    match event {
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            if is_tracked_guild(data, new_member.guild_id) {
                data.contributors
                    .on_member_join(new_member.user.id.get())
                    .await?;
            }
        }
        serenity::FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            if is_tracked_guild(data, *guild_id) {
                data.contributors.on_member_leave(user.id.get()).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("redhelper=info".parse()?),
        )
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);
    let discord_token = config.discord_token.clone();

    let db = Database::new(&config.database_url)?;
    db.execute_init()?;

    let github = Arc::new(GitHubClient::new(reqwest::Client::new(), config.github.clone()));
    let plugin = Arc::new(ContributorsPlugin::load(db.clone(), github.clone()).await?);
    let outgoing = Arc::new(OutgoingPipeline::load(db.clone()).await?);

    let owners = config
        .owner_id
        .map(|id| HashSet::from([serenity::UserId::new(id)]))
        .unwrap_or_default();

    let framework = {
        let plugin = Arc::clone(&plugin);
        let prefix = config.command_prefix.clone();
        poise::Framework::builder()
            .options(poise::FrameworkOptions {
                commands: vec![
                    contributors::newcontributors(),
                    changelog::getcontributors(),
                    sendmode::sendmode(),
                ],
                prefix_options: poise::PrefixFrameworkOptions {
                    prefix: Some(prefix),
                    ..Default::default()
                },
                owners,
                event_handler: |_ctx, event, _framework, data| Box::pin(handle_event(event, data)),
                ..Default::default()
            })
            .setup(move |ctx, _ready, framework| {
                Box::pin(async move {
                    info!("Bot is ready!");
                    poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                    // Set bot status
                    ctx.set_activity(Some(serenity::ActivityData::custom(&config.status_message)));

                    let sink = Arc::new(DiscordSink::new(ctx.http.clone(), Arc::clone(&outgoing)));
                    plugin.start(sink, config.relay_addr).await?;

                    Ok(Data {
                        config,
                        github,
                        contributors: plugin,
                        outgoing,
                    })
                })
            })
            .build()
    };

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::GUILD_MEMBERS;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    info!("Starting bot...");
    let shard_manager = client.shard_manager.clone();
    tokio::select! {
        result = client.start() => {
            if let Err(why) = result {
                error!("Client error: {:?}", why);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            shard_manager.shutdown_all().await;
        }
    }

    plugin.unload().await;
    Ok(())
}
