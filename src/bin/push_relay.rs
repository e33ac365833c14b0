//! Forwards the authors of a GitHub `push` webhook to the bot's intake relay.

use clap::Parser;
use redhelper::config::DEFAULT_RELAY_ADDR;
use redhelper::contributors::relay::{authors_from_push_event, send_batch};
use std::net::SocketAddr;
use tracing::info;

#[derive(Parser)]
#[command(name = "push_relay")]
#[command(about = "Send the authors of a GitHub push event to the running bot")]
struct Cli {
    /// Raw JSON payload of the `push` webhook event
    payload: String,

    /// Address the bot's relay listens on
    #[arg(long, env = "RELAY_ADDR", default_value = DEFAULT_RELAY_ADDR)]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("push_relay=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let authors = authors_from_push_event(&cli.payload)?;
    info!("Sending {} author(s) to {}", authors.len(), cli.addr);
    send_batch(cli.addr, &authors).await?;
    Ok(())
}
