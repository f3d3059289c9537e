use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use palaver::client::{self, ClientConfig};

#[derive(Parser, Debug)]
#[command(name = "palaver")]
#[command(author, version, about = "Terminal chat over a pub/sub messaging system")]
struct Args {
    /// Messaging system address
    #[arg(short, long, default_value = "nats://127.0.0.1:4222")]
    server: String,

    /// Override the chat display name
    #[arg(short, long)]
    name: Option<String>,

    /// User credentials file (from palaver-access)
    #[arg(short, long)]
    creds: PathBuf,

    /// Evict peers after this many seconds without a heartbeat
    #[arg(long)]
    peer_ttl: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    client::run(ClientConfig {
        server: args.server,
        creds_path: args.creds,
        name_override: args.name,
        peer_ttl_secs: args.peer_ttl,
    })
    .await
}
