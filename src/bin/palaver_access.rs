use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use palaver::issuer::{self, CredentialIssuer};

#[derive(Parser, Debug)]
#[command(name = "palaver-access")]
#[command(author, version, about = "Credential issuer for the palaver chat network")]
struct Args {
    /// Messaging system address
    #[arg(short, long, default_value = "nats://127.0.0.1:4222")]
    server: String,

    /// Account document file
    #[arg(short, long)]
    account: PathBuf,

    /// Delegated signing key seed file
    #[arg(short = 'k', long)]
    signing_key: PathBuf,

    /// Transport credentials file, if the messaging system requires auth
    #[arg(short, long)]
    creds: Option<PathBuf>,
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

    // Missing or unreadable credential material is a configuration error:
    // refuse to start.
    let issuer = CredentialIssuer::load_from_files(&args.account, &args.signing_key)?;

    let mut options = async_nats::ConnectOptions::new().name("Palaver Access");
    if let Some(creds_path) = &args.creds {
        let creds = std::fs::read_to_string(creds_path)
            .with_context(|| format!("could not load app credentials {}", creds_path.display()))?;
        options = async_nats::ConnectOptions::with_credentials(&creds)
            .context("could not parse app credentials")?
            .name("Palaver Access");
    }

    let client = options
        .connect(args.server.as_str())
        .await
        .context("could not connect to messaging system")?;
    info!(server = %args.server, "connected to messaging system");

    issuer::serve(client, issuer).await
}
