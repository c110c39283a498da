#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "seismo-store: ingest and query server for seismic waveform packets")]
struct Args {
    /// Path to a TOML/ini configuration file. CLI flags and `SEISMO_*`
    /// environment variables take precedence over values it sets.
    #[arg(long, env = "SEISMO_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = seismo_store::config::load(args.config.as_deref())?;
    seismo_store::server::run(config).await
}
