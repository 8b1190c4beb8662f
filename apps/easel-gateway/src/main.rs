use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;

use easel_gateway::Config;

#[derive(Parser, Debug)]
struct Args {
    /// Override EASEL_BIND_ADDR for this invocation.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    easel_gateway::serve(config).await
}
