use std::net::SocketAddr;

use clap::Parser;

use chat_gateway::{app, config, observability, AppState};

#[derive(Parser, Debug)]
#[command(name = "chat-gateway", version, about = "Multi-backend chat completion gateway")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "GATEWAY_CONFIG", default_value = "config/gateway.toml")]
    config: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Tracing filter, overrides RUST_LOG
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_tracing(args.log.as_deref());

    let cfg = config::load(&args.config).await?;
    tracing::info!(
        bedrock = cfg.providers.bedrock.enabled,
        openai = cfg.providers.openai.enabled,
        access_codes = cfg.auth.access_codes.len(),
        "configuration loaded"
    );

    let router = app(AppState::new(cfg));
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("chat gateway listening on {addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
