//! voice-turn-server entry point.

use voice_turn_server::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let fallback = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
                tracing_subscriber::EnvFilter::new(fallback)
            }),
        )
        .init();

    if let Err(e) = cli::run().await {
        tracing::error!(error = %e, "fatal error");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
