use std::path::PathBuf;

use tracing::info;

use portage_server::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portage_server=debug,portage_transport=info,tower_http=debug".into()),
        )
        .init();

    // Config
    let passphrase = std::env::var("PORTAGE_PASSPHRASE").unwrap_or_default();
    if passphrase.is_empty() {
        eprintln!("FATAL: PORTAGE_PASSPHRASE is unset.");
        eprintln!("       Clients derive the session key from it; without a key nothing");
        eprintln!("       can connect. Set it in your .env file and restart.");
        std::process::exit(1);
    }

    let host = std::env::var("PORTAGE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PORTAGE_PORT")
        .unwrap_or_else(|_| "4500".into())
        .parse()?;
    let root: PathBuf = std::env::var("PORTAGE_ROOT")
        .unwrap_or_else(|_| "./portage-root".into())
        .into();

    let config = Config {
        bind: format!("{host}:{port}").parse()?,
        root,
        passphrase,
    };

    tokio::select! {
        result = portage_server::run(config) => result,
        _ = shutdown_signal() => Ok(()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
