use std::path::PathBuf;

use rmcp::{ServiceExt, transport::stdio};

use drommage::config::Config;
use drommage::server::DrommageServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // MCP clients may start us with any CWD; DROMMAGE_REPO pins the repository.
    let repo_root = match std::env::var_os("DROMMAGE_REPO") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?,
    };

    // Repository .env first, then dotenvy's default CWD search. Existing vars win.
    let env_path = repo_root.join(".env");
    if env_path.exists() {
        dotenvy::from_path(&env_path).ok();
    } else {
        dotenvy::dotenv().ok();
    }

    tracing::info!(repo = %repo_root.display(), "drommage starting");

    let config = Config::load(&repo_root)?;
    let server = DrommageServer::new(&config, repo_root)?;

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("drommage shutting down");
    Ok(())
}
