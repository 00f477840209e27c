use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use umuw::config::{Cli, Command, Config};
use umuw::context::AppContext;
use umuw::render::TerminalRenderer;
use umuw::state::AppState;
use umuw::storage::UploadDir;
use umuw::{db, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli)?;
    std::fs::create_dir_all(&data_dir)?;
    tracing::debug!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;

    if let Command::Serve { .. } = cli.command {
        return serve(config).await;
    }

    let ctx = match AppContext::init(&config, Arc::new(TerminalRenderer)).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{}", e.notice());
            std::process::exit(1);
        }
    };
    let result = umuw::cli::run(&ctx, cli.command).await;
    ctx.shutdown();

    if let Err(e) = result {
        eprintln!("{}", e.notice());
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let db_path = config
        .db_path()
        .ok_or_else(|| anyhow::anyhow!("no database path configured"))?;
    let uploads_path = config
        .uploads_path()
        .ok_or_else(|| anyhow::anyhow!("no uploads path configured"))?;

    // Initialize database
    let pool = db::create_pool(db_path)?;
    db::run_migrations(&pool)?;
    let uploads = UploadDir::new(uploads_path)?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = routes::router(AppState::new(pool, config, uploads));

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
