use clap::Parser;
use tally_core::TallyConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use tally_server::{server, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tally.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match TallyConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect to DB
    let pool = match tally_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match tally_core::db::health_check(&pool).await {
            Ok(v) => println!("PostgreSQL connected: {}", v),
            Err(e) => {
                println!("PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match tally_core::db::check_approved_view(&pool).await {
            Ok(v) => println!("approved view present: {}", v),
            Err(e) => {
                println!("approved view check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("Tally DB health check passed");
        return Ok(());
    }

    // Wire pipeline + evaluation engine
    let state = match AppState::from_config(pool, config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to initialize server state: {}", e);
            std::process::exit(1);
        }
    };

    // Shutdown broadcast
    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Spawn scheduled evaluation loop if configured
    if let Some(interval_minutes) = state.config.evaluation.schedule_interval_minutes {
        if interval_minutes > 0 {
            let scheduler_runner = state.runner.clone();
            let scheduler_shutdown = tx.subscribe();
            tokio::spawn(async move {
                tally_server::subsystems::scheduler::run_scheduled_evaluation_loop(
                    scheduler_runner,
                    interval_minutes,
                    scheduler_shutdown,
                )
                .await;
            });
        }
    }

    // Spawn HTTP REST API server if enabled
    if state.config.http.enabled {
        let http_state = state.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = tally_server::http::start_http_server(http_state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = state.config.service.socket_path.clone();
    server::run_unix_server(&socket_path, state, tx.subscribe()).await?;

    Ok(())
}
