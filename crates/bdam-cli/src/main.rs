use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bdam_crm::{CrmClient, CrmClientConfig, ListFieldDictionary};
use bdam_sync::{Pipeline, ServiceConfig};
use bdam_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "bdam")]
#[command(about = "Bitrix deal-activity mirror")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run migrations and start the webhook receiver.
    Serve,
    /// Apply pending migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bdam_cli=info,bdam_sync=info,bdam_web=info,bdam_crm=info,bdam_db=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate => migrate(config).await,
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    // Phase one: construct and verify every dependency. A dead database is a
    // startup failure; a failed dictionary load is not.
    let pool = bdam_db::connect(&config.database_url, &config.pg_tls).await?;
    bdam_db::health_check(&pool)
        .await
        .context("database boot ping failed")?;
    tracing::info!("database connection verified");

    bdam_db::run_migrations(&pool).await?;

    let crm = CrmClient::new(
        CrmClientConfig::new(&config.crm_base_url).timeout(config.crm_timeout),
    )?;
    let dictionary = Arc::new(ListFieldDictionary::load(&crm).await);

    let pipeline = Arc::new(Pipeline::new(crm, pool, dictionary));
    let mut state = AppState::new(pipeline);
    if let Some(window) = config.dedup_window {
        tracing::info!(window_secs = window.as_secs(), "duplicate-delivery filter enabled");
        state = state.with_dedup_window(window);
    }

    // Phase two: only now start accepting webhooks.
    bdam_web::serve(state, config.port).await
}

async fn migrate(config: ServiceConfig) -> Result<()> {
    let pool = bdam_db::connect(&config.database_url, &config.pg_tls).await?;
    bdam_db::run_migrations(&pool).await?;
    println!("migrations applied");
    Ok(())
}
