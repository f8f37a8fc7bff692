use anyhow::Result;
use clap::{Parser, Subcommand};
use gpt_load::commands::MigrateKeysCommand;
use gpt_load::config::Settings;
use gpt_load::infrastructure::{migrations, Database};
use gpt_load::store::{RedisStore, Store};
use gpt_load::Application;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "gpt-load", version, about = "Multi-tenant reverse proxy for generative-AI APIs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Re-encrypt every stored credential value in place.
    ///
    /// Enable encryption: --to <new-key>. Disable: --from <old-key>.
    /// Rotate: --from <old-key> --to <new-key>. Back up the database and
    /// stop the service before migrating.
    MigrateKeys {
        /// Source encryption key (for decrypting existing data)
        #[arg(long, default_value = "")]
        from: String,
        /// Target encryption key (for encrypting new data)
        #[arg(long, default_value = "")]
        to: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        None => {
            info!("starting gpt-load server");
            let app = Application::new().await?;
            app.run().await?;
        }
        Some(Command::MigrateKeys { from, to }) => {
            run_migrate_keys(from, to).await?;
        }
    }

    Ok(())
}

async fn run_migrate_keys(from: String, to: String) -> Result<()> {
    let settings = Settings::new()?;
    let db = Database::connect(&settings.database).await?;
    migrations::migrate(&db).await?;

    let cache: Option<Arc<dyn Store>> = if settings.cache.url.is_empty() {
        // An in-process cache of a stopped service holds nothing to clear.
        None
    } else {
        Some(Arc::new(RedisStore::connect(&settings.cache.url).await?))
    };

    MigrateKeysCommand::new(db, cache, from, to).execute().await?;
    info!("key migration command completed");
    Ok(())
}
