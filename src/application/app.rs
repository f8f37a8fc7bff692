//! Application assembly: the explicit dependency container built at
//! startup, background task supervision, and the HTTP server.

use crate::admin::{self, AdminState};
use crate::channels::{build_http_client, ChannelRegistry, HttpClient};
use crate::config::Settings;
use crate::crypto::{self, CryptoService};
use crate::error::Result;
use crate::infrastructure::{migrations, Database};
use crate::keypool::{KeyProvider, KeyTaskRunner, PoolListener, Recuperator, TaskService};
use crate::proxy::{ProxyService, RequestLogger};
use crate::store::{MemoryStore, RedisStore, Store};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Owns every long-lived component; handed out as the interfaces each part
/// needs.
pub struct Application {
    settings: Settings,
    db: Database,
    store: Arc<dyn Store>,
    crypto: Arc<dyn CryptoService>,
    provider: Arc<KeyProvider>,
    registry: Arc<ChannelRegistry>,
    client: HttpClient,
}

impl Application {
    pub async fn new() -> Result<Self> {
        let settings = Settings::new()?;

        let db = Database::connect(&settings.database).await?;
        migrations::migrate(&db).await?;
        info!("database ready ({})", db.dialect().name());

        let store = build_store(&settings).await?;
        let crypto = crypto::new_service(&settings.auth.encryption_key);
        if settings.auth.key.is_empty() {
            warn!("AUTH_KEY is not set; admin and proxy authorization will reject all requests");
        } else {
            crypto::validate_passphrase_strength(&settings.auth.key, "AUTH_KEY");
        }

        let registry = Arc::new(ChannelRegistry::new());
        let client = build_http_client();
        let provider = Arc::new(KeyProvider::new(db.clone(), store.clone(), crypto.clone()));

        // Startup pool build; the listener keeps it converged afterwards.
        provider.rebuild_all().await?;

        Ok(Self {
            settings,
            db,
            store,
            crypto,
            provider,
            registry,
            client,
        })
    }

    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let recuperator = Recuperator::new(
            self.provider.clone(),
            self.registry.clone(),
            self.client.clone(),
            Duration::from_secs(self.settings.proxy.recuperate_interval_secs),
            self.settings.proxy.recuperate_batch as usize,
        );
        tokio::spawn(recuperator.run(shutdown_rx.clone()));

        let listener_task = PoolListener::new(
            self.provider.clone(),
            Duration::from_secs(self.settings.proxy.refresh_interval_secs),
        );
        tokio::spawn(listener_task.run(shutdown_rx.clone()));

        let tasks = Arc::new(TaskService::new(self.store.clone()));
        let runner = KeyTaskRunner::new(
            self.provider.clone(),
            tasks.clone(),
            self.registry.clone(),
            self.client.clone(),
        );

        let proxy = Arc::new(ProxyService::new(
            self.db.clone(),
            self.provider.clone(),
            self.registry.clone(),
            self.client.clone(),
            RequestLogger::new(self.db.clone()),
            self.settings.auth.key.clone(),
            self.settings.request_timeout(),
        ));

        let admin_state = Arc::new(AdminState {
            db: self.db.clone(),
            crypto: self.crypto.clone(),
            provider: self.provider.clone(),
            tasks,
            runner,
            auth_key: self.settings.auth.key.clone(),
            encryption_configured: !self.settings.auth.encryption_key.is_empty(),
        });

        let app = proxy.router().merge(admin::router(admin_state));

        let addr = self.settings.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("gpt-load listening on {addr}");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

        info!("server stopped");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

async fn build_store(settings: &Settings) -> Result<Arc<dyn Store>> {
    if settings.cache.url.is_empty() {
        info!("using in-process cache store");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        info!("using redis cache store");
        Ok(Arc::new(RedisStore::connect(&settings.cache.url).await?))
    }
}

/// Resolve on SIGINT/SIGTERM and flip the shutdown flag for background
/// tasks.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install ctrl-c handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
