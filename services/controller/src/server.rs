//! Controller wiring: listeners, catalog, pool and reconciliation loop.

use std::future::IntoFuture;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::admin::{self, AdminState};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::pool::InstancePool;
use crate::proxy::{self, ProxyRouter, ProxyState};
use crate::reconciler::Reconciler;
use crate::source::VersionSource;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("{name} listener failed: {source}")]
    Serve {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

pub struct Controller {
    config: Config,
    proxy_listener: TcpListener,
    admin_listener: TcpListener,
    catalog: Arc<Catalog>,
    reconciler: Arc<Reconciler>,
    proxy_state: ProxyState,
}

async fn bind(name: &'static str, port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { name, addr, source })
}

impl Controller {
    /// Bind both listeners and assemble the controller. Nothing runs yet.
    pub async fn bind(config: Config, source: Arc<dyn VersionSource>) -> Result<Self, ServerError> {
        let proxy_listener = bind("proxy", config.port).await?;
        let admin_listener = bind("admin", config.admin_port).await?;

        let catalog = Arc::new(Catalog::new(Arc::clone(&source), config.preview));
        let pool = Arc::new(InstancePool::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&catalog),
            Arc::clone(&pool),
            source,
            config.app_name(),
            config.run_commands.clone(),
            config.workspace_dir.clone(),
        ));
        let proxy_state = ProxyState::new(Arc::new(ProxyRouter::new(pool)))?;

        Ok(Self {
            config,
            proxy_listener,
            admin_listener,
            catalog,
            reconciler,
            proxy_state,
        })
    }

    pub fn proxy_addr(&self) -> io::Result<SocketAddr> {
        self.proxy_listener.local_addr()
    }

    pub fn admin_addr(&self) -> io::Result<SocketAddr> {
        self.admin_listener.local_addr()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Serve until `shutdown` flips to true, then stop every instance.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let app = self.config.app_name();
        info!(
            app = %app,
            port = self.config.port,
            admin_port = self.config.admin_port,
            preview = self.config.preview,
            "Starting controller"
        );

        // The loop performs the initial catalog load on its first tick.
        let events = self.catalog.subscribe();
        let reconcile_loop = tokio::spawn(Arc::clone(&self.reconciler).run(
            events,
            shutdown.clone(),
            self.config.refresh_interval(),
        ));

        let proxy = axum::serve(self.proxy_listener, proxy::create_router(self.proxy_state))
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .into_future();
        let admin = axum::serve(
            self.admin_listener,
            admin::create_router(AdminState::new(Arc::clone(&self.reconciler))),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .into_future();

        info!("Listening for application and admin traffic");
        let (proxy_result, admin_result) = tokio::join!(proxy, admin);

        if let Err(e) = reconcile_loop.await {
            error!(error = %e, "Reconciliation loop panicked");
        }
        let stopped = self.reconciler.stop_all().await;
        info!(app = %app, stopped, "Controller stopped");

        proxy_result.map_err(|source| ServerError::Serve {
            name: "proxy",
            source,
        })?;
        admin_result.map_err(|source| ServerError::Serve {
            name: "admin",
            source,
        })
    }
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also means shut down.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
