//! Gateway listeners.
//!
//! Binds one TCP listener per population and spawns a task per accepted
//! socket. Each population has its own connection limit.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{error, info, warn};

use super::base::serve_base;
use super::client::serve_client;
use super::config::GatewayConfig;
use super::directory::PeerDirectory;
use super::router::Router;
use super::session::Context;
use crate::core::{GatewayError, Store};

/// Signals a running gateway to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Bound gateway.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use basegate::server::{Gateway, GatewayConfig};
/// use basegate::store::MemoryStore;
///
/// # async fn example() -> Result<(), basegate::core::GatewayError> {
/// let gateway = Gateway::bind(GatewayConfig::default(), Arc::new(MemoryStore::new())).await?;
/// println!("bases on {}, clients on {}", gateway.base_addr(), gateway.client_addr());
/// gateway.run().await
/// # }
/// ```
pub struct Gateway {
    config: GatewayConfig,
    base_listener: TcpListener,
    client_listener: TcpListener,
    base_addr: SocketAddr,
    client_addr: SocketAddr,
    store: Arc<dyn Store>,
    directory: Arc<PeerDirectory>,
    shutdown: ShutdownHandle,
}

impl Gateway {
    /// Validate the configuration and bind both listeners.
    pub async fn bind(config: GatewayConfig, store: Arc<dyn Store>) -> Result<Self, GatewayError> {
        config.validate()?;

        let base_listener = TcpListener::bind(config.base.bind_addr).await?;
        let client_listener = TcpListener::bind(config.client.bind_addr).await?;
        let base_addr = base_listener.local_addr()?;
        let client_addr = client_listener.local_addr()?;
        let (tx, _) = watch::channel(false);

        Ok(Self {
            config,
            base_listener,
            client_listener,
            base_addr,
            client_addr,
            store,
            directory: Arc::new(PeerDirectory::new()),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        })
    }

    /// Bound Base listener address.
    pub fn base_addr(&self) -> SocketAddr {
        self.base_addr
    }

    /// Bound Client listener address.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Live connection directory.
    pub fn directory(&self) -> Arc<PeerDirectory> {
        self.directory.clone()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Handle that stops [`run`](Self::run) from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Serve both listeners until shutdown.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let router = Router::new(self.store.clone(), self.directory.clone());
        let base = Arc::new(Context {
            config: self.config.base.clone(),
            store: self.store.clone(),
            router: router.clone(),
        });
        let client = Arc::new(Context {
            config: self.config.client.clone(),
            store: self.store.clone(),
            router,
        });

        info!(base = %self.base_addr, client = %self.client_addr, "gateway listening");
        tokio::try_join!(
            self.accept_loop("base", &self.base_listener, base, serve_base),
            self.accept_loop("client", &self.client_listener, client, serve_client),
        )?;
        info!("gateway stopped");
        Ok(())
    }

    async fn accept_loop<F, Fut>(
        &self,
        population: &'static str,
        listener: &TcpListener,
        ctx: Arc<Context>,
        serve: F,
    ) -> Result<(), GatewayError>
    where
        F: Fn(TcpStream, SocketAddr, Arc<Context>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let limit = Arc::new(Semaphore::new(ctx.config.max_connections));
        let mut shutdown = self.shutdown.tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(population, %err, "accept failed");
                        continue;
                    }
                },
                _ = shutdown.changed() => return Ok(()),
            };

            let Ok(permit) = limit.clone().try_acquire_owned() else {
                warn!(population, %remote, "connection limit reached, closing");
                drop(stream);
                continue;
            };

            let connection = serve(stream, remote, ctx.clone(), shutdown.clone());
            tokio::spawn(async move {
                connection.await;
                drop(permit);
            });
        }
    }
}
