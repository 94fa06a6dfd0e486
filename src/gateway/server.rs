//! Gateway Endpoint
//!
//! Two listeners: the main one (peer → gateway calls) and the callback one
//! (the peer connects here so the gateway can call its registered objects).
//! Each gets its own accept task; both stop on the shared shutdown token.

use super::callback::CallbackClient;
use super::connection::{ConnectionHandler, SessionContext};
use super::object::GatewayObject;
use super::port::{acquire_free_port_on, PortError, PORT_ACQUIRE_ATTEMPTS_MAX};
use super::registry::{ObjectRegistry, ObjectTable};
use crate::config::GatewayConfig;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Error type for starting the gateway
#[derive(Debug)]
pub enum GatewayError {
    /// A listener could not be bound
    Bind { addr: SocketAddr, source: io::Error },
    /// No free callback port could be found
    Port(PortError),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Bind { addr, source } => write!(f, "Failed to bind {}: {}", addr, source),
            GatewayError::Port(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Bind { source, .. } => Some(source),
            GatewayError::Port(e) => Some(e),
        }
    }
}

impl From<PortError> for GatewayError {
    fn from(e: PortError) -> Self {
        GatewayError::Port(e)
    }
}

/// Where the gateway is reachable; fixed for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningEndpoint {
    pub host: IpAddr,
    pub port: u16,
    pub callback_port: u16,
}

impl ListeningEndpoint {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn callback_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.callback_port)
    }
}

pub struct GatewayServer {
    config: GatewayConfig,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        GatewayServer { config }
    }

    /// Bind both listeners and start serving `entry_point`.
    ///
    /// Returns once both sockets are bound; the ports are then final.
    pub async fn start(self, entry_point: Arc<dyn GatewayObject>) -> Result<GatewayHandle, GatewayError> {
        let host = self.config.host;

        let addr = SocketAddr::new(host, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        let port = local_port(&listener, addr)?;

        let callback_listener = bind_callback_listener(host, self.config.callback_port, port).await?;
        let callback_port = local_port(&callback_listener, SocketAddr::new(host, 0))?;

        let endpoint = ListeningEndpoint {
            host,
            port,
            callback_port,
        };
        info!(
            "Gateway listening on {} (callback port {})",
            endpoint.addr(),
            callback_port
        );

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let ctx = Arc::new(SessionContext {
            entry_point,
            objects: Arc::new(ObjectTable::new()),
            registry: Arc::new(ObjectRegistry::new()),
            callbacks: CallbackClient::new(self.config.call_timeout),
            tasks: tasks.clone(),
        });

        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let accept_main = tokio::spawn(accept_sessions(
            listener,
            ctx.clone(),
            permits,
            shutdown.clone(),
        ));
        let accept_callback = tokio::spawn(accept_callbacks(
            callback_listener,
            ctx.callbacks.clone(),
            tasks.clone(),
            shutdown.clone(),
        ));

        Ok(GatewayHandle {
            endpoint,
            ctx,
            shutdown,
            tasks,
            accept_tasks: Mutex::new(vec![accept_main, accept_callback]),
            stopped: AtomicBool::new(false),
        })
    }
}

fn local_port(listener: &TcpListener, addr: SocketAddr) -> Result<u16, GatewayError> {
    listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|source| GatewayError::Bind { addr, source })
}

/// Bind the callback listener, allocating a port unless one is configured.
///
/// An allocated port can be taken by someone else between the probe and the
/// bind; that case retries within the allocator's attempt bound.
async fn bind_callback_listener(host: IpAddr, configured: u16, main_port: u16) -> Result<TcpListener, GatewayError> {
    if configured != 0 {
        let addr = SocketAddr::new(host, configured);
        return TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source });
    }

    let mut last_error = None;
    for attempt in 1..=PORT_ACQUIRE_ATTEMPTS_MAX {
        let port = acquire_free_port_on(host)?;
        if port == main_port {
            continue;
        }
        let addr = SocketAddr::new(host, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!("Callback port {} taken before bind (attempt {})", port, attempt);
                last_error = Some(e);
            }
            Err(source) => return Err(GatewayError::Bind { addr, source }),
        }
    }

    Err(GatewayError::Port(PortError::NoFreePort {
        attempts: PORT_ACQUIRE_ATTEMPTS_MAX,
        last_error,
    }))
}

async fn accept_sessions(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                let handler = ConnectionHandler::new(stream, ctx.clone(), addr.to_string(), shutdown.clone());
                ctx.tasks.spawn(async move {
                    handler.run().await;
                    drop(permit);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
    debug!("Main accept loop stopped");
}

async fn accept_callbacks(
    listener: TcpListener,
    callbacks: CallbackClient,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("Callback connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                tasks.spawn(callbacks.attach(stream, shutdown.clone()));
            }
            Err(e) => {
                error!("Failed to accept callback connection: {}", e);
            }
        }
    }
    debug!("Callback accept loop stopped");
}

/// Running gateway
pub struct GatewayHandle {
    endpoint: ListeningEndpoint,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl GatewayHandle {
    pub fn endpoint(&self) -> ListeningEndpoint {
        self.endpoint
    }

    /// Callback objects registered by the peer
    pub fn registry(&self) -> Arc<ObjectRegistry> {
        self.ctx.registry.clone()
    }

    /// Gateway objects currently handed out to the peer
    pub fn objects(&self) -> Arc<ObjectTable> {
        self.ctx.objects.clone()
    }

    pub fn callbacks(&self) -> CallbackClient {
        self.ctx.callbacks.clone()
    }

    /// Token cancelled when the gateway shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop accepting, close every session and release both ports.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Gateway already shut down");
            return;
        }
        info!("Shutting down gateway on {}", self.endpoint.addr());

        self.shutdown.cancel();
        self.ctx.callbacks.disconnect();

        let accept_tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.accept_tasks.lock());
        for task in accept_tasks {
            if let Err(e) = task.await {
                warn!("Accept task ended abnormally: {}", e);
            }
        }

        self.tasks.close();
        self.tasks.wait().await;

        self.ctx.objects.clear();
        self.ctx.registry.clear();
        info!("Gateway stopped");
    }
}
