//! Peer side of the gateway protocol
//!
//! Used by the test client binary and the integration tests: connect to the
//! main listener, call gateway objects, publish callback objects, and serve
//! the gateway's calls on the callback connection.

use super::codec::{Frame, FrameCodec, FrameError, ENTRY_POINT_ID};
use super::handshake::{self, HandshakeError, HandshakeRecord};
use super::object::{Args, CallResult, GatewayObject, Returned};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error type for peer-side operations
#[derive(Debug)]
pub enum PeerError {
    Io(std::io::Error),
    Frame(FrameError),
    Handshake(HandshakeError),
    /// The gateway answered with an error outcome
    Remote(String),
    /// The gateway closed the connection
    Closed,
    /// A frame arrived that does not answer the outstanding request
    Unexpected(Frame),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Io(e) => write!(f, "I/O error: {}", e),
            PeerError::Frame(e) => write!(f, "{}", e),
            PeerError::Handshake(e) => write!(f, "{}", e),
            PeerError::Remote(msg) => write!(f, "Gateway error: {}", msg),
            PeerError::Closed => write!(f, "Gateway closed the connection"),
            PeerError::Unexpected(frame) => write!(f, "Unexpected frame: {:?}", frame),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        PeerError::Io(e)
    }
}

impl From<FrameError> for PeerError {
    fn from(e: FrameError) -> Self {
        PeerError::Frame(e)
    }
}

impl From<HandshakeError> for PeerError {
    fn from(e: HandshakeError) -> Self {
        PeerError::Handshake(e)
    }
}

/// Main-channel client; one request in flight at a time
pub struct PeerClient {
    framed: Framed<TcpStream, FrameCodec>,
    next_id: u64,
}

impl PeerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, PeerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to gateway at {}", addr);
        Ok(PeerClient {
            framed: Framed::new(stream, FrameCodec::new()),
            next_id: 1,
        })
    }

    /// Read the handshake file at `path` and connect to the published port
    pub async fn connect_from_handshake(
        path: &Path,
        host: IpAddr,
    ) -> Result<(Self, HandshakeRecord), PeerError> {
        let record = handshake::read(path)?;
        let client = Self::connect(SocketAddr::new(host, record.listener_port)).await?;
        Ok((client, record))
    }

    /// Call a method on the gateway's entry point
    pub async fn call_entry(&mut self, method: &str, args: Vec<Value>) -> Result<Value, PeerError> {
        self.call(ENTRY_POINT_ID, method, args).await
    }

    pub async fn call(&mut self, target: &str, method: &str, args: Vec<Value>) -> Result<Value, PeerError> {
        let id = self.next_request_id();
        self.request(Frame::Call {
            id,
            target: target.to_string(),
            method: method.to_string(),
            args,
        })
        .await
    }

    /// Publish the callback object `object_id` under `name`
    pub async fn register(&mut self, name: &str, object_id: &str) -> Result<(), PeerError> {
        let id = self.next_request_id();
        self.request(Frame::Register {
            id,
            name: name.to_string(),
            object_id: object_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Drop a gateway object previously returned to us
    pub async fn release(&mut self, object_id: &str) -> Result<bool, PeerError> {
        let id = self.next_request_id();
        let v = self
            .request(Frame::Release {
                id,
                object_id: object_id.to_string(),
            })
            .await?;
        Ok(v.as_bool().unwrap_or(false))
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn request(&mut self, frame: Frame) -> Result<Value, PeerError> {
        let id = frame.id();
        self.framed.send(frame).await?;

        match self.framed.next().await {
            Some(Ok(Frame::Reply { id: reply_id, outcome })) if reply_id == id => {
                outcome.into_result().map_err(PeerError::Remote)
            }
            Some(Ok(other)) => Err(PeerError::Unexpected(other)),
            Some(Err(e)) => Err(e.into()),
            None => Err(PeerError::Closed),
        }
    }
}

/// Serves the gateway's calls into local objects over the callback port
pub struct CallbackServer {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl CallbackServer {
    /// Connect to the gateway's callback port and serve `objects` by id
    pub async fn connect(
        addr: SocketAddr,
        objects: HashMap<String, Arc<dyn GatewayObject>>,
    ) -> Result<Self, PeerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            Framed::new(stream, FrameCodec::new()),
            objects,
            shutdown.clone(),
        ));
        Ok(CallbackServer { task, shutdown })
    }

    /// Close the callback connection, as a dying peer would
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn serve(
    mut framed: Framed<TcpStream, FrameCodec>,
    objects: HashMap<String, Arc<dyn GatewayObject>>,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = framed.next() => incoming,
        };

        let reply = match incoming {
            Some(Ok(Frame::Call {
                id,
                target,
                method,
                args,
            })) => match objects.get(&target) {
                Some(object) => match object.invoke(&method, Args::new(args)).await {
                    Ok(Returned::Value(v)) => Frame::ok(id, v),
                    Ok(Returned::Object(_)) => Frame::err(id, "object results are not supported"),
                    Err(e) => Frame::err(id, e.to_string()),
                },
                None => Frame::err(id, format!("Unknown object: {}", target)),
            },
            Some(Ok(other)) => {
                warn!("Ignoring unexpected callback frame: {:?}", other);
                continue;
            }
            Some(Err(e)) => {
                warn!("Callback connection failed: {}", e);
                break;
            }
            None => break,
        };

        if let Err(e) = framed.send(reply).await {
            warn!("Failed to answer callback: {}", e);
            break;
        }
    }
    debug!("Callback server stopped");
}

/// Watchdog object answering `ping()` with its alive flag
#[derive(Debug)]
pub struct LivenessProbe {
    alive: AtomicBool,
    pings: AtomicU64,
}

impl LivenessProbe {
    pub fn new() -> Self {
        LivenessProbe {
            alive: AtomicBool::new(true),
            pings: AtomicU64::new(0),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Pings answered so far
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayObject for LivenessProbe {
    fn invoke<'a>(&'a self, method: &'a str, _args: Args) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            match method {
                "ping" => {
                    self.pings.fetch_add(1, Ordering::Relaxed);
                    Ok(Returned::Value(Value::Bool(self.alive.load(Ordering::Acquire))))
                }
                other => Err(super::object::CallError::UnknownMethod(other.to_string())),
            }
        })
    }
}
