//! Callback channel
//!
//! The peer opens a connection to the gateway's callback port and serves
//! calls on it. The gateway side owns one [`CallbackClient`]; objects the
//! peer registers are [`RemoteObject`] proxies that route through it.
//!
//! ```text
//! WatchdogMonitor ──► RemoteObject::invoke ──► CallbackClient::call
//!                                                   │  Call{id}
//!                                                   ▼
//!                                  callback link task ◄──► peer socket
//!                                                   │  Reply{id}
//!                                   pending[id] ◄───┘
//! ```

use super::codec::{Frame, FrameCodec, Outcome};
use super::object::{Args, CallError, CallResult, GatewayObject, Returned};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Outcome>>>>;

struct CallbackLink {
    generation: u64,
    tx: mpsc::UnboundedSender<Frame>,
    pending: PendingCalls,
}

struct CallbackInner {
    next_call_id: AtomicU64,
    next_generation: AtomicU64,
    call_timeout: Duration,
    link: Mutex<Option<CallbackLink>>,
    /// Set once the first link attaches; only written under `link`
    attached_once: AtomicBool,
}

/// Gateway-side end of the callback channel
#[derive(Clone)]
pub struct CallbackClient {
    inner: Arc<CallbackInner>,
}

impl CallbackClient {
    pub fn new(call_timeout: Duration) -> Self {
        debug_assert!(!call_timeout.is_zero(), "call timeout must be positive");
        CallbackClient {
            inner: Arc::new(CallbackInner {
                next_call_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                call_timeout,
                link: Mutex::new(None),
                attached_once: AtomicBool::new(false),
            }),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Whether the peer has ever opened the callback connection
    pub fn has_attached(&self) -> bool {
        self.inner.attached_once.load(Ordering::Acquire)
    }

    /// Adopt `stream` as the callback connection, replacing any previous one.
    ///
    /// The returned future drives the connection and must be spawned. It
    /// finishes when the peer disconnects, the link is replaced, or
    /// `shutdown` fires; pending calls then fail with `PeerDisconnected`.
    pub fn attach(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        let previous = {
            let mut link = self.inner.link.lock();
            self.inner.attached_once.store(true, Ordering::Release);
            link.replace(CallbackLink {
                generation,
                tx,
                pending: pending.clone(),
            })
        };
        if previous.is_some() {
            warn!("Replacing existing callback connection");
        }

        let inner = self.inner.clone();
        async move {
            run_link(Framed::new(stream, FrameCodec::new()), rx, pending, shutdown).await;

            let mut link = inner.link.lock();
            if link.as_ref().map(|l| l.generation) == Some(generation) {
                *link = None;
            }
        }
    }

    /// Drop the current connection, failing its pending calls
    pub fn disconnect(&self) {
        if let Some(link) = self.inner.link.lock().take() {
            link.pending.lock().clear();
        }
    }

    /// Invoke `method` on the peer object `object_id`.
    ///
    /// Fails with `NotConnected` until the peer first opens the callback
    /// connection, and with `PeerDisconnected` once an opened one is gone.
    pub async fn call(
        &self,
        object_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        let pending = {
            let link = self.inner.link.lock();
            let Some(link) = link.as_ref() else {
                return Err(if self.inner.attached_once.load(Ordering::Acquire) {
                    CallError::PeerDisconnected
                } else {
                    CallError::NotConnected
                });
            };
            link.pending.lock().insert(id, reply_tx);
            let frame = Frame::Call {
                id,
                target: object_id.to_string(),
                method: method.to_string(),
                args,
            };
            if link.tx.send(frame).is_err() {
                link.pending.lock().remove(&id);
                return Err(CallError::PeerDisconnected);
            }
            link.pending.clone()
        };

        match tokio::time::timeout(self.inner.call_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome.into_result().map_err(CallError::Remote),
            Ok(Err(_)) => Err(CallError::PeerDisconnected),
            Err(_) => {
                pending.lock().remove(&id);
                Err(CallError::Timeout)
            }
        }
    }
}

async fn run_link(
    mut framed: Framed<TcpStream, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    pending: PendingCalls,
    shutdown: CancellationToken,
) {
    let peer = framed
        .get_ref()
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("Callback connection established: {}", peer);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Callback connection {} closing on shutdown", peer);
                break;
            }
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        warn!("Failed to send callback frame to {}: {}", peer, e);
                        break;
                    }
                }
                None => {
                    debug!("Callback connection {} replaced", peer);
                    break;
                }
            },
            incoming = framed.next() => match incoming {
                Some(Ok(Frame::Reply { id, outcome })) => {
                    match pending.lock().remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(outcome);
                        }
                        None => debug!("Dropping late callback reply {}", id),
                    }
                }
                Some(Ok(other)) => {
                    warn!("Unexpected frame on callback channel: {:?}", other);
                }
                Some(Err(e)) => {
                    warn!("Callback connection {} failed: {}", peer, e);
                    break;
                }
                None => {
                    info!("Callback connection closed: {}", peer);
                    break;
                }
            },
        }
    }

    // Dropping the senders wakes every waiter with PeerDisconnected
    pending.lock().clear();
}

/// Proxy for an object living in the peer process
#[derive(Clone)]
pub struct RemoteObject {
    object_id: String,
    client: CallbackClient,
}

impl RemoteObject {
    pub fn new(object_id: impl Into<String>, client: CallbackClient) -> Self {
        RemoteObject {
            object_id: object_id.into(),
            client,
        }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

impl GatewayObject for RemoteObject {
    fn invoke<'a>(&'a self, method: &'a str, args: Args) -> BoxFuture<'a, CallResult> {
        Box::pin(async move {
            self.client
                .call(&self.object_id, method, args.into_inner())
                .await
                .map(Returned::Value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, Framed<TcpStream, FrameCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (gateway_side, _) = listener.accept().await.unwrap();
        (gateway_side, Framed::new(peer, FrameCodec::new()))
    }

    #[tokio::test]
    async fn test_call_without_connection_fails() {
        let client = CallbackClient::new(Duration::from_millis(100));
        let err = client.call("p0", "ping", vec![]).await.unwrap_err();
        assert_eq!(err, CallError::NotConnected);
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let client = CallbackClient::new(Duration::from_secs(5));
        let (stream, mut peer) = connected_pair().await;
        tokio::spawn(client.attach(stream, CancellationToken::new()));

        let peer_task = tokio::spawn(async move {
            match peer.next().await {
                Some(Ok(Frame::Call { id, target, method, .. })) => {
                    assert_eq!(target, "p0");
                    assert_eq!(method, "ping");
                    peer.send(Frame::ok(id, json!(true))).await.unwrap();
                }
                other => panic!("unexpected frame: {:?}", other),
            }
            peer
        });

        let remote = RemoteObject::new("p0", client.clone());
        let v = remote.invoke("ping", Args::default()).await.unwrap();
        assert_eq!(v.into_value().unwrap(), json!(true));
        let _peer = peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let client = CallbackClient::new(Duration::from_secs(5));
        let (stream, mut peer) = connected_pair().await;
        tokio::spawn(client.attach(stream, CancellationToken::new()));

        tokio::spawn(async move {
            if let Some(Ok(Frame::Call { id, .. })) = peer.next().await {
                peer.send(Frame::err(id, "no such method")).await.unwrap();
            }
            // Keep the connection open until the test finishes
            let _ = peer.next().await;
        });

        let err = client.call("p0", "nope", vec![]).await.unwrap_err();
        assert_eq!(err, CallError::Remote("no such method".to_string()));
    }

    #[tokio::test]
    async fn test_pending_call_fails_when_peer_disconnects() {
        let client = CallbackClient::new(Duration::from_secs(5));
        let (stream, mut peer) = connected_pair().await;
        tokio::spawn(client.attach(stream, CancellationToken::new()));

        tokio::spawn(async move {
            // Read the call, then hang up without answering
            let _ = peer.next().await;
            drop(peer);
        });

        let err = client.call("p0", "ping", vec![]).await.unwrap_err();
        assert_eq!(err, CallError::PeerDisconnected);
    }

    #[tokio::test]
    async fn test_call_after_link_lost_is_peer_disconnected() {
        let client = CallbackClient::new(Duration::from_secs(5));
        assert!(!client.has_attached());

        let (stream, peer) = connected_pair().await;
        let link = tokio::spawn(client.attach(stream, CancellationToken::new()));
        assert!(client.has_attached());

        drop(peer);
        link.await.unwrap();
        assert!(!client.is_connected());

        let err = client.call("p0", "ping", vec![]).await.unwrap_err();
        assert_eq!(err, CallError::PeerDisconnected);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let client = CallbackClient::new(Duration::from_millis(50));
        let (stream, peer) = connected_pair().await;
        tokio::spawn(client.attach(stream, CancellationToken::new()));

        let err = client.call("p0", "ping", vec![]).await.unwrap_err();
        assert_eq!(err, CallError::Timeout);
        drop(peer);
    }
}
