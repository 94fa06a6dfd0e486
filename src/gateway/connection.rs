use super::callback::{CallbackClient, RemoteObject};
use super::codec::{Frame, FrameCodec, Outcome, ENTRY_POINT_ID};
use super::object::{Args, CallError, GatewayObject, Returned};
use super::registry::{ObjectRegistry, ObjectTable};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// State shared by every peer session
pub(crate) struct SessionContext {
    pub entry_point: Arc<dyn GatewayObject>,
    pub objects: Arc<ObjectTable>,
    pub registry: Arc<ObjectRegistry>,
    pub callbacks: CallbackClient,
    pub tasks: TaskTracker,
}

impl SessionContext {
    fn resolve(&self, target: &str) -> Option<Arc<dyn GatewayObject>> {
        if target == ENTRY_POINT_ID {
            Some(self.entry_point.clone())
        } else {
            self.objects.get(target)
        }
    }

    async fn dispatch(&self, target: &str, method: &str, args: Vec<Value>) -> Outcome {
        let Some(object) = self.resolve(target) else {
            return Outcome::Err(CallError::UnknownObject(target.to_string()).to_string());
        };

        match object.invoke(method, Args::new(args)).await {
            Ok(Returned::Value(v)) => Outcome::Ok(v),
            Ok(Returned::Object(obj)) => {
                let object_id = self.objects.insert(obj);
                debug!("{}.{} returned object {}", target, method, object_id);
                Outcome::Ok(json!({ "object_id": object_id }))
            }
            Err(e) => Outcome::Err(e.to_string()),
        }
    }
}

/// One peer connection on the main channel
pub(crate) struct ConnectionHandler {
    framed: Framed<TcpStream, FrameCodec>,
    ctx: Arc<SessionContext>,
    client_addr: String,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        ctx: Arc<SessionContext>,
        client_addr: String,
        shutdown: CancellationToken,
    ) -> Self {
        ConnectionHandler {
            framed: Framed::new(stream, FrameCodec::new()),
            ctx,
            client_addr,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("Client connected: {}", self.client_addr);

        // Calls run concurrently; their replies come back through this channel
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Frame>();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Closing session {} on shutdown", self.client_addr);
                    break;
                }
                Some(reply) = reply_rx.recv() => {
                    if let Err(e) = self.framed.send(reply).await {
                        warn!("Failed to write reply to {}: {}", self.client_addr, e);
                        break;
                    }
                }
                incoming = self.framed.next() => match incoming {
                    Some(Ok(frame)) => {
                        if let Some(reply) = self.handle_frame(frame, &reply_tx) {
                            if let Err(e) = self.framed.send(reply).await {
                                warn!("Failed to write reply to {}: {}", self.client_addr, e);
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Protocol error from {}: {}", self.client_addr, e);
                        break;
                    }
                    None => {
                        info!("Client disconnected: {}", self.client_addr);
                        break;
                    }
                },
            }
        }
    }

    /// Handle one frame; returns an immediate reply when there is one
    fn handle_frame(&self, frame: Frame, reply_tx: &mpsc::UnboundedSender<Frame>) -> Option<Frame> {
        match frame {
            Frame::Call {
                id,
                target,
                method,
                args,
            } => {
                let ctx = self.ctx.clone();
                let reply_tx = reply_tx.clone();
                self.ctx.tasks.spawn(async move {
                    let outcome = ctx.dispatch(&target, &method, args).await;
                    let _ = reply_tx.send(Frame::Reply { id, outcome });
                });
                None
            }
            Frame::Register {
                id,
                name,
                object_id,
            } => {
                info!(
                    "Peer {} registered callback object {} as {}",
                    self.client_addr, object_id, name
                );
                let proxy = RemoteObject::new(object_id, self.ctx.callbacks.clone());
                self.ctx.registry.register(name, Arc::new(proxy));
                Some(Frame::ok(id, Value::Null))
            }
            Frame::Release { id, object_id } => {
                let released = self.ctx.objects.release(&object_id);
                Some(Frame::ok(id, Value::Bool(released)))
            }
            Frame::Reply { id, .. } => {
                warn!(
                    "Unexpected reply {} on main channel from {}",
                    id, self.client_addr
                );
                Some(Frame::err(id, "reply frames are not accepted on this channel"))
            }
        }
    }
}
