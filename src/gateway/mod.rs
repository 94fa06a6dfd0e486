//! Cross-process gateway
//!
//! Exposes a root object to a peer process over TCP and stays alive only as
//! long as that peer does.
//!
//! ```text
//! port ──► server (listener + callback listener)
//!             │
//!             ├──► handshake::publish (ports → file)
//!             │
//!             ├──► connection (peer calls → entry point)
//!             └──► callback   (gateway calls → peer objects)
//!                       ▲
//!                watchdog (polls "Watchdog".ping)
//! ```

pub mod callback;
pub mod codec;
mod connection;
pub mod handshake;
pub mod object;
pub mod peer;
pub mod port;
pub mod registry;
pub mod server;
pub mod watchdog;

pub use callback::{CallbackClient, RemoteObject};
pub use codec::{Frame, FrameCodec, FrameError, Outcome, ENTRY_POINT_ID, MAX_FRAME_SIZE};
pub use handshake::{HandshakeError, HandshakeRecord, HANDSHAKE_PATH_ENV};
pub use object::{Args, CallError, CallResult, GatewayObject, Returned};
pub use peer::{CallbackServer, LivenessProbe, PeerClient, PeerError};
pub use port::{acquire_free_port, acquire_free_port_on, PortError, PORT_ACQUIRE_ATTEMPTS_MAX};
pub use registry::{ObjectRegistry, ObjectTable, WATCHDOG_KEY};
pub use server::{GatewayError, GatewayHandle, GatewayServer, ListeningEndpoint};
pub use watchdog::{LivenessState, TerminationReason, WatchdogMonitor};
