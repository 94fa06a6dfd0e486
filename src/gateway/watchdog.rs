//! Watchdog Monitor
//!
//! Keeps the gateway alive only while the peer process is alive.
//!
//! ```text
//! WaitingForRegistration ──found──► Polling ──ping true──┐
//!        │                             │  ▲───────────────┘
//!        │ timeout                     │ false / error / timeout
//!        ▼                             ▼
//! Terminated(NoWatchdogRegistered)  Terminated(PeerDead)
//! ```
//!
//! Cancelling the shutdown token in either state ends in
//! `Terminated(Shutdown)`.
//!
//! The peer may register before its callback connection is up. A ping that
//! finds no callback connection ever opened counts as not ready rather than
//! dead, until the registration deadline passes.

use super::object::{Args, CallError};
use super::registry::ObjectRegistry;
use crate::config::WatchdogConfig;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the liveness session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The peer never registered its watchdog
    NoWatchdogRegistered,
    /// A ping failed, returned false, or timed out
    PeerDead,
    /// The local process asked to stop
    Shutdown,
}

impl TerminationReason {
    /// Process exit status for this ending
    pub fn exit_code(self) -> i32 {
        match self {
            TerminationReason::NoWatchdogRegistered | TerminationReason::PeerDead => 1,
            TerminationReason::Shutdown => 0,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::NoWatchdogRegistered => write!(f, "no watchdog registered"),
            TerminationReason::PeerDead => write!(f, "peer dead"),
            TerminationReason::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

/// Result of one ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ping {
    Alive,
    Dead,
    /// Registered, but the callback connection has never been opened
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    WaitingForRegistration,
    Polling,
    Terminated(TerminationReason),
}

pub struct WatchdogMonitor {
    registry: Arc<ObjectRegistry>,
    config: WatchdogConfig,
    state: watch::Sender<LivenessState>,
    pings: AtomicU64,
}

impl WatchdogMonitor {
    pub fn new(registry: Arc<ObjectRegistry>, config: WatchdogConfig) -> Self {
        debug_assert!(!config.check_interval.is_zero());
        let (state, _) = watch::channel(LivenessState::WaitingForRegistration);
        WatchdogMonitor {
            registry,
            config,
            state,
            pings: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LivenessState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LivenessState {
        *self.state.borrow()
    }

    /// Pings issued so far
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    /// Drive the session until it terminates
    pub async fn run(&self, shutdown: CancellationToken) -> TerminationReason {
        let deadline = Instant::now() + self.config.registration_timeout;
        let reason = match self.wait_for_registration(&shutdown, deadline).await {
            Some(reason) => reason,
            None => {
                self.set_state(LivenessState::Polling);
                self.poll(&shutdown, deadline).await
            }
        };

        match reason {
            TerminationReason::Shutdown => info!("Watchdog stopped: {}", reason),
            _ => error!("Watchdog terminated: {}", reason),
        }
        self.set_state(LivenessState::Terminated(reason));
        reason
    }

    /// Returns `None` once the watchdog is registered
    async fn wait_for_registration(
        &self,
        shutdown: &CancellationToken,
        deadline: Instant,
    ) -> Option<TerminationReason> {
        let mut tick = interval(self.config.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Waiting up to {:?} for peer to register {}",
            self.config.registration_timeout, self.config.key
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Some(TerminationReason::Shutdown),
                _ = tick.tick() => {}
            }

            if self.registry.contains(&self.config.key) {
                info!("Peer registered {}, polling every {:?}", self.config.key, self.config.check_interval);
                return None;
            }
            if Instant::now() >= deadline {
                warn!(
                    "No {} registered within {:?}",
                    self.config.key, self.config.registration_timeout
                );
                return Some(TerminationReason::NoWatchdogRegistered);
            }
        }
    }

    /// `deadline` still bounds pings that find the peer not ready
    async fn poll(&self, shutdown: &CancellationToken, deadline: Instant) -> TerminationReason {
        let mut tick = interval(self.config.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return TerminationReason::Shutdown,
                _ = tick.tick() => {}
            }

            let ping = tokio::select! {
                _ = shutdown.cancelled() => return TerminationReason::Shutdown,
                ping = self.ping() => ping,
            };
            match ping {
                Ping::Alive => {}
                Ping::Dead => return TerminationReason::PeerDead,
                Ping::NotReady if Instant::now() >= deadline => {
                    warn!(
                        "{} registered but its callback connection never opened within {:?}",
                        self.config.key, self.config.registration_timeout
                    );
                    return TerminationReason::NoWatchdogRegistered;
                }
                Ping::NotReady => {}
            }
        }
    }

    /// One ping; anything but `true` counts as dead, except a
    /// callback connection that was never opened
    async fn ping(&self) -> Ping {
        let n = self.pings.fetch_add(1, Ordering::Relaxed) + 1;

        // Looked up every time so a re-registered watchdog is picked up
        let Some(watchdog) = self.registry.lookup(&self.config.key) else {
            warn!("{} disappeared from the registry", self.config.key);
            return Ping::Dead;
        };

        let result =
            tokio::time::timeout(self.config.ping_timeout, watchdog.invoke("ping", Args::default()))
                .await;

        match result {
            Ok(Ok(returned)) => match returned.into_value() {
                Ok(Value::Bool(true)) => {
                    debug!("Ping {} ok", n);
                    Ping::Alive
                }
                Ok(other) => {
                    warn!("Ping {} returned {}", n, other);
                    Ping::Dead
                }
                Err(e) => {
                    warn!("Ping {} failed: {}", n, e);
                    Ping::Dead
                }
            },
            Ok(Err(CallError::NotConnected)) => {
                debug!("Ping {}: callback connection not open yet", n);
                Ping::NotReady
            }
            Ok(Err(e)) => {
                warn!("Ping {} failed: {}", n, e);
                Ping::Dead
            }
            Err(_) => {
                warn!("Ping {} timed out after {:?}", n, self.config.ping_timeout);
                Ping::Dead
            }
        }
    }

    fn set_state(&self, state: LivenessState) {
        debug!("Liveness state -> {:?}", state);
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::object::{CallError, CallResult, GatewayObject, Returned};
    use crate::gateway::registry::WATCHDOG_KEY;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Answers pings from a fixed script, then keeps answering the last entry
    struct ScriptedWatchdog {
        script: Vec<Result<bool, CallError>>,
        calls: AtomicU64,
        seen_states: Mutex<Vec<LivenessState>>,
        state: Option<watch::Receiver<LivenessState>>,
    }

    impl ScriptedWatchdog {
        fn new(script: Vec<Result<bool, CallError>>) -> Self {
            ScriptedWatchdog {
                script,
                calls: AtomicU64::new(0),
                seen_states: Mutex::new(Vec::new()),
                state: None,
            }
        }
    }

    impl GatewayObject for ScriptedWatchdog {
        fn invoke<'a>(&'a self, method: &'a str, _args: Args) -> BoxFuture<'a, CallResult> {
            Box::pin(async move {
                assert_eq!(method, "ping");
                if let Some(rx) = &self.state {
                    self.seen_states.lock().push(*rx.borrow());
                }
                let i = self.calls.fetch_add(1, Ordering::Relaxed) as usize;
                let step = self.script[i.min(self.script.len() - 1)].clone();
                step.map(|alive| Returned::Value(json!(alive)))
            })
        }
    }

    struct Silent;

    impl GatewayObject for Silent {
        fn invoke<'a>(&'a self, _method: &'a str, _args: Args) -> BoxFuture<'a, CallResult> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test]
    async fn test_registration_timeout_never_polls() {
        let registry = Arc::new(ObjectRegistry::new());
        let monitor = WatchdogMonitor::new(registry, WatchdogConfig::test());
        let mut states = monitor.subscribe();

        let observer = tokio::spawn(async move {
            let mut seen = vec![*states.borrow()];
            while states.changed().await.is_ok() {
                seen.push(*states.borrow());
            }
            seen
        });

        let reason = monitor.run(CancellationToken::new()).await;
        assert_eq!(reason, TerminationReason::NoWatchdogRegistered);
        assert_eq!(reason.exit_code(), 1);
        assert_eq!(monitor.pings(), 0);
        assert_eq!(
            monitor.state(),
            LivenessState::Terminated(TerminationReason::NoWatchdogRegistered)
        );

        drop(monitor);
        let seen = observer.await.unwrap();
        assert!(!seen.contains(&LivenessState::Polling));
    }

    #[tokio::test]
    async fn test_false_ping_terminates_on_fourth_poll() {
        let registry = Arc::new(ObjectRegistry::new());
        let monitor = WatchdogMonitor::new(registry.clone(), WatchdogConfig::test());

        let mut watchdog = ScriptedWatchdog::new(vec![Ok(true), Ok(true), Ok(true), Ok(false)]);
        watchdog.state = Some(monitor.subscribe());
        let watchdog = Arc::new(watchdog);
        registry.register(WATCHDOG_KEY, watchdog.clone());

        let reason = monitor.run(CancellationToken::new()).await;
        assert_eq!(reason, TerminationReason::PeerDead);
        assert_eq!(monitor.pings(), 4);
        assert_eq!(watchdog.calls.load(Ordering::Relaxed), 4);

        // Every ping, the failing one included, happened while Polling
        let seen = watchdog.seen_states.lock().clone();
        assert_eq!(seen, vec![LivenessState::Polling; 4]);
    }

    #[tokio::test]
    async fn test_ping_error_is_peer_dead() {
        let registry = Arc::new(ObjectRegistry::new());
        registry.register(
            WATCHDOG_KEY,
            Arc::new(ScriptedWatchdog::new(vec![Err(CallError::PeerDisconnected)])),
        );
        let monitor = WatchdogMonitor::new(registry, WatchdogConfig::test());

        assert_eq!(
            monitor.run(CancellationToken::new()).await,
            TerminationReason::PeerDead
        );
        assert_eq!(monitor.pings(), 1);
    }

    #[tokio::test]
    async fn test_unopened_callback_connection_is_not_dead() {
        let registry = Arc::new(ObjectRegistry::new());
        let mut config = WatchdogConfig::test();
        config.registration_timeout = Duration::from_secs(5);
        registry.register(
            WATCHDOG_KEY,
            Arc::new(ScriptedWatchdog::new(vec![
                Err(CallError::NotConnected),
                Err(CallError::NotConnected),
                Ok(true),
                Ok(false),
            ])),
        );
        let monitor = WatchdogMonitor::new(registry, config);

        assert_eq!(
            monitor.run(CancellationToken::new()).await,
            TerminationReason::PeerDead
        );
        assert_eq!(monitor.pings(), 4);
    }

    #[tokio::test]
    async fn test_callback_connection_never_opened_times_out() {
        let registry = Arc::new(ObjectRegistry::new());
        registry.register(
            WATCHDOG_KEY,
            Arc::new(ScriptedWatchdog::new(vec![Err(CallError::NotConnected)])),
        );
        let monitor = WatchdogMonitor::new(registry, WatchdogConfig::test());

        let reason = monitor.run(CancellationToken::new()).await;
        assert_eq!(reason, TerminationReason::NoWatchdogRegistered);
        assert!(monitor.pings() > 1);
    }

    #[tokio::test]
    async fn test_ping_timeout_is_peer_dead() {
        let registry = Arc::new(ObjectRegistry::new());
        registry.register(WATCHDOG_KEY, Arc::new(Silent));
        let mut config = WatchdogConfig::test();
        config.ping_timeout = Duration::from_millis(30);
        let monitor = WatchdogMonitor::new(registry, config);

        assert_eq!(
            monitor.run(CancellationToken::new()).await,
            TerminationReason::PeerDead
        );
    }

    #[tokio::test]
    async fn test_late_registration_is_picked_up() {
        let registry = Arc::new(ObjectRegistry::new());
        let mut config = WatchdogConfig::test();
        config.registration_timeout = Duration::from_secs(5);
        let monitor = WatchdogMonitor::new(registry.clone(), config);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.register(
                WATCHDOG_KEY,
                Arc::new(ScriptedWatchdog::new(vec![Ok(true), Ok(false)])),
            );
        });

        assert_eq!(
            monitor.run(CancellationToken::new()).await,
            TerminationReason::PeerDead
        );
        assert_eq!(monitor.pings(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_while_polling() {
        let registry = Arc::new(ObjectRegistry::new());
        registry.register(WATCHDOG_KEY, Arc::new(ScriptedWatchdog::new(vec![Ok(true)])));
        let monitor = Arc::new(WatchdogMonitor::new(registry, WatchdogConfig::test()));
        let shutdown = CancellationToken::new();

        let task = {
            let monitor = monitor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run(shutdown).await })
        };

        let mut states = monitor.subscribe();
        states
            .wait_for(|s| *s == LivenessState::Polling)
            .await
            .unwrap();
        shutdown.cancel();

        let reason = task.await.unwrap();
        assert_eq!(reason, TerminationReason::Shutdown);
        assert_eq!(reason.exit_code(), 0);
    }
}
