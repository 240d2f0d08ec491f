//! Collaboration session lifecycle.
//!
//! ```text
//!   disconnected ──join/restore──▶ connecting ──link up──▶ connected
//!        ▲                             │  ▲                    │
//!        │                       fail  │  │ backoff            │ link lost
//!        │                             ▼  │                    ▼
//!        └──────── leave ─────────── error ◀─────────── disconnected
//! ```
//!
//! One driver task per connection attempt chain owns the signaling link and
//! its reconnect backoff. Every driver runs under a generation number; state
//! writes from a driver whose generation is no longer current (after
//! `leave()` or a re-`join()`) are dropped, so a discarded link can never
//! re-activate a task. The latest state is published as a
//! [`SessionSnapshot`] on a `watch` channel.

pub mod role;
pub mod signaling;
pub mod storage;

pub use role::{derive_role, Participant, Role};
pub use signaling::{SignalingConnector, SignalingEvent, SignalingLink, SignalingMessage, WebSocketConnector};
pub use storage::{FileSessionStore, MemorySessionStore, SessionStore};

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::{
    RECONNECT_MAX_RETRIES, RECONNECT_RETRY_DELAYS, SESSION_STORAGE_KEY, SIGNALING_CONNECT_TIMEOUT,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to the signaling service")]
    NotConnected,

    #[error("invalid signaling message: {0}")]
    Protocol(String),

    #[error("invalid signaling JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// States from which a visibility/online trigger may reconnect.
    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

/// Everything observers need to know about the session, published whole on
/// every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub address: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub task_id: Option<String>,
    pub participants: Vec<Participant>,
    pub role: Option<Role>,
    /// The caller also has its own direct connection to the data.
    pub has_local_connection: bool,
    /// Task ids currently exposed to remote participants.
    pub shared_tasks: BTreeSet<String>,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_owner(&self) -> bool {
        self.role.is_some_and(|r| r.is_owner())
    }

    pub fn is_read_only(&self) -> bool {
        self.role.is_some_and(|r| r.is_read_only())
    }

    /// Connected, bound to a task, and the session is the only path to the
    /// data. Gates the transfer layer.
    pub fn is_collab_mode(&self) -> bool {
        self.is_connected() && self.task_id.is_some() && !self.has_local_connection
    }

    fn rederive_role(&mut self) {
        self.role = self
            .user_id
            .as_deref()
            .and_then(|me| derive_role(&self.participants, me));
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Invitation address from the launch context; preferred over the
    /// persisted address on mount.
    pub invite: Option<String>,
    pub storage_key: String,
    pub connect_timeout: Duration,
    pub retry_delays: Vec<Duration>,
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invite: None,
            storage_key: SESSION_STORAGE_KEY.to_string(),
            connect_timeout: SIGNALING_CONNECT_TIMEOUT,
            retry_delays: RECONNECT_RETRY_DELAYS.iter().map(|s| Duration::from_secs(*s)).collect(),
            max_retries: RECONNECT_MAX_RETRIES,
        }
    }
}

impl SessionConfig {
    fn retry_delay(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.retry_delays.len().saturating_sub(1));
        self.retry_delays.get(idx).copied().unwrap_or(Duration::from_secs(1))
    }
}

struct Control {
    generation: u64,
    driver: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<Value>>,
    explicit_join: bool,
    intentional_leave: bool,
}

struct SessionInner {
    connector: Arc<dyn SignalingConnector>,
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    snapshot: watch::Sender<SessionSnapshot>,
    relay: broadcast::Sender<Value>,
    control: Mutex<Control>,
}

impl SessionInner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(ctl: &Control, generation: u64) -> bool {
        ctl.generation == generation && !ctl.intentional_leave
    }

    /// Apply `f` only if `generation` is still the live driver.
    fn update(&self, generation: u64, f: impl FnOnce(&mut SessionSnapshot)) -> bool {
        let ctl = self.control();
        if !Self::is_current(&ctl, generation) {
            debug!(event = "stale_session_update_dropped", generation, current = ctl.generation);
            return false;
        }
        self.snapshot.send_modify(f);
        true
    }

    fn set_state(&self, generation: u64, state: ConnectionState, attempt: u32, last_error: Option<String>) {
        let applied = self.update(generation, |s| {
            s.state = state;
            s.reconnect_attempt = attempt;
            if last_error.is_some() {
                s.last_error = last_error.clone();
            }
        });
        if applied {
            info!(event = "session_state", ?state, attempt, error = last_error.as_deref());
        }
    }
}

/// Owner of the signaling link and the session state machine.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Build the manager and restore a session if the context names one:
    /// the configured invite first, then the persisted address.
    /// Must be called inside a Tokio runtime.
    pub fn mount(
        connector: Arc<dyn SignalingConnector>,
        store: Arc<dyn SessionStore>,
        config: SessionConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (relay, _) = broadcast::channel(64);
        let mgr = Self {
            inner: Arc::new(SessionInner {
                connector,
                store,
                config,
                snapshot,
                relay,
                control: Mutex::new(Control {
                    generation: 0,
                    driver: None,
                    outbound: None,
                    explicit_join: false,
                    intentional_leave: false,
                }),
            }),
        };
        mgr.restore();
        mgr
    }

    fn restore(&self) {
        {
            let ctl = self.inner.control();
            if ctl.explicit_join || ctl.intentional_leave {
                return;
            }
        }
        if let Some(invite) = self.inner.config.invite.clone() {
            info!(event = "session_restore", source = "invite", address = %invite);
            self.persist(&invite);
            self.start(invite);
            return;
        }
        match self.inner.store.get(&self.inner.config.storage_key) {
            Some(address) => {
                info!(event = "session_restore", source = "storage", %address);
                self.start(address);
            }
            None => debug!(event = "session_restore_none"),
        }
    }

    /// Connect to `address` and remember it for the next mount. Joining the
    /// address the session is already on (or connecting to) is a no-op.
    pub fn join(&self, address: impl Into<String>) {
        let address = address.into();
        let already = {
            let mut ctl = self.inner.control();
            ctl.explicit_join = true;
            let was_leaving = std::mem::replace(&mut ctl.intentional_leave, false);
            let driver_live = ctl.driver.as_ref().is_some_and(|d| !d.is_finished());
            let snap = self.inner.snapshot.borrow();
            let same = snap.address.as_deref() == Some(address.as_str()) && !snap.state.is_idle();
            !was_leaving && driver_live && same
        };
        self.persist(&address);
        if already {
            debug!(event = "session_join_noop", %address);
            return;
        }
        info!(event = "session_join", %address);
        self.start(address);
    }

    /// Disconnect, forget the persisted address, and clear shared tasks.
    /// Late events from the discarded link are ignored.
    pub fn leave(&self) {
        {
            let mut ctl = self.inner.control();
            ctl.intentional_leave = true;
            ctl.explicit_join = false;
            ctl.generation += 1;
            ctl.outbound = None;
            if let Some(driver) = ctl.driver.take() {
                driver.abort();
            }
        }
        if let Err(e) = self.inner.store.remove(&self.inner.config.storage_key) {
            error!(event = "session_store_failure", op = "remove", error = %e);
        }
        self.inner.snapshot.send_modify(|s| {
            *s = SessionSnapshot {
                has_local_connection: s.has_local_connection,
                ..SessionSnapshot::default()
            };
        });
        info!(event = "session_leave");
    }

    /// The app became visible again.
    pub fn notify_visible(&self) -> bool {
        self.reconnect_if_idle("visible")
    }

    /// The network came back.
    pub fn notify_online(&self) -> bool {
        self.reconnect_if_idle("online")
    }

    fn reconnect_if_idle(&self, trigger: &'static str) -> bool {
        let address = {
            let ctl = self.inner.control();
            let snap = self.inner.snapshot.borrow();
            if ctl.intentional_leave || !snap.state.is_idle() {
                return false;
            }
            match snap.address.clone() {
                Some(address) => address,
                None => return false,
            }
        };
        info!(event = "session_reconnect_trigger", trigger, %address);
        self.start(address);
        true
    }

    /// Declare whether the caller has its own direct connection.
    pub fn set_local_connection(&self, has_local: bool) {
        self.inner
            .snapshot
            .send_if_modified(|s| std::mem::replace(&mut s.has_local_connection, has_local) != has_local);
    }

    /// Mark a task as exposed to remote participants. Returns false if it
    /// already was.
    pub fn share_task(&self, task_id: impl Into<String>) -> bool {
        let task_id = task_id.into();
        self.inner.snapshot.send_if_modified(|s| s.shared_tasks.insert(task_id))
    }

    pub fn unshare_task(&self, task_id: &str) -> bool {
        self.inner.snapshot.send_if_modified(|s| s.shared_tasks.remove(task_id))
    }

    /// Send an opaque relay payload over the live signaling link.
    pub fn relay(&self, message: Value) -> Result<(), SessionError> {
        if !self.inner.snapshot.borrow().is_connected() {
            return Err(SessionError::NotConnected);
        }
        let ctl = self.inner.control();
        let outbound = ctl.outbound.as_ref().ok_or(SessionError::NotConnected)?;
        outbound.send(message).map_err(|_| SessionError::NotConnected)
    }

    /// Relay payloads received from the signaling service.
    pub fn relay_messages(&self) -> broadcast::Receiver<Value> {
        self.inner.relay.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    fn persist(&self, address: &str) {
        if let Err(e) = self.inner.store.set(&self.inner.config.storage_key, address) {
            error!(event = "session_store_failure", op = "set", error = %e);
        }
    }

    /// Replace any running driver with a fresh one for `address`.
    fn start(&self, address: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ctl = self.inner.control();
        ctl.generation += 1;
        let generation = ctl.generation;
        if let Some(old) = ctl.driver.take() {
            old.abort();
        }
        ctl.outbound = Some(tx);
        self.inner.snapshot.send_modify(|s| {
            if s.address.as_deref() != Some(address.as_str()) {
                s.task_id = None;
                s.participants.clear();
                s.role = None;
            }
            s.address = Some(address.clone());
            s.state = ConnectionState::Connecting;
            s.reconnect_attempt = 0;
            s.last_error = None;
        });
        let inner = self.inner.clone();
        ctl.driver = Some(tokio::spawn(drive(inner, generation, address, rx)));
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let mut ctl = self.inner.control();
        ctl.generation += 1;
        if let Some(driver) = ctl.driver.take() {
            driver.abort();
        }
    }
}

/// How one link ended.
enum LinkEnd {
    Closed,
    Failed(String),
    Abandoned,
}

async fn drive(
    inner: Arc<SessionInner>,
    generation: u64,
    address: String,
    mut outbound: mpsc::UnboundedReceiver<Value>,
) {
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            inner.set_state(generation, ConnectionState::Connecting, attempt, None);
        }
        let connected = tokio::time::timeout(
            inner.config.connect_timeout,
            inner.connector.connect(&address),
        )
        .await;
        let reason = match connected {
            Ok(Ok(link)) => {
                attempt = 0;
                inner.set_state(generation, ConnectionState::Connected, 0, None);
                match pump(&inner, generation, link, &mut outbound).await {
                    LinkEnd::Abandoned => return,
                    LinkEnd::Closed => {
                        inner.set_state(generation, ConnectionState::Disconnected, 0, None);
                        None
                    }
                    LinkEnd::Failed(e) => Some(e),
                }
            }
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!(
                "signaling connect timed out after {:?}",
                inner.config.connect_timeout
            )),
        };
        if let Some(reason) = reason {
            warn!(event = "signaling_link_error", %address, attempt, error = %reason);
            inner.set_state(generation, ConnectionState::Error, attempt, Some(reason));
        }

        if attempt >= inner.config.max_retries {
            warn!(event = "session_reconnect_exhausted", %address, attempts = attempt);
            return;
        }
        let delay = inner.config.retry_delay(attempt);
        attempt += 1;
        debug!(event = "session_reconnect_scheduled", attempt, delay_ms = delay.as_millis() as u64);
        tokio::time::sleep(delay).await;
    }
}

async fn pump(
    inner: &SessionInner,
    generation: u64,
    mut link: Box<dyn SignalingLink>,
    outbound: &mut mpsc::UnboundedReceiver<Value>,
) -> LinkEnd {
    loop {
        tokio::select! {
            inbound = link.recv() => match inbound {
                None => return LinkEnd::Closed,
                Some(Err(e)) => match e.downcast_ref::<SessionError>() {
                    Some(decode) => {
                        debug!(event = "signaling_frame_ignored", error = %decode);
                    }
                    None => return LinkEnd::Failed(format!("{e:#}")),
                },
                Some(Ok(message)) => {
                    if !apply(inner, generation, message) {
                        link.close().await;
                        return LinkEnd::Abandoned;
                    }
                }
            },
            out = outbound.recv() => match out {
                Some(message) => {
                    if let Err(e) = link.send(message).await {
                        return LinkEnd::Failed(format!("{e:#}"));
                    }
                }
                None => {
                    link.close().await;
                    return LinkEnd::Abandoned;
                }
            },
        }
    }
}

/// Fold one inbound message into the snapshot. Returns false once this
/// driver's generation is stale.
fn apply(inner: &SessionInner, generation: u64, message: SignalingMessage) -> bool {
    match message {
        SignalingMessage::Event(SignalingEvent::Authenticated {
            user_id,
            username,
            task_id,
        }) => {
            let applied = inner.update(generation, |s| {
                s.user_id = Some(user_id.clone());
                s.username = Some(username.clone());
                s.task_id = task_id.clone();
                s.rederive_role();
            });
            if applied {
                info!(event = "session_authenticated", %user_id, %username, task_id = task_id.as_deref());
            }
            applied
        }
        SignalingMessage::Event(SignalingEvent::ParticipantsList { participants }) => {
            let count = participants.len();
            let applied = inner.update(generation, |s| {
                s.participants = participants;
                s.rederive_role();
            });
            if applied {
                debug!(event = "session_roster", participants = count);
            }
            applied
        }
        SignalingMessage::Event(SignalingEvent::ParticipantJoined { participant }) => {
            debug!(event = "participant_joined", user_id = %participant.user_id);
            inner.update(generation, |s| {
                role::upsert(&mut s.participants, participant);
                s.rederive_role();
            })
        }
        SignalingMessage::Event(SignalingEvent::ParticipantLeft { user_id }) => {
            debug!(event = "participant_left", %user_id);
            inner.update(generation, |s| {
                s.participants.retain(|p| p.user_id != user_id);
                s.rederive_role();
            })
        }
        SignalingMessage::Event(SignalingEvent::Error { message, code }) => {
            let text = message.unwrap_or_else(|| "signaling error".to_string());
            warn!(event = "signaling_error_message", code = code.as_deref(), error = %text);
            inner.update(generation, |s| s.last_error = Some(text))
        }
        SignalingMessage::Relay(value) => {
            if !SessionInner::is_current(&inner.control(), generation) {
                return false;
            }
            // No subscribers is fine; relays are fire and forget.
            let _ = inner.relay.send(value);
            true
        }
    }
}
