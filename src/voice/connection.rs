//! Per-client voice sessions and their state machine
//!
//! Every connected kiosk has one [`VoiceSession`]. All state changes and all
//! outbound traffic go through [`VoiceConnectionManager`], which serializes
//! access to the registry. The lock is never held across an `.await`:
//! senders are cloned out first, then awaited.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::ServerMessage;

/// A client that does not drain its queue within this window is treated as gone
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound message channel for one client
pub type ClientSender = mpsc::Sender<ServerMessage>;

/// Conversation state of one client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// Waiting for a wake word
    #[default]
    Idle,
    /// Streaming microphone audio to STT
    Listening,
    /// Generating a response
    Processing,
    /// Assistant audio is playing
    Speaking,
}

impl VoiceState {
    /// Lowercase wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connected client
#[derive(Debug)]
pub struct VoiceSession {
    /// Client identifier
    pub client_id: String,
    /// Distinguishes reconnects that reuse a client ID
    pub connection_id: Uuid,
    sender: ClientSender,
    /// Current conversation state
    pub state: VoiceState,
    /// When the client connected
    pub created_at: DateTime<Utc>,
    /// Last inbound message or state change
    pub last_activity: DateTime<Utc>,
    /// Live STT session, once connected
    pub stt_session: Option<Uuid>,
    /// An STT connection is being established
    pub stt_pending: bool,
}

/// Serializable view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub state: VoiceState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub stt_active: bool,
    pub stt_pending: bool,
}

/// Registry of connected voice clients
#[derive(Debug, Default)]
pub struct VoiceConnectionManager {
    sessions: Mutex<HashMap<String, VoiceSession>>,
}

impl VoiceConnectionManager {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, VoiceSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a client in `IDLE`, replacing any previous session with the same ID
    ///
    /// Returns the ID of this connection.
    pub fn connect(&self, client_id: &str, sender: ClientSender) -> Uuid {
        let now = Utc::now();
        let connection_id = Uuid::new_v4();
        let session = VoiceSession {
            client_id: client_id.to_string(),
            connection_id,
            sender,
            state: VoiceState::Idle,
            created_at: now,
            last_activity: now,
            stt_session: None,
            stt_pending: false,
        };

        let replaced = self.sessions().insert(client_id.to_string(), session);
        if replaced.is_some() {
            tracing::warn!(client_id, "replaced existing voice session");
        }
        tracing::info!(client_id, clients = self.len(), "voice client connected");
        connection_id
    }

    /// Remove a client; absent clients are ignored
    pub fn disconnect(&self, client_id: &str) -> Option<VoiceSession> {
        let removed = self.sessions().remove(client_id);
        if removed.is_some() {
            tracing::info!(client_id, clients = self.len(), "voice client disconnected");
        }
        removed
    }

    /// Remove a client only if it is still the given connection
    pub fn disconnect_connection(&self, client_id: &str, connection_id: Uuid) -> Option<VoiceSession> {
        let removed = {
            let mut sessions = self.sessions();
            let current = sessions
                .get(client_id)
                .is_some_and(|s| s.connection_id == connection_id);
            if current { sessions.remove(client_id) } else { None }
        };
        if removed.is_some() {
            tracing::info!(client_id, clients = self.len(), "voice client disconnected");
        }
        removed
    }

    /// Current connection ID of a client
    #[must_use]
    pub fn connection_id(&self, client_id: &str) -> Option<Uuid> {
        self.sessions().get(client_id).map(|s| s.connection_id)
    }

    /// Current state of a client
    #[must_use]
    pub fn state(&self, client_id: &str) -> Option<VoiceState> {
        self.sessions().get(client_id).map(|s| s.state)
    }

    /// Record activity without changing state
    pub fn touch(&self, client_id: &str) {
        if let Some(session) = self.sessions().get_mut(client_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Whether a client is connected
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions().contains_key(client_id)
    }

    /// Number of connected clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Whether no clients are connected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// IDs of all connected clients
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    /// Snapshot of every session, sorted by client ID
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshot: Vec<SessionSnapshot> = self
            .sessions()
            .values()
            .map(|s| SessionSnapshot {
                client_id: s.client_id.clone(),
                state: s.state,
                created_at: s.created_at,
                last_activity: s.last_activity,
                stt_active: s.stt_session.is_some(),
                stt_pending: s.stt_pending,
            })
            .collect();
        snapshot.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        snapshot
    }

    /// Whether any client is currently in `state`
    #[must_use]
    pub fn any_in_state(&self, state: VoiceState) -> bool {
        self.sessions().values().any(|s| s.state == state)
    }

    /// Set one client's state and notify it, or everyone when `broadcast` is set
    ///
    /// Returns false if the client is not connected.
    pub async fn update_state(&self, client_id: &str, state: VoiceState, broadcast: bool) -> bool {
        let previous = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(client_id) else {
                return false;
            };
            let previous = session.state;
            session.state = state;
            session.last_activity = Utc::now();
            previous
        };

        tracing::debug!(client_id, from = %previous, to = %state, "voice state change");

        if broadcast {
            let mut extra = serde_json::Map::new();
            extra.insert("client_id".to_string(), client_id.into());
            self.broadcast(ServerMessage::State { state, extra }).await;
        } else {
            self.send_to(client_id, ServerMessage::state(state)).await;
        }
        true
    }

    /// Move a client from `from` to `to` only if it is currently in `from`
    ///
    /// The check and the change happen under one lock, so concurrent callers
    /// cannot both succeed. The client is notified on success.
    pub async fn transition(&self, client_id: &str, from: VoiceState, to: VoiceState) -> bool {
        {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(client_id) else {
                return false;
            };
            if session.state != from {
                return false;
            }
            session.state = to;
            session.last_activity = Utc::now();
        }

        tracing::debug!(client_id, from = %from, to = %to, "voice state change");
        self.send_to(client_id, ServerMessage::state(to)).await;
        true
    }

    /// Force every client into `state` and broadcast the change once
    pub async fn set_all_states(
        &self,
        state: VoiceState,
        extra: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        {
            let now = Utc::now();
            for session in self.sessions().values_mut() {
                session.state = state;
                session.last_activity = now;
            }
        }

        tracing::debug!(to = %state, "voice state change for all clients");
        self.broadcast(ServerMessage::State {
            state,
            extra: extra.unwrap_or_default(),
        })
        .await;
    }

    /// Move every client in `from` (except `except`) to `to`, notifying each
    ///
    /// Returns the IDs of the clients that changed.
    pub async fn replace_state(
        &self,
        from: VoiceState,
        to: VoiceState,
        except: Option<&str>,
    ) -> Vec<String> {
        let changed: Vec<String> = {
            let now = Utc::now();
            self.sessions()
                .values_mut()
                .filter(|s| s.state == from && Some(s.client_id.as_str()) != except)
                .map(|s| {
                    s.state = to;
                    s.last_activity = now;
                    s.client_id.clone()
                })
                .collect()
        };

        for client_id in &changed {
            self.send_to(client_id, ServerMessage::state(to)).await;
        }
        changed
    }

    /// Send a message to every client
    ///
    /// Clients whose channel is closed or stalled are disconnected; the rest
    /// still receive the message. Returns the number of successful deliveries.
    pub async fn broadcast(&self, message: ServerMessage) -> usize {
        let targets: Vec<(String, Uuid, ClientSender)> = self
            .sessions()
            .values()
            .map(|s| (s.client_id.clone(), s.connection_id, s.sender.clone()))
            .collect();

        let mut delivered = 0;
        for (client_id, connection_id, sender) in targets {
            if deliver(&sender, message.clone()).await {
                delivered += 1;
            } else {
                tracing::warn!(client_id = %client_id, kind = message.kind(), "broadcast failed, dropping client");
                self.disconnect_connection(&client_id, connection_id);
            }
        }
        delivered
    }

    /// Send a message to one client, disconnecting it on failure
    pub async fn send_to(&self, client_id: &str, message: ServerMessage) -> bool {
        let Some((connection_id, sender)) = self
            .sessions()
            .get(client_id)
            .map(|s| (s.connection_id, s.sender.clone()))
        else {
            return false;
        };

        let kind = message.kind();
        if deliver(&sender, message).await {
            true
        } else {
            tracing::warn!(client_id, kind, "send failed, dropping client");
            self.disconnect_connection(client_id, connection_id);
            false
        }
    }

    /// Flag that an STT connection is being established (or no longer is)
    pub fn mark_stt_pending(&self, client_id: &str, pending: bool) {
        if let Some(session) = self.sessions().get_mut(client_id) {
            session.stt_pending = pending;
        }
    }

    /// Record a connected STT session
    pub fn attach_stt(&self, client_id: &str, session_id: Uuid) {
        if let Some(session) = self.sessions().get_mut(client_id) {
            session.stt_session = Some(session_id);
            session.stt_pending = false;
        }
    }

    /// Forget an STT session if it is still the current one
    pub fn detach_stt(&self, client_id: &str, session_id: Uuid) {
        if let Some(session) = self
            .sessions()
            .get_mut(client_id)
            .filter(|s| s.stt_session == Some(session_id))
        {
            session.stt_session = None;
        }
    }

    /// Current STT session of a client
    #[must_use]
    pub fn stt_session(&self, client_id: &str) -> Option<Uuid> {
        self.sessions().get(client_id).and_then(|s| s.stt_session)
    }
}

async fn deliver(sender: &ClientSender, message: ServerMessage) -> bool {
    sender.send_timeout(message, SEND_TIMEOUT).await.is_ok()
}
