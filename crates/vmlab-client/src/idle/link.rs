//! Dashboard side of the dashboard/console message link.

use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;

use vmlab_protocol::context::{CONSOLE_SOURCE, ContextMessage, EndReason, MessageKind};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("console window for {0} is closed")]
    Closed(String),

    #[error("console window for {0} is not keeping up")]
    Full(String),

    #[error("malformed context message: {0}")]
    Malformed(String),

    #[error("rejected message from untrusted source {source_tag:?}")]
    Rejected { source_tag: String },

    #[error("no console window registered for {0}")]
    UnknownSession(String),

    #[error("unexpected {0:?} message from a console")]
    UnexpectedKind(MessageKind),
}

/// A console view the dashboard can post to.
pub trait ConsoleWindow: Send + Sync {
    fn post(&self, message: ContextMessage) -> Result<(), LinkError>;
}

/// Console window reached through a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelWindow {
    session_id: String,
    tx: mpsc::Sender<ContextMessage>,
}

impl ChannelWindow {
    pub fn new(session_id: impl Into<String>, tx: mpsc::Sender<ContextMessage>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
        }
    }
}

impl ConsoleWindow for ChannelWindow {
    fn post(&self, message: ContextMessage) -> Result<(), LinkError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Full(self.session_id.clone()),
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed(self.session_id.clone()),
        })
    }
}

/// A validated message from a console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Activity { session_id: String },
    Focus { session_id: String },
    Blur { session_id: String },
}

struct Entry {
    window: Weak<dyn ConsoleWindow>,
    acknowledged: bool,
    /// Focus handshakes sent since the console was last heard from.
    unanswered: u32,
}

/// Lookup-only registry of the console windows this dashboard opened.
///
/// The link holds weak references: whoever opened a window owns it, and a
/// dropped or closed window is pruned on the next send.
#[derive(Default)]
pub struct ContextLink {
    windows: HashMap<String, Entry>,
}

impl ContextLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a window. Replacing an existing one resets its handshake.
    pub fn register(&mut self, session_id: impl Into<String>, window: &Arc<dyn ConsoleWindow>) {
        let session_id = session_id.into();
        debug!("Registered console window for session {}", session_id);
        self.windows.insert(
            session_id,
            Entry {
                window: Arc::downgrade(window),
                acknowledged: false,
                unanswered: 0,
            },
        );
    }

    pub fn forget(&mut self, session_id: &str) {
        self.windows.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.windows.contains_key(session_id)
    }

    pub fn is_acknowledged(&self, session_id: &str) -> bool {
        self.windows
            .get(session_id)
            .is_some_and(|entry| entry.acknowledged)
    }

    /// Fire-and-forget to every window. Returns how many posts succeeded.
    pub fn broadcast(&mut self, kind: MessageKind, timestamp: i64, reason: Option<EndReason>) -> usize {
        let ids: Vec<String> = self.windows.keys().cloned().collect();
        ids.iter()
            .filter(|id| {
                let mut message = ContextMessage::from_dashboard(kind, id.as_str(), timestamp);
                message.reason = reason;
                self.send(id, message)
            })
            .count()
    }

    /// Handshake every window that has not acknowledged yet.
    pub fn handshake(&mut self, timestamp: i64) -> usize {
        let pending: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, entry)| !entry.acknowledged)
            .map(|(id, _)| id.clone())
            .collect();

        pending
            .iter()
            .filter(|id| {
                let message =
                    ContextMessage::from_dashboard(MessageKind::Handshake, id.as_str(), timestamp);
                self.send(id, message)
            })
            .count()
    }

    /// Handshake again with consoles that hold focus.
    ///
    /// Returns the sessions whose console is gone or left `max_unanswered`
    /// handshakes unanswered; their focus no longer counts. A silent console
    /// stays registered and goes back to the plain handshake.
    pub fn recheck_focused(
        &mut self,
        focused: &[String],
        timestamp: i64,
        max_unanswered: u32,
    ) -> Vec<String> {
        let mut lost = Vec::new();
        for session_id in focused {
            let Some(entry) = self.windows.get_mut(session_id) else {
                lost.push(session_id.clone());
                continue;
            };
            if entry.unanswered >= max_unanswered {
                warn!(
                    "Console for session {} stopped answering, releasing its focus",
                    session_id
                );
                entry.acknowledged = false;
                entry.unanswered = 0;
                lost.push(session_id.clone());
                continue;
            }
            entry.unanswered += 1;

            let message =
                ContextMessage::from_dashboard(MessageKind::Handshake, session_id.as_str(), timestamp);
            if !self.send(session_id, message) && !self.is_registered(session_id) {
                debug!("Focused console for session {} is gone", session_id);
                lost.push(session_id.clone());
            }
        }
        lost
    }

    fn send(&mut self, session_id: &str, message: ContextMessage) -> bool {
        let Some(entry) = self.windows.get(session_id) else {
            return false;
        };

        let result = match entry.window.upgrade() {
            Some(window) => window.post(message),
            None => Err(LinkError::Closed(session_id.to_string())),
        };

        match result {
            Ok(()) => true,
            Err(LinkError::Full(_)) => {
                debug!("Console window for {} is full, dropping message", session_id);
                false
            }
            Err(e) => {
                debug!("Pruning console window: {}", e);
                self.windows.remove(session_id);
                false
            }
        }
    }

    /// Validate a console message. Handshake acks are consumed here.
    pub fn accept(&mut self, message: ContextMessage) -> Result<Option<InboundEvent>, LinkError> {
        if message.source != CONSOLE_SOURCE {
            return Err(LinkError::Rejected {
                source_tag: message.source,
            });
        }

        let Some(entry) = self.windows.get_mut(&message.session_id) else {
            return Err(LinkError::UnknownSession(message.session_id));
        };

        entry.unanswered = 0;
        let session_id = message.session_id;
        match message.kind {
            MessageKind::HandshakeAck => {
                entry.acknowledged = true;
                debug!("Console for session {} acknowledged", session_id);
                Ok(None)
            }
            MessageKind::Activity => Ok(Some(InboundEvent::Activity { session_id })),
            MessageKind::Focus => Ok(Some(InboundEvent::Focus { session_id })),
            MessageKind::Blur => Ok(Some(InboundEvent::Blur { session_id })),
            kind @ (MessageKind::Handshake | MessageKind::Terminate) => {
                Err(LinkError::UnexpectedKind(kind))
            }
        }
    }

    /// Parse and validate a raw JSON message.
    pub fn accept_json(&mut self, raw: &str) -> Result<Option<InboundEvent>, LinkError> {
        let message: ContextMessage =
            serde_json::from_str(raw).map_err(|e| LinkError::Malformed(e.to_string()))?;
        self.accept(message)
    }

    /// Drop windows for sessions that no longer exist.
    pub fn retain_sessions(&mut self, live: &HashSet<String>) {
        let before = self.windows.len();
        self.windows.retain(|id, _| live.contains(id));
        let dropped = before - self.windows.len();
        if dropped > 0 {
            warn!("Dropped {} console window(s) for ended sessions", dropped);
        }
    }
}
