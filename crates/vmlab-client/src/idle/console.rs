//! Console side of the link: runs inside a detached console view.

use log::debug;
use tokio::sync::mpsc;

use vmlab_protocol::context::{ContextMessage, DASHBOARD_SOURCE, EndReason, MessageKind};

use super::monitor::{ActivityMonitor, InputSignal, MonitorEvent};

/// What the console view should do after a dashboard message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    Nothing,
    /// The dashboard ended the session; close the view.
    Close(EndReason),
}

/// Relays local interaction to the dashboard and obeys its directives.
pub struct ConsoleEndpoint {
    session_id: String,
    to_dashboard: mpsc::Sender<ContextMessage>,
    monitor: ActivityMonitor,
    terminated: Option<EndReason>,
}

impl ConsoleEndpoint {
    pub fn new(session_id: impl Into<String>, to_dashboard: mpsc::Sender<ContextMessage>) -> Self {
        Self {
            session_id: session_id.into(),
            to_dashboard,
            monitor: ActivityMonitor::new(),
            terminated: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn terminated(&self) -> Option<EndReason> {
        self.terminated
    }

    /// Feed a local input signal. Returns whether anything was sent.
    pub fn on_signal(&mut self, signal: InputSignal, at: i64) -> bool {
        if self.terminated.is_some() {
            return false;
        }
        let kind = match self.monitor.observe(signal, at) {
            Some(MonitorEvent::Activity(_)) => MessageKind::Activity,
            Some(MonitorEvent::Focus(_)) => MessageKind::Focus,
            Some(MonitorEvent::Blur(_)) => MessageKind::Blur,
            None => return false,
        };
        self.send(ContextMessage::from_console(kind, &self.session_id, at))
    }

    /// Handle a message from the dashboard.
    pub fn on_message(&mut self, message: ContextMessage, at: i64) -> ConsoleAction {
        if message.source != DASHBOARD_SOURCE || message.session_id != self.session_id {
            debug!(
                "Console {} ignoring message from {:?} for {}",
                self.session_id, message.source, message.session_id
            );
            return ConsoleAction::Nothing;
        }

        match message.kind {
            MessageKind::Handshake => {
                self.send(ContextMessage::from_console(
                    MessageKind::HandshakeAck,
                    &self.session_id,
                    at,
                ));
                ConsoleAction::Nothing
            }
            MessageKind::Terminate => {
                let reason = message.reason.unwrap_or(EndReason::UserEnd);
                self.terminated = Some(reason);
                ConsoleAction::Close(reason)
            }
            _ => ConsoleAction::Nothing,
        }
    }

    fn send(&self, message: ContextMessage) -> bool {
        match self.to_dashboard.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!("Console {} could not reach dashboard: {}", self.session_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlab_protocol::context::CONSOLE_SOURCE;

    #[test]
    fn test_signals_are_relayed() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut console = ConsoleEndpoint::new("s1", tx);

        assert!(console.on_signal(InputSignal::Focus, 1));
        assert!(console.on_signal(InputSignal::KeyPress, 2));

        let focus = rx.try_recv().unwrap();
        assert_eq!(focus.kind, MessageKind::Focus);
        assert_eq!(focus.source, CONSOLE_SOURCE);
        assert_eq!(rx.try_recv().unwrap().kind, MessageKind::Activity);
    }

    #[test]
    fn test_handshake_is_acknowledged() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut console = ConsoleEndpoint::new("s1", tx);

        let action = console.on_message(
            ContextMessage::from_dashboard(MessageKind::Handshake, "s1", 5),
            6,
        );
        assert_eq!(action, ConsoleAction::Nothing);
        let ack = rx.try_recv().unwrap();
        assert_eq!(ack.kind, MessageKind::HandshakeAck);
        assert_eq!(ack.timestamp, 6);
    }

    #[test]
    fn test_terminate_closes_and_silences() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut console = ConsoleEndpoint::new("s1", tx);

        let action = console.on_message(
            ContextMessage::terminate("s1", 1, EndReason::IdleTimeout),
            1,
        );
        assert_eq!(action, ConsoleAction::Close(EndReason::IdleTimeout));
        assert!(!console.on_signal(InputSignal::KeyPress, 2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_foreign_messages_ignored() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut console = ConsoleEndpoint::new("s1", tx);

        let spoofed = ContextMessage::new(MessageKind::Terminate, "s1", 1, "elsewhere");
        assert_eq!(console.on_message(spoofed, 1), ConsoleAction::Nothing);

        let other = ContextMessage::terminate("s2", 1, EndReason::UserEnd);
        assert_eq!(console.on_message(other, 1), ConsoleAction::Nothing);
        assert!(console.terminated().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_dashboard_is_swallowed() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut console = ConsoleEndpoint::new("s1", tx);
        assert!(!console.on_signal(InputSignal::PointerMove, 1));
    }
}
