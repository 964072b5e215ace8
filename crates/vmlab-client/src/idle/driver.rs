//! Async driver: owns the timers and performs the coordinator's effects.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use vmlab_protocol::SessionInfo;
use vmlab_protocol::context::{ContextMessage, EndReason};

use super::IdleConfig;
use super::coordinator::{Effect, IdleCoordinator, Wake};
use super::link::{ConsoleWindow, ContextLink, InboundEvent};
use super::monitor::{ActivityMonitor, InputSignal, MonitorEvent};
use super::store::ActivityStore;
use crate::api::SessionControl;
use crate::clock::Clock;

const COMMAND_BUFFER_SIZE: usize = 64;

/// Requests from the UI layer.
pub enum IdleCommand {
    /// Raw dashboard input, filtered through the local monitor.
    Input(InputSignal),
    /// Activity the UI has already qualified.
    RecordActivity,
    ConsoleOpened {
        session_id: String,
        /// Owned by the caller; the driver keeps a weak reference.
        window: Arc<dyn ConsoleWindow>,
    },
    Continue,
    EndNow,
    Shutdown,
}

/// What the dashboard should render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdleView {
    pub show_idle_prompt: bool,
    pub countdown_seconds: Option<u64>,
    pub session_ended: bool,
    pub end_reason: Option<EndReason>,
    /// User-facing explanation once the sessions are gone.
    pub message: Option<String>,
    /// Non-fatal problem, e.g. the server refused to stop a session.
    pub error: Option<String>,
    pub suspended: bool,
    pub sessions: Vec<SessionInfo>,
}

/// UI-facing handle to a running [`IdleDriver`].
pub struct IdleHandle {
    commands: mpsc::Sender<IdleCommand>,
    view: watch::Receiver<IdleView>,
    task: JoinHandle<()>,
}

impl IdleHandle {
    async fn send(&self, command: IdleCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Idle driver is gone, dropping command");
        }
    }

    pub async fn signal(&self, signal: InputSignal) {
        self.send(IdleCommand::Input(signal)).await;
    }

    pub async fn record_activity(&self) {
        self.send(IdleCommand::RecordActivity).await;
    }

    pub async fn on_console_opened(
        &self,
        session_id: impl Into<String>,
        window: Arc<dyn ConsoleWindow>,
    ) {
        self.send(IdleCommand::ConsoleOpened {
            session_id: session_id.into(),
            window,
        })
        .await;
    }

    pub async fn continue_session(&self) {
        self.send(IdleCommand::Continue).await;
    }

    pub async fn end_now(&self) {
        self.send(IdleCommand::EndNow).await;
    }

    /// Latest published view.
    pub fn view(&self) -> IdleView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IdleView> {
        self.view.clone()
    }

    pub async fn shutdown(self) {
        self.send(IdleCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Idle driver task failed: {}", e);
        }
    }
}

/// One dashboard's idle loop.
pub struct IdleDriver {
    config: IdleConfig,
    control: Arc<dyn SessionControl>,
    store: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
    coordinator: IdleCoordinator,
    monitor: ActivityMonitor,
    link: ContextLink,
    sessions: Vec<SessionInfo>,
    last_reported_at: Option<i64>,
    error: Option<String>,
    view_tx: watch::Sender<IdleView>,
}

impl IdleDriver {
    /// Start the loop. Console messages arrive on `inbound`.
    pub fn spawn(
        config: IdleConfig,
        control: Arc<dyn SessionControl>,
        store: Arc<dyn ActivityStore>,
        clock: Arc<dyn Clock>,
        inbound: mpsc::Receiver<ContextMessage>,
    ) -> IdleHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (view_tx, view_rx) = watch::channel(IdleView::default());

        let driver = Self {
            coordinator: IdleCoordinator::new(config.grace_period_ms()),
            config,
            control,
            store,
            clock,
            monitor: ActivityMonitor::new(),
            link: ContextLink::new(),
            sessions: Vec::new(),
            last_reported_at: None,
            error: None,
            view_tx,
        };
        let task = tokio::spawn(driver.run(commands_rx, inbound));

        IdleHandle {
            commands: commands_tx,
            view: view_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<IdleCommand>,
        mut inbound: mpsc::Receiver<ContextMessage>,
    ) {
        match self.store.load() {
            Ok(Some(record)) => self.coordinator.restore(&record),
            Ok(None) => {}
            Err(e) => warn!("Failed to load activity record: {:#}", e),
        }

        let clock = self.clock.clone();
        let mut refresh = tokio::time::interval(self.config.refresh_interval());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut handshake = tokio::time::interval(self.config.handshake_interval());
        handshake.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Idle driver started");
        loop {
            let wake = self.coordinator.next_wake(clock.now_ms());

            tokio::select! {
                command = commands.recv() => match command {
                    Some(IdleCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                Some(message) = inbound.recv() => self.handle_message(message).await,

                _ = refresh.tick() => self.refresh().await,

                _ = handshake.tick() => self.check_consoles().await,

                _ = sleep_until(clock.as_ref(), wake) => {
                    if let Some(wake) = wake {
                        let effects = self.coordinator.on_timer(wake.generation, clock.now_ms());
                        self.dispatch(effects).await;
                    }
                }
            }

            self.publish();
        }
        info!("Idle driver stopped");
    }

    async fn handle_command(&mut self, command: IdleCommand) {
        let now = self.clock.now_ms();
        let effects = match command {
            IdleCommand::Input(signal) => match self.monitor.observe(signal, now) {
                Some(MonitorEvent::Activity(ts)) | Some(MonitorEvent::Focus(ts)) => {
                    self.coordinator.record_activity(ts)
                }
                Some(MonitorEvent::Blur(_)) | None => Vec::new(),
            },
            IdleCommand::RecordActivity => self.coordinator.record_activity(now),
            IdleCommand::ConsoleOpened { session_id, window } => {
                self.link.register(session_id, &window);
                self.link.handshake(now);
                Vec::new()
            }
            IdleCommand::Continue => self.coordinator.continue_session(now),
            IdleCommand::EndNow => self.coordinator.end_now(EndReason::UserEnd, now),
            IdleCommand::Shutdown => Vec::new(),
        };
        self.dispatch(effects).await;
    }

    async fn handle_message(&mut self, message: ContextMessage) {
        // Console clocks are not trusted; events are stamped on arrival.
        let now = self.clock.now_ms();
        let effects = match self.link.accept(message) {
            Ok(Some(InboundEvent::Activity { session_id })) => {
                self.coordinator.on_console_activity(&session_id, now)
            }
            Ok(Some(InboundEvent::Focus { session_id })) => {
                self.coordinator.on_console_focus(&session_id, now)
            }
            Ok(Some(InboundEvent::Blur { session_id })) => {
                self.coordinator.on_console_blur(&session_id, now)
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!("Dropping console message: {}", e);
                Vec::new()
            }
        };
        self.dispatch(effects).await;
    }

    /// Handshake new consoles and make sure focused ones are still there.
    ///
    /// A console that closed while focused never sends its blur, so its
    /// focus is released here instead.
    async fn check_consoles(&mut self) {
        let now = self.clock.now_ms();
        self.link.handshake(now);

        let focused = self.coordinator.focused_sessions();
        if focused.is_empty() {
            return;
        }
        let lost = self
            .link
            .recheck_focused(&focused, now, self.config.focus_ack_limit);

        let mut effects = Vec::new();
        for session_id in lost {
            effects.extend(self.coordinator.on_console_blur(&session_id, now));
        }
        self.dispatch(effects).await;
    }

    async fn dispatch(&mut self, effects: Vec<Effect>) {
        if let Some((session_ids, reason)) = self.apply(effects) {
            self.terminate(session_ids, reason).await;
        }
    }

    /// Carry out everything except termination, which is handed back.
    fn apply(&mut self, effects: Vec<Effect>) -> Option<(Vec<String>, EndReason)> {
        let mut termination = None;
        for effect in effects {
            match effect {
                Effect::Broadcast {
                    kind,
                    timestamp,
                    reason,
                } => {
                    self.link.broadcast(kind, timestamp, reason);
                }
                Effect::ReportActivity(ts) => self.report_activity(ts),
                Effect::Persist(record) => {
                    if let Err(e) = self.store.save(&record) {
                        warn!("Failed to persist activity record: {:#}", e);
                    }
                }
                Effect::PromptOpened { countdown_ends_at } => {
                    debug!("Idle prompt open until {}", countdown_ends_at);
                    self.monitor.set_prompt_active(true);
                }
                Effect::PromptClosed => self.monitor.set_prompt_active(false),
                Effect::Terminate {
                    session_ids,
                    reason,
                } => termination = Some((session_ids, reason)),
            }
        }
        termination
    }

    fn report_activity(&mut self, ts: i64) {
        let interval = self.config.activity_report_interval_ms();
        if self
            .last_reported_at
            .is_some_and(|last| ts - last < interval)
        {
            return;
        }
        self.last_reported_at = Some(ts);

        let session_ids = self.coordinator.session_ids();
        let control = self.control.clone();
        tokio::spawn(async move {
            for session_id in session_ids {
                if let Err(e) = control.report_activity(&session_id, ts).await {
                    debug!("Activity report for {} failed: {}", session_id, e);
                }
            }
        });
    }

    async fn terminate(&mut self, session_ids: Vec<String>, reason: EndReason) {
        self.error = None;
        if !session_ids.is_empty() {
            match self
                .control
                .terminate(&session_ids, self.config.disposal)
                .await
            {
                Ok(response) => {
                    let failed: Vec<String> = response
                        .failures()
                        .map(|r| {
                            format!(
                                "{}: {}",
                                r.session_id,
                                r.error.as_deref().unwrap_or("unknown error")
                            )
                        })
                        .collect();
                    if !failed.is_empty() {
                        warn!("Some sessions could not be ended: {}", failed.join(", "));
                        self.error =
                            Some(format!("Some sessions could not be ended: {}", failed.join(", ")));
                    }
                }
                Err(e) => {
                    warn!("Ending sessions ({}) failed: {}", reason, e);
                    self.error = Some(format!("Could not end session: {}", e));
                }
            }
        }

        if let Err(e) = self.store.clear() {
            warn!("Failed to clear activity record: {:#}", e);
        }
        self.refresh().await;
    }

    async fn refresh(&mut self) {
        let was_ended = self.coordinator.is_ended();
        let sessions = match self.control.list_sessions(!was_ended).await {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!("Session refresh failed, keeping last list: {}", e);
                return;
            }
        };

        let effects = self
            .coordinator
            .sync_sessions(&sessions, self.clock.now_ms());
        if was_ended && !self.coordinator.is_ended() {
            self.error = None;
            self.last_reported_at = None;
        }

        let live: HashSet<String> = sessions
            .iter()
            .filter(|s| s.status.is_active())
            .map(|s| s.id.clone())
            .collect();
        self.link.retain_sessions(&live);
        self.sessions = sessions;

        if self.apply(effects).is_some() {
            warn!("Session refresh produced a termination, ignoring");
        }
    }

    fn publish(&self) {
        let now = self.clock.now_ms();
        let end_reason = self.coordinator.end_reason();
        let view = IdleView {
            show_idle_prompt: self.coordinator.prompt_visible(),
            countdown_seconds: self.coordinator.countdown_seconds(now),
            session_ended: end_reason.is_some(),
            end_reason,
            message: end_reason.map(|r| r.user_message().to_string()),
            error: self.error.clone(),
            suspended: self.coordinator.is_suspended(),
            sessions: self.sessions.clone(),
        };

        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

async fn sleep_until(clock: &dyn Clock, wake: Option<Wake>) {
    match wake {
        Some(wake) => {
            let delay = u64::try_from(wake.at - clock.now_ms()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        None => std::future::pending::<()>().await,
    }
}
