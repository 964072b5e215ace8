//! Idle coordinator: one deadline for the whole session set.
//!
//! Pure state machine. Every input carries the caller's clock reading and
//! every output is an [`Effect`] for the driver to carry out. Time is Unix ms.
//!
//! ```text
//!            activity                  deadline reached           countdown over / end_now
//! [armed] ------------> [armed] ------------------------> [prompt] -----------------------> [ended]
//!    |  ^                                                    |
//!    |  | blur (last console)            continue            |
//!    v  |                        <---------------------------+
//! [suspended]
//! ```

use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

use vmlab_protocol::context::{EndReason, MessageKind};
use vmlab_protocol::SessionInfo;

use super::store::ActivityRecord;

const MINUTE_MS: i64 = 60_000;

/// Something the driver must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Post to every linked console.
    Broadcast {
        kind: MessageKind,
        timestamp: i64,
        reason: Option<EndReason>,
    },
    /// Tell the server the user was active at this time.
    ReportActivity(i64),
    Persist(ActivityRecord),
    PromptOpened { countdown_ends_at: i64 },
    PromptClosed,
    /// Stop or delete these sessions. Issued at most once per session set.
    Terminate {
        session_ids: Vec<String>,
        reason: EndReason,
    },
}

/// When the driver should call [`IdleCoordinator::on_timer`] next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub at: i64,
    pub generation: u64,
}

/// Snapshot of the prompt for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdlePromptState {
    pub visible: bool,
    pub countdown_ends_at: Option<i64>,
    pub suspended: bool,
}

#[derive(Debug)]
pub struct IdleCoordinator {
    grace_ms: i64,
    /// Sessions counting toward the deadline, with their idle timeout in ms.
    timeouts: BTreeMap<String, i64>,
    /// Sessions the current deadline already covers.
    known: BTreeSet<String>,
    last_activity_at: Option<i64>,
    idle_deadline: Option<i64>,
    /// Consoles currently holding focus.
    focused: BTreeSet<String>,
    countdown_ends_at: Option<i64>,
    ended: Option<EndReason>,
    ended_sessions: BTreeSet<String>,
    generation: u64,
}

impl IdleCoordinator {
    pub fn new(grace_ms: i64) -> Self {
        Self {
            grace_ms,
            timeouts: BTreeMap::new(),
            known: BTreeSet::new(),
            last_activity_at: None,
            idle_deadline: None,
            focused: BTreeSet::new(),
            countdown_ends_at: None,
            ended: None,
            ended_sessions: BTreeSet::new(),
            generation: 0,
        }
    }

    /// Resume from a record persisted before a reload.
    pub fn restore(&mut self, record: &ActivityRecord) {
        if self
            .last_activity_at
            .is_some_and(|current| current >= record.last_activity_at)
        {
            return;
        }
        debug!(
            "Restoring idle state: last activity {} covering {} session(s)",
            record.last_activity_at,
            record.session_ids.len()
        );
        self.last_activity_at = Some(record.last_activity_at);
        self.known = record.session_ids.iter().cloned().collect();
        self.reschedule();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_some()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.ended
    }

    pub fn is_suspended(&self) -> bool {
        !self.focused.is_empty()
    }

    /// Sessions whose console currently holds focus.
    pub fn focused_sessions(&self) -> Vec<String> {
        self.focused.iter().cloned().collect()
    }

    pub fn prompt_visible(&self) -> bool {
        self.countdown_ends_at.is_some()
    }

    pub fn last_activity_at(&self) -> Option<i64> {
        self.last_activity_at
    }

    pub fn idle_deadline(&self) -> Option<i64> {
        self.idle_deadline
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Sessions that currently count toward the deadline.
    pub fn session_ids(&self) -> Vec<String> {
        self.timeouts.keys().cloned().collect()
    }

    pub fn has_sessions(&self) -> bool {
        !self.timeouts.is_empty()
    }

    pub fn prompt_state(&self) -> IdlePromptState {
        IdlePromptState {
            visible: self.prompt_visible(),
            countdown_ends_at: self.countdown_ends_at,
            suspended: self.is_suspended(),
        }
    }

    /// Whole seconds left on the prompt, rounded up.
    pub fn countdown_seconds(&self, now: i64) -> Option<u64> {
        self.countdown_ends_at
            .map(|ends| ((ends - now).max(0) as u64).div_ceil(1_000))
    }

    /// Shortest idle timeout across the session set.
    pub fn effective_timeout_ms(&self) -> Option<i64> {
        self.timeouts.values().min().copied()
    }

    pub fn next_wake(&self, now: i64) -> Option<Wake> {
        if self.ended.is_some() {
            return None;
        }
        let at = match self.countdown_ends_at {
            // Land on whole-second boundaries of the remaining time.
            Some(ends) if ends > now => ends - ((ends - now - 1) / 1_000) * 1_000,
            Some(_) => now,
            None => self.idle_deadline?,
        };
        Some(Wake {
            at,
            generation: self.generation,
        })
    }

    /// Take in the latest session list from the server.
    pub fn sync_sessions(&mut self, sessions: &[SessionInfo], now: i64) -> Vec<Effect> {
        let active: BTreeMap<String, i64> = sessions
            .iter()
            .filter(|s| s.status.counts_for_idle())
            .map(|s| (s.id.clone(), s.idle_timeout_minutes.max(1) * MINUTE_MS))
            .collect();

        let was_suspended = self.is_suspended();
        self.focused.retain(|id| active.contains_key(id));
        // The user was working in a console until now; resume from here.
        let resumed = was_suspended && !self.is_suspended();

        if self.ended.is_some() {
            let fresh = active.keys().any(|id| !self.ended_sessions.contains(id));
            if !fresh {
                self.timeouts = active;
                return Vec::new();
            }
            info!("New session started after the previous set ended, re-arming idle tracking");
            self.ended = None;
            self.ended_sessions.clear();
            self.known.clear();
            self.last_activity_at = None;
        }

        let has_new = active.keys().any(|id| !self.known.contains(id));
        let known_changed = has_new || self.known.len() != active.len();
        self.timeouts = active;
        self.known = self.timeouts.keys().cloned().collect();

        let mut effects = Vec::new();
        if self.timeouts.is_empty() {
            if self.countdown_ends_at.take().is_some() {
                effects.push(Effect::PromptClosed);
            }
            self.reschedule();
            return effects;
        }

        if (has_new || resumed) && self.countdown_ends_at.is_none() {
            if self.is_suspended() {
                self.last_activity_at = Some(now);
            } else {
                if resumed {
                    debug!("Idle clock resumed, the focused console's session is gone");
                }
                return self.record_activity(now);
            }
        }

        self.reschedule();
        if known_changed {
            effects.extend(self.record().map(Effect::Persist));
        }
        effects
    }

    /// Local activity in the dashboard.
    pub fn record_activity(&mut self, ts: i64) -> Vec<Effect> {
        if self.ended.is_some() || self.countdown_ends_at.is_some() || self.is_suspended() {
            return Vec::new();
        }

        let ts = self.last_activity_at.map_or(ts, |last| last.max(ts));
        self.last_activity_at = Some(ts);
        self.reschedule();

        if self.timeouts.is_empty() {
            return Vec::new();
        }

        let mut effects = vec![
            Effect::Broadcast {
                kind: MessageKind::Activity,
                timestamp: ts,
                reason: None,
            },
            Effect::ReportActivity(ts),
        ];
        effects.extend(self.record().map(Effect::Persist));
        effects
    }

    /// Activity relayed by a console, stamped with the dashboard clock.
    pub fn on_console_activity(&mut self, session_id: &str, now: i64) -> Vec<Effect> {
        if !self.timeouts.contains_key(session_id) {
            return Vec::new();
        }
        self.record_activity(now)
    }

    /// A console took focus: the user is working there, stop the clock.
    pub fn on_console_focus(&mut self, session_id: &str, _now: i64) -> Vec<Effect> {
        if self.ended.is_some()
            || self.countdown_ends_at.is_some()
            || !self.timeouts.contains_key(session_id)
        {
            return Vec::new();
        }
        if self.focused.insert(session_id.to_string()) {
            debug!("Idle clock suspended by console {}", session_id);
            self.reschedule();
        }
        Vec::new()
    }

    /// A console lost focus. The last one to do so restarts the clock at `now`.
    pub fn on_console_blur(&mut self, session_id: &str, now: i64) -> Vec<Effect> {
        if !self.focused.remove(session_id) {
            return Vec::new();
        }
        if self.is_suspended() {
            return Vec::new();
        }
        debug!("Idle clock resumed by console {}", session_id);
        self.record_activity(now)
    }

    /// The driver's timer fired.
    pub fn on_timer(&mut self, generation: u64, now: i64) -> Vec<Effect> {
        if generation != self.generation || self.ended.is_some() {
            return Vec::new();
        }

        if let Some(ends) = self.countdown_ends_at {
            if now >= ends {
                return self.end_now(EndReason::IdleTimeout, now);
            }
            return Vec::new();
        }

        let Some(deadline) = self.idle_deadline else {
            return Vec::new();
        };
        if now < deadline || self.timeouts.is_empty() || self.is_suspended() {
            return Vec::new();
        }

        let countdown_ends_at = deadline + self.grace_ms;
        info!(
            "Idle deadline reached for {} session(s), prompting until {}",
            self.timeouts.len(),
            countdown_ends_at
        );
        self.countdown_ends_at = Some(countdown_ends_at);
        self.idle_deadline = None;
        self.generation += 1;

        let mut effects = vec![Effect::PromptOpened { countdown_ends_at }];
        if now >= countdown_ends_at {
            effects.extend(self.end_now(EndReason::IdleTimeout, now));
        }
        effects
    }

    /// Explicit "continue session" from the prompt.
    pub fn continue_session(&mut self, now: i64) -> Vec<Effect> {
        if self.ended.is_some() {
            debug!("Ignoring continue after the session set ended");
            return Vec::new();
        }

        let mut effects = Vec::new();
        if self.countdown_ends_at.take().is_some() {
            effects.push(Effect::PromptClosed);
        }
        self.focused.clear();
        self.generation += 1;
        effects.extend(self.record_activity(now));
        effects
    }

    /// End every session in the set. Later calls are no-ops.
    pub fn end_now(&mut self, reason: EndReason, now: i64) -> Vec<Effect> {
        if self.ended.is_some() {
            return Vec::new();
        }

        let session_ids = self.session_ids();
        info!(
            "Ending {} session(s): {}",
            session_ids.len(),
            reason
        );

        let mut effects = Vec::new();
        if self.countdown_ends_at.take().is_some() {
            effects.push(Effect::PromptClosed);
        }
        self.ended = Some(reason);
        self.ended_sessions = session_ids.iter().cloned().collect();
        self.focused.clear();
        self.idle_deadline = None;
        self.generation += 1;

        effects.push(Effect::Broadcast {
            kind: MessageKind::Terminate,
            timestamp: now,
            reason: Some(reason),
        });
        effects.push(Effect::Terminate {
            session_ids,
            reason,
        });
        effects
    }

    fn record(&self) -> Option<ActivityRecord> {
        self.last_activity_at.map(|last_activity_at| ActivityRecord {
            last_activity_at,
            idle_deadline: self.idle_deadline,
            session_ids: self.known.iter().cloned().collect(),
        })
    }

    fn reschedule(&mut self) {
        let deadline = if self.ended.is_some()
            || self.countdown_ends_at.is_some()
            || self.is_suspended()
        {
            None
        } else {
            self.last_activity_at
                .zip(self.effective_timeout_ms())
                .map(|(last, timeout)| last + timeout)
        };

        if deadline != self.idle_deadline {
            self.idle_deadline = deadline;
            self.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlab_protocol::SessionStatus;

    const GRACE: i64 = 300_000;

    fn session(id: &str, status: SessionStatus, idle_timeout_minutes: i64) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            owner: "alice".to_string(),
            template_id: "t1".to_string(),
            status,
            console_endpoint: None,
            last_active_at: 0,
            idle_timeout_minutes,
            auto_delete_minutes: 5,
            created_at: 0,
            stopped_at: None,
            error_message: None,
        }
    }

    fn armed(timeouts: &[(&str, i64)]) -> IdleCoordinator {
        let mut c = IdleCoordinator::new(GRACE);
        let sessions: Vec<_> = timeouts
            .iter()
            .map(|(id, minutes)| session(id, SessionStatus::Running, *minutes))
            .collect();
        c.sync_sessions(&sessions, 0);
        c
    }

    fn fire(c: &mut IdleCoordinator, now: i64) -> Vec<Effect> {
        let generation = c.generation();
        c.on_timer(generation, now)
    }

    #[test]
    fn test_new_sessions_arm_deadline_with_minimum_timeout() {
        let c = armed(&[("a", 30), ("b", 10)]);
        assert_eq!(c.last_activity_at(), Some(0));
        assert_eq!(c.idle_deadline(), Some(10 * MINUTE_MS));
        assert_eq!(c.next_wake(0).unwrap().at, 10 * MINUTE_MS);
    }

    #[test]
    fn test_record_activity_moves_deadline_and_reports() {
        let mut c = armed(&[("a", 30)]);
        let effects = c.record_activity(60_000);

        assert_eq!(c.idle_deadline(), Some(60_000 + 30 * MINUTE_MS));
        assert!(effects.contains(&Effect::ReportActivity(60_000)));
        assert!(effects.iter().any(|e| matches!(e, Effect::Persist(_))));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast {
                kind: MessageKind::Activity,
                ..
            }
        )));
    }

    #[test]
    fn test_activity_never_moves_backwards() {
        let mut c = armed(&[("a", 30)]);
        c.record_activity(100_000);
        c.record_activity(50_000);
        assert_eq!(c.last_activity_at(), Some(100_000));
    }

    #[test]
    fn test_prompt_opens_at_deadline_with_grace_from_deadline() {
        let mut c = armed(&[("a", 30)]);
        assert!(fire(&mut c, 30 * MINUTE_MS - 1).is_empty());

        // Timer ran late: the countdown is still measured from the deadline.
        let effects = fire(&mut c, 30 * MINUTE_MS + 2_000);
        assert_eq!(
            effects,
            vec![Effect::PromptOpened {
                countdown_ends_at: 35 * MINUTE_MS
            }]
        );
        assert!(c.prompt_visible());
        assert_eq!(c.countdown_seconds(30 * MINUTE_MS + 2_000), Some(298));
    }

    #[test]
    fn test_activity_ignored_while_prompt_open() {
        let mut c = armed(&[("a", 30)]);
        fire(&mut c, 30 * MINUTE_MS);
        assert!(c.record_activity(31 * MINUTE_MS).is_empty());
        assert!(c.on_console_activity("a", 31 * MINUTE_MS).is_empty());
        assert!(c.on_console_focus("a", 31 * MINUTE_MS).is_empty());
        assert!(c.prompt_visible());
    }

    #[test]
    fn test_countdown_expiry_ends_with_idle_timeout() {
        let mut c = armed(&[("a", 30), ("b", 45)]);
        fire(&mut c, 30 * MINUTE_MS);

        assert!(fire(&mut c, 35 * MINUTE_MS - 1).is_empty());
        let effects = fire(&mut c, 35 * MINUTE_MS);

        assert!(effects.contains(&Effect::PromptClosed));
        assert!(effects.contains(&Effect::Terminate {
            session_ids: vec!["a".to_string(), "b".to_string()],
            reason: EndReason::IdleTimeout,
        }));
        assert_eq!(c.end_reason(), Some(EndReason::IdleTimeout));
        assert_eq!(c.next_wake(35 * MINUTE_MS), None);
    }

    #[test]
    fn test_countdown_wakes_on_second_boundaries() {
        let mut c = armed(&[("a", 30)]);
        fire(&mut c, 30 * MINUTE_MS);

        let ends = 35 * MINUTE_MS;
        assert_eq!(c.next_wake(30 * MINUTE_MS).unwrap().at, 30 * MINUTE_MS + 1_000);
        assert_eq!(c.next_wake(ends - 1_500).unwrap().at, ends - 1_000);
        assert_eq!(c.next_wake(ends - 400).unwrap().at, ends);
        assert_eq!(c.next_wake(ends + 10).unwrap().at, ends + 10);
    }

    #[test]
    fn test_continue_closes_prompt_and_rearms() {
        let mut c = armed(&[("a", 30)]);
        fire(&mut c, 30 * MINUTE_MS);

        let effects = c.continue_session(34 * MINUTE_MS);
        assert_eq!(effects.first(), Some(&Effect::PromptClosed));
        assert!(!c.prompt_visible());
        assert_eq!(c.idle_deadline(), Some(64 * MINUTE_MS));
    }

    #[test]
    fn test_end_now_is_idempotent_and_final() {
        let mut c = armed(&[("a", 30)]);
        let first = c.end_now(EndReason::UserEnd, 1_000);
        assert_eq!(
            first
                .iter()
                .filter(|e| matches!(e, Effect::Terminate { .. }))
                .count(),
            1
        );

        assert!(c.end_now(EndReason::UserEnd, 2_000).is_empty());
        assert!(c.end_now(EndReason::IdleTimeout, 3_000).is_empty());
        assert!(c.continue_session(4_000).is_empty());
        assert!(c.record_activity(5_000).is_empty());
        assert_eq!(c.end_reason(), Some(EndReason::UserEnd));
    }

    #[test]
    fn test_stale_timer_is_noop() {
        let mut c = armed(&[("a", 30)]);
        let stale = c.next_wake(0).unwrap();
        c.record_activity(10 * MINUTE_MS);

        assert!(c.on_timer(stale.generation, 40 * MINUTE_MS).is_empty());
        assert!(!c.prompt_visible());
    }

    #[test]
    fn test_focus_suspends_until_last_blur() {
        let mut c = armed(&[("a", 30), ("b", 30)]);
        c.on_console_focus("a", MINUTE_MS);
        c.on_console_focus("b", MINUTE_MS);
        assert!(c.is_suspended());
        assert_eq!(c.next_wake(MINUTE_MS), None);
        // Activity kept, deadline gone.
        assert_eq!(c.last_activity_at(), Some(0));
        assert_eq!(c.idle_deadline(), None);

        assert!(c.on_console_blur("a", 50 * MINUTE_MS).is_empty());
        assert!(c.is_suspended());

        let effects = c.on_console_blur("b", 60 * MINUTE_MS);
        assert!(effects.contains(&Effect::ReportActivity(60 * MINUTE_MS)));
        assert_eq!(c.idle_deadline(), Some(90 * MINUTE_MS));
    }

    #[test]
    fn test_focused_session_leaving_resumes_from_now() {
        let mut c = armed(&[("a", 30), ("b", 30)]);
        c.on_console_focus("a", MINUTE_MS);
        assert_eq!(c.focused_sessions(), vec!["a".to_string()]);

        // Hours later the focused session is gone from the list.
        let now = 180 * MINUTE_MS;
        let effects = c.sync_sessions(&[session("b", SessionStatus::Running, 30)], now);
        assert!(!c.is_suspended());
        assert_eq!(c.last_activity_at(), Some(now));
        assert_eq!(c.idle_deadline(), Some(now + 30 * MINUTE_MS));
        assert!(effects.contains(&Effect::ReportActivity(now)));

        assert!(fire(&mut c, now + 6_000).is_empty());
        assert_eq!(
            fire(&mut c, now + 30 * MINUTE_MS),
            vec![Effect::PromptOpened {
                countdown_ends_at: now + 30 * MINUTE_MS + GRACE
            }]
        );
    }

    #[test]
    fn test_unknown_console_is_ignored() {
        let mut c = armed(&[("a", 30)]);
        c.on_console_focus("zzz", MINUTE_MS);
        assert!(!c.is_suspended());
        assert!(c.on_console_activity("zzz", MINUTE_MS).is_empty());
    }

    #[test]
    fn test_sync_rearms_only_for_new_sessions() {
        let mut c = armed(&[("a", 30)]);
        let sessions = vec![session("a", SessionStatus::Running, 30)];

        assert!(c.sync_sessions(&sessions, 10 * MINUTE_MS).is_empty());
        assert_eq!(c.idle_deadline(), Some(30 * MINUTE_MS));

        let sessions = vec![
            session("a", SessionStatus::Running, 30),
            session("b", SessionStatus::Pending, 30),
        ];
        c.sync_sessions(&sessions, 10 * MINUTE_MS);
        assert_eq!(c.idle_deadline(), Some(40 * MINUTE_MS));
    }

    #[test]
    fn test_sync_recomputes_deadline_when_shortest_session_leaves() {
        let mut c = armed(&[("a", 30), ("b", 10)]);
        let sessions = vec![
            session("a", SessionStatus::Running, 30),
            session("b", SessionStatus::Stopped, 10),
        ];
        c.sync_sessions(&sessions, MINUTE_MS);
        assert_eq!(c.idle_deadline(), Some(30 * MINUTE_MS));
    }

    #[test]
    fn test_no_prompt_without_active_sessions() {
        let mut c = armed(&[("a", 30)]);
        c.sync_sessions(&[session("a", SessionStatus::Stopped, 30)], MINUTE_MS);
        assert_eq!(c.next_wake(MINUTE_MS), None);
        assert!(fire(&mut c, 60 * MINUTE_MS).is_empty());
    }

    #[test]
    fn test_ended_latch_survives_refetch_until_new_session() {
        let mut c = armed(&[("a", 30)]);
        c.end_now(EndReason::IdleTimeout, 0);

        // Deletion still in flight: same id, still not a reason to re-arm.
        c.sync_sessions(&[session("a", SessionStatus::Running, 30)], 1_000);
        assert!(c.is_ended());

        c.sync_sessions(&[session("c", SessionStatus::Pending, 30)], 2_000);
        assert!(!c.is_ended());
        assert_eq!(c.idle_deadline(), Some(2_000 + 30 * MINUTE_MS));
    }

    #[test]
    fn test_restore_keeps_deadline_across_reload() {
        let mut c = IdleCoordinator::new(GRACE);
        c.restore(&ActivityRecord {
            last_activity_at: 5 * MINUTE_MS,
            idle_deadline: Some(35 * MINUTE_MS),
            session_ids: vec!["a".to_string()],
        });

        c.sync_sessions(&[session("a", SessionStatus::Running, 30)], 20 * MINUTE_MS);
        assert_eq!(c.idle_deadline(), Some(35 * MINUTE_MS));
    }

    #[test]
    fn test_restore_long_past_deadline_ends_immediately() {
        let mut c = IdleCoordinator::new(GRACE);
        c.restore(&ActivityRecord {
            last_activity_at: 0,
            idle_deadline: None,
            session_ids: vec!["a".to_string()],
        });
        c.sync_sessions(&[session("a", SessionStatus::Running, 30)], 2 * 60 * MINUTE_MS);

        let effects = fire(&mut c, 2 * 60 * MINUTE_MS);
        assert!(effects.iter().any(|e| matches!(e, Effect::Terminate { .. })));
    }
}
