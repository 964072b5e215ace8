//! Local interaction tracking for one execution context.

use serde::{Deserialize, Serialize};

/// A raw interaction signal from the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSignal {
    PointerMove,
    KeyPress,
    PointerPress,
    TouchStart,
    Scroll,
    Focus,
    Blur,
    /// Page visibility changed.
    Visibility { hidden: bool },
}

/// Normalized output of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Activity(i64),
    Focus(i64),
    Blur(i64),
}

/// Turns raw signals into activity events. Never decides anything else.
#[derive(Debug, Default)]
pub struct ActivityMonitor {
    hidden: bool,
    prompt_active: bool,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// While the idle prompt is up, input is not activity; only an explicit
    /// continue resets the clock.
    pub fn set_prompt_active(&mut self, active: bool) {
        self.prompt_active = active;
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn observe(&mut self, signal: InputSignal, at: i64) -> Option<MonitorEvent> {
        match signal {
            InputSignal::Visibility { hidden } => {
                self.hidden = hidden;
                if hidden {
                    None
                } else {
                    self.activity(at)
                }
            }
            InputSignal::Focus => Some(MonitorEvent::Focus(at)),
            InputSignal::Blur => Some(MonitorEvent::Blur(at)),
            InputSignal::PointerMove
            | InputSignal::KeyPress
            | InputSignal::PointerPress
            | InputSignal::TouchStart
            | InputSignal::Scroll => self.activity(at),
        }
    }

    fn activity(&self, at: i64) -> Option<MonitorEvent> {
        if self.hidden || self.prompt_active {
            None
        } else {
            Some(MonitorEvent::Activity(at))
        }
    }
}
