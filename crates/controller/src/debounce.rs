//! Debounced toggle for the wall button (active-low, pull-up wiring).
//!
//! A press is a falling edge (released `true` → pressed `false`). A press
//! toggles the output only when more than `delay` has passed since the last
//! accepted toggle. The previous raw level is updated on every call, after
//! the edge test, so a held button never re-fires.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ToggleEvent {
    /// Output after the toggle.
    pub(crate) on: bool,
}

#[derive(Debug)]
pub(crate) struct DebouncedToggle {
    delay: Duration,
    prev_raw: bool,
    last_toggle: Option<Instant>,
    output: bool,
}

impl DebouncedToggle {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            prev_raw: true,
            last_toggle: None,
            output: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn output(&self) -> bool {
        self.output
    }

    /// Keep the output in step with a change made elsewhere (e.g. a remote
    /// light command), so the next press flips the real state.
    pub(crate) fn sync_output(&mut self, on: bool) {
        self.output = on;
    }

    pub(crate) fn update(&mut self, raw: bool, now: Instant) -> Option<ToggleEvent> {
        let falling = self.prev_raw && !raw;
        self.prev_raw = raw;

        if !falling {
            return None;
        }
        let settled = self
            .last_toggle
            .map_or(true, |t| now.saturating_duration_since(t) > self.delay);
        if !settled {
            return None;
        }

        self.last_toggle = Some(now);
        self.output = !self.output;
        Some(ToggleEvent { on: self.output })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
