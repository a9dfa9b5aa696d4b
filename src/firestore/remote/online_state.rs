use std::fmt;

/// How confident the client is that it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// No connection attempt has settled yet. Listeners hold back
    /// from-cache snapshots in this state.
    #[default]
    Unknown,
    Online,
    /// Listeners get from-cache snapshots right away.
    Offline,
}

impl OnlineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineState::Unknown => "Unknown",
            OnlineState::Online => "Online",
            OnlineState::Offline => "Offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Unknown" => Some(OnlineState::Unknown),
            "Online" => Some(OnlineState::Online),
            "Offline" => Some(OnlineState::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for OnlineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watch stream failures tolerated before the client is considered offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives the online state from watch stream health. Each method returns the
/// new state when it changed.
#[derive(Debug, Default)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    /// Bumped whenever a pending connect timeout becomes obsolete.
    timer_generation: u64,
    timer_armed: bool,
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self {
            should_warn_client_is_offline: true,
            ..Self::default()
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// A watch stream attempt started. Returns the state change and, on the
    /// first attempt, the generation of the connect timeout to arm.
    pub fn handle_watch_stream_start(&mut self) -> (Option<OnlineState>, Option<u64>) {
        if self.watch_stream_failures != 0 {
            return (None, None);
        }
        let change = self.set_and_broadcast(OnlineState::Unknown);
        self.timer_generation += 1;
        self.timer_armed = true;
        (change, Some(self.timer_generation))
    }

    /// The connect timeout armed under `generation` fired.
    pub fn handle_connect_timeout(&mut self, generation: u64) -> Option<OnlineState> {
        if !self.timer_armed || generation != self.timer_generation {
            return None;
        }
        self.timer_armed = false;
        self.log_client_offline_warning("backend didn't respond within 10 seconds");
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, reason: &str) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.set_and_broadcast(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_timer();
            self.log_client_offline_warning(&format!(
                "connection failed {} times, most recent error: {reason}",
                self.watch_stream_failures
            ));
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Explicit transition, e.g. a message arrived or the network was disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn clear_timer(&mut self) {
        if self.timer_armed {
            self.timer_armed = false;
            self.timer_generation += 1;
        }
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn log_client_offline_warning(&mut self, details: &str) {
        if self.should_warn_client_is_offline {
            log::warn!("could not reach the backend ({details}), operating in offline mode");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("client is offline: {details}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_failure_goes_offline() {
        let mut tracker = OnlineStateTracker::new();
        let (change, timer) = tracker.handle_watch_stream_start();
        assert_eq!(change, None);
        assert!(timer.is_some());
        assert_eq!(
            tracker.handle_watch_stream_failure("unavailable"),
            Some(OnlineState::Offline)
        );
    }

    #[test]
    fn failure_while_online_returns_to_unknown() {
        let mut tracker = OnlineStateTracker::new();
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(
            tracker.handle_watch_stream_failure("reset"),
            Some(OnlineState::Unknown)
        );
        assert_eq!(tracker.state(), OnlineState::Unknown);
    }

    #[test]
    fn stale_timeouts_are_ignored() {
        let mut tracker = OnlineStateTracker::new();
        let (_, timer) = tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        assert_eq!(tracker.handle_connect_timeout(timer.unwrap()), None);

        tracker.set(OnlineState::Unknown);
        let (_, timer) = tracker.handle_watch_stream_start();
        assert_eq!(
            tracker.handle_connect_timeout(timer.unwrap()),
            Some(OnlineState::Offline)
        );
    }
}
