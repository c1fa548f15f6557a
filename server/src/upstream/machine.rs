//! Reconnect policy for the upstream connection
//!
//! The machine owns every timing decision (which candidate next, how long to
//! wait, when credentials are on cooldown, when a silent peer is dead) and
//! performs no I/O. The driver in `client.rs` feeds it events and acts on the
//! returned [`Step`].

use std::time::Duration;

use airpad_relay_shared::protocol::CLOSE_INVALID_CREDENTIALS;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Backoff,
    Stopped,
}

/// What the driver should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Connect { endpoint: String },
    Wait(Duration),
    Stopped,
}

/// Outcome of a close, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    pub credentials_rejected: bool,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub reconnect: Duration,
    pub invalid_credentials_retry: Duration,
    /// 0 disables dead-peer detection
    pub max_missed_heartbeats: u32,
}

#[derive(Debug)]
pub struct Machine {
    candidates: Vec<String>,
    index: usize,
    state: ConnState,
    resume_at: Option<Instant>,
    blocked_until: Option<Instant>,
    missed_heartbeats: u32,
    policy: ReconnectPolicy,
}

/// A 4001 close whose reason mentions invalid credentials
pub fn is_credentials_rejection(code: Option<u16>, reason: &str) -> bool {
    code == Some(CLOSE_INVALID_CREDENTIALS) && reason.to_lowercase().contains("invalid credentials")
}

impl Machine {
    /// `primary` selects the starting candidate when present in the list
    pub fn new(candidates: Vec<String>, primary: &str, policy: ReconnectPolicy) -> Self {
        let index = candidates.iter().position(|c| c == primary).unwrap_or(0);
        Self {
            candidates,
            index,
            state: ConnState::Idle,
            resume_at: None,
            blocked_until: None,
            missed_heartbeats: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn current(&self) -> Option<&str> {
        self.candidates.get(self.index).map(String::as_str)
    }

    pub fn blocked_until(&self) -> Option<Instant> {
        self.blocked_until
    }

    /// Decide the next action at `now`
    pub fn poll(&mut self, now: Instant) -> Step {
        if self.state == ConnState::Stopped {
            return Step::Stopped;
        }
        if let Some(at) = self.resume_at {
            if at > now {
                return Step::Wait(at - now);
            }
            self.resume_at = None;
        }
        if let Some(until) = self.blocked_until {
            if until > now {
                self.state = ConnState::Backoff;
                self.resume_at = Some(until);
                return Step::Wait(until - now);
            }
        }
        let Some(endpoint) = self.current().map(str::to_string) else {
            self.state = ConnState::Stopped;
            return Step::Stopped;
        };
        self.state = ConnState::Connecting;
        Step::Connect { endpoint }
    }

    pub fn on_open(&mut self) {
        if self.state == ConnState::Stopped {
            return;
        }
        self.state = ConnState::Open;
        self.blocked_until = None;
        self.missed_heartbeats = 0;
    }

    /// Socket closed, errored, or failed to connect. Advances to the next
    /// candidate and schedules the retry.
    pub fn on_closed(&mut self, code: Option<u16>, reason: &str, now: Instant) -> CloseOutcome {
        let credentials_rejected = is_credentials_rejection(code, reason);
        if credentials_rejected {
            self.blocked_until = Some(now + self.policy.invalid_credentials_retry);
        }
        self.advance();

        let delay = match self.blocked_until {
            Some(until) if until > now => self.policy.invalid_credentials_retry,
            _ => self.policy.reconnect,
        };
        if self.state != ConnState::Stopped {
            self.state = ConnState::Backoff;
            self.resume_at = Some(now + delay);
        }
        CloseOutcome {
            credentials_rejected,
            delay,
        }
    }

    /// The current candidate cannot be turned into a URL
    pub fn on_unusable_endpoint(&mut self, now: Instant) {
        self.advance();
        if self.state != ConnState::Stopped {
            self.state = ConnState::Backoff;
            self.resume_at = Some(now + self.policy.reconnect);
        }
    }

    /// Any inbound frame proves the peer alive
    pub fn on_inbound(&mut self) {
        self.missed_heartbeats = 0;
    }

    /// Heartbeat tick. `true` means the peer is considered dead and the
    /// socket should be closed instead of pinged.
    pub fn on_heartbeat(&mut self) -> bool {
        let max = self.policy.max_missed_heartbeats;
        if max > 0 && self.missed_heartbeats >= max {
            return true;
        }
        self.missed_heartbeats = self.missed_heartbeats.saturating_add(1);
        false
    }

    pub fn stop(&mut self) {
        self.state = ConnState::Stopped;
        self.resume_at = None;
    }

    fn advance(&mut self) {
        if self.candidates.len() > 1 {
            self.index = (self.index + 1) % self.candidates.len();
        }
    }
}
