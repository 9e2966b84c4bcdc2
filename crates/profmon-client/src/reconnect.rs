//! Connection state and reconnect backoff.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──start──> Connecting ──open──> Authenticating ──auth ok──> Connected
//!                             ▲                      │                        │
//!                             │                 auth error /            close / error
//!                             │                 close / error                 │
//!                             │                      ▼                        ▼
//!                             └─────backoff delay── Reconnecting <────────────┘
//!
//!             destroy() from any state ──> Destroyed
//! ```
//!
//! Reconnection never gives up. The delay before each attempt comes from
//! [`Backoff`]: the first failure in a streak retries immediately, later
//! ones wait 1 s, 2 s, 4 s, ... up to [`ReconnectConfig::max_delay`]. Only an
//! authenticated round-trip resets the streak.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ClientError, Result};

/// Connection state of a session.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// No transport and nothing scheduled yet.
    Disconnected,

    /// Transport open in progress.
    Connecting,

    /// Transport open, waiting for the auth reply. Calls are queued.
    Authenticating,

    /// Authenticated; calls flow freely.
    Connected {
        /// Time when authentication completed
        connected_at: Instant,
    },

    /// Waiting out the backoff delay after a failure.
    Reconnecting {
        /// Consecutive failures so far (1-based)
        attempt: u32,
        /// When the next open will be attempted
        next_retry_at: Instant,
        /// The failure that triggered reconnection
        last_error: String,
    },

    /// The session was destroyed. Terminal.
    Destroyed,
}

impl ConnectionState {
    /// Returns true if authenticated.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Returns true once the session is destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Returns the last failure if reconnecting.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Reconnecting { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    /// Returns a short status label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Authenticating => "Authenticating...",
            Self::Connected { .. } => "Connected",
            Self::Reconnecting { .. } => "Reconnecting...",
            Self::Destroyed => "Destroyed",
        }
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        // Compare variants without comparing Instant fields
        match (self, other) {
            (Self::Disconnected, Self::Disconnected)
            | (Self::Connecting, Self::Connecting)
            | (Self::Authenticating, Self::Authenticating)
            | (Self::Connected { .. }, Self::Connected { .. })
            | (Self::Destroyed, Self::Destroyed) => true,
            (Self::Reconnecting { attempt: a1, .. }, Self::Reconnecting { attempt: a2, .. }) => {
                a1 == a2
            }
            _ => false,
        }
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay of the first non-immediate retry.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for doubling).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    /// Check the policy before a session is started with it.
    ///
    /// The multiplier must be a finite number of at least 1.0 and
    /// `max_delay` may not be below `initial_delay`.
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ClientError::InvalidConfig(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(ClientError::InvalidConfig(format!(
                "max_delay ({:?}) is below initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        Ok(())
    }

    /// Calculate the delay for a given consecutive failure (1-based).
    ///
    /// Failure 1 retries at once; failure `n >= 2` waits
    /// `initial_delay * multiplier^(n-2)`, capped at `max_delay`. A
    /// multiplier that fails [`validate`](Self::validate) is treated as 1.0.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::try_from_secs_f64(final_delay).unwrap_or(self.max_delay)
    }
}

/// Tracks consecutive failures and hands out reconnect delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    failures: u32,
}

impl Backoff {
    /// Create a backoff tracker with no failures recorded.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        if let Err(e) = config.validate() {
            tracing::warn!("Reconnect policy is out of range, delays are clamped: {}", e);
        }
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure; returns the attempt number and the delay to wait.
    pub fn record_failure(&mut self) -> (u32, Duration) {
        self.failures = self.failures.saturating_add(1);
        (self.failures, self.config.delay_for_attempt(self.failures))
    }

    /// Delay the next failure would get, without recording anything.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.config.delay_for_attempt(self.failures.saturating_add(1))
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget the failure streak (after an authenticated round-trip).
    pub fn reset(&mut self) {
        if self.failures > 0 {
            tracing::debug!("Backoff reset after {} failures", self.failures);
        }
        self.failures = 0;
    }
}
