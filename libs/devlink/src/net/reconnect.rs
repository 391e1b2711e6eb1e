//! Reconnection policy for the reusable TCP client
//!
//! Attempts are grouped into cycles: within a cycle a failed attempt is
//! retried after `connect_cycle`, a failed cycle is followed by another one
//! after `retry_cycle` when auto-reconnect is enabled. The helper only
//! decides what comes next; waiting is left to the caller so that the wait
//! can be interrupted by `close()`.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::params::ConnectionParams;

/// Connection state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Successfully connected
    Connected,
    /// Disconnected
    Disconnected,
    /// Currently reconnecting
    Reconnecting,
    /// Reconnection stopped (gave up or aborted)
    Failed,
}

/// What to do after a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Wait for the delay, then try again
    Retry(Duration),
    /// Too many failed cycles, notify the owner and stop
    Abort,
    /// Cycle exhausted without auto-reconnect, stop quietly
    GiveUp,
}

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts per cycle (at least one)
    pub connect_retries: u32,
    /// Delay between attempts of one cycle
    pub connect_cycle: Duration,
    /// Delay between cycles
    pub retry_cycle: Duration,
    /// Start a new cycle after a failed one
    pub auto_reconnect: bool,
    /// Failed cycles before aborting (0 means never)
    pub retry_abort: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            connect_cycle: Duration::from_secs(5),
            retry_cycle: Duration::from_secs(30),
            auto_reconnect: true,
            retry_abort: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Create from a connection parameter set
    pub fn from_params(params: &ConnectionParams) -> Self {
        Self {
            connect_retries: params.connect_retries,
            connect_cycle: params.connect_cycle_duration(),
            retry_cycle: params.retry_cycle_duration(),
            auto_reconnect: params.auto_reconnect,
            retry_abort: params.retry_suspend,
        }
    }

    fn attempts_per_cycle(&self) -> u32 {
        self.connect_retries.max(1)
    }
}

/// Reconnection context tracking current state and attempts
#[derive(Debug, Clone)]
pub struct ReconnectContext {
    /// Attempt within the current cycle
    pub current_attempt: u32,
    /// Consecutive cycles without a connection
    pub failed_cycles: u32,
    /// Last attempt time
    pub last_attempt: Option<Instant>,
    pub connection_state: ConnectionState,
}

impl Default for ReconnectContext {
    fn default() -> Self {
        Self {
            current_attempt: 0,
            failed_cycles: 0,
            last_attempt: None,
            connection_state: ConnectionState::Disconnected,
        }
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    /// Total connection attempts
    pub total_attempts: u64,
    /// Successful connection count
    pub successful_connects: u64,
    /// Failed attempt count
    pub failed_attempts: u64,
    /// Cycles that ended without a connection
    pub failed_cycles: u64,
    /// Last successful connection time
    pub last_connected: Option<Instant>,
}

/// Attempt bookkeeping for one reconnecting client
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    context: ReconnectContext,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            context: ReconnectContext::default(),
            stats: ReconnectStats::default(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.context.connection_state
    }

    pub fn context(&self) -> &ReconnectContext {
        &self.context
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Start a fresh sequence of cycles
    pub fn reset(&mut self) {
        self.context.current_attempt = 0;
        self.context.failed_cycles = 0;
        self.context.last_attempt = None;
        if self.context.connection_state != ConnectionState::Connected {
            self.context.connection_state = ConnectionState::Disconnected;
        }
    }

    /// Record the start of an attempt
    pub fn begin_attempt(&mut self) {
        self.context.connection_state = ConnectionState::Reconnecting;
        self.context.current_attempt += 1;
        self.context.last_attempt = Some(Instant::now());
        self.stats.total_attempts += 1;
        debug!(
            "Connection attempt {}/{} (failed cycles: {})",
            self.context.current_attempt,
            self.policy.attempts_per_cycle(),
            self.context.failed_cycles
        );
    }

    pub fn mark_connected(&mut self) {
        if self.context.current_attempt > 1 || self.context.failed_cycles > 0 {
            info!(
                "Connected after {} failed cycle(s), attempt {}",
                self.context.failed_cycles, self.context.current_attempt
            );
        }
        self.context.connection_state = ConnectionState::Connected;
        self.context.current_attempt = 0;
        self.context.failed_cycles = 0;
        self.stats.successful_connects += 1;
        self.stats.last_connected = Some(Instant::now());
    }

    pub fn mark_disconnected(&mut self) {
        self.context.connection_state = ConnectionState::Disconnected;
        debug!("Connection marked as disconnected");
    }

    /// Record a failed attempt and decide what happens next
    pub fn record_failure(&mut self, reason: &str) -> ReconnectStep {
        self.stats.failed_attempts += 1;
        warn!(
            "Connection attempt {} failed: {}",
            self.context.current_attempt, reason
        );

        if self.context.current_attempt < self.policy.attempts_per_cycle() {
            self.context.connection_state = ConnectionState::Disconnected;
            return ReconnectStep::Retry(self.policy.connect_cycle);
        }

        self.context.current_attempt = 0;
        self.context.failed_cycles += 1;
        self.stats.failed_cycles += 1;

        if self.policy.retry_abort > 0 && self.context.failed_cycles >= self.policy.retry_abort {
            self.context.connection_state = ConnectionState::Failed;
            warn!(
                "Reconnection aborted after {} failed cycle(s)",
                self.context.failed_cycles
            );
            return ReconnectStep::Abort;
        }

        if !self.policy.auto_reconnect {
            self.context.connection_state = ConnectionState::Failed;
            warn!("Connect retries exhausted, auto-reconnect disabled");
            return ReconnectStep::GiveUp;
        }

        self.context.connection_state = ConnectionState::Disconnected;
        ReconnectStep::Retry(self.policy.retry_cycle)
    }
}
