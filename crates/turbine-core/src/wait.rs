//! Bounded waits
//!
//! Every blocking operation in the fabric takes a [`Wait`]. The durations
//! below are the defaults a router starts from.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default wait for a routed request to be answered
pub const LONG_WAIT: Duration = Duration::from_millis(10_000);

/// Default interval between liveness pings
pub const PING_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default wait for a ping (or handshake) answer
pub const PING_WAIT: Duration = Duration::from_millis(30_000);

/// Default delay between parent reconnection attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(60_000);

/// Default scheduler tick
pub const NORMAL_WAIT: Duration = Duration::from_millis(1_000);

/// How long a blocking operation may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wait {
    /// Check once, never block
    Immediate,
    /// Block until the condition holds or the operation is interrupted
    Forever,
    /// Block for at most this long
    For(Duration),
}

impl Wait {
    /// Build from milliseconds: 0 is immediate, `u64::MAX` is forever
    pub fn from_millis(ms: u64) -> Self {
        match ms {
            0 => Wait::Immediate,
            u64::MAX => Wait::Forever,
            ms => Wait::For(Duration::from_millis(ms)),
        }
    }

    /// The bound as a duration, `None` for [`Wait::Forever`]
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Wait::Immediate => Some(Duration::ZERO),
            Wait::Forever => None,
            Wait::For(d) => Some(d),
        }
    }

    pub fn is_immediate(self) -> bool {
        matches!(self, Wait::Immediate) || self == Wait::For(Duration::ZERO)
    }
}

impl From<Duration> for Wait {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Wait::Immediate
        } else {
            Wait::For(d)
        }
    }
}
