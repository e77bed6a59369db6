use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Uniform wait convention for sockets and registration waits.
///
/// `Infinite` never returns without completion or cancellation, `DoNotWait`
/// is a non-blocking poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    #[default]
    Infinite,
    DoNotWait,
    Millis(u64),
}

impl Timeout {
    pub fn from_millis(ms: u64) -> Self {
        Self::Millis(ms)
    }

    /// `None` means wait forever
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::DoNotWait => Some(Duration::ZERO),
            Timeout::Millis(ms) => Some(Duration::from_millis(*ms)),
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Timeout::Infinite)
    }

    pub fn is_poll(&self) -> bool {
        matches!(self, Timeout::DoNotWait | Timeout::Millis(0))
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::DoNotWait
        } else {
            Timeout::Millis(duration.as_millis().min(u64::MAX as u128) as u64)
        }
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Timeout::Infinite, Timeout::from)
    }
}
