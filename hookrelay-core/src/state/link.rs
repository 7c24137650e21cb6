//! Lifecycle shared by channels and the sessions built on them.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::RelayError;

// ── LinkState ────────────────────────────────────────────────────

/// The current phase of a helper ↔ controller link.
///
/// ```text
///  Connecting ──► Open ──► Broken ──► Closed
///       │           │                   ▲
///       │           └───────────────────┤
///       └───────────────────────────────┘
/// ```
///
/// `Closed` is terminal. `Broken` is only reachable from `Connecting` or
/// `Open` and only leads to `Closed`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Transport is up; waiting for the opening exchange.
    #[default]
    Connecting,

    /// Ready for traffic.
    Open {
        /// When the link entered `Open`.
        since: Instant,
    },

    /// The transport failed without an orderly goodbye.
    Broken {
        /// Human-readable cause, for logs.
        reason: String,
    },

    /// Resources released. Terminal.
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open { .. } => write!(f, "Open"),
            Self::Broken { .. } => write!(f, "Broken"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Broken { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Broken or Closed: no more traffic will flow.
    pub fn is_terminal(&self) -> bool {
        self.is_broken() || self.is_closed()
    }

    /// How long the link has been `Open`, `None` in any other state.
    pub fn open_duration(&self) -> Option<Duration> {
        match self {
            Self::Open { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Open`.
    ///
    /// Valid from: `Connecting`.
    pub fn open(&mut self) -> Result<(), RelayError> {
        match self {
            Self::Connecting => {
                *self = Self::Open {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RelayError::ProtocolViolation(
                "cannot open: not in Connecting state",
            )),
        }
    }

    /// Transition to `Broken`.
    ///
    /// Valid from: `Connecting`, `Open`. Returns `Ok(false)` if the link
    /// was already broken so concurrent failure paths report once.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<bool, RelayError> {
        match self {
            Self::Connecting | Self::Open { .. } => {
                *self = Self::Broken {
                    reason: reason.into(),
                };
                Ok(true)
            }
            Self::Broken { .. } => Ok(false),
            Self::Closed => Err(RelayError::ProtocolViolation(
                "cannot fail: link already Closed",
            )),
        }
    }

    /// Transition to `Closed` from any state.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        *self = Self::Closed;
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut state = LinkState::default();
        assert_eq!(state, LinkState::Connecting);

        state.open().unwrap();
        assert!(state.is_open());
        assert!(state.open_duration().is_some());

        assert!(state.close());
        assert!(state.is_closed());
    }

    #[test]
    fn broken_then_closed() {
        let mut state = LinkState::Open {
            since: Instant::now(),
        };
        assert!(state.fail("eof").unwrap());
        assert!(state.is_broken());
        assert!(!state.fail("again").unwrap());
        assert!(state.close());
        assert!(state.is_closed());
    }

    #[test]
    fn closed_is_terminal() {
        let mut state = LinkState::Closed;
        assert!(state.open().is_err());
        assert!(state.fail("late").is_err());
        assert!(!state.close());
    }

    #[test]
    fn cannot_reopen_broken_link() {
        let mut state = LinkState::Broken {
            reason: "reset".into(),
        };
        assert!(state.open().is_err());
    }

    #[test]
    fn open_only_from_connecting() {
        let mut state = LinkState::Open {
            since: Instant::now(),
        };
        assert!(state.open().is_err());
    }

    #[test]
    fn display_format() {
        assert_eq!(LinkState::Connecting.to_string(), "Connecting");
        assert_eq!(
            LinkState::Open {
                since: Instant::now()
            }
            .to_string(),
            "Open"
        );
        assert_eq!(
            LinkState::Broken {
                reason: "x".into()
            }
            .to_string(),
            "Broken"
        );
        assert_eq!(LinkState::Closed.to_string(), "Closed");
    }
}
