//! Dongle session lifecycle state machine.
//!
//! Validated transitions that return `Result` instead of panicking.
//!
//! ```text
//!  Closed ──► Opened ──► Initialised ──► Configured ──► Streaming
//!    ▲                                                     │
//!    └──────────────────── stop / unplug ◄─────────────────┘
//!
//!  any state ──► Failed   (fatal transport/codec error; requires
//!                          a full close + reopen)
//! ```

use crate::error::AutoboxError;

// ── SessionPhase ─────────────────────────────────────────────────

/// The current phase of a dongle session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No device held. Initial / terminal state.
    #[default]
    Closed,

    /// Device acquired and interface claimed.
    Opened,

    /// Initialise blob sequence sent and acknowledged.
    Initialised,

    /// Configuration pushed; BoxInfo received.
    Configured,

    /// Media flowing (or awaited under the pair timeout).
    Streaming,

    /// Fatal error; only a full close + reopen leaves this state.
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl SessionPhase {
    /// Static phase name (also used in error reporting).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Opened => "Opened",
            Self::Initialised => "Initialised",
            Self::Configured => "Configured",
            Self::Streaming => "Streaming",
            Self::Failed => "Failed",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    fn invalid(op: &'static str, state: &Self) -> AutoboxError {
        AutoboxError::InvalidState {
            op,
            state: state.name(),
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Device acquired and interface claimed.
    ///
    /// Valid from: `Closed`.
    pub fn open(&mut self) -> Result<(), AutoboxError> {
        match self {
            Self::Closed => {
                *self = Self::Opened;
                Ok(())
            }
            other => Err(Self::invalid("open", other)),
        }
    }

    /// Initialise sequence acknowledged.
    ///
    /// Valid from: `Opened`.
    pub fn initialise(&mut self) -> Result<(), AutoboxError> {
        match self {
            Self::Opened => {
                *self = Self::Initialised;
                Ok(())
            }
            other => Err(Self::invalid("initialise", other)),
        }
    }

    /// BoxInfo received after the configuration push.
    ///
    /// Valid from: `Initialised`.
    pub fn configure(&mut self) -> Result<(), AutoboxError> {
        match self {
            Self::Initialised => {
                *self = Self::Configured;
                Ok(())
            }
            other => Err(Self::invalid("configure", other)),
        }
    }

    /// Start command sent; media may flow.
    ///
    /// Valid from: `Configured`.
    pub fn stream(&mut self) -> Result<(), AutoboxError> {
        match self {
            Self::Configured => {
                *self = Self::Streaming;
                Ok(())
            }
            other => Err(Self::invalid("stream", other)),
        }
    }

    /// Explicit stop or unplug.
    ///
    /// Valid from any non-`Failed` state; a no-op when already closed.
    pub fn close(&mut self) -> Result<(), AutoboxError> {
        match self {
            Self::Failed => Err(Self::invalid("close", self)),
            _ => {
                *self = Self::Closed;
                Ok(())
            }
        }
    }

    /// Fatal error from any state.
    pub fn fail(&mut self) {
        *self = Self::Failed;
    }

    /// Leave `Failed` (or any state) for `Closed` as part of a full
    /// close + reopen cycle.
    pub fn reset(&mut self) {
        *self = Self::Closed;
    }
}

// ── Tests ────────────────────────────────────────────────────────
