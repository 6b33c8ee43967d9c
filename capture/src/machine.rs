//! Client recording state machine.
//!
//! Pure bookkeeping, no I/O: the session asks the machine whether a
//! transition is allowed and performs the side effects itself.
//!
//! ```text
//! Idle ──start(ready)──▶ ArmedRecording ──stop──▶ Finalizing
//!  ▲                                                  │ flushed
//!  └──────────── delivered / failed ◀── Uploading ◀───┘
//! ```

use take_common::artifact::SessionDescriptor;
use take_common::protocol::RecorderState;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    ArmedRecording(SessionDescriptor),
    Finalizing(SessionDescriptor),
    Uploading(SessionDescriptor),
}

/// Why a start command was not honoured.  Neither case is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRejected {
    NotReady,
    Busy(RecorderState),
}

#[derive(Debug)]
pub struct Machine {
    phase: Phase,
}

impl Default for Machine {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RecorderState {
        match self.phase {
            Phase::Idle => RecorderState::Idle,
            Phase::ArmedRecording(_) => RecorderState::ArmedRecording,
            Phase::Finalizing(_) => RecorderState::Finalizing,
            Phase::Uploading(_) => RecorderState::Uploading,
        }
    }

    /// Descriptor of the take in flight, if any.
    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        match &self.phase {
            Phase::Idle => None,
            Phase::ArmedRecording(d) | Phase::Finalizing(d) | Phase::Uploading(d) => Some(d),
        }
    }

    /// `Idle → ArmedRecording`.  Busy is checked before readiness so a
    /// recording client reports why it really refused.
    pub fn start(&mut self, desc: SessionDescriptor, ready: bool) -> Result<(), StartRejected> {
        if self.phase != Phase::Idle {
            return Err(StartRejected::Busy(self.state()));
        }
        if !ready {
            return Err(StartRejected::NotReady);
        }
        self.phase = Phase::ArmedRecording(desc);
        Ok(())
    }

    /// `ArmedRecording → Finalizing`.  Returns false (no-op) in any other
    /// state.
    pub fn stop(&mut self) -> bool {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::ArmedRecording(desc) => {
                self.phase = Phase::Finalizing(desc);
                true
            }
            other => {
                self.phase = other;
                false
            }
        }
    }

    /// `Finalizing → Uploading`, once the capture buffer is flushed.
    /// Returns the descriptor the artifact belongs to.
    pub fn flushed(&mut self) -> Option<SessionDescriptor> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Finalizing(desc) => {
                self.phase = Phase::Uploading(desc.clone());
                Some(desc)
            }
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// `Uploading → Idle` after a terminal delivery outcome, success or not.
    pub fn delivered(&mut self) -> Option<SessionDescriptor> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Uploading(desc) => Some(desc),
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Drop the take in flight after a capture failure.
    pub fn abort(&mut self) -> Option<SessionDescriptor> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => None,
            Phase::ArmedRecording(d) | Phase::Finalizing(d) | Phase::Uploading(d) => Some(d),
        }
    }
}
