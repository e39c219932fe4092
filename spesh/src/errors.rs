//! Errors that specialization and deoptimization can raise.

use crate::{candidate::CallTargetId, callsite::CallsiteShape, ir::BlockIdx};
use std::sync::Arc;
use thiserror::Error;

/// Which of a handler's three offsets could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, strum::Display)]
pub enum HandlerOffset {
    #[strum(to_string = "start")]
    Start,
    #[strum(to_string = "end")]
    End,
    #[strum(to_string = "goto")]
    Goto,
}

/// A failure in the specialization pipeline or in deoptimization.
///
/// Planning skips and optimization restrictions never surface as one of these: they are recovered
/// locally and only logged.
#[derive(Error, Debug)]
pub enum SpeshError {
    /// An identical (shape, type tuple) candidate was installed first.
    #[error("Duplicate candidate for call target {call_target} with shape {shape}")]
    DuplicateCandidate {
        call_target: CallTargetId,
        shape: Arc<CallsiteShape>,
    },
    /// The call target has no free candidate slots left.
    #[error("Call target {call_target} already has {limit} candidates")]
    TooManyCandidates {
        call_target: CallTargetId,
        limit: usize,
    },
    /// A branch fix-up targets a block that was never emitted. This is a bug in an upstream pass.
    #[error("Internal error: unresolved label to {block:?} in call target {call_target}")]
    UnresolvedLabel {
        call_target: CallTargetId,
        block: BlockIdx,
    },
    /// An exception handler offset was never captured during code generation.
    #[error("Internal error: unresolved {which} offset for handler {handler} in call target {call_target}")]
    UnresolvedHandler {
        call_target: CallTargetId,
        handler: usize,
        which: HandlerOffset,
    },
    /// A guard failed at an offset that has no deopt point.
    #[error("Internal error: no deopt point at offset {offset} in call target {call_target}")]
    DeoptPointNotFound {
        call_target: CallTargetId,
        offset: u32,
    },
    #[error("Not yet supported: {0}")]
    NotYetSupported(String),
    /// Deoptimization was requested for a frame running generic code.
    #[error("Frame is not running specialized code")]
    NotSpecialized,
    #[error("Invalid bytecode at offset {offset}: {msg}")]
    InvalidBytecode { offset: u32, msg: String },
    /// Something went wrong that is probably the result of a bug in this crate.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpeshError {
    /// Is this error one that the driver recovers from silently (i.e. it never escapes the
    /// subsystem)?
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpeshError::DuplicateCandidate { .. } | SpeshError::TooManyCandidates { .. }
        )
    }
}
