// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel operation errors.
//!
//! Errors that fail a send hand the unsent value back to the caller.
//! `Closed` carries the error code the closing side supplied, if any.

use thiserror::Error;

/// Channel construction rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Blocking or deadline-aware send failed.
pub enum SendError<T> {
    /// The channel (or its receive side) is closed.
    Closed { value: T, code: Option<u32> },
    /// The deadline passed before the value could be enqueued or handed off.
    TimedOut(T),
    /// The deadline was cancelled before the wait committed.
    Cancelled(T),
    /// The buffer is full and the channel drops new items.
    Full(T),
}

impl<T> SendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed { value, .. }
            | SendError::TimedOut(value)
            | SendError::Cancelled(value)
            | SendError::Full(value) => value,
        }
    }

    /// The peer's close code, when the failure was a closure.
    pub fn code(&self) -> Option<u32> {
        match self {
            SendError::Closed { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SendError::Closed { .. })
    }
}

impl<T> std::fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed { code, .. } => {
                f.debug_struct("Closed").field("code", code).finish()
            }
            SendError::TimedOut(_) => f.write_str("TimedOut"),
            SendError::Cancelled(_) => f.write_str("Cancelled"),
            SendError::Full(_) => f.write_str("Full"),
        }
    }
}

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed { code: Some(c), .. } => {
                write!(f, "sending on a closed channel (code {c})")
            }
            SendError::Closed { .. } => f.write_str("sending on a closed channel"),
            SendError::TimedOut(_) => f.write_str("send timed out"),
            SendError::Cancelled(_) => f.write_str("send cancelled"),
            SendError::Full(_) => f.write_str("channel full, new item dropped"),
        }
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Non-blocking send failed.
pub enum TrySendError<T> {
    /// The buffer is full (or no receiver is waiting, on a rendezvous
    /// channel).
    Full(T),
    Closed { value: T, code: Option<u32> },
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(value) | TrySendError::Closed { value, .. } => value,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

impl<T> std::fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full"),
            TrySendError::Closed { code, .. } => {
                f.debug_struct("Closed").field("code", code).finish()
            }
        }
    }
}

impl<T> std::fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("channel full"),
            TrySendError::Closed { code: Some(c), .. } => {
                write!(f, "sending on a closed channel (code {c})")
            }
            TrySendError::Closed { .. } => f.write_str("sending on a closed channel"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Blocking or deadline-aware receive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The channel is closed and fully drained.
    #[error("receiving on a closed channel")]
    Closed { code: Option<u32> },
    #[error("recv timed out")]
    TimedOut,
    #[error("recv cancelled")]
    Cancelled,
    /// The autoclose guard refused a wait that can never be satisfied.
    #[error("recv would deadlock on an autoclose channel owned by this scope")]
    Deadlock,
}

impl RecvError {
    pub fn code(&self) -> Option<u32> {
        match self {
            RecvError::Closed { code } => *code,
            _ => None,
        }
    }
}

/// Non-blocking receive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    #[error("channel empty")]
    Empty,
    #[error("receiving on a closed channel")]
    Closed { code: Option<u32> },
}
