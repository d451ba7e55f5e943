// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels: typed, multi-producer multi-consumer, explicit close.
//!
//! `bounded(n)` and `rendezvous()` cover the common cases; `Builder`
//! exposes overflow modes, topology flags, and resource pools. Handles
//! are cheap clones over one shared channel; dropping the last `Sender`
//! closes the transmit side, dropping the last `Receiver` closes the
//! receive side.

pub mod error;
pub mod futures;

pub(crate) mod core;
pub(crate) mod waiters;

mod handles;

pub use handles::{Receiver, Sender};

use std::sync::Arc;

use self::core::Channel;
use self::error::ChannelError;
use crate::nursery::NurseryId;

/// What a full buffer does to a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowMode {
    /// Block the sender (or report full to non-blocking sends).
    #[default]
    Block,
    /// Drop the incoming item and report it.
    DropNew,
    /// Evict the oldest buffered item and enqueue the new one.
    DropOld,
}

/// Lifecycle callbacks for pooled (resource) channels.
pub struct PoolHooks<T> {
    /// Mint a fresh item when the pool is empty and under its cap.
    pub create: Box<dyn Fn() -> T + Send + Sync>,
    /// Applied to every item returned through `send`.
    pub reset: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
    /// Applied to items still buffered when the channel is dropped, and
    /// to items evicted by `DropOld`.
    pub destroy: Option<Box<dyn Fn(T) + Send + Sync>>,
}

/// A buffered channel with capacity `cap` in the default Block mode.
pub fn bounded<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    Builder::new().capacity(cap).build().expect("valid config")
}

/// An unbuffered channel: every send rendezvouses with a recv.
pub fn rendezvous<T>() -> (Sender<T>, Receiver<T>) {
    Builder::new().capacity(0).build().expect("valid config")
}

/// Channel configuration.
pub struct Builder<T> {
    cap: usize,
    mode: OverflowMode,
    ordered: bool,
    lockfree: bool,
    pool: Option<(PoolHooks<T>, usize)>,
    autoclose_owner: Option<NurseryId>,
}

impl<T> Default for Builder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Builder<T> {
    pub fn new() -> Self {
        Self {
            cap: 0,
            mode: OverflowMode::Block,
            ordered: false,
            lockfree: true,
            pool: None,
            autoclose_owner: None,
        }
    }

    /// Buffer capacity; 0 makes a rendezvous channel.
    pub fn capacity(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn overflow(mut self, mode: OverflowMode) -> Self {
        self.mode = mode;
        self
    }

    /// Strictly ordered topology: disables the lock-free fast path so
    /// every transfer serializes through the channel mutex.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Allow or forbid the lock-free ring for this channel.
    pub fn lockfree(mut self, lockfree: bool) -> Self {
        self.lockfree = lockfree;
        self
    }

    /// Make this a resource pool: `recv` mints items through
    /// `hooks.create` while fewer than `max_items` exist.
    pub fn pooled(mut self, hooks: PoolHooks<T>, max_items: usize) -> Self {
        self.pool = Some((hooks, max_items));
        self
    }

    /// Tag the channel as autoclosed by the given nursery, enabling the
    /// opt-in deadlock guard on blocking recv from inside that scope.
    pub fn autoclose_owner(mut self, owner: NurseryId) -> Self {
        self.autoclose_owner = Some(owner);
        self
    }

    pub fn build(self) -> Result<(Sender<T>, Receiver<T>), ChannelError> {
        if self.cap == 0 && self.mode != OverflowMode::Block {
            return Err(ChannelError::InvalidConfig(
                "drop modes require a buffered channel",
            ));
        }
        if self.pool.as_ref().is_some_and(|(_, max)| *max == 0) {
            return Err(ChannelError::InvalidConfig(
                "pooled channel needs max_items >= 1",
            ));
        }
        let chan = Channel::new(
            self.cap,
            self.mode,
            self.ordered,
            self.lockfree,
            self.pool,
            self.autoclose_owner,
        );
        Ok(handles::pair(chan))
    }
}

pub(crate) fn raw<T>(sender: &Sender<T>) -> &Arc<Channel<T>> {
    handles::sender_chan(sender)
}

pub(crate) fn raw_rx<T>(receiver: &Receiver<T>) -> &Arc<Channel<T>> {
    handles::receiver_chan(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_modes_rejected_on_rendezvous() {
        let err = Builder::<u32>::new()
            .capacity(0)
            .overflow(OverflowMode::DropOld)
            .build()
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfig(_)));
    }

    #[test]
    fn bounded_builds() {
        let (tx, rx) = bounded::<u32>(4);
        tx.try_send(1).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 1);
    }
}
