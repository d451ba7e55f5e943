// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Concur runtime library: the concurrency core.
//!
//! Typed message-passing channels on top of an M:N work-stealing fiber
//! scheduler. Producers and consumers — fibers or plain OS threads —
//! exchange values through channels with blocking, non-blocking, timed,
//! and deadline-aware operations, rendezvous handoff, backpressure
//! modes, close-with-error, and multi-channel select.
//!
//! Components:
//! - `chan`     — channels: buffer, waiter protocol, operations
//! - `select`   — multi-channel readiness, single-winner commit
//! - `sched`    — worker threads, queues, stealing, watchdog, timers
//! - `deadline` — deadline values and the ambient cancellation scope
//! - `nursery`  — the scope-id interface consumed by the autoclose guard
//! - `config`   — `CC_*` environment tunables
//!
//! Fibers are stackless tasks: a blocking channel call parks the OS
//! thread on the channel's condition variable, while the `*_async`
//! forms park the calling fiber by publishing a wait node and returning
//! `Pending` until a peer completes the operation.

pub mod chan;
pub mod config;
pub mod deadline;
pub mod nursery;
pub mod sched;
pub mod select;

pub(crate) mod ring;
pub(crate) mod stats;

pub use chan::{
    bounded, rendezvous, Builder, OverflowMode, PoolHooks, Receiver, Sender,
};
pub use chan::error::{
    ChannelError, RecvError, SendError, TryRecvError, TrySendError,
};
pub use deadline::Deadline;
pub use sched::{runtime, sleep, spawn, yield_now, JoinError, JoinHandle, Runtime};
pub use select::{Select, SelectError, SelectOutcome, TrySelectError};
