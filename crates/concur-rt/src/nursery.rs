// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The nursery-scope interface consumed by the runtime.
//!
//! Nurseries themselves live outside this crate; the core only needs to
//! know *which* nursery the current thread/fiber is executing under so the
//! opt-in autoclose guard can refuse a blocking recv that could never be
//! satisfied (the channel is closed by the very scope the caller is inside).

use std::cell::Cell;

/// Opaque nursery identity. Assigned by the nursery layer.
pub type NurseryId = u64;

thread_local! {
    static CURRENT: Cell<Option<NurseryId>> = const { Cell::new(None) };
}

/// Mark the current thread as executing inside `id` until the returned
/// guard drops. Scopes nest.
pub fn enter(id: NurseryId) -> NurseryScope {
    let prev = CURRENT.with(|c| c.replace(Some(id)));
    NurseryScope { prev }
}

/// The nursery the current thread is executing under, if any.
pub fn current() -> Option<NurseryId> {
    CURRENT.with(|c| c.get())
}

/// Restores the previous nursery on drop.
pub struct NurseryScope {
    prev: Option<NurseryId>,
}

impl Drop for NurseryScope {
    fn drop(&mut self) {
        let prev = self.prev;
        CURRENT.with(|c| c.set(prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_restore() {
        assert_eq!(current(), None);
        {
            let _outer = enter(7);
            assert_eq!(current(), Some(7));
            {
                let _inner = enter(9);
                assert_eq!(current(), Some(9));
            }
            assert_eq!(current(), Some(7));
        }
        assert_eq!(current(), None);
    }
}
