//! C5: one-shot timer bound to a [`Base`](crate::base::Base) (spec §4.9).
//!
//! Simplified from upstream `mio`'s old tick-wheel `Timer<T>` (`src/timer.rs`
//! in the pack): that file slab-allocates many *recurring* slots walked by a
//! wheel cursor. The spec only wants one pending deadline per handle that
//! fires once, so this keeps the "slot holds a deadline plus a callback,
//! re-register on every `set`" idea and drops the wheel/cursor machinery in
//! favor of a plain deadline-ordered min-heap (`BinaryHeap<Reverse<_>>`).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::base::Base;

/// One pending-or-fired entry in the base's timer heap.
struct Slot {
    callback: Box<dyn FnMut()>,
    enabled: bool,
    /// Bumped on every `set`/`disable` so a heap entry computed for a
    /// previous arming can be recognized as stale and skipped rather than
    /// firing the wrong deadline.
    generation: u64,
}

/// The deadline-ordered heap `Base` owns; one entry per `set` call (stale
/// entries accumulate and are discarded lazily rather than removed eagerly,
/// since a binary heap has no efficient arbitrary-element removal).
#[derive(Default)]
pub(crate) struct TimerHeap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
}

impl TimerHeap {
    pub(crate) fn new() -> TimerHeap {
        TimerHeap::default()
    }

    pub(crate) fn insert(&mut self, callback: Box<dyn FnMut()>) -> usize {
        let slot = Slot { callback, enabled: false, generation: 0 };
        if let Some(id) = self.free.pop() {
            self.slots[id] = Some(slot);
            id
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    pub(crate) fn remove(&mut self, id: usize) {
        if let Some(slot) = self.slots.get_mut(id).and_then(Option::take) {
            drop(slot);
            self.free.push(id);
        }
    }

    pub(crate) fn set(&mut self, id: usize, now: Instant, duration: Duration) {
        if let Some(Some(slot)) = self.slots.get_mut(id) {
            slot.enabled = true;
            slot.generation += 1;
            let deadline = now + duration;
            self.heap.push(Reverse((deadline, id, slot.generation)));
        }
    }

    pub(crate) fn disable(&mut self, id: usize) {
        if let Some(Some(slot)) = self.slots.get_mut(id) {
            slot.enabled = false;
            slot.generation += 1;
        }
    }

    pub(crate) fn is_set(&self, id: usize) -> bool {
        matches!(self.slots.get(id), Some(Some(slot)) if slot.enabled)
    }

    /// The soonest live deadline, used to bound the selector's wait timeout.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Fires every timer whose deadline has passed, in deadline order.
    pub(crate) fn fire_due(&mut self, now: Instant) {
        while let Some(Reverse((deadline, id, generation))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            let Some(Some(slot)) = self.slots.get_mut(id) else { continue };
            if !slot.enabled || slot.generation != generation {
                continue; // stale: disabled, deleted, or re-armed since this entry was pushed
            }
            slot.enabled = false;
            // Take the callback out so the heap/slots aren't borrowed while
            // user code (which may call back into the timer API) runs.
            let mut callback = std::mem::replace(&mut slot.callback, Box::new(|| {}));
            callback();
            if let Some(Some(slot)) = self.slots.get_mut(id) {
                slot.callback = callback;
            }
        }
    }
}

/// A one-shot timer handle created against a [`Base`].
///
/// `Timer` itself is just an index into the base's timer heap; all state
/// lives in the `Base` it was created from, matching the arena-index style
/// used for the TCP handler free-list (spec §9).
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    id: usize,
}

impl Timer {
    /// Registers `callback` with `base`, initially disabled. Call [`set`]
    /// to arm it.
    ///
    /// [`set`]: Timer::set
    pub fn create(base: &mut Base, callback: impl FnMut() + 'static) -> Timer {
        let id = base.timers_mut().insert(Box::new(callback));
        Timer { id }
    }

    /// Arms (or re-arms) the timer to fire `duration` from now. Per spec
    /// §4.9, re-arming an already-enabled timer implicitly disables then
    /// re-enables it — the old deadline's heap entry is left in place but
    /// will be recognized as stale by its generation number and skipped.
    pub fn set(&self, base: &mut Base, duration: Duration) {
        let now = base.clock().now();
        base.timers_mut().set(self.id, now, duration);
    }

    /// Disables the timer; it will not fire until [`set`](Timer::set) again.
    pub fn disable(&self, base: &mut Base) {
        base.timers_mut().disable(self.id);
    }

    /// True from `set` until either `disable` or the callback firing.
    pub fn is_set(&self, base: &Base) -> bool {
        base.timers().is_set(self.id)
    }

    /// Releases the timer's slot. The handle must not be used afterward.
    pub fn delete(self, base: &mut Base) {
        base.timers_mut().remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn fires_once_and_clears_enabled() {
        let mut heap = TimerHeap::new();
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        let id = heap.insert(Box::new(move || fired2.set(fired2.get() + 1)));

        let t0 = Instant::now();
        heap.set(id, t0, Duration::from_millis(10));
        assert!(heap.is_set(id));

        heap.fire_due(t0 + Duration::from_millis(20));
        assert_eq!(fired.get(), 1);
        assert!(!heap.is_set(id));

        // Firing again with no re-arm is a no-op.
        heap.fire_due(t0 + Duration::from_secs(1));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn re_set_invalidates_the_old_deadline() {
        let mut heap = TimerHeap::new();
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        let id = heap.insert(Box::new(move || fired2.set(fired2.get() + 1)));

        let t0 = Instant::now();
        heap.set(id, t0, Duration::from_millis(10));
        heap.set(id, t0, Duration::from_millis(1000)); // re-arm further out

        // The stale 10ms entry should not fire the callback early.
        heap.fire_due(t0 + Duration::from_millis(50));
        assert_eq!(fired.get(), 0);
        assert!(heap.is_set(id));

        heap.fire_due(t0 + Duration::from_millis(1500));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn disable_prevents_firing() {
        let mut heap = TimerHeap::new();
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        let id = heap.insert(Box::new(move || fired2.set(fired2.get() + 1)));

        let t0 = Instant::now();
        heap.set(id, t0, Duration::from_millis(10));
        heap.disable(id);
        heap.fire_due(t0 + Duration::from_millis(20));
        assert_eq!(fired.get(), 0);
    }
}
