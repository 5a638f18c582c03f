use crate::event::Event;
use crate::sys;

use std::fmt;

/// A collection of readiness events filled in by one readiness-wait call.
///
/// Reused across calls the same way a `mio::Events` is: [`Base`](crate::Base)
/// allocates one once and refills it on every `dispatch` wakeup instead of
/// allocating a fresh batch per iteration.
pub struct Events {
    inner: sys::SysEvents,
}

/// Iterator over the [`Event`]s in an [`Events`].
#[derive(Clone)]
pub struct Iter<'a> {
    inner: &'a Events,
    pos: usize,
}

impl Events {
    /// Returns a new `Events` capable of holding up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: sys::SysEvents::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { inner: self, pos: 0 }
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn sys(&mut self) -> &mut sys::SysEvents {
        &mut self.inner
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        let ret = self.inner.inner.get(self.pos).map(|e| {
            // SAFETY: `Event` is `#[repr(transparent)]` over `sys::SysEvent`.
            unsafe { &*(e as *const sys::SysEvent as *const Event) }
        });
        self.pos += 1;
        ret
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {
    fn len(&self) -> usize {
        self.inner.inner.len().saturating_sub(self.pos)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("length", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}
