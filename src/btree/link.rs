use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A published pointer to an immutable node.
///
/// Writers build the target completely before calling [`Link::publish`];
/// readers that [`Link::load`] either see the old target or the finished new
/// one. The lock is held only for the pointer copy.
pub struct Link<T> {
    slot: RwLock<Option<Arc<T>>>,
}

impl<T> Link<T> {
    pub fn new(target: Option<Arc<T>>) -> Self {
        Self {
            slot: RwLock::new(target),
        }
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.slot.read().clone()
    }

    pub fn publish(&self, target: Option<Arc<T>>) {
        *self.slot.write() = target;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.read().is_none()
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_empty() { "Link(empty)" } else { "Link(set)" })
    }
}
