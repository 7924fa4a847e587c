use crate::btree::link::Link;
use bytes::Bytes;
use std::sync::Arc;

/// One version of a key's value, newest first.
#[derive(Debug)]
pub struct Update {
    value: Option<Bytes>,
    next: Option<Arc<Update>>,
}

pub type UpdateList = Link<Update>;

impl Update {
    pub fn new(value: Option<Bytes>, next: Option<Arc<Update>>) -> Self {
        Self { value, next }
    }

    /// `None` for a deletion.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }

    pub fn next(&self) -> Option<&Arc<Update>> {
        self.next.as_ref()
    }

    pub fn memsize(&self) -> usize {
        std::mem::size_of::<Self>() + self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// Push a new version on the head of a chain.
///
/// Callers hold the page's write serialization.
pub(crate) fn push_update(list: &UpdateList, value: Option<Bytes>) -> Arc<Update> {
    let upd = Arc::new(Update::new(value, list.load()));
    list.publish(Some(upd.clone()));
    upd
}
