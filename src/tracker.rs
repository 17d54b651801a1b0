//! Dirty-rectangle tracker.
//!
//! For every secure-id buffer registered in this process the tracker keeps
//! an ordered sequence of [`DirtyRect`] records: one per registration, the
//! first of which is rewritten by every lock and read back by unlock to
//! scope the cache clean.
//!
//! The operations keep the behavior of the linked list this replaces:
//!
//! - [`insert_first`](RectTracker::insert_first) and
//!   [`insert_last`](RectTracker::insert_last) both place the new record
//!   right after the first record with the same identity, or at the end of
//!   the sequence when there is none. Neither inserts at the head.
//! - [`count`](RectTracker::count) counts list positions whose successor
//!   carries the identity. Behind the list's sentinel head every record has
//!   a predecessor, so this equals the number of records for the identity.
//! - [`release`](RectTracker::release) removes the first record for the
//!   identity.
//! - [`find`](RectTracker::find) returns the first record, or `None`.

use crate::memory::SecureId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Last-locked sub-rectangle of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyRect {
    /// Buffer identity.
    pub id: SecureId,
    /// Left edge in pixels.
    pub left: u32,
    /// Top edge in rows.
    pub top: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
    /// Row stride in bytes.
    pub stride: u32,
    /// Set once a lock has written the rectangle.
    pub locked: bool,
}

impl DirtyRect {
    /// Empty rectangle for a freshly registered buffer.
    pub fn new(id: SecureId, stride: u32) -> Self {
        Self {
            id,
            stride,
            ..Self::default()
        }
    }

    /// Byte offset of the first dirty row from the buffer base.
    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.stride as usize * self.top as usize
    }

    /// Bytes spanned by the dirty rows.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Mutex-guarded identity → records map.
#[derive(Debug, Default)]
pub struct RectTracker {
    records: Mutex<HashMap<SecureId, Vec<DirtyRect>>>,
}

impl RectTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<SecureId, Vec<DirtyRect>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert after the first record with the same identity.
    pub fn insert_first(&self, rect: DirtyRect) {
        tracing::trace!(secure_id = rect.id, "insert_first");
        self.insert_after_first_match(rect);
    }

    /// Insert after the first record with the same identity.
    ///
    /// Same placement as [`insert_first`](Self::insert_first).
    pub fn insert_last(&self, rect: DirtyRect) {
        tracing::trace!(secure_id = rect.id, "insert_last");
        self.insert_after_first_match(rect);
    }

    fn insert_after_first_match(&self, rect: DirtyRect) {
        let mut records = self.records();
        let seq = records.entry(rect.id).or_default();
        if seq.is_empty() {
            seq.push(rect);
        } else {
            seq.insert(1, rect);
        }
    }

    /// First record for `id`.
    pub fn find(&self, id: SecureId) -> Option<DirtyRect> {
        self.records().get(&id).and_then(|seq| seq.first().copied())
    }

    /// Apply `f` to the first record for `id`. Returns false if none exists.
    pub fn update_first(&self, id: SecureId, f: impl FnOnce(&mut DirtyRect)) -> bool {
        match self.records().get_mut(&id).and_then(|seq| seq.first_mut()) {
            Some(rect) => {
                f(rect);
                true
            }
            None => false,
        }
    }

    /// Positions whose successor carries `id`.
    pub fn count(&self, id: SecureId) -> usize {
        self.records().get(&id).map_or(0, Vec::len)
    }

    /// Remove the first record for `id`. Returns whether one was removed.
    pub fn release(&self, id: SecureId) -> bool {
        let mut records = self.records();
        let Some(seq) = records.get_mut(&id) else {
            return false;
        };
        if seq.is_empty() {
            records.remove(&id);
            return false;
        }
        seq.remove(0);
        if seq.is_empty() {
            records.remove(&id);
        }
        true
    }

    /// Undo the most recent insert for `id`.
    ///
    /// Inserts land after the first record, so that is the one removed while
    /// the first record, which lock and unlock read, is kept. A lone record
    /// is removed as is.
    pub fn release_inserted(&self, id: SecureId) -> bool {
        let mut records = self.records();
        let Some(seq) = records.get_mut(&id) else {
            return false;
        };
        match seq.len() {
            0 => {
                records.remove(&id);
                false
            }
            1 => {
                records.remove(&id);
                true
            }
            _ => {
                seq.remove(1);
                true
            }
        }
    }

    /// All records for `id`, in order.
    pub fn snapshot(&self, id: SecureId) -> Vec<DirtyRect> {
        self.records().get(&id).cloned().unwrap_or_default()
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.records().values().map(Vec::len).sum()
    }

    /// True if no records exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log every record at debug level.
    pub fn dump(&self) {
        let records = self.records();
        let mut ids: Vec<_> = records.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            for rect in &records[&id] {
                tracing::debug!(
                    secure_id = rect.id,
                    left = rect.left,
                    top = rect.top,
                    width = rect.width,
                    height = rect.height,
                    stride = rect.stride,
                    locked = rect.locked,
                    "dirty rect"
                );
            }
        }
    }
}
