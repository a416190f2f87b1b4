// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction read and write buffers.

use crate::{error::TxError, segment::Segment, vlock::VersionLock};
use std::{collections::BTreeMap, sync::Arc};
use zeroize::Zeroizing;

/// A single shadowed word.
pub(crate) struct WriteEntry {
    /// Private copy of the bytes to commit. `None` once the entry only
    /// marks a pending deallocation.
    pub src: Option<Zeroizing<Vec<u8>>>,

    /// The lock guarding the destination word
    pub lock: VersionLock,

    /// Handle on the segment holding the destination word. A concurrent
    /// commit may unlink the segment from the region at any time; this
    /// reference keeps the buffer alive until the entry is dropped.
    pub segment: Arc<Segment>,

    /// The word belongs to a segment scheduled for deallocation
    pub is_freed: bool,

    /// Base address of the segment to unlink when this entry commits. Set
    /// on the entry covering the segment's first word.
    pub seg_to_free: Option<usize>,
}

/// The write set keeps shadow copies keyed by destination address. The
/// ordered map gives every transaction the same deterministic lock
/// acquisition order and guarantees one entry per destination.
#[derive(Default)]
pub(crate) struct WriteSet {
    entries: BTreeMap<usize, WriteEntry>,
}

impl WriteSet {
    pub fn get(&self, dest: usize) -> Option<&WriteEntry> {
        self.entries.get(&dest)
    }

    pub fn get_mut(&mut self, dest: usize) -> Option<&mut WriteEntry> {
        self.entries.get_mut(&dest)
    }

    pub fn contains(&self, dest: usize) -> bool {
        self.entries.contains_key(&dest)
    }

    pub fn insert(&mut self, dest: usize, entry: WriteEntry) {
        self.entries.insert(dest, entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Tries to lock every word that will be written back. On a conflict
    /// all locks acquired so far are released with their versions
    /// untouched.
    pub fn acquire_locks(&self) -> Result<(), TxError> {
        let mut acquired: Vec<&VersionLock> = Vec::with_capacity(self.entries.len());

        for entry in self.entries.values() {
            if entry.is_freed {
                continue;
            }
            if entry.lock.try_lock().is_err() {
                for lock in acquired.drain(..) {
                    lock.release();
                }
                return Err(TxError::LockPresent);
            }
            acquired.push(&entry.lock);
        }

        Ok(())
    }

    /// Releases every held lock without touching versions. Used when the
    /// commit fails after acquisition.
    pub fn release_locks(&self) {
        for entry in self.entries.values() {
            if !entry.is_freed {
                entry.lock.release();
            }
        }
    }

    /// Writes every shadow copy back to shared memory and releases its
    /// lock with the new version `wv`. Returns the base addresses of the
    /// segments scheduled for deallocation.
    pub fn commit_release(&self, wv: usize) -> Vec<usize> {
        let mut unlink = Vec::new();

        for (dest, entry) in &self.entries {
            if entry.is_freed {
                if let Some(base) = entry.seg_to_free {
                    unlink.push(base);
                }
                continue;
            }
            if let Some(src) = &entry.src {
                // the lock is held, publishing the version happens after
                // the bytes landed
                entry.segment.write_word(*dest, src);
            }
            entry.lock.release_set(wv);
        }

        unlink
    }
}

/// The read set records the locks observed by speculative reads, in
/// observation order. Duplicates are tolerated.
#[derive(Default)]
pub(crate) struct ReadSet {
    entries: Vec<(usize, VersionLock)>,
}

impl ReadSet {
    pub fn record(&mut self, addr: usize, lock: VersionLock) {
        self.entries.push((addr, lock));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Validates every observed word against the snapshot version `rv`.
    ///
    /// When `wv == rv + 1` no other transaction committed in between and
    /// the set is trivially valid. A locked entry is accepted iff the lock
    /// is our own, that is its address sits in `writes`; the version bound
    /// still applies to such entries, since the holder only advances the
    /// version on release.
    pub fn validate(&self, writes: &WriteSet, rv: usize, wv: usize) -> Result<(), TxError> {
        if wv == rv + 1 {
            return Ok(());
        }

        for (addr, lock) in &self.entries {
            let (version, locked) = lock.sample();
            if version > rv {
                return Err(TxError::StaleObject);
            }
            if locked && !writes.contains(*addr) {
                return Err(TxError::LockPresent);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadSet, WriteEntry, WriteSet};
    use crate::{error::TxError, segment::Segment, vlock::VersionLock};
    use std::sync::Arc;
    use zeroize::Zeroizing;

    fn entry(segment: &Arc<Segment>, addr: usize, value: u64) -> WriteEntry {
        WriteEntry {
            src: Some(Zeroizing::new(value.to_le_bytes().to_vec())),
            lock: segment.lock_for(addr).clone(),
            segment: segment.clone(),
            is_freed: false,
            seg_to_free: None,
        }
    }

    fn freed_entry(segment: &Arc<Segment>, addr: usize, seg_to_free: Option<usize>) -> WriteEntry {
        WriteEntry {
            src: None,
            lock: segment.lock_for(addr).clone(),
            segment: segment.clone(),
            is_freed: true,
            seg_to_free,
        }
    }

    #[test]
    fn test_acquire_locks_rolls_back_on_conflict() {
        let segment = Arc::new(Segment::new(16, 8, 0).expect("failed to allocate segment"));
        let a = segment.base();
        let b = a + 8;
        segment.lock_for(b).try_lock().expect("failed to acquire lock");

        let mut writes = WriteSet::default();
        writes.insert(a, entry(&segment, a, 0));
        writes.insert(b, entry(&segment, b, 0));

        assert_eq!(writes.acquire_locks(), Err(TxError::LockPresent));

        // the first lock was taken and released again, versions untouched
        assert!(!segment.lock_for(a).is_locked());
        assert_eq!(segment.lock_for(a).version(), 0);
    }

    #[test]
    fn test_acquire_skips_freed_entries() {
        let segment = Arc::new(Segment::new(8, 8, 0).expect("failed to allocate segment"));
        let a = segment.base();
        segment.lock_for(a).try_lock().expect("failed to acquire lock");

        let mut writes = WriteSet::default();
        writes.insert(a, freed_entry(&segment, a, Some(a)));

        // a freed word is never locked, the held lock does not conflict
        assert_eq!(writes.acquire_locks(), Ok(()));
    }

    #[test]
    fn test_commit_release_writes_back() {
        let segment = Arc::new(Segment::new(8, 8, 0).expect("failed to allocate segment"));
        let a = segment.base();

        let mut writes = WriteSet::default();
        writes.insert(a, entry(&segment, a, 9));
        writes.acquire_locks().expect("failed to acquire locks");

        assert_eq!(writes.commit_release(5), Vec::<usize>::new());

        let mut word = [0u8; 8];
        segment.read_word(a, &mut word);
        assert_eq!(u64::from_le_bytes(word), 9);
        assert_eq!(segment.lock_for(a).sample(), (5, false));
    }

    #[test]
    fn test_commit_release_returns_segments_to_unlink() {
        let segment = Arc::new(Segment::new(16, 8, 0).expect("failed to allocate segment"));
        let a = segment.base();
        let b = a + 8;

        let mut writes = WriteSet::default();
        writes.insert(a, freed_entry(&segment, a, Some(a)));
        writes.insert(b, freed_entry(&segment, b, None));

        assert_eq!(writes.commit_release(7), vec![a]);
    }

    #[test]
    fn test_entries_keep_the_segment_buffer_alive() {
        let segment = Arc::new(Segment::new(8, 8, 0).expect("failed to allocate segment"));
        let a = segment.base();

        let mut writes = WriteSet::default();
        writes.insert(a, entry(&segment, a, 3));

        // the region dropping its handle must not free the buffer under a
        // pending write-back
        drop(segment);

        let pending = writes.get(a).expect("entry missing");
        pending.lock.try_lock().expect("failed to acquire lock");
        writes.commit_release(1);

        let mut word = [0u8; 8];
        writes.get(a).expect("entry missing").segment.read_word(a, &mut word);
        assert_eq!(u64::from_le_bytes(word), 3);
    }

    #[test]
    fn test_validate_trivial_when_no_interleaving_commit() {
        let lock = VersionLock::new(100);
        let mut reads = ReadSet::default();
        reads.record(0x1000, lock);

        // rv = 4, wv = 5: nobody else committed, stale versions are fine
        assert_eq!(reads.validate(&WriteSet::default(), 4, 5), Ok(()));
    }

    #[test]
    fn test_validate_rejects_stale_versions() {
        let lock = VersionLock::new(3);
        let mut reads = ReadSet::default();
        reads.record(0x1000, lock);

        assert_eq!(reads.validate(&WriteSet::default(), 2, 9), Err(TxError::StaleObject));
    }

    #[test]
    fn test_validate_rejects_foreign_locks() {
        let lock = VersionLock::new(1);
        lock.try_lock().expect("failed to acquire lock");

        let mut reads = ReadSet::default();
        reads.record(0x1000, lock);

        assert_eq!(reads.validate(&WriteSet::default(), 2, 9), Err(TxError::LockPresent));
    }

    #[test]
    fn test_validate_accepts_own_locks() {
        let segment = Arc::new(Segment::new(8, 8, 0).expect("failed to allocate segment"));
        let a = segment.base();
        let lock = segment.lock_for(a).clone();
        lock.try_lock().expect("failed to acquire lock");

        let mut writes = WriteSet::default();
        writes.insert(a, entry(&segment, a, 0));

        let mut reads = ReadSet::default();
        reads.record(a, lock);

        assert_eq!(reads.validate(&writes, 2, 9), Ok(()));
    }
}
