// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{Result, TxError},
    segment::Segment,
    sets::{ReadSet, WriteEntry, WriteSet},
    stm::Stm,
};
use log::*;
use std::sync::Arc;
use zeroize::Zeroizing;

/// A single-attempt transaction over a shared memory region.
///
/// Reads are served from a consistent snapshot of the region, writes land
/// in a private shadow buffer until [`Transaction::commit`]. Any conflict
/// or contract violation aborts the transaction: all buffered state is
/// dropped, segments allocated by the transaction are unlinked again, and
/// every further operation fails with [`TxError::Failed`].
pub struct Transaction<'tm> {
    stm: &'tm Stm,

    /// Transaction id, used in log lines
    id: usize,

    /// A snapshot of the global version clock, taken at begin
    rv: usize,

    is_ro: bool,

    aborted: bool,
    committed: bool,

    reads: ReadSet,
    writes: WriteSet,

    /// Base addresses of the segments allocated by this transaction,
    /// unlinked again if it does not commit
    allocated: Vec<usize>,
}

impl<'tm> Transaction<'tm> {
    pub(crate) fn new(stm: &'tm Stm, id: usize, rv: usize, is_ro: bool) -> Self {
        Self {
            stm,
            id,
            rv,
            is_ro,
            aborted: false,
            committed: false,
            reads: ReadSet::default(),
            writes: WriteSet::default(),
            allocated: Vec::new(),
        }
    }

    /// Returns `true`, if the transaction was started read-only
    pub fn is_read_only(&self) -> bool {
        self.is_ro
    }

    /// Reads `dst.len()` bytes from the shared address `src` into the
    /// private buffer `dst`. The length must be a positive multiple of the
    /// region alignment.
    ///
    /// Words already shadowed by this transaction are served from the
    /// write set, every other word is read speculatively: its lock is
    /// sampled before and after the copy and the bytes only count if both
    /// samples agree on an unlocked word no newer than the snapshot.
    pub fn read(&mut self, src: usize, dst: &mut [u8]) -> Result<()> {
        self.ensure_active()?;
        if let Err(e) = self.check_size(dst.len()) {
            return Err(self.abort(e));
        }

        let align = self.stm.align();
        for (i, word) in dst.chunks_exact_mut(align).enumerate() {
            let addr = src + i * align;
            if let Err(e) = Self::read_word(
                self.stm,
                self.rv,
                self.is_ro,
                &self.writes,
                &mut self.reads,
                addr,
                word,
            ) {
                return Err(self.abort(e));
            }
        }

        Ok(())
    }

    fn read_word(
        stm: &Stm,
        rv: usize,
        is_ro: bool,
        writes: &WriteSet,
        reads: &mut ReadSet,
        addr: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        if !is_ro {
            if let Some(entry) = writes.get(addr) {
                if entry.is_freed {
                    return Err(TxError::UseAfterFree);
                }
                if let Some(src) = &entry.src {
                    dst.copy_from_slice(src);
                    return Ok(());
                }
            }
        }

        let segment = stm.find_segment(addr)?;
        let lock = segment.lock_for(addr).clone();

        let (pre_version, _) = lock.sample();
        if pre_version > rv {
            return Err(TxError::StaleObject);
        }

        segment.read_word(addr, dst);

        let (post_version, post_locked) = lock.sample();
        if post_locked {
            return Err(TxError::LockPresent);
        }
        if post_version != pre_version {
            return Err(TxError::StaleObject);
        }

        if !is_ro {
            reads.record(addr, lock);
        }

        Ok(())
    }

    /// Writes the private buffer `src` to the shared address `dest`. The
    /// length must be a positive multiple of the region alignment. The
    /// bytes land in a shadow copy and reach shared memory at commit.
    pub fn write(&mut self, src: &[u8], dest: usize) -> Result<()> {
        self.ensure_active()?;
        if self.is_ro {
            return Err(self.abort(TxError::ReadOnly));
        }
        if let Err(e) = self.check_size(src.len()) {
            return Err(self.abort(e));
        }

        let align = self.stm.align();
        for (i, word) in src.chunks_exact(align).enumerate() {
            let addr = dest + i * align;
            if let Err(e) = self.write_word(addr, word) {
                return Err(self.abort(e));
            }
        }

        Ok(())
    }

    fn write_word(&mut self, addr: usize, word: &[u8]) -> Result<()> {
        if let Some(entry) = self.writes.get_mut(addr) {
            if entry.is_freed {
                return Err(TxError::UseAfterFree);
            }
            if let Some(src) = entry.src.as_mut() {
                src.copy_from_slice(word);
            }
            return Ok(());
        }

        let segment = self.stm.find_segment(addr)?;
        self.writes.insert(
            addr,
            WriteEntry {
                src: Some(Zeroizing::new(word.to_vec())),
                lock: segment.lock_for(addr).clone(),
                segment,
                is_freed: false,
                seg_to_free: None,
            },
        );

        Ok(())
    }

    /// Allocates a fresh zeroed segment of `size` bytes and publishes it
    /// in the region. Returns the base address of the segment.
    ///
    /// An allocator failure surfaces as [`TxError::OutOfMemory`] without
    /// aborting the transaction, so the caller may shrink the request and
    /// try again. An invalid size aborts.
    pub fn alloc(&mut self, size: usize) -> Result<usize> {
        self.ensure_active()?;
        if let Err(e) = self.check_size(size) {
            return Err(self.abort(e));
        }

        // fresh words carry the snapshot version so this transaction can
        // read them back
        let segment = match Segment::new(size, self.stm.align(), self.rv) {
            Ok(segment) => Arc::new(segment),
            Err(TxError::OutOfMemory) => return Err(TxError::OutOfMemory),
            Err(e) => return Err(self.abort(e)),
        };

        let base = segment.base();
        self.stm.add_segment(segment);
        self.allocated.push(base);
        info!("TX({}): ALLOC SEGMENT ({:#x})", self.id, base);

        Ok(base)
    }

    /// Schedules the segment starting at `target` for deallocation. Every
    /// word of the segment is marked freed; the segment is unlinked when
    /// the transaction commits.
    pub fn free(&mut self, target: usize) -> Result<()> {
        self.ensure_active()?;
        if self.is_ro {
            return Err(self.abort(TxError::ReadOnly));
        }
        if target == self.stm.start() {
            return Err(self.abort(TxError::StartSegment));
        }

        let segment = match self.stm.find_segment(target) {
            Ok(segment) => segment,
            Err(e) => return Err(self.abort(e)),
        };
        if target != segment.base() {
            return Err(self.abort(TxError::UnknownAddress));
        }

        let align = self.stm.align();
        for i in 0..segment.word_count() {
            let addr = segment.base() + i * align;
            if let Some(entry) = self.writes.get_mut(addr) {
                if entry.is_freed {
                    return Err(self.abort(TxError::DoubleFree));
                }
                entry.is_freed = true;
            } else {
                self.writes.insert(
                    addr,
                    WriteEntry {
                        src: None,
                        lock: segment.lock_for(addr).clone(),
                        segment: segment.clone(),
                        is_freed: true,
                        seg_to_free: None,
                    },
                );
            }
        }

        // the entry covering the first word carries the unlink marker
        if let Some(entry) = self.writes.get_mut(segment.base()) {
            entry.seg_to_free = Some(segment.base());
        }
        info!("TX({}): FREE SEGMENT ({:#x})", self.id, target);

        Ok(())
    }

    /// Ends the transaction.
    ///
    /// A read-only transaction commits by discarding its state. A
    /// read-write transaction runs the TL2 sequence:
    ///
    /// 1. Lock every word of the write set, in ascending address order.
    /// 2. Increment the global clock; the new value is the write version.
    /// 3. Validate the read set against the snapshot, unless no other
    ///    transaction committed in between.
    /// 4. Write the shadow copies back, release every lock with the write
    ///    version and unlink freed segments.
    pub fn commit(mut self) -> Result<()> {
        if self.aborted {
            return Err(TxError::Failed);
        }
        if self.is_ro {
            info!("TX({}): READ ONLY COMMIT", self.id);
            self.committed = true;
            return Ok(());
        }

        if let Err(e) = self.writes.acquire_locks() {
            info!("TX({}): LOCKING WRITE SET FAILED", self.id);
            return Err(self.abort(e));
        }

        let wv = self.stm.increment_clock();
        info!("TX({}): INCREMENT GLOBAL VERSION ({})", self.id, wv);

        if let Err(e) = self.reads.validate(&self.writes, self.rv, wv) {
            info!("TX({}): VALIDATING READ SET FAILED", self.id);
            self.writes.release_locks();
            return Err(self.abort(e));
        }

        for base in self.writes.commit_release(wv) {
            self.stm.remove_segment(base);
        }

        info!("TX({}): COMMITTED ({})", self.id, wv);
        self.committed = true;
        Ok(())
    }

    /// Drops all buffered state, rolls back this transaction's segment
    /// allocations and poisons the transaction.
    fn abort(&mut self, reason: TxError) -> TxError {
        info!("TX({}): ABORT ({})", self.id, reason);

        self.aborted = true;
        self.reads.clear();
        self.writes.clear();
        for base in self.allocated.drain(..) {
            self.stm.remove_segment(base);
        }

        reason
    }

    fn ensure_active(&self) -> Result<()> {
        if self.aborted {
            return Err(TxError::Failed);
        }
        Ok(())
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size == 0 || size % self.stm.align() != 0 {
            return Err(TxError::SizeUnaligned);
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // abandoning a live transaction aborts it
        if !self.committed {
            for base in self.allocated.drain(..) {
                self.stm.remove_segment(base);
            }
        }
    }
}
