// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Software Transactional Memory (STM)
//!
//! This module implements a variation of the TL2 algorithm described by
//! Shavit et al. over a shared memory region of aligned words. Access to
//! shared words is guarded by specialized word sized locks with integrated
//! versioning, and a global version clock orders all committing writers.
//! The algorithm differentiates between reading and writing transactions,
//! with read-only transactions skipping all bookkeeping.

use crate::{
    error::{Result, TxError},
    segment::Segment,
    transaction::Transaction,
    vlock::VersionClock,
};
use log::*;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};

/// Bound on the exponential backoff of [`Strategy::RetryWithBackoff`]
const MAX_BACKOFF_ROUNDS: usize = 7;

/// Controls how [`Stm::execute`] reacts to a failed transaction attempt.
#[derive(Clone, Copy)]
pub enum Strategy {
    /// Give up after the first failed attempt
    Abort,

    /// Retry executing the calling function until it commits. Conflicts
    /// are expected to be transient, so this is the default for contended
    /// workloads.
    Retry,

    /// Retry with an exponentially growing busy wait in between attempts,
    /// keeping heavily contended words reachable for other threads. Once
    /// the backoff reaches its bound the last error is surfaced.
    RetryWithBackoff,
}

/// A shared transactional memory region.
///
/// The region owns a start segment created up front, every segment
/// allocated inside transactions, the word alignment and the global
/// version clock. All transactional access goes through [`Stm::begin`] or
/// the retrying helpers.
pub struct Stm {
    /// Segments ordered by ascending buffer address
    segments: RwLock<Vec<Arc<Segment>>>,

    /// The non-deallocatable segment created with the region
    start: Arc<Segment>,

    /// Word size in bytes, a power of two
    align: usize,

    /// Global clock giving the number of transactions that have committed
    clock: VersionClock,

    transaction_ids: AtomicUsize,
}

impl Stm {
    /// Creates a region with one non-deallocatable segment of `size`
    /// bytes. `align` is the word size in bytes and must be a power of
    /// two; `size` must be a positive multiple of it.
    pub fn new(size: usize, align: usize) -> Result<Self> {
        if !align.is_power_of_two() {
            return Err(TxError::BadAlignment);
        }
        if size == 0 || size % align != 0 {
            return Err(TxError::SizeUnaligned);
        }

        let start = Arc::new(Segment::new(size, align, 0)?);

        Ok(Self {
            segments: RwLock::new(vec![start.clone()]),
            start,
            align,
            clock: VersionClock::default(),
            transaction_ids: AtomicUsize::new(0),
        })
    }

    /// Base address of the start segment
    pub fn start(&self) -> usize {
        self.start.base()
    }

    /// Size of the start segment in bytes
    pub fn size(&self) -> usize {
        self.start.len()
    }

    /// Word size in bytes
    pub fn align(&self) -> usize {
        self.align
    }

    /// Current value of the global version clock
    pub fn clock(&self) -> usize {
        self.clock.version()
    }

    pub(crate) fn increment_clock(&self) -> usize {
        self.clock.increment()
    }

    /// Begins a transaction whose snapshot is the current clock value.
    ///
    /// The transaction is single-attempt: any conflict aborts it and the
    /// caller decides whether to begin a new one. See [`Stm::execute`] for
    /// a retrying wrapper.
    pub fn begin(&self, is_ro: bool) -> Transaction<'_> {
        let id = self.transaction_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let rv = self.clock.version();
        info!("TX({}): START. GLOBAL VERSION ({})", id, rv);

        Transaction::new(self, id, rv, is_ro)
    }

    /// Runs `func` inside transactions until one commits, according to
    /// `strategy`. The engine itself never retries; this helper re-begins
    /// a fresh transaction per attempt and hands back the value returned
    /// by the committed run.
    pub fn execute<F, U>(&self, is_ro: bool, strategy: Strategy, func: F) -> Result<U>
    where
        F: Fn(&mut Transaction<'_>) -> Result<U>,
    {
        let mut backoff = 0;

        loop {
            let mut tx = self.begin(is_ro);
            let err = match func(&mut tx) {
                Ok(res) => match tx.commit() {
                    Ok(()) => return Ok(res),
                    Err(e) => e,
                },
                Err(e) => e,
            };

            match strategy {
                Strategy::Abort => return Err(err),
                Strategy::Retry => {}
                Strategy::RetryWithBackoff => {
                    if backoff > MAX_BACKOFF_ROUNDS {
                        return Err(err);
                    }
                    // keep the CPU busy for a doubling number of spin
                    // hints before the next attempt
                    for _ in 0..(1usize << backoff) {
                        std::hint::spin_loop();
                    }
                    backoff += 1;
                }
            }
        }
    }

    /// Shorthand for [`Stm::execute`] with a read-write transaction and
    /// the [`Strategy::Retry`] strategy
    pub fn read_write<F, U>(&self, func: F) -> Result<U>
    where
        F: Fn(&mut Transaction<'_>) -> Result<U>,
    {
        self.execute(false, Strategy::Retry, func)
    }

    /// Shorthand for [`Stm::execute`] with a read-only transaction and
    /// the [`Strategy::Retry`] strategy
    pub fn read_only<F, U>(&self, func: F) -> Result<U>
    where
        F: Fn(&mut Transaction<'_>) -> Result<U>,
    {
        self.execute(true, Strategy::Retry, func)
    }

    /// Locates the segment covering `addr`. The returned handle keeps the
    /// buffer alive even if a concurrent commit unlinks the segment.
    pub(crate) fn find_segment(&self, addr: usize) -> Result<Arc<Segment>> {
        let segments = self.segments.read().expect("segment list poisoned");

        let idx = segments.partition_point(|segment| segment.base() <= addr);
        if idx == 0 {
            return Err(TxError::UnknownAddress);
        }

        let segment = &segments[idx - 1];
        if segment.contains(addr) {
            Ok(segment.clone())
        } else {
            Err(TxError::UnknownAddress)
        }
    }

    /// Inserts `segment` into the address ordered list.
    pub(crate) fn add_segment(&self, segment: Arc<Segment>) {
        let mut segments = self.segments.write().expect("segment list poisoned");

        let idx = segments.partition_point(|other| other.base() < segment.base());
        segments.insert(idx, segment);
    }

    /// Unlinks the segment with the given base address. The buffer is
    /// released once the last in-flight reference drops.
    pub(crate) fn remove_segment(&self, base: usize) -> Option<Arc<Segment>> {
        let mut segments = self.segments.write().expect("segment list poisoned");

        let idx = segments.iter().position(|segment| segment.base() == base)?;
        Some(segments.remove(idx))
    }
}
