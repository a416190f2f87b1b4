// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Transactional Memory
//!
//! This crate implements a word granular software transactional memory
//! following the TL2 algorithm by Shavit et al. A [`Stm`] region hands out
//! aligned shared memory; threads operate on it through transactions whose
//! reads, writes, allocations and frees either take effect atomically at
//! commit, or abort without a trace. Consistency comes from a global
//! version clock combined with one versioned lock per shared word.
//!
//! Transactions are single-attempt: a conflict aborts, and retrying is up
//! to the caller. [`Stm::execute`] and its shorthands wrap the retry loop
//! with a configurable [`Strategy`].
//!
//! ```
//! use stronghold_tm::Stm;
//!
//! let stm = Stm::new(8, 8).expect("failed to create region");
//! let start = stm.start();
//!
//! let mut tx = stm.begin(false);
//! tx.write(&0xFFFFu64.to_le_bytes(), start).expect("write failed");
//! tx.commit().expect("commit failed");
//!
//! let mut word = [0u8; 8];
//! let mut tx = stm.begin(true);
//! tx.read(start, &mut word).expect("read failed");
//! tx.commit().expect("commit failed");
//!
//! assert_eq!(u64::from_le_bytes(word), 0xFFFF);
//! ```

pub mod error;
pub mod segment;
pub mod stm;
pub mod transaction;
pub mod vlock;

mod sets;

pub use error::{Result, TxError};
pub use segment::Segment;
pub use stm::{Stm, Strategy};
pub use transaction::Transaction;
pub use vlock::{VersionClock, VersionLock};
