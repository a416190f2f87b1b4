// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, TxError>;

#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction failed")]
    Failed,

    #[error("word is locked")]
    LockPresent,

    #[error("object is stale")]
    StaleObject,

    #[error("size is not a positive multiple of the alignment")]
    SizeUnaligned,

    #[error("alignment is not a power of two")]
    BadAlignment,

    #[error("address is outside every shared segment")]
    UnknownAddress,

    #[error("allocation failed")]
    OutOfMemory,

    #[error("write access in a read-only transaction")]
    ReadOnly,

    #[error("word was freed earlier in the transaction")]
    UseAfterFree,

    #[error("segment was freed twice in the transaction")]
    DoubleFree,

    #[error("the start segment cannot be freed")]
    StartSegment,
}
