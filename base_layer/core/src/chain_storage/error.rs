// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use sable_storage::StorageError;
use thiserror::Error;

use crate::{common::FixedHash, transactions::encoding::EncodingError};

#[derive(Debug, Error)]
pub enum ChainStorageError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Encoding error: {0}")]
    EncodingError(#[from] EncodingError),
    #[error("Could not decode a persisted record in '{store}': {message}")]
    CorruptRecord { store: &'static str, message: String },
    #[error("Block {0} is not in the store")]
    BlockNotFound(FixedHash),
    #[error("Coinview save rejected: caller's old tip {given} does not match the current tip {expected}")]
    InvalidOldTip { expected: FixedHash, given: FixedHash },
    #[error("The transaction index is not enabled")]
    TransactionIndexDisabled,
    #[error("Block store initialization failed: {0}")]
    InitializationFailed(String),
    #[error(
        "The stored chain is inconsistent: walked back from {from} without reaching expected predecessor {expected}"
    )]
    BrokenStoredChain { from: FixedHash, expected: FixedHash },
}
