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

//! The seam to the external block-validation rule engine. The node never re-implements consensus rules; it
//! hands candidate blocks to a [`BlockValidator`] and reacts to the verdict. Validation failures carry an
//! optional ban classification for the peer that supplied the block.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;

use crate::{blocks::Block, common::BanReason};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Block failed validation: {0}")]
    BlockError(String),
    #[error("Block contains an unknown or immature input: {0}")]
    InvalidInput(String),
    #[error("Fatal storage error during validation: {0}")]
    FatalStorageError(String),
}

impl ValidationError {
    pub fn get_ban_reason(&self, long_ban: Duration) -> Option<BanReason> {
        match self {
            err @ ValidationError::BlockError(_) | err @ ValidationError::InvalidInput(_) => {
                Some(BanReason::new(err, long_ban))
            },
            ValidationError::FatalStorageError(_) => None,
        }
    }
}

/// Validates a block body in the context of the chain it extends. Implementations may block; callers run
/// them on a blocking task.
pub trait BlockValidator: Send + Sync {
    fn validate_block(&self, block: &Block, height: u64) -> Result<(), ValidationError>;
}

/// A validator that accepts or rejects everything, switchable at runtime. Test use, and a placeholder until
/// a rule engine is attached.
#[derive(Clone)]
pub struct MockValidator {
    is_valid: Arc<AtomicBool>,
}

impl MockValidator {
    pub fn new(is_valid: bool) -> Self {
        Self {
            is_valid: Arc::new(AtomicBool::new(is_valid)),
        }
    }

    pub fn set_valid(&self, is_valid: bool) {
        self.is_valid.store(is_valid, Ordering::SeqCst);
    }
}

impl BlockValidator for MockValidator {
    fn validate_block(&self, block: &Block, _height: u64) -> Result<(), ValidationError> {
        if self.is_valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ValidationError::BlockError(format!(
                "mock validator rejected {}",
                block.hash()
            )))
        }
    }
}
