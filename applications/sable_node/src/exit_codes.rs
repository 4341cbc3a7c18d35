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

use std::fmt;

use thiserror::Error;

/// The process exits with one of these codes on a fatal error; a clean shutdown exits 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    ConfigError = 101,
    StorageError = 102,
    NetworkError = 103,
    FatalRuntimeError = 104,
    LoggingError = 105,
}

impl ExitCode {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ExitCode::ConfigError => Some("Check the configuration file and command-line options."),
            ExitCode::StorageError => Some(
                "The data directory may be corrupt or was created with incompatible options (for example a \
                 different txindex setting).",
            ),
            ExitCode::NetworkError => Some("Check that the listen endpoints are available."),
            _ => None,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

#[derive(Debug, Error)]
#[error("{code}: {details}")]
pub struct ExitError {
    pub code: ExitCode,
    pub details: String,
}

impl ExitError {
    pub fn new<T: ToString>(code: ExitCode, details: T) -> Self {
        Self {
            code,
            details: details.to_string(),
        }
    }
}

impl From<sable_storage::StorageError> for ExitError {
    fn from(err: sable_storage::StorageError) -> Self {
        ExitError::new(ExitCode::StorageError, err)
    }
}

impl From<sable_core::chain_storage::ChainStorageError> for ExitError {
    fn from(err: sable_core::chain_storage::ChainStorageError) -> Self {
        ExitError::new(ExitCode::StorageError, err)
    }
}

impl From<sable_core::base_node::address_index::AddressIndexError> for ExitError {
    fn from(err: sable_core::base_node::address_index::AddressIndexError) -> Self {
        ExitError::new(ExitCode::StorageError, err)
    }
}

impl From<config::ConfigError> for ExitError {
    fn from(err: config::ConfigError) -> Self {
        ExitError::new(ExitCode::ConfigError, err)
    }
}
