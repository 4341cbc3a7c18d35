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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame carried the wrong network magic (got {got:02x?})")]
    BadMagic { got: [u8; 4] },
    #[error("Frame checksum did not match its payload for command '{command}'")]
    BadChecksum { command: String },
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
    #[error("Frame payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("The remote peer did not complete the handshake in time")]
    HandshakeTimedOut,
    #[error("Unexpected '{got}' message during handshake (expected '{expected}')")]
    UnexpectedHandshakeMessage { expected: String, got: String },
    #[error("The connection closed during the handshake")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Whether this failure indicates the remote peer broke the protocol (as opposed to a local/transport fault).
    pub fn is_peer_misbehavior(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadMagic { .. } |
                ProtocolError::BadChecksum { .. } |
                ProtocolError::PayloadTooLarge { .. } |
                ProtocolError::MalformedPayload(_) |
                ProtocolError::UnexpectedHandshakeMessage { .. }
        )
    }
}
