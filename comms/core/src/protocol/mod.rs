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

//! The Bitcoin-family wire protocol: framed messages over TCP with a 4-byte magic, a 12-byte ASCII command,
//! a payload length and a double-SHA256 checksum. Control payloads (version, ping/pong, addr) are typed here;
//! data payloads (blocks, headers, transactions, inventories beyond hashes) are opaque to this crate.

mod commands;
pub mod encoding;
mod error;
mod frame;
pub mod handshake;
mod messages;

pub use commands::Command;
pub use error::ProtocolError;
pub use frame::{read_frame, write_frame, MessageFrame, RawFrame, HEADER_SIZE};
pub use messages::{
    AddrMessage,
    InvKind,
    InvMessage,
    Inventory,
    NetAddress,
    PingPongMessage,
    TimestampedAddress,
    VersionMessage,
    MAX_ADDR_PER_MESSAGE,
    MAX_INV_PER_MESSAGE,
};
