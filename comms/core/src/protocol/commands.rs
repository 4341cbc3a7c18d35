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

use crate::protocol::ProtocolError;

pub const COMMAND_SIZE: usize = 12;

/// The wire commands this node speaks. The on-wire form is the lowercase name, zero-padded to 12 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetData,
    GetBlocks,
    GetHeaders,
    Headers,
    Block,
    Tx,
    SendHeaders,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        use Command::*;
        match self {
            Version => "version",
            Verack => "verack",
            Ping => "ping",
            Pong => "pong",
            GetAddr => "getaddr",
            Addr => "addr",
            Inv => "inv",
            GetData => "getdata",
            GetBlocks => "getblocks",
            GetHeaders => "getheaders",
            Headers => "headers",
            Block => "block",
            Tx => "tx",
            SendHeaders => "sendheaders",
        }
    }

    pub fn to_wire_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut bytes = [0u8; COMMAND_SIZE];
        bytes[..self.as_str().len()].copy_from_slice(self.as_str().as_bytes());
        bytes
    }

    pub fn from_wire_bytes(bytes: &[u8; COMMAND_SIZE]) -> Result<Self, ProtocolError> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
        let name = std::str::from_utf8(&bytes[..end])
            .map_err(|_| ProtocolError::UnknownCommand(format!("{:02x?}", bytes)))?;
        // Trailing padding must be all zero
        if bytes[end..].iter().any(|&b| b != 0) {
            return Err(ProtocolError::UnknownCommand(format!("{:02x?}", bytes)));
        }
        use Command::*;
        let command = match name {
            "version" => Version,
            "verack" => Verack,
            "ping" => Ping,
            "pong" => Pong,
            "getaddr" => GetAddr,
            "addr" => Addr,
            "inv" => Inv,
            "getdata" => GetData,
            "getblocks" => GetBlocks,
            "getheaders" => GetHeaders,
            "headers" => Headers,
            "block" => Block,
            "tx" => Tx,
            "sendheaders" => SendHeaders,
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    /// Commands handled entirely inside the comms layer.
    pub fn is_control(&self) -> bool {
        use Command::*;
        matches!(self, Version | Verack | Ping | Pong | GetAddr | Addr)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_roundtrip_for_every_command() {
        use Command::*;
        for cmd in [
            Version, Verack, Ping, Pong, GetAddr, Addr, Inv, GetData, GetBlocks, GetHeaders, Headers, Block, Tx,
            SendHeaders,
        ] {
            let bytes = cmd.to_wire_bytes();
            assert_eq!(Command::from_wire_bytes(&bytes).unwrap(), cmd);
        }
    }

    #[test]
    fn rejects_unknown_and_badly_padded_commands() {
        let mut bytes = [0u8; COMMAND_SIZE];
        bytes[..7].copy_from_slice(b"mempool");
        assert!(Command::from_wire_bytes(&bytes).is_err());

        let mut bytes = Command::Ping.to_wire_bytes();
        bytes[COMMAND_SIZE - 1] = b'x';
        assert!(Command::from_wire_bytes(&bytes).is_err());
    }
}
