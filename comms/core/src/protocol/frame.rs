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

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    commands::{Command, COMMAND_SIZE},
    ProtocolError,
};

/// magic(4) + command(12) + length(4) + checksum(4)
pub const HEADER_SIZE: usize = 24;

/// A fully decoded outbound or inbound message.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub command: Command,
    pub payload: Bytes,
}

impl MessageFrame {
    pub fn new(command: Command, payload: Bytes) -> Self {
        Self { command, payload }
    }

    pub fn empty(command: Command) -> Self {
        Self {
            command,
            payload: Bytes::new(),
        }
    }
}

/// A frame as read off the wire. The command bytes are kept raw so that unknown commands can be skipped
/// without tearing the connection down.
#[derive(Debug)]
pub struct RawFrame {
    pub command_bytes: [u8; COMMAND_SIZE],
    pub payload: Bytes,
}

impl RawFrame {
    pub fn command(&self) -> Result<Command, ProtocolError> {
        Command::from_wire_bytes(&self.command_bytes)
    }

    pub fn command_label(&self) -> String {
        let end = self
            .command_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        String::from_utf8_lossy(&self.command_bytes[..end]).into_owned()
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

pub async fn write_frame<W>(writer: &mut W, magic: [u8; 4], frame: &MessageFrame) -> Result<(), ProtocolError>
where W: AsyncWrite + Unpin {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&magic);
    header[4..16].copy_from_slice(&frame.command.to_wire_bytes());
    header[16..20].copy_from_slice(&(frame.payload.len() as u32).to_le_bytes());
    header[20..24].copy_from_slice(&checksum(&frame.payload));

    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R, magic: [u8; 4], max_payload: usize) -> Result<RawFrame, ProtocolError>
where R: AsyncRead + Unpin {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    if header[..4] != magic {
        let mut got = [0u8; 4];
        got.copy_from_slice(&header[..4]);
        return Err(ProtocolError::BadMagic { got });
    }

    let mut command_bytes = [0u8; COMMAND_SIZE];
    command_bytes.copy_from_slice(&header[4..16]);

    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            size: length,
            max: max_payload,
        });
    }

    let mut expected_checksum = [0u8; 4];
    expected_checksum.copy_from_slice(&header[20..24]);

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    if checksum(&payload) != expected_checksum {
        let end = command_bytes.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
        return Err(ProtocolError::BadChecksum {
            command: String::from_utf8_lossy(&command_bytes[..end]).into_owned(),
        });
    }

    Ok(RawFrame {
        command_bytes,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const MAGIC: [u8; 4] = *b"test";

    #[tokio::test]
    async fn frame_roundtrip() {
        let frame = MessageFrame::new(Command::Ping, Bytes::from_static(b"\x01\x02\x03"));
        let mut wire = Vec::new();
        write_frame(&mut wire, MAGIC, &frame).await.unwrap();

        let mut reader = wire.as_slice();
        let raw = read_frame(&mut reader, MAGIC, 1024).await.unwrap();
        assert_eq!(raw.command().unwrap(), Command::Ping);
        assert_eq!(&raw.payload[..], b"\x01\x02\x03");
    }

    #[tokio::test]
    async fn wrong_magic_is_rejected() {
        let frame = MessageFrame::empty(Command::Verack);
        let mut wire = Vec::new();
        write_frame(&mut wire, MAGIC, &frame).await.unwrap();

        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader, *b"main", 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic { .. }));
    }

    #[tokio::test]
    async fn corrupted_payload_fails_the_checksum() {
        let frame = MessageFrame::new(Command::Tx, Bytes::from_static(b"payload"));
        let mut wire = Vec::new();
        write_frame(&mut wire, MAGIC, &frame).await.unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader, MAGIC, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadChecksum { .. }));
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_before_reading_it() {
        let frame = MessageFrame::new(Command::Block, Bytes::from(vec![0u8; 64]));
        let mut wire = Vec::new();
        write_frame(&mut wire, MAGIC, &frame).await.unwrap();

        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader, MAGIC, 32).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn unknown_command_is_reported_not_fatal() {
        let mut wire = Vec::new();
        let payload = b"";
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&MAGIC);
        header[4..11].copy_from_slice(b"mempool");
        header[20..24].copy_from_slice(&checksum(payload));
        wire.extend_from_slice(&header);

        let mut reader = wire.as_slice();
        let raw = read_frame(&mut reader, MAGIC, 1024).await.unwrap();
        assert!(raw.command().is_err());
        assert_eq!(raw.command_label(), "mempool");
    }
}
