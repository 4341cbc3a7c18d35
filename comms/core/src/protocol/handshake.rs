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

//! The `version`/`verack` exchange. The initiator opens with `version`; the responder answers with its own
//! `version` followed by `verack`; the initiator completes with `verack`. A peer that does not finish inside
//! the handshake window is disconnected.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::{
    frame::{read_frame, write_frame, MessageFrame},
    Command,
    ProtocolError,
    VersionMessage,
};

pub async fn initiate<S>(
    stream: &mut S,
    magic: [u8; 4],
    max_payload: usize,
    local_version: VersionMessage,
    window: Duration,
) -> Result<VersionMessage, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(window, async {
        write_frame(stream, magic, &MessageFrame::new(Command::Version, local_version.to_payload())).await?;
        let remote = expect(stream, magic, max_payload, Command::Version).await?;
        let remote = VersionMessage::from_payload(remote)?;
        write_frame(stream, magic, &MessageFrame::empty(Command::Verack)).await?;
        expect(stream, magic, max_payload, Command::Verack).await?;
        Ok(remote)
    })
    .await
    .map_err(|_| ProtocolError::HandshakeTimedOut)?
}

pub async fn respond<S>(
    stream: &mut S,
    magic: [u8; 4],
    max_payload: usize,
    local_version: VersionMessage,
    window: Duration,
) -> Result<VersionMessage, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(window, async {
        let remote = expect(stream, magic, max_payload, Command::Version).await?;
        let remote = VersionMessage::from_payload(remote)?;
        write_frame(stream, magic, &MessageFrame::new(Command::Version, local_version.to_payload())).await?;
        write_frame(stream, magic, &MessageFrame::empty(Command::Verack)).await?;
        expect(stream, magic, max_payload, Command::Verack).await?;
        Ok(remote)
    })
    .await
    .map_err(|_| ProtocolError::HandshakeTimedOut)?
}

async fn expect<S>(
    stream: &mut S,
    magic: [u8; 4],
    max_payload: usize,
    expected: Command,
) -> Result<bytes::Bytes, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = read_frame(stream, magic, max_payload).await?;
    let command = raw
        .command()
        .map_err(|_| ProtocolError::UnexpectedHandshakeMessage {
            expected: expected.to_string(),
            got: raw.command_label(),
        })?;
    if command != expected {
        return Err(ProtocolError::UnexpectedHandshakeMessage {
            expected: expected.to_string(),
            got: command.to_string(),
        });
    }
    Ok(raw.payload)
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::protocol::NetAddress;

    const MAGIC: [u8; 4] = *b"test";
    const MAX: usize = 1024 * 1024;

    fn version(nonce: u64, height: u32) -> VersionMessage {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        VersionMessage {
            protocol_version: 70012,
            services: 1,
            timestamp: 0,
            receiver: NetAddress::new(0, addr),
            sender: NetAddress::new(1, addr),
            nonce,
            user_agent: "/sable:test/".to_string(),
            start_height: height,
        }
    }

    #[tokio::test]
    async fn both_sides_complete_and_learn_the_remote_version() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let window = Duration::from_secs(5);
        let (initiator, responder) = tokio::join!(
            initiate(&mut a, MAGIC, MAX, version(1, 100), window),
            respond(&mut b, MAGIC, MAX, version(2, 200), window),
        );
        assert_eq!(initiator.unwrap().start_height, 200);
        assert_eq!(responder.unwrap().start_height, 100);
    }

    #[tokio::test]
    async fn silent_responder_times_out() {
        let (mut a, _b) = tokio::io::duplex(4096);
        let err = initiate(&mut a, MAGIC, MAX, version(1, 0), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::HandshakeTimedOut));
    }

    #[tokio::test]
    async fn unexpected_opening_message_fails_the_responder() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let window = Duration::from_secs(5);
        write_frame(&mut a, MAGIC, &MessageFrame::empty(Command::Ping))
            .await
            .unwrap();
        let err = respond(&mut b, MAGIC, MAX, version(2, 0), window).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedHandshakeMessage { .. }));
    }
}
