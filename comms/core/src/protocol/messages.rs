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

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{
    encoding::{ensure_remaining, read_hash, read_var_string, read_varint, write_var_string, write_varint},
    ProtocolError,
};

pub const MAX_ADDR_PER_MESSAGE: usize = 1000;
pub const MAX_INV_PER_MESSAGE: usize = 50_000;
const MAX_USER_AGENT_LEN: usize = 256;

/// A peer endpoint with its advertised service bits. IPv4 addresses travel in IPv6-mapped form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    pub address: SocketAddr,
}

impl NetAddress {
    pub fn new(services: u64, address: SocketAddr) -> Self {
        Self { services, address }
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.services);
        let v6 = match self.address.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        buf.put_slice(&v6.octets());
        buf.put_u16(self.address.port());
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure_remaining(buf, 8 + 16 + 2)?;
        let services = buf.get_u64_le();
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = buf.get_u16();
        Ok(Self {
            services,
            address: SocketAddr::new(ip, port),
        })
    }
}

/// The handshake opener. `start_height` is the claimed chain tip used to seed download scheduling.
#[derive(Debug, Clone)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u32,
}

impl VersionMessage {
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(96 + self.user_agent.len());
        buf.put_u32_le(self.protocol_version);
        buf.put_u64_le(self.services);
        buf.put_i64_le(self.timestamp);
        self.receiver.write(&mut buf);
        self.sender.write(&mut buf);
        buf.put_u64_le(self.nonce);
        write_var_string(&mut buf, &self.user_agent);
        buf.put_u32_le(self.start_height);
        buf.freeze()
    }

    pub fn from_payload(mut payload: Bytes) -> Result<Self, ProtocolError> {
        ensure_remaining(&payload, 4 + 8 + 8)?;
        let protocol_version = payload.get_u32_le();
        let services = payload.get_u64_le();
        let timestamp = payload.get_i64_le();
        let receiver = NetAddress::read(&mut payload)?;
        let sender = NetAddress::read(&mut payload)?;
        ensure_remaining(&payload, 8)?;
        let nonce = payload.get_u64_le();
        let user_agent = read_var_string(&mut payload, MAX_USER_AGENT_LEN)?;
        ensure_remaining(&payload, 4)?;
        let start_height = payload.get_u32_le();
        Ok(Self {
            protocol_version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPongMessage {
    pub nonce: u64,
}

impl PingPongMessage {
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(self.nonce);
        buf.freeze()
    }

    pub fn from_payload(mut payload: Bytes) -> Result<Self, ProtocolError> {
        ensure_remaining(&payload, 8)?;
        Ok(Self {
            nonce: payload.get_u64_le(),
        })
    }
}

/// One gossiped peer endpoint with the time it was last seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub last_seen: u32,
    pub address: NetAddress,
}

#[derive(Debug, Clone, Default)]
pub struct AddrMessage {
    pub addresses: Vec<TimestampedAddress>,
}

impl AddrMessage {
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.addresses.len() * 30);
        write_varint(&mut buf, self.addresses.len() as u64);
        for entry in &self.addresses {
            buf.put_u32_le(entry.last_seen);
            entry.address.write(&mut buf);
        }
        buf.freeze()
    }

    pub fn from_payload(mut payload: Bytes) -> Result<Self, ProtocolError> {
        let count = read_varint(&mut payload)? as usize;
        if count > MAX_ADDR_PER_MESSAGE {
            return Err(ProtocolError::MalformedPayload(format!(
                "addr message with {} entries exceeds the {} entry limit",
                count, MAX_ADDR_PER_MESSAGE
            )));
        }
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            ensure_remaining(&payload, 4)?;
            let last_seen = payload.get_u32_le();
            let address = NetAddress::read(&mut payload)?;
            addresses.push(TimestampedAddress { last_seen, address });
        }
        Ok(Self { addresses })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    fn to_wire(self) -> u32 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
        }
    }

    fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(InvKind::Tx),
            2 => Ok(InvKind::Block),
            other => Err(ProtocolError::MalformedPayload(format!(
                "unknown inventory kind {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InvKind,
    pub hash: [u8; 32],
}

/// Payload shared by `inv` and `getdata`.
#[derive(Debug, Clone, Default)]
pub struct InvMessage {
    pub items: Vec<Inventory>,
}

impl InvMessage {
    pub fn blocks<I: IntoIterator<Item = [u8; 32]>>(hashes: I) -> Self {
        Self {
            items: hashes
                .into_iter()
                .map(|hash| Inventory {
                    kind: InvKind::Block,
                    hash,
                })
                .collect(),
        }
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.items.len() * 36);
        write_varint(&mut buf, self.items.len() as u64);
        for item in &self.items {
            buf.put_u32_le(item.kind.to_wire());
            buf.put_slice(&item.hash);
        }
        buf.freeze()
    }

    pub fn from_payload(mut payload: Bytes) -> Result<Self, ProtocolError> {
        let count = read_varint(&mut payload)? as usize;
        if count > MAX_INV_PER_MESSAGE {
            return Err(ProtocolError::MalformedPayload(format!(
                "inventory with {} entries exceeds the {} entry limit",
                count, MAX_INV_PER_MESSAGE
            )));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            ensure_remaining(&payload, 4)?;
            let kind = InvKind::from_wire(payload.get_u32_le())?;
            let hash = read_hash(&mut payload)?;
            items.push(Inventory { kind, hash });
        }
        Ok(Self { items })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_addr(port: u16) -> NetAddress {
        NetAddress::new(1, SocketAddr::new("203.0.113.7".parse().unwrap(), port))
    }

    #[test]
    fn version_roundtrip_preserves_claimed_height() {
        let msg = VersionMessage {
            protocol_version: 70012,
            services: 1,
            timestamp: 1_700_000_000,
            receiver: sample_addr(38333),
            sender: sample_addr(48333),
            nonce: 0xdead_beef,
            user_agent: "/sable:0.4.0/".to_string(),
            start_height: 812_345,
        };
        let decoded = VersionMessage::from_payload(msg.to_payload()).unwrap();
        assert_eq!(decoded.start_height, 812_345);
        assert_eq!(decoded.nonce, 0xdead_beef);
        assert_eq!(decoded.user_agent, "/sable:0.4.0/");
        assert_eq!(decoded.receiver, msg.receiver);
    }

    #[test]
    fn ipv4_addresses_survive_the_v6_mapping() {
        let mut buf = BytesMut::new();
        sample_addr(1234).write(&mut buf);
        let decoded = NetAddress::read(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, sample_addr(1234));
    }

    #[test]
    fn addr_message_entry_limit() {
        let entries = (0..=MAX_ADDR_PER_MESSAGE)
            .map(|i| TimestampedAddress {
                last_seen: 0,
                address: sample_addr(i as u16),
            })
            .collect::<Vec<_>>();
        let msg = AddrMessage { addresses: entries };
        assert!(AddrMessage::from_payload(msg.to_payload()).is_err());
    }

    #[test]
    fn inv_roundtrip() {
        let msg = InvMessage::blocks([[1u8; 32], [2u8; 32]]);
        let decoded = InvMessage::from_payload(msg.to_payload()).unwrap();
        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.items[0].kind, InvKind::Block);
        assert_eq!(decoded.items[1].hash, [2u8; 32]);
    }
}
