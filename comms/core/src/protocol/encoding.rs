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

//! Primitive wire encodings shared by every message: the variable-length integer ("compact size"),
//! length-prefixed strings, fixed hashes and network addresses.

use bytes::{Buf, BufMut};

use crate::protocol::ProtocolError;

pub fn write_varint(buf: &mut impl BufMut, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        },
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        },
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        },
    }
}

pub fn read_varint(buf: &mut impl Buf) -> Result<u64, ProtocolError> {
    if !buf.has_remaining() {
        return Err(truncated());
    }
    let prefix = buf.get_u8();
    let value = match prefix {
        0xfd => {
            ensure_remaining(buf, 2)?;
            u64::from(buf.get_u16_le())
        },
        0xfe => {
            ensure_remaining(buf, 4)?;
            u64::from(buf.get_u32_le())
        },
        0xff => {
            ensure_remaining(buf, 8)?;
            buf.get_u64_le()
        },
        n => u64::from(n),
    };
    Ok(value)
}

pub fn write_var_string(buf: &mut impl BufMut, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

pub fn read_var_string(buf: &mut impl Buf, max_len: usize) -> Result<String, ProtocolError> {
    let len = read_varint(buf)? as usize;
    if len > max_len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string length {} exceeds limit {}",
            len, max_len
        )));
    }
    ensure_remaining(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtocolError::MalformedPayload("string is not valid UTF-8".to_string()))
}

pub fn read_hash(buf: &mut impl Buf) -> Result<[u8; 32], ProtocolError> {
    ensure_remaining(buf, 32)?;
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    Ok(hash)
}

pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(truncated());
    }
    Ok(())
}

fn truncated() -> ProtocolError {
    ProtocolError::MalformedPayload("payload ended prematurely".to_string())
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn varint_boundaries_roundtrip() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000, u64::MAX] {
            let mut buf = BytesMut::new();
            write_varint(&mut buf, n);
            let mut rd = buf.freeze();
            assert_eq!(read_varint(&mut rd).unwrap(), n);
            assert_eq!(rd.remaining(), 0);
        }
    }

    #[test]
    fn var_string_limit_is_enforced() {
        let mut buf = BytesMut::new();
        write_var_string(&mut buf, "hello world");
        let mut rd = buf.freeze();
        assert!(read_var_string(&mut rd, 5).is_err());
    }

    #[test]
    fn truncated_payloads_error_cleanly() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xfd);
        buf.put_u8(0x01);
        let mut rd = buf.freeze();
        assert!(read_varint(&mut rd).is_err());
    }
}
