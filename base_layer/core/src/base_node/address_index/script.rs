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

//! Locking-script to address derivation. The indexer treats this as an injected collaborator; scripts the
//! resolver does not recognize are skipped silently.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

pub trait ScriptAddressResolver: Send + Sync {
    fn resolve(&self, script_pubkey: &[u8]) -> Option<String>;
}

/// The standard Base58Check resolver: pay-to-pubkey-hash, pay-to-script-hash and bare pay-to-pubkey forms.
pub struct Base58AddressResolver {
    pubkey_hash_prefix: u8,
    script_hash_prefix: u8,
}

impl Base58AddressResolver {
    pub fn new(pubkey_hash_prefix: u8, script_hash_prefix: u8) -> Self {
        Self {
            pubkey_hash_prefix,
            script_hash_prefix,
        }
    }
}

impl Default for Base58AddressResolver {
    fn default() -> Self {
        // 'S...' addresses for key hashes, 's...' for script hashes
        Self::new(63, 125)
    }
}

impl ScriptAddressResolver for Base58AddressResolver {
    fn resolve(&self, script: &[u8]) -> Option<String> {
        const OP_DUP: u8 = 0x76;
        const OP_HASH160: u8 = 0xa9;
        const OP_EQUAL: u8 = 0x87;
        const OP_EQUALVERIFY: u8 = 0x88;
        const OP_CHECKSIG: u8 = 0xac;

        // P2PKH: OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        if script.len() == 25 &&
            script[0] == OP_DUP &&
            script[1] == OP_HASH160 &&
            script[2] == 20 &&
            script[23] == OP_EQUALVERIFY &&
            script[24] == OP_CHECKSIG
        {
            return Some(base58check(self.pubkey_hash_prefix, &script[3..23]));
        }
        // P2SH: OP_HASH160 <20> OP_EQUAL
        if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
            return Some(base58check(self.script_hash_prefix, &script[2..22]));
        }
        // Bare P2PK: <33|65-byte pubkey> OP_CHECKSIG
        if (script.len() == 35 || script.len() == 67) && script[script.len() - 1] == OP_CHECKSIG {
            let pubkey = &script[1..script.len() - 1];
            let key_hash = hash160(pubkey);
            return Some(base58check(self.pubkey_hash_prefix, &key_hash));
        }
        None
    }
}

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

fn base58check(prefix: u8, payload: &[u8]) -> String {
    let mut extended = Vec::with_capacity(payload.len() + 5);
    extended.push(prefix);
    extended.extend_from_slice(payload);
    let checksum = Sha256::digest(Sha256::digest(&extended));
    extended.extend_from_slice(&checksum[..4]);
    bs58::encode(extended).into_string()
}

#[cfg(test)]
mod test {
    use super::*;

    fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 20];
        script.extend_from_slice(&hash);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    #[test]
    fn p2pkh_resolves_deterministically() {
        let resolver = Base58AddressResolver::default();
        let a = resolver.resolve(&p2pkh([1u8; 20])).unwrap();
        let b = resolver.resolve(&p2pkh([1u8; 20])).unwrap();
        let c = resolver.resolve(&p2pkh([2u8; 20])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn p2sh_and_p2pk_forms_resolve() {
        let resolver = Base58AddressResolver::default();

        let mut p2sh = vec![0xa9, 20];
        p2sh.extend_from_slice(&[7u8; 20]);
        p2sh.push(0x87);
        assert!(resolver.resolve(&p2sh).is_some());

        let mut p2pk = vec![33];
        p2pk.extend_from_slice(&[2u8; 33]);
        p2pk.push(0xac);
        assert!(resolver.resolve(&p2pk).is_some());
    }

    #[test]
    fn unknown_scripts_resolve_to_none() {
        let resolver = Base58AddressResolver::default();
        assert!(resolver.resolve(&[]).is_none());
        assert!(resolver.resolve(&[0x6a, 0x04, 1, 2, 3, 4]).is_none());
        assert!(resolver.resolve(&[0x51]).is_none());
    }
}
