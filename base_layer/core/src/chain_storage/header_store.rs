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

//! Persistence for the main chain's headers: height (big-endian) to the 80 consensus bytes. Rebuilding the
//! in-memory header tree at startup replays these in height order.

use sable_storage::StoreHandle;

use crate::{blocks::BlockHeader, chain_storage::ChainStorageError};

#[derive(Clone)]
pub struct HeaderStore {
    store: StoreHandle,
}

impl HeaderStore {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub fn save(&self, height: u64, header: &BlockHeader) -> Result<(), ChainStorageError> {
        self.store.insert(&height.to_be_bytes(), &header.to_bytes())?;
        Ok(())
    }

    /// All persisted headers in ascending height order.
    pub fn load_all(&self) -> Result<Vec<(u64, BlockHeader)>, ChainStorageError> {
        let mut headers = Vec::new();
        for (key, value) in self.store.scan_prefix(&[])? {
            let height_bytes: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainStorageError::CorruptRecord {
                    store: crate::chain_storage::store_names::HEADERS,
                    message: format!("header key of {} bytes", key.len()),
                })?;
            let header = BlockHeader::from_bytes(&value)?;
            headers.push((u64::from_be_bytes(height_bytes), header));
        }
        Ok(headers)
    }

    /// Remove persisted headers strictly above `height` (after a reorg shortened the main chain).
    pub fn truncate_above(&self, height: u64) -> Result<(), ChainStorageError> {
        let mut cursor = height.saturating_add(1);
        while self.store.get(&cursor.to_be_bytes())?.is_some() {
            self.store.delete(&cursor.to_be_bytes())?;
            cursor += 1;
        }
        Ok(())
    }

    pub fn highest(&self) -> Result<Option<u64>, ChainStorageError> {
        match self.store.last()? {
            Some((key, _)) => {
                let height_bytes: [u8; 8] =
                    key.as_slice()
                        .try_into()
                        .map_err(|_| ChainStorageError::CorruptRecord {
                            store: crate::chain_storage::store_names::HEADERS,
                            message: format!("header key of {} bytes", key.len()),
                        })?;
                Ok(Some(u64::from_be_bytes(height_bytes)))
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use sable_storage::StoreBuilder;
    use tempfile::TempDir;

    use super::*;
    use crate::{chain_storage::store_names, common::FixedHash};

    fn setup(dir: &TempDir) -> HeaderStore {
        let engine = StoreBuilder::new(dir.path())
            .add_store(store_names::HEADERS)
            .build()
            .unwrap();
        HeaderStore::new(engine.get_handle(store_names::HEADERS).unwrap())
    }

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: FixedHash::zero(),
            merkle_root: FixedHash::zero(),
            timestamp: 0,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    #[test]
    fn load_all_is_height_ordered() {
        let dir = TempDir::new().unwrap();
        let store = setup(&dir);
        for height in [2u64, 0, 1, 300] {
            store.save(height, &header(height as u32)).unwrap();
        }
        let loaded = store.load_all().unwrap();
        let heights = loaded.iter().map(|(h, _)| *h).collect::<Vec<_>>();
        assert_eq!(heights, vec![0, 1, 2, 300]);
        assert_eq!(store.highest().unwrap(), Some(300));
    }

    #[test]
    fn truncate_removes_a_contiguous_suffix() {
        let dir = TempDir::new().unwrap();
        let store = setup(&dir);
        for height in 0u64..6 {
            store.save(height, &header(height as u32)).unwrap();
        }
        store.truncate_above(2).unwrap();
        let heights = store.load_all().unwrap().iter().map(|(h, _)| *h).collect::<Vec<_>>();
        assert_eq!(heights, vec![0, 1, 2]);
    }
}
