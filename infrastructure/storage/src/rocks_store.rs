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

use std::{path::PathBuf, sync::Arc};

use log::*;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use crate::error::StorageError;

const LOG_TARGET: &str = "storage::rocks_store";

/// Builds a [`KeyValStore`] with a fixed set of named stores. Stores must all be declared up front; the engine
/// creates missing ones and opens existing ones.
pub struct StoreBuilder {
    path: PathBuf,
    stores: Vec<String>,
}

impl StoreBuilder {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            stores: Vec::new(),
        }
    }

    pub fn add_store(mut self, name: &str) -> Self {
        self.stores.push(name.to_string());
        self
    }

    pub fn build(self) -> Result<KeyValStore, StorageError> {
        std::fs::create_dir_all(&self.path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let descriptors = self
            .stores
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name.clone(), Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, &self.path, descriptors)?;
        debug!(
            target: LOG_TARGET,
            "Opened key-value engine at '{}' with {} store(s)",
            self.path.display(),
            self.stores.len()
        );
        Ok(KeyValStore {
            db: Arc::new(db),
            stores: Arc::new(self.stores),
        })
    }
}

/// A handle to the engine instance. Cheap to clone; all clones share the underlying engine.
#[derive(Clone)]
pub struct KeyValStore {
    db: Arc<DB>,
    stores: Arc<Vec<String>>,
}

impl KeyValStore {
    pub fn get_handle(&self, name: &str) -> Result<StoreHandle, StorageError> {
        if !self.stores.iter().any(|s| s == name) {
            return Err(StorageError::StoreNotFound(name.to_string()));
        }
        Ok(StoreHandle {
            db: self.db.clone(),
            name: name.to_string(),
        })
    }

    /// Commit every operation in the transaction atomically. Either all operations across all stores are
    /// durable after this returns, or none are.
    pub fn commit(&self, txn: WriteTransaction) -> Result<(), StorageError> {
        if txn.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for op in &txn.ops {
            match op {
                Op::Insert { store, key, value } => {
                    let cf = self.cf(store)?;
                    batch.put_cf(cf, key, value);
                },
                Op::Delete { store, key } => {
                    let cf = self.cf(store)?;
                    batch.delete_cf(cf, key);
                },
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Compact a store by rewriting its surviving entries. Blocks until the compaction completes.
    pub fn compact(&self, name: &str) -> Result<(), StorageError> {
        let cf = self.cf(name)?;
        self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::StoreNotFound(name.to_string()))
    }
}

/// A handle to one named store. Point reads/writes go through here; multi-key atomic writes go through
/// [`WriteTransaction`] and [`KeyValStore::commit`].
#[derive(Clone)]
pub struct StoreHandle {
    db: Arc<DB>,
    name: String,
}

impl StoreHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get_cf(self.cf()?, key)?)
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.db.get_pinned_cf(self.cf()?, key)?.is_some())
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        Ok(self.db.put_cf(self.cf()?, key, value)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        Ok(self.db.delete_cf(self.cf()?, key)?)
    }

    /// All entries whose key starts with `prefix`, in ascending key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.cf()?, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    /// The entry with the lowest key, if any.
    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.edge(IteratorMode::Start)
    }

    /// The entry with the highest key, if any.
    pub fn last(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.edge(IteratorMode::End)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.first()?.is_none())
    }

    fn edge(&self, mode: IteratorMode) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        match self.db.iterator_cf(self.cf()?, mode).next() {
            Some(item) => {
                let (key, value) = item?;
                Ok(Some((key.to_vec(), value.to_vec())))
            },
            None => Ok(None),
        }
    }

    fn cf(&self) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(&self.name)
            .ok_or_else(|| StorageError::StoreNotFound(self.name.clone()))
    }
}

/// An ordered list of writes and deletes spanning any number of stores, committed atomically.
#[derive(Default)]
pub struct WriteTransaction {
    ops: Vec<Op>,
}

enum Op {
    Insert {
        store: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        store: String,
        key: Vec<u8>,
    },
}

impl WriteTransaction {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, store: &StoreHandle, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(Op::Insert {
            store: store.name().to_string(),
            key,
            value,
        });
        self
    }

    pub fn delete(&mut self, store: &StoreHandle, key: Vec<u8>) -> &mut Self {
        self.ops.push(Op::Delete {
            store: store.name().to_string(),
            key,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}
