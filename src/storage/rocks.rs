//! RocksDB-backed token store.
//!
//! # Schema
//!
//! **`current` column family:** token name -> protobuf-serialized Token.
//!
//! **`archive` column family:** archived token name (already carrying the
//! archive prefix) -> protobuf-serialized Token.
//!
//! **`meta` column family:** `version_counter` -> i64 (big-endian), the last
//! version issued by the master.
//!
//! A commit is one `WriteBatch` written with `sync = true`, so every
//! acknowledged batch is on disk before the master acknowledges the client,
//! and a batch spanning both namespaces lands atomically.

use std::path::Path;

use prost::Message;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};

use crate::grpc::proto::Token;
use crate::storage::{CommitBatch, StoreError, TokenStore};

const CF_CURRENT: &str = "current";
const CF_ARCHIVE: &str = "archive";
const CF_META: &str = "meta";

const KEY_VERSION_COUNTER: &[u8] = b"version_counter";

/// Persistent token store on RocksDB.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open the store at `path`, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_CURRENT, Options::default()),
            ColumnFamilyDescriptor::new(CF_ARCHIVE, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Other(format!("missing column family {}", name)))
    }

    fn scan_prefix(&self, cf_name: &str, prefix: &str) -> Result<Vec<Token>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
        let mut tokens = Vec::new();
        for entry in self.db.iterator_cf(cf, mode) {
            let (key, value) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            tokens.push(Token::decode(value.as_ref())?);
        }
        Ok(tokens)
    }
}

impl TokenStore for RocksStore {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let cf_current = self.cf(CF_CURRENT)?;
        let cf_archive = self.cf(CF_ARCHIVE)?;
        let cf_meta = self.cf(CF_META)?;

        let mut write = WriteBatch::default();
        for token in &batch.updates {
            write.put_cf(cf_current, token.name.as_bytes(), token.encode_to_vec());
        }
        for name in &batch.deletes {
            write.delete_cf(cf_current, name.as_bytes());
        }
        for token in &batch.archives {
            write.put_cf(cf_archive, token.name.as_bytes(), token.encode_to_vec());
        }
        write.put_cf(cf_meta, KEY_VERSION_COUNTER, batch.version_counter.to_be_bytes());

        // Durability barrier: the master acknowledges nothing before this
        // write is synced.
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(write, &opts)?;
        Ok(())
    }

    fn load_current(&self) -> Result<Vec<Token>, StoreError> {
        self.scan_prefix(CF_CURRENT, "")
    }

    fn load_version_counter(&self) -> Result<i64, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, KEY_VERSION_COUNTER)? {
            Some(bytes) => {
                if bytes.len() != 8 {
                    return Err(StoreError::Other("invalid version counter bytes".to_string()));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(i64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    fn read_current(&self, prefix: &str) -> Result<Vec<Token>, StoreError> {
        self.scan_prefix(CF_CURRENT, prefix)
    }

    fn read_archive(&self, prefix: &str) -> Result<Vec<Token>, StoreError> {
        self.scan_prefix(CF_ARCHIVE, prefix)
    }
}
