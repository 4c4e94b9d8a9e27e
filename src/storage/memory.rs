//! Ephemeral in-memory token store.
//!
//! Keeps the `TokenStore` contract without touching disk.  Used by unit
//! tests and local experiments where durability does not matter.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::grpc::proto::Token;
use crate::storage::{CommitBatch, StoreError, TokenStore};

#[derive(Default)]
struct Tables {
    current: BTreeMap<String, Token>,
    archive: BTreeMap<String, Token>,
    version_counter: i64,
}

/// Non-durable store backed by in-memory maps.
#[derive(Default)]
pub struct EphemeralStore {
    tables: Mutex<Tables>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scan(table: &BTreeMap<String, Token>, prefix: &str) -> Vec<Token> {
    table
        .range(prefix.to_string()..)
        .take_while(|(name, _)| name.starts_with(prefix))
        .map(|(_, token)| token.clone())
        .collect()
}

impl TokenStore for EphemeralStore {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        for token in &batch.updates {
            tables.current.insert(token.name.clone(), token.clone());
        }
        for name in &batch.deletes {
            tables.current.remove(name);
        }
        for token in &batch.archives {
            tables.archive.insert(token.name.clone(), token.clone());
        }
        tables.version_counter = batch.version_counter;
        Ok(())
    }

    fn load_current(&self) -> Result<Vec<Token>, StoreError> {
        Ok(scan(&self.tables.lock().unwrap().current, ""))
    }

    fn load_version_counter(&self) -> Result<i64, StoreError> {
        Ok(self.tables.lock().unwrap().version_counter)
    }

    fn read_current(&self, prefix: &str) -> Result<Vec<Token>, StoreError> {
        Ok(scan(&self.tables.lock().unwrap().current, prefix))
    }

    fn read_archive(&self, prefix: &str) -> Result<Vec<Token>, StoreError> {
        Ok(scan(&self.tables.lock().unwrap().archive, prefix))
    }
}
