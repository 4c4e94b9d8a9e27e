//! Token master operation logic.
//!
//! The handler owns the in-memory index, the version source, and the store,
//! and implements the five operations of the master.  Every mutating
//! operation checks all of its preconditions first, then commits the whole
//! batch to the store, and only then touches the index, so clients observe
//! either all of a batch's effects or none and an acknowledged change is
//! already durable.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use slog::{debug, info, Logger};

use crate::grpc::proto::{Token, TokenQuery};
use crate::master::error::{MasterError, Result};
use crate::master::index::TokenIndex;
use crate::master::version::VersionSource;
use crate::storage::{CommitBatch, TokenStore};

/// Name prefix of the immutable archive namespace.
pub const ARCHIVE_PREFIX: &str = "/__ARCHIVE__";

/// Seconds since the epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A token is owned iff it has an owner and its lease has not expired.
/// Everything else is claimable.
pub fn is_owned(token: &Token, now: i64) -> bool {
    !token.owner.is_empty() && token.expiration_time > now
}

pub struct MasterHandler {
    index: TokenIndex,
    versions: VersionSource,
    store: Box<dyn TokenStore>,
    log: Logger,
}

impl MasterHandler {
    /// Rebuild the in-memory index from the store.
    pub fn recover(store: Box<dyn TokenStore>, log: Logger) -> Result<Self> {
        let tokens = store
            .load_current()
            .map_err(|e| MasterError::Unknown(format!("failed to load tokens: {}", e)))?;
        let counter = store
            .load_version_counter()
            .map_err(|e| MasterError::Unknown(format!("failed to load version counter: {}", e)))?;

        let mut index = TokenIndex::new();
        for token in tokens {
            index.insert(token);
        }
        info!(log, "recovered token index";
            "tokens" => index.len(),
            "version_counter" => counter
        );

        Ok(Self {
            index,
            versions: VersionSource::resume(counter),
            store,
            log,
        })
    }

    pub fn token_count(&self) -> usize {
        self.index.len()
    }

    /// Count tokens under a prefix, grouped by the substring after the
    /// prefix up to and including the first occurrence of `group_suffix`
    /// (the whole remainder when the suffix is absent or empty).
    pub fn group(&self, prefix: &str, group_suffix: &str) -> Result<BTreeMap<String, i64>> {
        let mut counts = BTreeMap::new();
        for token in self.index.prefix_scan(prefix) {
            let remainder = &token.name[prefix.len()..];
            let group = if group_suffix.is_empty() {
                remainder
            } else {
                match remainder.find(group_suffix) {
                    Some(pos) => &remainder[..pos + group_suffix.len()],
                    None => remainder,
                }
            };
            *counts.entry(group.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Answer each query with the first `max_tokens` tokens under its
    /// prefix, ascending by name, preserving query order.
    pub fn query(&self, queries: &[TokenQuery]) -> Result<Vec<Vec<Token>>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let scan = self.index.prefix_scan(&query.name_prefix);
            let tokens: Vec<Token> = if query.max_tokens == 0 {
                scan.cloned().collect()
            } else {
                scan.take(query.max_tokens as usize).cloned().collect()
            };
            results.push(tokens);
        }
        Ok(results)
    }

    fn check_modifiable(&self, token: &Token) -> Result<()> {
        if token.name.is_empty() {
            return Err(MasterError::InputError("token with empty name".to_string()));
        }
        match self.index.get(&token.name) {
            Some(existing) => {
                if existing.version != token.version {
                    return Err(MasterError::VersionConflict(format!(
                        "token {} with different version {} found",
                        existing.name, existing.version
                    )));
                }
            }
            None => {
                if token.version != 0 {
                    return Err(MasterError::NotFound(format!(
                        "token {} not found",
                        token.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Atomic batch of updates (inserts carry no version, updates carry the
    /// current one) and deletes (always carry the current version).
    /// Returns the written tokens with their freshly assigned versions.
    pub fn modify(&mut self, updates: Vec<Token>, deletes: Vec<Token>) -> Result<Vec<Token>> {
        for token in &deletes {
            if token.version == 0 {
                return Err(MasterError::InputError(format!(
                    "token {} does not have version set",
                    token.name
                )));
            }
        }
        for token in &updates {
            self.check_modifiable(token)?;
        }
        for token in &deletes {
            if token.name.is_empty() {
                return Err(MasterError::InputError("token with empty name".to_string()));
            }
            match self.index.get(&token.name) {
                None => {
                    return Err(MasterError::NotFound(format!(
                        "token {} not found",
                        token.name
                    )))
                }
                Some(existing) if existing.version != token.version => {
                    return Err(MasterError::VersionConflict(format!(
                        "token {} with different version {} found",
                        existing.name, existing.version
                    )));
                }
                Some(_) => {}
            }
        }

        let mut written = Vec::with_capacity(updates.len());
        for mut token in updates {
            token.version = self.versions.next();
            written.push(token);
        }
        let delete_names: Vec<String> = deletes.iter().map(|t| t.name.clone()).collect();

        self.commit(CommitBatch {
            updates: written.clone(),
            deletes: delete_names.clone(),
            archives: Vec::new(),
            version_counter: self.versions.current(),
        })?;

        for token in &written {
            self.index.insert(token.clone());
        }
        for name in &delete_names {
            self.index.remove(name);
        }
        debug!(self.log, "applied modify";
            "updates" => written.len(),
            "deletes" => delete_names.len()
        );
        Ok(written)
    }

    /// Claim up to `max_tokens` claimable tokens under the query prefix,
    /// preferring higher priority and breaking ties by ascending name.
    pub fn query_and_own(
        &mut self,
        owner: &str,
        expiration_time: i64,
        query: &TokenQuery,
    ) -> Result<Vec<Token>> {
        if owner.is_empty() {
            return Err(MasterError::InputError("owner must not be empty".to_string()));
        }
        let now = now_secs();
        if expiration_time <= now {
            return Err(MasterError::InputError(format!(
                "expiration time {} is in the past",
                expiration_time
            )));
        }

        let mut candidates: Vec<&Token> = self
            .index
            .prefix_scan(&query.name_prefix)
            .filter(|t| !is_owned(t, now))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        if query.max_tokens != 0 {
            candidates.truncate(query.max_tokens as usize);
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut token = candidate.clone();
            token.owner = owner.to_string();
            token.expiration_time = expiration_time;
            token.version = self.versions.next();
            claimed.push(token);
        }

        if !claimed.is_empty() {
            self.commit(CommitBatch {
                updates: claimed.clone(),
                deletes: Vec::new(),
                archives: Vec::new(),
                version_counter: self.versions.current(),
            })?;
            for token in &claimed {
                self.index.insert(token.clone());
            }
            debug!(self.log, "claimed tokens";
                "owner" => owner,
                "count" => claimed.len()
            );
        }
        Ok(claimed)
    }

    /// Atomically move tokens from the current namespace to the archive.
    pub fn archive(&mut self, tokens: Vec<Token>) -> Result<()> {
        for token in &tokens {
            if token.name.is_empty() || token.version == 0 {
                return Err(MasterError::InputError(format!(
                    "token {} does not have version set",
                    token.name
                )));
            }
            match self.index.get(&token.name) {
                None => {
                    return Err(MasterError::NotFound(format!(
                        "token {} not found",
                        token.name
                    )))
                }
                Some(existing) if existing.version != token.version => {
                    return Err(MasterError::VersionConflict(format!(
                        "token {} with different version {} found",
                        existing.name, existing.version
                    )));
                }
                Some(_) => {}
            }
        }

        let mut archives = Vec::with_capacity(tokens.len());
        let mut deletes = Vec::with_capacity(tokens.len());
        for token in &tokens {
            // Archived tokens keep their fields; only the name moves under
            // the archive prefix.
            let mut archived = self.index.get(&token.name).cloned().unwrap_or_default();
            archived.name = format!("{}{}", ARCHIVE_PREFIX, token.name);
            archives.push(archived);
            deletes.push(token.name.clone());
        }

        self.commit(CommitBatch {
            updates: Vec::new(),
            deletes: deletes.clone(),
            archives,
            version_counter: self.versions.current(),
        })?;

        for name in &deletes {
            self.index.remove(name);
        }
        debug!(self.log, "archived tokens"; "count" => deletes.len());
        Ok(())
    }

    fn commit(&self, batch: CommitBatch) -> Result<()> {
        // A failed commit leaves the store untouched (one atomic write
        // batch), so the in-memory state stays consistent and the client
        // gets a retryable UNKNOWN.
        self.store
            .commit(&batch)
            .map_err(|e| MasterError::Unknown(format!("persistence failure: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EphemeralStore;
    use slog::{o, Discard};

    fn handler() -> MasterHandler {
        let log = Logger::root(Discard, o!());
        MasterHandler::recover(Box::new(EphemeralStore::new()), log).unwrap()
    }

    fn insert(name: &str) -> Token {
        Token {
            name: name.to_string(),
            data: b"x".to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_query() {
        let mut master = handler();
        let written = master
            .modify(vec![insert("/a/1"), insert("/a/2"), insert("/b/1")], vec![])
            .unwrap();
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|t| t.version > 0));

        let results = master
            .query(&[TokenQuery {
                name_prefix: "/a/".to_string(),
                max_tokens: 0,
            }])
            .unwrap();
        assert_eq!(results.len(), 1);
        let names: Vec<&str> = results[0].iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["/a/1", "/a/2"]);
        assert!(results[0].iter().all(|t| t.data == b"x"));
    }

    #[test]
    fn test_insert_with_version_is_not_found() {
        let mut master = handler();
        let mut token = insert("/a/1");
        token.version = 42;
        assert!(matches!(
            master.modify(vec![token], vec![]),
            Err(MasterError::NotFound(_))
        ));
    }

    #[test]
    fn test_optimistic_conflict() {
        let mut master = handler();
        let v1 = master.modify(vec![insert("/k")], vec![]).unwrap().remove(0);

        // Another client updates the token first.
        let mut update_b = v1.clone();
        update_b.data = b"b".to_vec();
        master.modify(vec![update_b], vec![]).unwrap();

        // The stale update must conflict.
        let mut update_a = v1;
        update_a.data = b"a".to_vec();
        assert!(matches!(
            master.modify(vec![update_a], vec![]),
            Err(MasterError::VersionConflict(_))
        ));
    }

    #[test]
    fn test_insert_over_existing_conflicts() {
        let mut master = handler();
        master.modify(vec![insert("/k")], vec![]).unwrap();
        assert!(matches!(
            master.modify(vec![insert("/k")], vec![]),
            Err(MasterError::VersionConflict(_))
        ));
    }

    #[test]
    fn test_delete_requires_version() {
        let mut master = handler();
        let token = master.modify(vec![insert("/k")], vec![]).unwrap().remove(0);

        let mut versionless = token.clone();
        versionless.version = 0;
        assert!(matches!(
            master.modify(vec![], vec![versionless]),
            Err(MasterError::InputError(_))
        ));

        master.modify(vec![], vec![token]).unwrap();
        assert_eq!(master.token_count(), 0);
    }

    #[test]
    fn test_failed_batch_has_no_effect() {
        let mut master = handler();
        let good = insert("/a/1");
        let mut bad = insert("/a/2");
        bad.version = 99;
        assert!(master.modify(vec![good, bad], vec![]).is_err());
        assert_eq!(master.token_count(), 0);
    }

    #[test]
    fn test_versions_unique_across_batch() {
        let mut master = handler();
        let written = master
            .modify(vec![insert("/a/1"), insert("/a/2")], vec![])
            .unwrap();
        assert_ne!(written[0].version, written[1].version);
    }

    #[test]
    fn test_claim_prefers_priority_then_name() {
        let mut master = handler();
        let mut low = insert("/job/runnable/k");
        low.priority = 1.0;
        let mut high = insert("/job/runnable/j");
        high.priority = 5.0;
        let mut tied = insert("/job/runnable/a");
        tied.priority = 1.0;
        master.modify(vec![low, high, tied], vec![]).unwrap();

        let query = TokenQuery {
            name_prefix: "/job/runnable/".to_string(),
            max_tokens: 1,
        };
        let exp = now_secs() + 60;

        let first = master.query_and_own("w1", exp, &query).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "/job/runnable/j");
        assert_eq!(first[0].owner, "w1");

        // The leased token is skipped; the tie breaks by ascending name.
        let second = master.query_and_own("w2", exp, &query).unwrap();
        assert_eq!(second[0].name, "/job/runnable/a");
    }

    #[test]
    fn test_expired_lease_is_claimable() {
        let mut master = handler();
        let token = master
            .modify(vec![insert("/job/runnable/j")], vec![])
            .unwrap()
            .remove(0);

        // Simulate an expired lease by writing one that ends now.
        let mut leased = token;
        leased.owner = "w1".to_string();
        leased.expiration_time = now_secs();
        master.modify(vec![leased], vec![]).unwrap();

        let query = TokenQuery {
            name_prefix: "/job/".to_string(),
            max_tokens: 1,
        };
        let claimed = master.query_and_own("w3", now_secs() + 60, &query).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].owner, "w3");
    }

    #[test]
    fn test_claim_with_past_expiration_is_input_error() {
        let mut master = handler();
        let query = TokenQuery {
            name_prefix: "/".to_string(),
            max_tokens: 1,
        };
        assert!(matches!(
            master.query_and_own("w1", now_secs() - 10, &query),
            Err(MasterError::InputError(_))
        ));
    }

    #[test]
    fn test_claim_empty_result_is_ok() {
        let mut master = handler();
        let query = TokenQuery {
            name_prefix: "/nothing/".to_string(),
            max_tokens: 1,
        };
        assert!(master
            .query_and_own("w1", now_secs() + 60, &query)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_permanent_lease_never_claimable() {
        let mut master = handler();
        let token = master
            .modify(vec![insert("/job/runnable/j")], vec![])
            .unwrap()
            .remove(0);
        let mut disabled = token;
        disabled.owner = "admin".to_string();
        disabled.expiration_time = i64::MAX;
        master.modify(vec![disabled], vec![]).unwrap();

        let query = TokenQuery {
            name_prefix: "/job/".to_string(),
            max_tokens: 1,
        };
        assert!(master
            .query_and_own("w1", now_secs() + 60, &query)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_archive_moves_atomically() {
        let mut master = handler();
        let token = master
            .modify(vec![insert("/workflow/w/i/job/runnable/j")], vec![])
            .unwrap()
            .remove(0);

        master.archive(vec![token]).unwrap();

        let live = master
            .query(&[TokenQuery {
                name_prefix: "/workflow/".to_string(),
                max_tokens: 0,
            }])
            .unwrap();
        assert!(live[0].is_empty());
    }

    #[test]
    fn test_archive_with_stale_version_conflicts() {
        let mut master = handler();
        let token = master.modify(vec![insert("/w/t")], vec![]).unwrap().remove(0);
        let mut refreshed = token.clone();
        refreshed.data = b"new".to_vec();
        master.modify(vec![refreshed], vec![]).unwrap();

        assert!(matches!(
            master.archive(vec![token]),
            Err(MasterError::VersionConflict(_))
        ));
        assert_eq!(master.token_count(), 1);
    }

    #[test]
    fn test_group_counts() {
        let mut master = handler();
        master
            .modify(
                vec![
                    insert("/dir1/sub1/a"),
                    insert("/dir1/sub1/b"),
                    insert("/dir1/sub2/c"),
                    insert("/dir2/x"),
                ],
                vec![],
            )
            .unwrap();

        let counts = master.group("/dir1/", "/").unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts["sub1/"], 2);
        assert_eq!(counts["sub2/"], 1);
    }

    #[test]
    fn test_group_without_suffix_uses_remainder() {
        let mut master = handler();
        master
            .modify(vec![insert("/dir/a"), insert("/dir/b")], vec![])
            .unwrap();
        let counts = master.group("/dir/", "").unwrap();
        assert_eq!(counts["a"], 1);
        assert_eq!(counts["b"], 1);
    }
}
