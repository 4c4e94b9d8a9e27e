//! In-memory token index.
//!
//! Tokens are kept in an ordered map keyed by name, so exact lookup and
//! lexicographic prefix scans both come straight from the container.  The
//! name hierarchy is a first-class index: a prefix scan over
//! `/workflow/w/i/job/runnable/` *is* the list of runnable jobs.

use std::collections::BTreeMap;

use crate::grpc::proto::Token;

/// Ordered name -> token map with prefix iteration.
#[derive(Debug, Default)]
pub struct TokenIndex {
    tokens: BTreeMap<String, Token>,
}

impl TokenIndex {
    pub fn new() -> Self {
        Self {
            tokens: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Token> {
        self.tokens.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tokens.contains_key(name)
    }

    /// Insert or replace a token under its name.
    pub fn insert(&mut self, token: Token) {
        self.tokens.insert(token.name.clone(), token);
    }

    pub fn remove(&mut self, name: &str) -> Option<Token> {
        self.tokens.remove(name)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens whose name starts with `prefix`, in ascending name order.
    pub fn prefix_scan<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Token> + 'a {
        self.tokens
            .range(prefix.to_string()..)
            .take_while(move |(name, _)| name.starts_with(prefix))
            .map(|(_, token)| token)
    }
}
