//! Typed gRPC client for the token master.
//!
//! Wraps the generated client so that callers work with the native request
//! shapes and get `MasterError` back instead of raw statuses.  Cloning is
//! cheap; clones share the underlying channel.

use std::collections::BTreeMap;

use tonic::transport::Channel;

use crate::grpc::proto::{
    token_master_client::TokenMasterClient, ArchiveRequest, GroupRequest, ModifyRequest,
    QueryAndOwnRequest, QueryRequest, Token, TokenQuery,
};
use crate::master::{MasterError, Result};

#[derive(Clone)]
pub struct MasterClient {
    client: TokenMasterClient<Channel>,
}

impl MasterClient {
    /// Connect to a master at `address` (host:port).
    pub async fn connect(address: &str) -> Result<Self> {
        let endpoint = format!("http://{}", address);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| MasterError::Unknown(format!("invalid master address: {}", e)))?
            .connect()
            .await
            .map_err(|e| MasterError::Unknown(format!("connection failed: {}", e)))?;
        Ok(Self {
            client: TokenMasterClient::new(channel),
        })
    }

    pub async fn group(&mut self, prefix: &str, suffix: &str) -> Result<BTreeMap<String, i64>> {
        let response = self
            .client
            .group(GroupRequest {
                name_prefix: prefix.to_string(),
                group_suffix: suffix.to_string(),
            })
            .await?;
        Ok(response.into_inner().counts.into_iter().collect())
    }

    /// Run a batch of prefix queries; one token list per query, in order.
    pub async fn query(&mut self, queries: Vec<TokenQuery>) -> Result<Vec<Vec<Token>>> {
        let response = self.client.query(QueryRequest { queries }).await?;
        Ok(response
            .into_inner()
            .results
            .into_iter()
            .map(|list| list.tokens)
            .collect())
    }

    /// Single-prefix convenience around `query`.  `max_tokens` zero means
    /// no cap.
    pub async fn query_prefix(&mut self, prefix: &str, max_tokens: u64) -> Result<Vec<Token>> {
        let mut results = self
            .query(vec![TokenQuery {
                name_prefix: prefix.to_string(),
                max_tokens,
            }])
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    pub async fn modify(&mut self, updates: Vec<Token>, deletes: Vec<Token>) -> Result<Vec<Token>> {
        let response = self
            .client
            .modify(ModifyRequest { updates, deletes })
            .await?;
        Ok(response.into_inner().updates)
    }

    pub async fn query_and_own(
        &mut self,
        owner: &str,
        expiration_time: i64,
        prefix: &str,
        max_tokens: u64,
    ) -> Result<Vec<Token>> {
        let response = self
            .client
            .query_and_own(QueryAndOwnRequest {
                owner: owner.to_string(),
                expiration_time,
                query: Some(TokenQuery {
                    name_prefix: prefix.to_string(),
                    max_tokens,
                }),
            })
            .await?;
        Ok(response.into_inner().tokens)
    }

    pub async fn archive(&mut self, tokens: Vec<Token>) -> Result<()> {
        self.client.archive(ArchiveRequest { tokens }).await?;
        Ok(())
    }
}
