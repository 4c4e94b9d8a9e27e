//! gRPC service implementation for the token master.
//!
//! The service itself is thin: every RPC is turned into a request on the
//! master's mailbox and the typed error comes back as a gRPC status.  RPCs
//! may arrive on any number of connections; the total order is imposed by
//! the mailbox, not here.

use std::collections::BTreeMap;

use slog::{info, Logger};
use tokio::sync::oneshot;
use tonic::{transport::Server, Request, Response, Status};
use tonic_reflection::server::Builder as ReflectionBuilder;

use crate::grpc::proto::{
    token_master_server::{TokenMaster, TokenMasterServer},
    ArchiveRequest, ArchiveResponse, GroupRequest, GroupResponse, ModifyRequest, ModifyResponse,
    QueryAndOwnRequest, QueryAndOwnResponse, QueryRequest, QueryResponse, TokenList,
};
use crate::master::MasterHandle;

/// gRPC service delegating to the master task.
pub struct TokenMasterService {
    master: MasterHandle,
}

impl TokenMasterService {
    pub fn new(master: MasterHandle) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl TokenMaster for TokenMasterService {
    async fn group(
        &self,
        request: Request<GroupRequest>,
    ) -> Result<Response<GroupResponse>, Status> {
        let req = request.into_inner();
        let counts: BTreeMap<String, i64> = self
            .master
            .group(req.name_prefix, req.group_suffix)
            .await?;
        Ok(Response::new(GroupResponse {
            counts: counts.into_iter().collect(),
        }))
    }

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<QueryResponse>, Status> {
        let req = request.into_inner();
        let results = self.master.query(req.queries).await?;
        Ok(Response::new(QueryResponse {
            results: results
                .into_iter()
                .map(|tokens| TokenList { tokens })
                .collect(),
        }))
    }

    async fn modify(
        &self,
        request: Request<ModifyRequest>,
    ) -> Result<Response<ModifyResponse>, Status> {
        let req = request.into_inner();
        let updates = self.master.modify(req.updates, req.deletes).await?;
        Ok(Response::new(ModifyResponse { updates }))
    }

    async fn query_and_own(
        &self,
        request: Request<QueryAndOwnRequest>,
    ) -> Result<Response<QueryAndOwnResponse>, Status> {
        let req = request.into_inner();
        let query = req
            .query
            .ok_or_else(|| Status::invalid_argument("query is required"))?;
        let tokens = self
            .master
            .query_and_own(req.owner, req.expiration_time, query)
            .await?;
        Ok(Response::new(QueryAndOwnResponse { tokens }))
    }

    async fn archive(
        &self,
        request: Request<ArchiveRequest>,
    ) -> Result<Response<ArchiveResponse>, Status> {
        let req = request.into_inner();
        self.master.archive(req.tokens).await?;
        Ok(Response::new(ArchiveResponse {}))
    }
}

/// gRPC server handle with graceful shutdown support.
///
/// Shutting down stops accepting RPCs; the master task drains its in-flight
/// request and exits once the last handle is gone.
pub struct GrpcServerHandle {
    shutdown_tx: oneshot::Sender<()>,
}

impl GrpcServerHandle {
    /// Trigger graceful shutdown of the server.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Start the token master gRPC server on `address`.
pub async fn start_grpc_server(
    address: String,
    master: MasterHandle,
    log: Logger,
) -> Result<GrpcServerHandle, Box<dyn std::error::Error>> {
    let addr = address.parse()?;

    let service = TokenMasterService::new(master);

    let reflection_service = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(crate::grpc::proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    info!(log, "starting token master server"; "address" => &address);
    tokio::spawn(async move {
        Server::builder()
            .add_service(TokenMasterServer::new(service))
            .add_service(reflection_service)
            .serve_with_shutdown(addr, async {
                shutdown_rx.await.ok();
            })
            .await
            .expect("gRPC server failed");
    });

    Ok(GrpcServerHandle { shutdown_tx })
}
