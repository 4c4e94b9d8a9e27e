//! gRPC surface of the token master: the generated protocol types, the
//! server wiring, and a typed client used by workers, schedulers, and
//! tooling.

pub mod client;
pub mod server;

// Include the generated protobuf code
pub mod proto {
    tonic_prost::include_proto!("tokenmill");

    // File descriptor for gRPC reflection
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/tokenmill_descriptor.bin"));
}

pub use client::MasterClient;
pub use server::{start_grpc_server, GrpcServerHandle};
