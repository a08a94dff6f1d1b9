//! Generated protobuf and gRPC types for the `log.v1` API.

pub mod v1 {
    tonic::include_proto!("log.v1");
}
