//! STRATA gRPC API
//!
//! This crate defines the gRPC protocol for the strata daemon ↔ CLI
//! communication as well as the operation wire format consumed by the
//! solver. The protobuf definitions are in `proto/strata.proto` and
//! code-generated via `tonic-build`.

// Include the generated code
pub mod strata {
    pub mod v1 {
        tonic::include_proto!("strata.v1");
    }
}
