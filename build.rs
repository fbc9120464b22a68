//! Generates the `connector.RemoteConnection` client and server stubs.
//!
//! The messages are declared by hand in `src/proto.rs` with prost derives, so
//! the service is described with tonic-build's manual builder and no `protoc`
//! is required at build time.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path(CODEC)
        .build()
}

fn main() {
    let service = Service::builder()
        .name("RemoteConnection")
        .package("connector")
        .comment("Control and data plane between two connectors.")
        .method(unary(
            "expose_service",
            "ExposeService",
            "crate::proto::ExposeRequest",
            "crate::proto::ExposeResponse",
        ))
        .method(unary(
            "destroy_service",
            "DestroyService",
            "crate::proto::DestroyRequest",
            "crate::proto::NullMessage",
        ))
        .method(unary(
            "list_services",
            "ListServices",
            "crate::proto::NullMessage",
            "crate::proto::ListResponse",
        ))
        .method(
            Method::builder()
                .name("open_stream")
                .route_name("OpenStream")
                .input_type("crate::proto::OpenData")
                .output_type("crate::proto::OpenData")
                .codec_path(CODEC)
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[service]);
    println!("cargo:rerun-if-changed=build.rs");
}
