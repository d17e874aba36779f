/// Builds the gRPC client and server code for `proto/idalloc.proto`.
///
/// Besides the message types and service traits, a serialized file descriptor
/// set is written to `OUT_DIR/idalloc_descriptor.bin` so the server can expose
/// it through gRPC reflection.
///
/// Generated code is accessible in Rust via:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("idalloc");
/// }
/// ```
///
/// # Panics
///
/// Panics if code generation fails.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("idalloc_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/idalloc.proto"], &["proto"])
        .unwrap();
}
