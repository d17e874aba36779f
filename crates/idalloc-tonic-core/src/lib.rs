#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can access `idalloc` via
// `idalloc_tonic_core::idalloc`
pub use idalloc;

pub mod proto {
    tonic::include_proto!("idalloc");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("idalloc_descriptor");
}
