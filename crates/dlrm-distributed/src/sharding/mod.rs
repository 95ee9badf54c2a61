//! Logical device meshes and tensor sharding descriptions.

mod mesh;
mod spec;

pub use mesh::*;
pub use spec::*;
