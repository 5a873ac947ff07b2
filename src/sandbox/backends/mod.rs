pub mod docker;
pub mod shuru;

pub use docker::{DockerBackend, DockerConfig};
pub use shuru::{ShuruBackend, ShuruConfig};
