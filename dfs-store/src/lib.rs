//! Content-addressed object storage with optional at-rest encryption.

pub mod crypto;
pub mod path;
pub mod store;

pub use path::{PathKey, PathTransform};
pub use store::Storage;
