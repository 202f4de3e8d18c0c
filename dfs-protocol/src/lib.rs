//! Shared message types, registry node records, and wire framing for dfs.

pub mod message;
pub mod node;
pub mod wire;

pub use message::Message;
pub use node::Node;
