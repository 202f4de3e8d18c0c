//! Control messages exchanged between file servers.

use serde::{Deserialize, Serialize};

/// A control message announcing a file to store or requesting one back.
///
/// The postcard variant index is the wire discriminant, so variants must only
/// ever be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// The sender is about to push `size` raw bytes that should be stored
    /// under `(id, key)` on the receiving node.
    StoreFile { id: String, key: String, size: u64 },
    /// The sender wants the object it previously stored under `(id, key)`.
    GetFile { id: String, key: String },
}

impl Message {
    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StoreFile { .. } => "store_file",
            Message::GetFile { .. } => "get_file",
        }
    }
}

/// Serialize a `Message` to compact binary via postcard.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(msg)
}

/// Deserialize a `Message` from postcard bytes.
pub fn decode_message(data: &[u8]) -> Result<Message, postcard::Error> {
    postcard::from_bytes(data)
}
