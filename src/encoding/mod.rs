//! Binary data encodings. Bincode is used both for framing consensus
//! messages handed to a transport and for any value snapshots a collaborator
//! chooses to persist.

pub mod bincode;

use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A value that can be encoded to and from binary via Bincode. Implemented
/// by all wire message types.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
