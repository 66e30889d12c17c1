//! Device and encoding types shared across StrataDB tiers.

use serde::{Deserialize, Serialize};

/// Opaque identifier for the device a buffer tier serves.
///
/// The in-memory tier only moves host memory, but transfer signatures carry
/// source and destination devices so tiers backed by other devices can slot
/// in behind the same contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub i32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Columnar encoding applied to a chunk's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// Raw fixed-width values.
    #[default]
    None,
    /// Run-length encoded.
    Rle,
    /// Delta encoded against the previous value.
    Delta,
    /// Dictionary encoded.
    Dictionary,
}

/// Encoder metadata carried alongside a chunk's bytes.
///
/// Synchronized from source to destination whenever chunk bytes move between
/// tiers, so a chunk's interpretation travels with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncoderMeta {
    /// Encoding applied to the chunk bytes.
    pub encoding: Encoding,
    /// Number of logical elements encoded.
    pub elem_count: usize,
}
