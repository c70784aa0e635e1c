use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `smelter`, this serves two purposes:
/// 1. It fingerprints a source unit together with the compiler setting used
///    for it, which is the key of the artifact cache.
/// 2. It names entries of the durable cache on disk (`<hex>.cbor`), so two
///    processes that compile the same input agree on the file name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        crate::utils::hex(&self.0)
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = crate::utils::unhex(text)?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash32(bytes))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Hash32::from_hex(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid hash '{text}'")))
    }
}

/// Incremental BLAKE3 hasher with length-prefixed fields, so that
/// `("ab", "c")` and `("a", "bc")` never collide.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn new(domain: &str) -> Self {
        let mut hasher = Self::default();
        hasher.field(domain.as_bytes());
        hasher
    }

    pub(crate) fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

/// Cooperative cancellation shared between a run and its tasks.
///
/// Cancelling does not interrupt an action that is already running; the
/// scheduler stops starting new tasks and actions may poll
/// [`TaskContext::is_cancelled`](crate::TaskContext::is_cancelled).
pub use tokio_util::sync::CancellationToken;
