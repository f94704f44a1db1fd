//! Provides fingerprints which stand in for cached values on the cluster.
//!
//! Values are never sent to other nodes. Instead, each write publishes a [Digest](Digest) of the
//! value (a SHA-256 over a canonical byte representation). Each peer compares this digest with the
//! one of its own copy and either keeps or drops it.
//!
//! A [Fingerprint](Fingerprint) bundles the digest with the value itself. The value is only ever
//! present within the process which performed the write. It is explicitly excluded from the wire
//! encoding, and the channel API only accepts digests.
//!
//! # Examples
//! ```
//! # use invalidation_cache::fingerprint::Fingerprint;
//! let local = Fingerprint::of("Hello World".to_owned());
//! assert_eq!(local.value().unwrap(), "Hello World");
//!
//! // Only the digest crosses the wire...
//! let wire = local.encode();
//! assert_eq!(wire.len(), 32);
//!
//! // ..so that the decoded fingerprint has no value but still equals the original one.
//! let remote = Fingerprint::<String>::decode(&wire).unwrap();
//! assert_eq!(remote.value().is_none(), true);
//! assert_eq!(remote, local);
//! ```
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest as _, Sha256};

/// The sentinel which is fingerprinted to obtain the tombstone digest.
pub const TOMBSTONE_SENTINEL: &str = "NULL_OBJECT_INVALIDATION";

/// Contains the number of bytes in a digest.
pub const DIGEST_LENGTH: usize = 32;

lazy_static::lazy_static! {
    static ref TOMBSTONE: Digest = Digest::of(TOMBSTONE_SENTINEL);
}

/// Represents the SHA-256 digest of a value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// Computes the digest of the given value.
    pub fn of<V: Digestible + ?Sized>(value: &V) -> Self {
        let mut hasher = Sha256::new();
        value.update_digest(&mut hasher);
        Digest(hasher.finalize().into())
    }

    /// Returns the digest which signals that a key has to be evicted on all peers.
    pub fn tombstone() -> Self {
        *TOMBSTONE
    }

    /// Determines if this is the tombstone digest.
    pub fn is_tombstone(&self) -> bool {
        *self == *TOMBSTONE
    }

    /// Provides access to the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    /// Writes the wire representation (the raw bytes) into the given buffer.
    pub fn encode_into(&self, buffer: &mut BytesMut) {
        buffer.put_slice(&self.0);
    }

    /// Reads a digest from its wire representation.
    ///
    /// # Errors
    /// Fails if the given data isn't exactly [DIGEST_LENGTH](DIGEST_LENGTH) bytes long.
    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let bytes: [u8; DIGEST_LENGTH] = data.try_into().map_err(|_| {
            anyhow::anyhow!(
                "A digest has to be {} bytes long but {} bytes were given.",
                DIGEST_LENGTH,
                data.len()
            )
        })?;

        Ok(Digest(bytes))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // The first 8 bytes are more than enough to tell digests apart in logs...
        write!(f, "Digest({}..)", hex::encode(&self.0[..8]))
    }
}

/// Describes values which can be fingerprinted.
///
/// Implementations have to feed a canonical representation of the value into the given hasher,
/// so that equal values always yield the same digest, on every node and in every process.
pub trait Digestible {
    /// Feeds the canonical representation of this value into the hasher.
    fn update_digest(&self, hasher: &mut Sha256);
}

impl Digestible for str {
    fn update_digest(&self, hasher: &mut Sha256) {
        hasher.update(self.as_bytes());
    }
}

impl Digestible for String {
    fn update_digest(&self, hasher: &mut Sha256) {
        self.as_str().update_digest(hasher);
    }
}

impl Digestible for [u8] {
    fn update_digest(&self, hasher: &mut Sha256) {
        hasher.update(self);
    }
}

impl Digestible for Vec<u8> {
    fn update_digest(&self, hasher: &mut Sha256) {
        self.as_slice().update_digest(hasher);
    }
}

impl Digestible for bool {
    fn update_digest(&self, hasher: &mut Sha256) {
        hasher.update([*self as u8]);
    }
}

macro_rules! digestible_numbers {
    ($($number:ty),*) => {
        $(
            impl Digestible for $number {
                fn update_digest(&self, hasher: &mut Sha256) {
                    hasher.update(self.to_le_bytes());
                }
            }
        )*
    };
}

digestible_numbers!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl<T: Digestible + ?Sized> Digestible for &T {
    fn update_digest(&self, hasher: &mut Sha256) {
        (**self).update_digest(hasher);
    }
}

impl<T: Digestible + ?Sized> Digestible for Arc<T> {
    fn update_digest(&self, hasher: &mut Sha256) {
        (**self).update_digest(hasher);
    }
}

impl<T: Digestible + ?Sized> Digestible for Box<T> {
    fn update_digest(&self, hasher: &mut Sha256) {
        (**self).update_digest(hasher);
    }
}

impl<T: Digestible> Digestible for Option<T> {
    fn update_digest(&self, hasher: &mut Sha256) {
        match self {
            Some(value) => {
                hasher.update([1u8]);
                value.update_digest(hasher);
            }
            None => hasher.update([0u8]),
        }
    }
}

/// Bundles the digest of a value with the value itself.
///
/// Fingerprints produced by a local write carry the value, fingerprints received from the
/// channel don't. Equality is solely determined by the digest.
#[derive(Clone)]
pub struct Fingerprint<V> {
    digest: Digest,
    value: Option<V>,
}

impl<V: Digestible> Fingerprint<V> {
    /// Creates a local fingerprint which carries the given value.
    pub fn of(value: V) -> Self {
        Fingerprint {
            digest: Digest::of(&value),
            value: Some(value),
        }
    }
}

impl<V> Fingerprint<V> {
    /// Creates a fingerprint for a digest received from another node.
    pub fn foreign(digest: Digest) -> Self {
        Fingerprint {
            digest,
            value: None,
        }
    }

    /// Returns the tombstone fingerprint.
    pub fn tombstone() -> Self {
        Fingerprint::foreign(Digest::tombstone())
    }

    /// Returns the digest of the value.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Returns the value if this fingerprint was created locally.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Consumes the fingerprint and yields its value (if present).
    pub fn into_value(self) -> Option<V> {
        self.value
    }

    /// Determines if this fingerprint was created by a local write.
    pub fn is_local(&self) -> bool {
        self.value.is_some()
    }

    /// Returns the wire representation which only consists of the digest.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(DIGEST_LENGTH);
        self.digest.encode_into(&mut buffer);
        buffer.freeze()
    }

    /// Reads a fingerprint from its wire representation.
    ///
    /// The result is always a foreign fingerprint without a value.
    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(Fingerprint::foreign(Digest::decode(data)?))
    }
}

impl<V> PartialEq for Fingerprint<V> {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl<V> Eq for Fingerprint<V> {}

impl<V> Hash for Fingerprint<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl<V> Debug for Fingerprint<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fingerprint")
            .field("digest", &self.digest)
            .field("local", &self.is_local())
            .finish()
    }
}
