//! # Partitioning Contract
//!
//! Partition keys, static key assignment and the codec contract used when an
//! operator runs as N partitioned instances.
//!
//! A [`PartitionKey`] is a fixed-width bit pattern. A record whose hash agrees
//! with the pattern on the key's low `width` bits belongs to the partition
//! holding that key. Every partitioned instance is given a set of keys when the
//! plan is compiled; the set travels in the consumer's input endpoint and is
//! handed to the transport service as the subscription filter.
//!
//! ## Usage
//!
//! ```rust
//! use streamweave_control::partitioning::{round_robin_keys, PartitionKey};
//!
//! // 3 partitions need 2 bits; the 4th key value wraps around to partition 0.
//! let keys = round_robin_keys(3);
//! assert_eq!(keys.len(), 3);
//! assert!(keys[0].contains(&PartitionKey::new(2, 0b00)));
//! assert!(keys[0].contains(&PartitionKey::new(2, 0b11)));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Fixed-width bit-vector identifying one slice of a partitioned stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
  width: u8,
  bits: u32,
}

/// The "no filter" key: zero width, zero pattern. Matches every record.
///
/// Distinct from an empty key set, which matches nothing.
pub const NULL_PARTITION: PartitionKey = PartitionKey { width: 0, bits: 0 };

/// A set of keys owned by one partitioned instance.
pub type PartitionKeys = BTreeSet<PartitionKey>;

impl PartitionKey {
  /// Creates a key of `width` bits. Bits above `width` are discarded.
  pub const fn new(width: u8, bits: u32) -> Self {
    let width = if width > 32 { 32 } else { width };
    Self {
      width,
      bits: bits & mask_for(width),
    }
  }

  /// Number of significant bits.
  pub const fn width(self) -> u8 {
    self.width
  }

  /// The bit pattern.
  pub const fn bits(self) -> u32 {
    self.bits
  }

  /// Mask selecting the significant bits of a record hash.
  pub const fn mask(self) -> u32 {
    mask_for(self.width)
  }

  /// Returns `true` for [`NULL_PARTITION`].
  pub const fn is_null(self) -> bool {
    self.width == 0
  }

  /// Returns `true` if a record with `hash` belongs to this key.
  pub const fn matches(self, hash: u32) -> bool {
    (hash & self.mask()) == self.bits
  }
}

impl fmt::Display for PartitionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_null() {
      write!(f, "*")
    } else {
      write!(f, "{:0width$b}", self.bits, width = self.width as usize)
    }
  }
}

const fn mask_for(width: u8) -> u32 {
  if width == 0 {
    0
  } else if width >= 32 {
    u32::MAX
  } else {
    (1u32 << width) - 1
  }
}

/// Returns `true` if any key in `keys` accepts a record with `hash`.
pub fn keys_accept(keys: &PartitionKeys, hash: u32) -> bool {
  keys.iter().any(|k| k.matches(hash))
}

/// Number of key bits needed to tell `partition_count` partitions apart.
pub fn partition_bits(partition_count: u32) -> u8 {
  if partition_count <= 1 {
    0
  } else {
    (u32::BITS - (partition_count - 1).leading_zeros()) as u8
  }
}

/// Default static key assignment.
///
/// Every key value of the required width is handed out round-robin, so value
/// `v` lands on partition `v % partition_count` and no record is left without
/// an owner when the count is not a power of two. A single partition owns
/// [`NULL_PARTITION`].
pub fn round_robin_keys(partition_count: u32) -> Vec<PartitionKeys> {
  if partition_count <= 1 {
    return vec![BTreeSet::from([NULL_PARTITION])];
  }
  let width = partition_bits(partition_count);
  let mut assignment = vec![PartitionKeys::new(); partition_count as usize];
  for value in 0..=mask_for(width) {
    assignment[(value % partition_count) as usize].insert(PartitionKey::new(width, value));
  }
  assignment
}

/// Control records interleaved with data on a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRecord {
  /// Start of a streaming window.
  BeginWindow(u64),
  /// End of a streaming window.
  EndWindow(u64),
  /// Upstream has finished.
  EndStream,
}

/// A record as seen by a partition codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
  /// Serialized data payload.
  Data(Vec<u8>),
  /// Window or stream marker; never routed by key.
  Control(ControlRecord),
}

/// Partitioning half of a stream codec.
///
/// The compiler asks a codec for its static key assignment; the worker runtime
/// asks it for the partition hash of each data record.
pub trait PartitionCodec: Send + Sync + fmt::Debug {
  /// Reference embedded in descriptors and looked up in a [`CodecRegistry`].
  fn name(&self) -> &str;

  /// Key sets for `partition_count` instances, one per instance.
  fn assign_keys(&self, partition_count: u32) -> Vec<PartitionKeys> {
    round_robin_keys(partition_count)
  }

  /// Partition hash of a data payload.
  fn partition(&self, payload: &[u8]) -> u32;

  /// Partition hash of a record.
  ///
  /// # Panics
  ///
  /// Panics when handed a control record. Control records are broadcast by the
  /// runtime and asking for their partition is a caller bug that would
  /// otherwise mis-route them.
  fn route(&self, record: &Record) -> u32 {
    match record {
      Record::Data(payload) => self.partition(payload),
      Record::Control(control) => panic!(
        "partition codec '{}' invoked on control record {:?}",
        self.name(),
        control
      ),
    }
  }
}

/// Hashes the payload bytes.
#[derive(Clone, Debug, Default)]
pub struct HashCodec;

impl HashCodec {
  /// Registry name of this codec.
  pub const NAME: &'static str = "hash";
}

impl PartitionCodec for HashCodec {
  fn name(&self) -> &str {
    Self::NAME
  }

  fn partition(&self, payload: &[u8]) -> u32 {
    use std::collections::hash_map::DefaultHasher;

    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish() as u32
  }
}

/// Named codecs available to the compiler.
#[derive(Clone, Debug, Default)]
pub struct CodecRegistry {
  codecs: HashMap<String, Arc<dyn PartitionCodec>>,
}

impl CodecRegistry {
  /// Creates a registry holding only [`HashCodec`].
  pub fn new() -> Self {
    Self::default().with_codec(Arc::new(HashCodec))
  }

  /// Registers `codec` under its own name.
  #[must_use]
  pub fn with_codec(mut self, codec: Arc<dyn PartitionCodec>) -> Self {
    self.codecs.insert(codec.name().to_string(), codec);
    self
  }

  /// Looks up a codec by name.
  pub fn get(&self, name: &str) -> Option<Arc<dyn PartitionCodec>> {
    self.codecs.get(name).cloned()
  }
}
