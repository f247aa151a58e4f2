//! Tests for partition keys, static assignment and codec routing.

use crate::partitioning::{
  keys_accept, partition_bits, round_robin_keys, CodecRegistry, ControlRecord, HashCodec,
  PartitionCodec, PartitionKey, PartitionKeys, Record, NULL_PARTITION,
};
use std::collections::BTreeSet;

#[test]
fn test_partition_key_masks_excess_bits() {
  let key = PartitionKey::new(2, 0b1110);
  assert_eq!(key.bits(), 0b10);
  assert_eq!(key.mask(), 0b11);
  assert_eq!(key, PartitionKey::new(2, 0b10));
  assert_ne!(key, PartitionKey::new(3, 0b10));
}

#[test]
fn test_null_partition_is_not_the_empty_set() {
  assert!(NULL_PARTITION.is_null());
  assert!(NULL_PARTITION.matches(0xdead_beef));

  let unfiltered = BTreeSet::from([NULL_PARTITION]);
  let empty = PartitionKeys::new();
  assert!(keys_accept(&unfiltered, 7));
  assert!(!keys_accept(&empty, 7));
  assert_ne!(unfiltered, empty);
}

#[test]
fn test_partition_bits() {
  assert_eq!(partition_bits(1), 0);
  assert_eq!(partition_bits(2), 1);
  assert_eq!(partition_bits(3), 2);
  assert_eq!(partition_bits(4), 2);
  assert_eq!(partition_bits(5), 3);
}

#[test]
fn test_round_robin_covers_every_key_value() {
  let keys = round_robin_keys(3);
  assert_eq!(keys.len(), 3);
  assert_eq!(
    keys[0],
    BTreeSet::from([PartitionKey::new(2, 0), PartitionKey::new(2, 3)])
  );
  assert_eq!(keys[1], BTreeSet::from([PartitionKey::new(2, 1)]));
  assert_eq!(keys[2], BTreeSet::from([PartitionKey::new(2, 2)]));

  // Every hash is owned by exactly one partition.
  for hash in 0..64u32 {
    let owners = keys.iter().filter(|k| keys_accept(k, hash)).count();
    assert_eq!(owners, 1, "hash {} owned by {} partitions", hash, owners);
  }
}

#[test]
fn test_single_partition_owns_null_key() {
  assert_eq!(round_robin_keys(1), vec![BTreeSet::from([NULL_PARTITION])]);
}

#[test]
fn test_display() {
  assert_eq!(PartitionKey::new(3, 0b101).to_string(), "101");
  assert_eq!(PartitionKey::new(2, 1).to_string(), "01");
  assert_eq!(NULL_PARTITION.to_string(), "*");
}

#[test]
fn test_hash_codec_is_deterministic() {
  let codec = HashCodec;
  let record = Record::Data(b"user-42".to_vec());
  assert_eq!(codec.route(&record), codec.route(&record));
  assert_eq!(codec.route(&record), codec.partition(b"user-42"));
}

#[test]
#[should_panic(expected = "control record")]
fn test_routing_a_control_record_panics() {
  HashCodec.route(&Record::Control(ControlRecord::EndWindow(7)));
}

#[test]
fn test_registry_lookup() {
  let registry = CodecRegistry::new();
  assert!(registry.get(HashCodec::NAME).is_some());
  assert!(registry.get("missing").is_none());
}
