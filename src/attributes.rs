//! # Attributes
//!
//! Typed key/value settings attached to graphs, operators and ports.
//!
//! Attributes are declared on the logical graph and copied into the physical
//! plan as immutable snapshots; deploy descriptors carry those snapshots to the
//! worker runtime unchanged. Maps are ordered so that two snapshots of the same
//! declaration always compare and serialize identically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of containers the application may occupy (graph attribute).
pub const CONTAINERS_MAX_COUNT: &str = "CONTAINERS_MAX_COUNT";
/// Number of partitioned instances created for an operator (operator attribute).
pub const INITIAL_PARTITION_COUNT: &str = "INITIAL_PARTITION_COUNT";
/// Memory ask in megabytes for one operator instance (operator attribute).
pub const MEMORY_MB: &str = "MEMORY_MB";
/// Idle spin interval of the operator or port, in milliseconds.
pub const SPIN_MILLIS: &str = "SPIN_MILLIS";
/// Capacity of the queue backing a port.
pub const QUEUE_CAPACITY: &str = "QUEUE_CAPACITY";
/// Input port attribute: partition the consumer exactly like its producer.
pub const PARTITION_PARALLEL: &str = "PARTITION_PARALLEL";
/// Output port attribute: logic reference used for unifiers merging this port.
pub const UNIFIER: &str = "UNIFIER";

/// A single attribute value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
  /// Integral setting (capacities, counts, intervals).
  Integer(i64),
  /// Flag.
  Boolean(bool),
  /// Free-form text such as a logic reference.
  Text(String),
}

impl AttributeValue {
  /// Returns the integer payload, if this is an integer.
  pub fn as_int(&self) -> Option<i64> {
    match self {
      AttributeValue::Integer(v) => Some(*v),
      _ => None,
    }
  }

  /// Returns the boolean payload, if this is a flag.
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      AttributeValue::Boolean(v) => Some(*v),
      _ => None,
    }
  }

  /// Returns the text payload, if this is text.
  pub fn as_text(&self) -> Option<&str> {
    match self {
      AttributeValue::Text(v) => Some(v),
      _ => None,
    }
  }
}

impl fmt::Display for AttributeValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AttributeValue::Integer(v) => write!(f, "{}", v),
      AttributeValue::Boolean(v) => write!(f, "{}", v),
      AttributeValue::Text(v) => write!(f, "{}", v),
    }
  }
}

impl From<i64> for AttributeValue {
  fn from(v: i64) -> Self {
    AttributeValue::Integer(v)
  }
}

impl From<i32> for AttributeValue {
  fn from(v: i32) -> Self {
    AttributeValue::Integer(i64::from(v))
  }
}

impl From<u32> for AttributeValue {
  fn from(v: u32) -> Self {
    AttributeValue::Integer(i64::from(v))
  }
}

impl From<bool> for AttributeValue {
  fn from(v: bool) -> Self {
    AttributeValue::Boolean(v)
  }
}

impl From<&str> for AttributeValue {
  fn from(v: &str) -> Self {
    AttributeValue::Text(v.to_string())
  }
}

impl From<String> for AttributeValue {
  fn from(v: String) -> Self {
    AttributeValue::Text(v)
  }
}

/// Ordered attribute map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, AttributeValue>);

impl Attributes {
  /// Creates an empty map.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets `name` to `value`, replacing any previous value.
  pub fn set(&mut self, name: &str, value: impl Into<AttributeValue>) -> &mut Self {
    self.0.insert(name.to_string(), value.into());
    self
  }

  /// Builder form of [`set`](Self::set).
  #[must_use]
  pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
    self.set(name, value);
    self
  }

  /// Returns the raw value for `name`.
  pub fn get(&self, name: &str) -> Option<&AttributeValue> {
    self.0.get(name)
  }

  /// Returns `name` as an integer, if set to one.
  pub fn get_int(&self, name: &str) -> Option<i64> {
    self.get(name).and_then(AttributeValue::as_int)
  }

  /// Returns `name` as a flag, if set to one.
  pub fn get_bool(&self, name: &str) -> Option<bool> {
    self.get(name).and_then(AttributeValue::as_bool)
  }

  /// Returns `name` as text, if set to text.
  pub fn get_text(&self, name: &str) -> Option<&str> {
    self.get(name).and_then(AttributeValue::as_text)
  }

  /// Returns `true` when no attribute is set.
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Number of attributes set.
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Iterates attributes in name order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v))
  }
}

impl fmt::Display for Attributes {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    for (i, (name, value)) in self.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}={}", name, value)?;
    }
    write!(f, "}}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn typed_accessors_only_match_their_variant() {
    let attrs = Attributes::new()
      .with(QUEUE_CAPACITY, 1024)
      .with(PARTITION_PARALLEL, true)
      .with(UNIFIER, "sum-unifier");

    assert_eq!(attrs.get_int(QUEUE_CAPACITY), Some(1024));
    assert_eq!(attrs.get_bool(QUEUE_CAPACITY), None);
    assert_eq!(attrs.get_bool(PARTITION_PARALLEL), Some(true));
    assert_eq!(attrs.get_text(UNIFIER), Some("sum-unifier"));
    assert_eq!(attrs.get_int(SPIN_MILLIS), None);
  }

  #[test]
  fn json_form_is_a_flat_object() {
    let attrs = Attributes::new().with(SPIN_MILLIS, 99).with(UNIFIER, "u");
    let json = serde_json::to_string(&attrs).unwrap();
    assert_eq!(json, r#"{"SPIN_MILLIS":99,"UNIFIER":"u"}"#);
    let back: Attributes = serde_json::from_str(&json).unwrap();
    assert_eq!(back, attrs);
  }

  #[test]
  fn display_lists_in_name_order() {
    let attrs = Attributes::new().with("b", 2).with("a", false);
    assert_eq!(attrs.to_string(), "{a=false, b=2}");
  }
}
