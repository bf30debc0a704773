//! Property-based test generators using proptest.
//!
//! Provides strategies for generating names, payloads and operation
//! sequences accepted by the authority.

use livesync_protocol::JsonObject;
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for generating valid unique names.
///
/// Names are lowercase, so they never look like a SID.
pub fn unique_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,31}").expect("Invalid regex")
}

/// Strategy for generating non-empty map keys.
pub fn map_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9_.:-]{1,24}").expect("Invalid regex")
}

/// Strategy for generating JSON values of bounded depth.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[ -~]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// Strategy for generating document and item bodies.
pub fn json_object_strategy() -> impl Strategy<Value = JsonObject> {
    prop::collection::btree_map("[a-z]{1,8}", json_value_strategy(), 0..6)
        .prop_map(|map| map.into_iter().collect())
}

/// An operation on a collection.
#[derive(Debug, Clone)]
pub enum CollectionOperation {
    /// Add a list item, or set a fresh map key.
    Add {
        /// Item body.
        data: JsonObject,
    },
    /// Replace an existing item.
    Set {
        /// Picks among the live items, modulo their count.
        pick: usize,
        /// Item body.
        data: JsonObject,
    },
    /// Remove an existing item.
    Remove {
        /// Picks among the live items, modulo their count.
        pick: usize,
    },
}

/// Strategy for generating collection operations.
pub fn collection_operation_strategy() -> impl Strategy<Value = CollectionOperation> {
    prop_oneof![
        3 => json_object_strategy().prop_map(|data| CollectionOperation::Add { data }),
        2 => (any::<usize>(), json_object_strategy())
            .prop_map(|(pick, data)| CollectionOperation::Set { pick, data }),
        1 => any::<usize>().prop_map(|pick| CollectionOperation::Remove { pick }),
    ]
}

/// Strategy for generating a sequence of collection operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<CollectionOperation>> {
    prop::collection::vec(collection_operation_strategy(), min_ops..max_ops)
}

/// Strategy for the revisions of a push sequence as the network might
/// deliver it: out of order, with duplicates.
pub fn push_revisions_strategy(max_revision: u64) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1..=max_revision.max(1), 1..32)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
