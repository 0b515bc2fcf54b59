//! Property-based test generators using proptest.
//!
//! Provides strategies for values that conform to [`page_schema`](crate::page_schema).

use ctxgraph_store::{PermanentId, Value};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for permanent ids.
pub fn permanent_id_strategy() -> impl Strategy<Value = PermanentId> {
    prop::array::uniform16(any::<u8>()).prop_map(PermanentId::from_bytes)
}

/// Strategy for any storable value.
///
/// Floats are kept finite so values compare equal to themselves.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9f64..1.0e9).prop_map(Value::Float),
        "[ -~]{0,24}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        permanent_id_strategy().prop_map(Value::Reference),
    ]
}

/// Strategy for `visits` values.
pub fn visits_strategy() -> impl Strategy<Value = i64> {
    0i64..1_000_000
}

/// Strategy for `Page` field maps.
///
/// Either field may be absent or null.
pub fn page_fields_strategy() -> impl Strategy<Value = BTreeMap<String, Value>> {
    (
        prop::option::of(prop_oneof![Just(Value::Null), visits_strategy().prop_map(Value::Integer)]),
        prop::option::of(prop_oneof![
            Just(Value::Null),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text)
        ]),
    )
        .prop_map(|(visits, title)| {
            let mut fields = BTreeMap::new();
            if let Some(visits) = visits {
                fields.insert("visits".to_string(), visits);
            }
            if let Some(title) = title {
                fields.insert("title".to_string(), title);
            }
            fields
        })
}

/// Strategy for a small batch of pages.
pub fn page_batch_strategy() -> impl Strategy<Value = Vec<BTreeMap<String, Value>>> {
    prop::collection::vec(page_fields_strategy(), 1..8)
}
