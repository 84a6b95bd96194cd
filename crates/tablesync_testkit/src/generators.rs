//! Property-based test generators using proptest.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tablesync_protocol::{ConflictType, SyncState};
use tablesync_store::Values;

/// Strategy for valid table identifiers.
pub fn table_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for row identifiers.
pub fn row_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("uuid:[0-9a-f]{8}").expect("Invalid regex")
}

/// Strategy for plain (non-conflict) sync states.
pub fn plain_state_strategy() -> impl Strategy<Value = SyncState> {
    prop_oneof![
        Just(SyncState::NewRow),
        Just(SyncState::Changed),
        Just(SyncState::Synced),
        Just(SyncState::SyncedPendingFiles),
        Just(SyncState::Deleted),
    ]
}

/// Strategy for conflict types.
pub fn conflict_type_strategy() -> impl Strategy<Value = ConflictType> {
    prop_oneof![
        Just(ConflictType::LocalDeletedOldValues),
        Just(ConflictType::LocalUpdatedUpdatedValues),
        Just(ConflictType::ServerDeletedOldValues),
        Just(ConflictType::ServerUpdatedUpdatedValues),
    ]
}

/// Strategy for `name`/`age` values of the `people` table.
pub fn people_values_strategy() -> impl Strategy<Value = Values> {
    (
        prop::option::of("[A-Za-z ]{1,12}"),
        prop::option::of(0u8..120),
    )
        .prop_map(|(name, age)| {
            let mut values = BTreeMap::new();
            values.insert("name".to_string(), name);
            values.insert("age".to_string(), age.map(|a| a.to_string()));
            values
        })
}

/// Strategy for a set of server rows keyed by distinct row ids.
pub fn people_rows_strategy(max: usize) -> impl Strategy<Value = BTreeMap<String, Values>> {
    prop::collection::btree_map(row_id_strategy(), people_values_strategy(), 0..max)
}

/// Strategy for app-relative file paths outside the table folders.
pub fn app_file_path_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("(config|assets)/[a-z]{1,8}\\.(json|html|txt)")
        .expect("Invalid regex")
}
