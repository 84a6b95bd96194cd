//! End-to-end row sync against the in-memory server.

use proptest::prelude::*;
use tablesync_engine::{ConflictResolver, EngineState, ResolvedAs, SyncError, TableStatus};
use tablesync_protocol::{SavepointType, SyncState};
use tablesync_store::{RowEntry, RowWriter, StoreError};
use tablesync_testkit::prelude::*;

fn seeded_app() -> TestApp {
    let app = TestApp::new();
    app.server
        .create_table("people", Some("People"), &people_columns());
    app.server
        .upsert_row("people", "r1", values(&[("name", "Ann"), ("age", "3")]));
    app
}

fn state_of(app: &TestApp, row_id: &str) -> Option<SyncState> {
    app.db
        .data_table("people")
        .unwrap()
        .get_row_sync_state(row_id)
        .unwrap()
}

#[test]
fn first_pass_creates_table_and_pulls_rows() {
    let app = seeded_app();
    app.server
        .upsert_row("people", "r2", values(&[("name", "Bo"), ("age", "4")]));

    let outcome = app.processor().synchronize().unwrap();
    assert!(outcome.is_success());
    let result = outcome.table("people").unwrap();
    assert_eq!(result.counters.pulled_inserts, 2);

    let table = app.db.table("people").unwrap();
    assert_eq!(table.display_name.as_deref(), Some("People"));
    assert_eq!(table.sync_tag, app.server.table("people").unwrap().sync_tag());
    assert_eq!(state_of(&app, "r1"), Some(SyncState::Synced));
    assert!(table.last_sync_time.is_some());
}

#[test]
fn unchanged_table_skips_row_fetch() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.server.clear_requests();
    let outcome = processor.synchronize().unwrap();
    assert_eq!(outcome.table("people").unwrap().counters.pulled(), 0);
    assert!(app
        .server
        .requests()
        .iter()
        .all(|r| !r.url.contains("/rows") && !r.url.contains("/diff")));
    assert_eq!(processor.state(), EngineState::Synced);
}

#[test]
fn incremental_pull_uses_diff() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.server
        .upsert_row("people", "r1", values(&[("name", "Ann"), ("age", "4")]));
    app.server.clear_requests();
    let outcome = processor.synchronize().unwrap();

    assert_eq!(outcome.table("people").unwrap().counters.pulled_updates, 1);
    assert!(app.server.requests().iter().any(|r| r.url.contains("/diff?data_etag=")));
    let entry = app.db.data_table("people").unwrap().entry("r1").unwrap();
    match entry {
        Some(RowEntry::Plain(row)) => assert_eq!(row.value("age"), Some("4")),
        other => panic!("unexpected entry {other:?}"),
    }
}

#[test]
fn local_insert_is_pushed() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.db
        .data_table("people")
        .unwrap()
        .insert_row_as("r9", values(&[("name", "Cy"), ("age", "9")]), SavepointType::Complete)
        .unwrap();
    let outcome = processor.synchronize().unwrap();

    assert_eq!(outcome.table("people").unwrap().counters.pushed_inserts, 1);
    let remote = app.server.row("people", "r9").unwrap();
    assert_eq!(remote.values.get("age").cloned().flatten().as_deref(), Some("9"));
    assert_eq!(state_of(&app, "r9"), Some(SyncState::Synced));
}

#[test]
fn incomplete_savepoints_are_not_pushed() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.db
        .data_table("people")
        .unwrap()
        .insert_row_as("r9", values(&[("age", "9")]), SavepointType::Incomplete)
        .unwrap();
    processor.synchronize().unwrap();

    assert!(app.server.row("people", "r9").is_none());
    assert_eq!(state_of(&app, "r9"), Some(SyncState::NewRow));
}

#[test]
fn local_delete_is_pushed() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.db.data_table("people").unwrap().mark_deleted("r1").unwrap();
    let outcome = processor.synchronize().unwrap();

    assert_eq!(outcome.table("people").unwrap().counters.pushed_deletes, 1);
    assert!(app.server.row("people", "r1").unwrap().deleted);
    assert_eq!(state_of(&app, "r1"), None);
}

#[test]
fn server_delete_purges_synced_row() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.server.delete_row("people", "r1");
    let outcome = processor.synchronize().unwrap();

    assert_eq!(outcome.table("people").unwrap().counters.pulled_deletes, 1);
    assert!(app.db.data_table("people").unwrap().entry("r1").unwrap().is_none());
}

#[test]
fn concurrent_edits_become_a_conflict_and_resolve_once() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.db
        .data_table("people")
        .unwrap()
        .update_row("r1", &values(&[("age", "5")]))
        .unwrap();
    app.server
        .upsert_row("people", "r1", values(&[("name", "Ann"), ("age", "7")]));

    let outcome = processor.synchronize().unwrap();
    assert_eq!(outcome.table("people").unwrap().counters.conflicts, 1);
    match app.db.data_table("people").unwrap().entry("r1").unwrap() {
        Some(RowEntry::Conflicted { local, server }) => {
            assert_eq!(local.value("age"), Some("5"));
            assert_eq!(server.value("age"), Some("7"));
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    // The conflicted row is not pushed.
    let remote = app.server.row("people", "r1").unwrap();
    assert_eq!(remote.values.get("age").cloned().flatten().as_deref(), Some("7"));

    let resolver = ConflictResolver::new(&app.db, "people").unwrap();
    assert_eq!(resolver.take_local("r1").unwrap(), ResolvedAs::Changed);
    assert!(matches!(
        resolver.take_local("r1"),
        Err(StoreError::NotInConflict { .. })
    ));

    processor.synchronize().unwrap();
    let remote = app.server.row("people", "r1").unwrap();
    assert_eq!(remote.values.get("age").cloned().flatten().as_deref(), Some("5"));
    assert_eq!(state_of(&app, "r1"), Some(SyncState::Synced));
}

#[test]
fn refused_write_is_deferred() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    let table = app.db.table("people").unwrap();
    app.db
        .transaction(|txn| {
            RowWriter::new(txn, &table).set_state("r1", None, SyncState::Changed, Some("stale"))
        })
        .unwrap();

    let outcome = processor.synchronize().unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.table("people").unwrap().counters.deferred_conflicts, 1);
    assert_eq!(state_of(&app, "r1"), Some(SyncState::Changed));
    assert_eq!(processor.stats().deferred_conflicts, 1);
}

#[test]
fn transient_failure_is_retried() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.server
        .upsert_row("people", "r2", values(&[("name", "Bo")]));
    app.server.fail_requests_to("/tables/people", 1, 503);
    let outcome = processor.synchronize().unwrap();

    assert_eq!(outcome.table("people").unwrap().status, TableStatus::Success);
    assert_eq!(processor.stats().retries, 1);
    assert_eq!(state_of(&app, "r2"), Some(SyncState::Synced));
}

#[test]
fn failing_table_does_not_block_others() {
    let app = seeded_app();
    app.server.create_table("visits", Some("Visits"), &people_columns());
    app.server
        .upsert_row("visits", "v1", values(&[("name", "Dee")]));
    app.server.fail_requests_to("/tables/people", 10, 400);

    let processor = app.processor();
    let outcome = processor.synchronize().unwrap();

    let people = outcome.table("people").unwrap();
    assert_eq!(people.status, TableStatus::Failure);
    assert!(people.message.is_some());
    assert_eq!(outcome.table("visits").unwrap().status, TableStatus::Success);
    assert!(!outcome.is_success());
    assert_eq!(processor.state(), EngineState::Error);
    assert_eq!(processor.stats().retries, 0);
}

#[test]
fn rejected_token_is_reported_per_table() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();

    app.server.fail_requests_to("/tables/people", 1, 401);
    let outcome = processor.synchronize().unwrap();
    assert_eq!(
        outcome.table("people").unwrap().status,
        TableStatus::AuthFailure
    );
}

#[test]
fn listing_failure_fails_the_pass() {
    let app = seeded_app();
    app.server.require_token("secret");

    let processor = app.processor();
    assert!(matches!(processor.synchronize(), Err(SyncError::Auth(_))));
    assert_eq!(processor.state(), EngineState::Error);

    let authed = app.processor_with(app.config().with_access_token("secret"));
    assert!(authed.synchronize().unwrap().is_success());
    assert!(app
        .server
        .requests()
        .iter()
        .filter(|r| r.url.starts_with(FAKE_SERVER_URL))
        .skip(1)
        .all(|r| r.header("Authorization") == Some("Bearer secret")));
}

#[test]
fn local_only_table_is_created_remotely() {
    let app = TestApp::new();
    app.db.create_table("visits", None, &people_columns()).unwrap();
    app.db
        .data_table("visits")
        .unwrap()
        .insert_row_as("v1", values(&[("name", "Eve")]), SavepointType::Complete)
        .unwrap();

    let outcome = app.processor().synchronize().unwrap();
    assert!(outcome.is_success());
    assert!(app.server.table("visits").is_some());
    let keys: Vec<_> = app
        .server
        .columns("visits")
        .into_iter()
        .map(|c| c.element_key)
        .collect();
    assert_eq!(keys, ["name", "age"]);
    assert_eq!(app.server.live_rows("visits").len(), 1);
}

#[test]
fn disabled_tables_are_skipped() {
    let app = seeded_app();
    let processor = app.processor();
    processor.synchronize().unwrap();
    app.db.set_sync_enabled("people", false).unwrap();

    let outcome = processor.synchronize().unwrap();
    assert!(outcome.table("people").is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn pulled_rows_match_the_server(rows in people_rows_strategy(8)) {
        let app = TestApp::new();
        app.server.create_table("people", None, &people_columns());
        for (row_id, row_values) in &rows {
            app.server.upsert_row("people", row_id, row_values.clone());
        }

        let processor = app.processor();
        processor.synchronize().unwrap();
        let entries = app.db.data_table("people").unwrap().entries().unwrap();
        prop_assert_eq!(entries.len(), rows.len());
        for entry in entries {
            match entry {
                RowEntry::Plain(row) => {
                    prop_assert_eq!(row.sync_state, SyncState::Synced);
                    prop_assert_eq!(Some(&row.values), rows.get(&row.row_id));
                }
                RowEntry::Conflicted { .. } => prop_assert!(false, "unexpected conflict"),
            }
        }

        let again = processor.synchronize().unwrap();
        prop_assert_eq!(again.table("people").unwrap().counters.pulled(), 0);
    }
}
