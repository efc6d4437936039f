use livesync_core::db::migrations::latest_version;
use livesync_core::db::{open_db, open_db_in_memory, DbError};
use livesync_core::{EntityRecord, EntityRef, SqliteEntityStore};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    for table in ["entities", "entity_links", "subscribers", "subscriber_accounts"] {
        assert_table_exists(&conn, table);
    }
}

#[test]
fn reopening_file_database_keeps_schema_and_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("livesync.db");

    let store = SqliteEntityStore::open(&path).unwrap();
    store
        .insert_entity(&EntityRecord::new("Account", "42"))
        .unwrap();
    drop(store);

    let conn = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn), latest_version());
    drop(conn);

    let reopened = SqliteEntityStore::open(&path).unwrap();
    assert!(reopened
        .get_entity(&EntityRef::new("Account", "42"))
        .unwrap()
        .is_some());
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    match open_db(&path).unwrap_err() {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn links_require_existing_entities() {
    let conn = open_db_in_memory().unwrap();
    let result = conn.execute(
        "INSERT INTO entity_links (source_type, source_id, association, target_type, target_id)
         VALUES ('Membership', 'm1', 'account', 'Account', '42');",
        [],
    );
    assert!(result.is_err(), "foreign keys must be enforced");
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
