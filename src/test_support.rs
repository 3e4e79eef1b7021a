use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tempfile::TempDir;

use crate::adapters::db::{open_connection, run_migrations};

/// Fresh migrated scratch database. The TempDir guard must stay alive for
/// the duration of the test.
pub fn open_migrated_connection() -> (Connection, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("fleetgazer-test.db");
    let mut connection =
        open_connection(path.to_string_lossy().as_ref()).expect("test db should open");
    run_migrations(&mut connection).expect("test migrations should succeed");
    (connection, dir)
}

/// Same as [`open_migrated_connection`], wrapped the way the runtime
/// shares its writer connection.
pub fn open_shared_migrated_connection() -> (Arc<Mutex<Connection>>, TempDir) {
    let (connection, dir) = open_migrated_connection();
    (Arc::new(Mutex::new(connection)), dir)
}
