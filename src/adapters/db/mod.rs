use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use thiserror::Error;

use crate::domain::models::Address;
use crate::domain::units::{format_timestamp, parse_timestamp};

pub mod cars;
pub mod charges;
pub mod drives;
pub mod parkings;
pub mod positions;

pub const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS cars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cloud_id INTEGER NOT NULL UNIQUE,
    cloud_vehicle_id INTEGER NOT NULL,
    vin TEXT NOT NULL,
    name TEXT NOT NULL,
    model TEXT NOT NULL DEFAULT '',
    trim_badging TEXT NOT NULL DEFAULT '',
    exterior_color TEXT NOT NULL DEFAULT '',
    wheel_type TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS drives (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    car_id INTEGER NOT NULL REFERENCES cars(id) ON DELETE CASCADE,
    start_time TEXT NOT NULL,
    end_time TEXT,
    distance_km REAL NOT NULL DEFAULT 0,
    duration_min REAL NOT NULL DEFAULT 0,
    start_battery_level INTEGER NOT NULL DEFAULT 0,
    end_battery_level INTEGER,
    start_range_km REAL NOT NULL DEFAULT 0,
    end_range_km REAL,
    start_odometer_km REAL NOT NULL DEFAULT 0,
    end_odometer_km REAL,
    start_address TEXT,
    end_address TEXT,
    start_latitude REAL,
    start_longitude REAL,
    end_latitude REAL,
    end_longitude REAL
);

CREATE INDEX IF NOT EXISTS idx_drives_car_start_desc
ON drives (car_id, start_time DESC);

CREATE INDEX IF NOT EXISTS idx_drives_car_open
ON drives (car_id) WHERE end_time IS NULL;

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    car_id INTEGER NOT NULL REFERENCES cars(id) ON DELETE CASCADE,
    drive_id INTEGER REFERENCES drives(id) ON DELETE SET NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    heading INTEGER NOT NULL DEFAULT 0,
    speed REAL,
    power INTEGER NOT NULL DEFAULT 0,
    odometer REAL NOT NULL DEFAULT 0,
    battery_level INTEGER NOT NULL DEFAULT 0,
    range_km REAL NOT NULL DEFAULT 0,
    inside_temp REAL,
    outside_temp REAL,
    elevation INTEGER,
    tpms_pressure_fl REAL,
    tpms_pressure_fr REAL,
    tpms_pressure_rl REAL,
    tpms_pressure_rr REAL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_positions_drive_recorded
ON positions (drive_id, recorded_at);

CREATE INDEX IF NOT EXISTS idx_positions_car_recorded_desc
ON positions (car_id, recorded_at DESC);

CREATE TABLE IF NOT EXISTS charging_processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    car_id INTEGER NOT NULL REFERENCES cars(id) ON DELETE CASCADE,
    start_time TEXT NOT NULL,
    end_time TEXT,
    start_battery_level INTEGER NOT NULL DEFAULT 0,
    end_battery_level INTEGER,
    start_range_km REAL NOT NULL DEFAULT 0,
    end_range_km REAL,
    charge_energy_added REAL NOT NULL DEFAULT 0,
    charger_power_max INTEGER,
    duration_min REAL NOT NULL DEFAULT 0,
    outside_temp_avg REAL,
    cost REAL,
    address TEXT
);

CREATE INDEX IF NOT EXISTS idx_charging_processes_car_start_desc
ON charging_processes (car_id, start_time DESC);

CREATE INDEX IF NOT EXISTS idx_charging_processes_car_open
ON charging_processes (car_id) WHERE end_time IS NULL;

CREATE TABLE IF NOT EXISTS charges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    charging_process_id INTEGER NOT NULL REFERENCES charging_processes(id) ON DELETE CASCADE,
    battery_level INTEGER NOT NULL DEFAULT 0,
    usable_battery_level INTEGER NOT NULL DEFAULT 0,
    range_km REAL NOT NULL DEFAULT 0,
    charger_power INTEGER NOT NULL DEFAULT 0,
    charger_voltage INTEGER NOT NULL DEFAULT 0,
    charger_current INTEGER NOT NULL DEFAULT 0,
    charge_energy_added REAL NOT NULL DEFAULT 0,
    outside_temp REAL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_charges_process_recorded
ON charges (charging_process_id, recorded_at);

CREATE TABLE IF NOT EXISTS parkings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    car_id INTEGER NOT NULL REFERENCES cars(id) ON DELETE CASCADE,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_min REAL NOT NULL DEFAULT 0,
    latitude REAL NOT NULL DEFAULT 0,
    longitude REAL NOT NULL DEFAULT 0,
    address TEXT,
    start_battery_level INTEGER NOT NULL DEFAULT 0,
    end_battery_level INTEGER,
    start_range_km REAL NOT NULL DEFAULT 0,
    end_range_km REAL,
    start_odometer_km REAL NOT NULL DEFAULT 0,
    end_odometer_km REAL,
    energy_used_kwh REAL,
    start_inside_temp REAL,
    end_inside_temp REAL,
    start_outside_temp REAL,
    end_outside_temp REAL,
    inside_temp_avg REAL,
    outside_temp_avg REAL,
    climate_used_min REAL,
    sentry_mode_used_min REAL,
    start_locked INTEGER NOT NULL DEFAULT 0,
    start_sentry_mode INTEGER NOT NULL DEFAULT 0,
    start_doors_open INTEGER NOT NULL DEFAULT 0,
    start_windows_open INTEGER NOT NULL DEFAULT 0,
    start_frunk_open INTEGER NOT NULL DEFAULT 0,
    start_trunk_open INTEGER NOT NULL DEFAULT 0,
    start_climate_on INTEGER NOT NULL DEFAULT 0,
    start_user_present INTEGER NOT NULL DEFAULT 0,
    end_locked INTEGER,
    end_sentry_mode INTEGER,
    end_doors_open INTEGER,
    end_windows_open INTEGER,
    end_frunk_open INTEGER,
    end_trunk_open INTEGER,
    end_climate_on INTEGER,
    end_user_present INTEGER,
    start_tpms_pressure_fl REAL,
    start_tpms_pressure_fr REAL,
    start_tpms_pressure_rl REAL,
    start_tpms_pressure_rr REAL,
    end_tpms_pressure_fl REAL,
    end_tpms_pressure_fr REAL,
    end_tpms_pressure_rl REAL,
    end_tpms_pressure_rr REAL,
    car_version TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_parkings_car_start_desc
ON parkings (car_id, start_time DESC);

CREATE INDEX IF NOT EXISTS idx_parkings_car_open
ON parkings (car_id) WHERE end_time IS NULL;

CREATE TABLE IF NOT EXISTS parking_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parking_id INTEGER NOT NULL REFERENCES parkings(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    event_time TEXT NOT NULL,
    details TEXT
);

CREATE INDEX IF NOT EXISTS idx_parking_events_parking_time
ON parking_events (parking_id, event_time);
"#,
    ),
    // v2: trajectory-derived drive aggregates, backfilled once for drives
    // recorded before the columns existed.
    (
        2,
        r#"
ALTER TABLE drives ADD COLUMN speed_max REAL;
ALTER TABLE drives ADD COLUMN power_max INTEGER;
ALTER TABLE drives ADD COLUMN power_min INTEGER;
ALTER TABLE drives ADD COLUMN inside_temp_avg REAL;
ALTER TABLE drives ADD COLUMN outside_temp_avg REAL;
ALTER TABLE drives ADD COLUMN energy_used_kwh REAL;
ALTER TABLE drives ADD COLUMN energy_regen_kwh REAL;

UPDATE drives SET
    speed_max = (SELECT MAX(speed) FROM positions WHERE positions.drive_id = drives.id),
    power_max = (SELECT MAX(power) FROM positions WHERE positions.drive_id = drives.id),
    power_min = (SELECT MIN(power) FROM positions WHERE positions.drive_id = drives.id),
    inside_temp_avg = (SELECT AVG(inside_temp) FROM positions WHERE positions.drive_id = drives.id),
    outside_temp_avg = (SELECT AVG(outside_temp) FROM positions WHERE positions.drive_id = drives.id),
    energy_used_kwh = (
        SELECT SUM(CASE WHEN dt < 60.0 AND power > 0 THEN power * dt / 3600.0 ELSE 0.0 END)
        FROM (
            SELECT power,
                   (julianday(LEAD(recorded_at) OVER (ORDER BY recorded_at))
                    - julianday(recorded_at)) * 86400.0 AS dt
            FROM positions WHERE positions.drive_id = drives.id
        ) WHERE dt IS NOT NULL
    ),
    energy_regen_kwh = (
        SELECT SUM(CASE WHEN dt < 60.0 AND power < 0 THEN -power * dt / 3600.0 ELSE 0.0 END)
        FROM (
            SELECT power,
                   (julianday(LEAD(recorded_at) OVER (ORDER BY recorded_at))
                    - julianday(recorded_at)) * 86400.0 AS dt
            FROM positions WHERE positions.drive_id = drives.id
        ) WHERE dt IS NOT NULL
    )
WHERE end_time IS NOT NULL;
"#,
    ),
];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path).map_err(DbError::from)?;
    connection
        .execute_batch(
            r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
"#,
        )
        .map_err(DbError::from)?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

pub(crate) fn store_timestamp(ts: DateTime<Utc>) -> String {
    format_timestamp(ts)
}

pub(crate) fn store_opt_timestamp(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(format_timestamp)
}

pub(crate) fn read_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| column_error(idx, format!("invalid timestamp: {raw}")))
}

pub(crate) fn read_opt_timestamp(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| column_error(idx, format!("invalid timestamp: {raw}"))),
        None => Ok(None),
    }
}

pub(crate) fn store_address(address: &Option<Address>) -> Option<String> {
    address
        .as_ref()
        .and_then(|address| serde_json::to_string(address).ok())
}

pub(crate) fn read_address(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Address>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| column_error(idx, format!("invalid address json: {err}"))),
        None => Ok(None),
    }
}

fn column_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

#[cfg(test)]
mod tests {
    use crate::test_support::open_migrated_connection;

    use super::{LATEST_SCHEMA_VERSION, run_migrations, schema_version};

    #[test]
    fn migrates_fresh_database_to_latest_version() {
        let (connection, _dir) = open_migrated_connection();

        let version = schema_version(&connection).expect("schema version should be queryable");
        assert_eq!(version, LATEST_SCHEMA_VERSION);

        for table in [
            "cars",
            "positions",
            "drives",
            "charging_processes",
            "charges",
            "parkings",
            "parking_events",
        ] {
            let exists: i64 = connection
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("table check should work");
            assert_eq!(exists, 1, "missing table {table}");
        }

        let aggregate_column: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('drives') WHERE name = 'energy_used_kwh'",
                [],
                |row| row.get(0),
            )
            .expect("column metadata query should succeed");
        assert_eq!(aggregate_column, 1);
    }

    #[test]
    fn migrations_are_idempotent() {
        let (mut connection, _dir) = open_migrated_connection();

        run_migrations(&mut connection).expect("second migration run should succeed");

        let version = schema_version(&connection).expect("schema version should be queryable");
        assert_eq!(version, LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn rejects_databases_from_the_future() {
        let (mut connection, _dir) = open_migrated_connection();
        connection
            .pragma_update(None, "user_version", 99)
            .expect("pragma update should work");

        let err = run_migrations(&mut connection).expect_err("future schema must be rejected");
        assert!(err.to_string().contains("unsupported schema version 99"));
    }
}
