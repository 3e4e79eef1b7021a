use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::domain::models::{Address, Drive, DrivePath};

use super::{
    DbError, read_address, read_opt_timestamp, read_timestamp, store_address, store_opt_timestamp,
    store_timestamp,
};

const DRIVE_COLUMNS: &str = "id, car_id, start_time, end_time, distance_km, duration_min, \
                             start_battery_level, end_battery_level, start_range_km, end_range_km, \
                             start_odometer_km, end_odometer_km, speed_max, power_max, power_min, \
                             inside_temp_avg, outside_temp_avg, energy_used_kwh, energy_regen_kwh, \
                             start_address, end_address, start_latitude, start_longitude, \
                             end_latitude, end_longitude";

fn map_drive(row: &Row<'_>) -> rusqlite::Result<Drive> {
    Ok(Drive {
        id: row.get(0)?,
        car_id: row.get(1)?,
        start_time: read_timestamp(row, 2)?,
        end_time: read_opt_timestamp(row, 3)?,
        distance_km: row.get(4)?,
        duration_min: row.get(5)?,
        start_battery_level: row.get(6)?,
        end_battery_level: row.get(7)?,
        start_range_km: row.get(8)?,
        end_range_km: row.get(9)?,
        start_odometer_km: row.get(10)?,
        end_odometer_km: row.get(11)?,
        speed_max: row.get(12)?,
        power_max: row.get(13)?,
        power_min: row.get(14)?,
        inside_temp_avg: row.get(15)?,
        outside_temp_avg: row.get(16)?,
        energy_used_kwh: row.get(17)?,
        energy_regen_kwh: row.get(18)?,
        start_address: read_address(row, 19)?,
        end_address: read_address(row, 20)?,
        start_latitude: row.get(21)?,
        start_longitude: row.get(22)?,
        end_latitude: row.get(23)?,
        end_longitude: row.get(24)?,
    })
}

/// Opens a drive: only the start-side fields are persisted.
pub fn create(connection: &Connection, drive: &Drive) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO drives (car_id, start_time, start_battery_level, start_range_km,
                             start_odometer_km, start_address, start_latitude, start_longitude)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            drive.car_id,
            store_timestamp(drive.start_time),
            drive.start_battery_level,
            drive.start_range_km,
            drive.start_odometer_km,
            store_address(&drive.start_address),
            drive.start_latitude,
            drive.start_longitude,
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

/// Late-arriving geocode result for the start point.
pub fn set_start_address(
    connection: &Connection,
    drive_id: i64,
    address: &Address,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE drives SET start_address = ?2 WHERE id = ?1",
        params![
            drive_id,
            serde_json::to_string(address).unwrap_or_default()
        ],
    )?;
    Ok(())
}

/// Closes the drive with end-side fields and trajectory aggregates.
/// Returns false when the row was already closed (the write is skipped).
pub fn complete(connection: &Connection, drive: &Drive) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE drives SET
             end_time = ?2, distance_km = ?3, duration_min = ?4, end_battery_level = ?5,
             end_range_km = ?6, end_odometer_km = ?7, speed_max = ?8, power_max = ?9,
             power_min = ?10, inside_temp_avg = ?11, outside_temp_avg = ?12,
             energy_used_kwh = ?13, energy_regen_kwh = ?14, start_address = ?15,
             end_address = ?16, end_latitude = ?17, end_longitude = ?18
         WHERE id = ?1 AND end_time IS NULL",
        params![
            drive.id,
            store_opt_timestamp(drive.end_time),
            drive.distance_km,
            drive.duration_min,
            drive.end_battery_level,
            drive.end_range_km,
            drive.end_odometer_km,
            drive.speed_max,
            drive.power_max,
            drive.power_min,
            drive.inside_temp_avg,
            drive.outside_temp_avg,
            drive.energy_used_kwh,
            drive.energy_regen_kwh,
            store_address(&drive.start_address),
            store_address(&drive.end_address),
            drive.end_latitude,
            drive.end_longitude,
        ],
    )?;
    Ok(updated > 0)
}

pub fn get_active(connection: &Connection, car_id: i64) -> Result<Option<Drive>, DbError> {
    let drive = connection
        .query_row(
            &format!(
                "SELECT {DRIVE_COLUMNS} FROM drives
                 WHERE car_id = ?1 AND end_time IS NULL
                 ORDER BY start_time DESC LIMIT 1"
            ),
            params![car_id],
            map_drive,
        )
        .optional()?;
    Ok(drive)
}

pub fn get_by_id(connection: &Connection, drive_id: i64) -> Result<Option<Drive>, DbError> {
    let drive = connection
        .query_row(
            &format!("SELECT {DRIVE_COLUMNS} FROM drives WHERE id = ?1"),
            params![drive_id],
            map_drive,
        )
        .optional()?;
    Ok(drive)
}

pub fn list_by_car(
    connection: &Connection,
    car_id: i64,
    limit: u32,
    offset: u32,
) -> Result<Vec<Drive>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {DRIVE_COLUMNS} FROM drives
         WHERE car_id = ?1
         ORDER BY start_time DESC, id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = statement.query_map(
        params![car_id, i64::from(limit), i64::from(offset)],
        map_drive,
    )?;

    let mut drives = Vec::new();
    for row in rows {
        drives.push(row?);
    }
    Ok(drives)
}

pub fn count_by_car(connection: &Connection, car_id: i64) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM drives WHERE car_id = ?1",
        params![car_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Drive summaries plus their coordinate polylines inside a time window,
/// newest first.
pub fn get_paths_in_range(
    connection: &Connection,
    car_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<DrivePath>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, start_time, duration_min, distance_km FROM drives
         WHERE car_id = ?1 AND start_time >= ?2 AND start_time <= ?3
         ORDER BY start_time DESC",
    )?;
    let rows = statement.query_map(
        params![car_id, store_timestamp(start), store_timestamp(end)],
        |row| {
            Ok(DrivePath {
                drive_id: row.get(0)?,
                start_time: read_timestamp(row, 1)?,
                duration_min: row.get(2)?,
                distance_km: row.get(3)?,
                path: Vec::new(),
            })
        },
    )?;

    let mut paths = Vec::new();
    for row in rows {
        paths.push(row?);
    }

    let mut point_statement = connection.prepare(
        "SELECT latitude, longitude FROM positions
         WHERE drive_id = ?1 ORDER BY recorded_at, id",
    )?;
    for path in &mut paths {
        let points = point_statement.query_map(params![path.drive_id], |row| {
            Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?))
        })?;
        for point in points {
            path.path.push(point?);
        }
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use crate::adapters::db::{cars, positions};
    use crate::domain::models::{Address, Drive, Position};
    use crate::test_support::open_migrated_connection;

    use super::{
        complete, count_by_car, create, get_active, get_by_id, get_paths_in_range, list_by_car,
        set_start_address,
    };

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn seed_car(connection: &rusqlite::Connection) -> i64 {
        cars::upsert(connection, 1001, 2001, "5YJ3E1EA", "Daily", t0())
            .expect("car insert should succeed")
    }

    fn open_drive(connection: &rusqlite::Connection, car_id: i64, offset_min: i64) -> i64 {
        let drive = Drive {
            car_id,
            start_time: t0() + Duration::minutes(offset_min),
            start_battery_level: 80,
            start_range_km: 350.0,
            start_odometer_km: 12300.0,
            start_latitude: Some(30.25),
            start_longitude: Some(120.17),
            ..Default::default()
        };
        create(connection, &drive).expect("drive insert should succeed")
    }

    #[test]
    fn active_drive_is_the_open_row() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = open_drive(&connection, car_id, 0);

        let active = get_active(&connection, car_id)
            .expect("query should succeed")
            .expect("drive should be active");
        assert_eq!(active.id, drive_id);
        assert_eq!(active.end_time, None);
        assert_eq!(active.start_battery_level, 80);
    }

    #[test]
    fn complete_closes_exactly_once() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = open_drive(&connection, car_id, 0);

        let mut drive = get_by_id(&connection, drive_id)
            .expect("query should succeed")
            .expect("drive should exist");
        drive.end_time = Some(t0() + Duration::minutes(25));
        drive.duration_min = 25.0;
        drive.end_battery_level = Some(71);
        drive.end_range_km = Some(310.0);
        drive.end_odometer_km = Some(12318.5);
        drive.distance_km = 18.5;
        drive.speed_max = Some(96.5);
        drive.power_max = Some(120);
        drive.power_min = Some(-40);
        drive.energy_used_kwh = Some(3.4);
        drive.energy_regen_kwh = Some(0.7);
        drive.end_latitude = Some(30.30);
        drive.end_longitude = Some(120.20);

        assert!(complete(&connection, &drive).expect("complete should succeed"));
        assert!(
            !complete(&connection, &drive).expect("second complete should be a no-op"),
            "closing an already-closed drive must not write"
        );

        assert_eq!(get_active(&connection, car_id).expect("query should succeed"), None);
        let closed = get_by_id(&connection, drive_id)
            .expect("query should succeed")
            .expect("drive should exist");
        assert_eq!(closed.distance_km, 18.5);
        assert_eq!(closed.power_min, Some(-40));
    }

    #[test]
    fn deferred_start_address_lands_on_the_row() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = open_drive(&connection, car_id, 0);

        let address = Address {
            formatted: "1 Lakeside Ave".to_string(),
            city: "Hangzhou".to_string(),
            ..Address::default()
        };
        set_start_address(&connection, drive_id, &address).expect("update should succeed");

        let drive = get_by_id(&connection, drive_id)
            .expect("query should succeed")
            .expect("drive should exist");
        assert_eq!(drive.start_address, Some(address));
    }

    #[test]
    fn listing_pages_newest_first() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        for offset in [0, 60, 120] {
            open_drive(&connection, car_id, offset);
        }

        let page = list_by_car(&connection, car_id, 2, 1).expect("list should succeed");
        assert_eq!(page.len(), 2);
        assert!(page[0].start_time > page[1].start_time);
        assert_eq!(count_by_car(&connection, car_id).expect("count should succeed"), 3);
    }

    #[test]
    fn paths_carry_ordered_polylines() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = open_drive(&connection, car_id, 0);

        for (offset, lat) in [(0, 30.25), (5, 30.26), (10, 30.27)] {
            positions::create(
                &connection,
                &Position {
                    car_id,
                    drive_id: Some(drive_id),
                    latitude: lat,
                    longitude: 120.17,
                    recorded_at: t0() + Duration::seconds(offset),
                    ..Position::default()
                },
            )
            .expect("position insert should succeed");
        }

        let paths = get_paths_in_range(
            &connection,
            car_id,
            t0() - Duration::hours(1),
            t0() + Duration::hours(1),
        )
        .expect("paths should load");
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].drive_id, drive_id);
        assert_eq!(
            paths[0].path,
            vec![(30.25, 120.17), (30.26, 120.17), (30.27, 120.17)]
        );

        let outside = get_paths_in_range(
            &connection,
            car_id,
            t0() + Duration::hours(2),
            t0() + Duration::hours(3),
        )
        .expect("paths should load");
        assert!(outside.is_empty());
    }
}
