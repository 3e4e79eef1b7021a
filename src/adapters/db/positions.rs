use rusqlite::{Connection, Row, params};

use crate::domain::models::{DriveStats, Position};

use super::{DbError, read_timestamp, store_timestamp};

const POSITION_COLUMNS: &str = "id, car_id, drive_id, latitude, longitude, heading, speed, power, \
                                odometer, battery_level, range_km, inside_temp, outside_temp, \
                                elevation, tpms_pressure_fl, tpms_pressure_fr, tpms_pressure_rl, \
                                tpms_pressure_rr, recorded_at";

fn map_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get(0)?,
        car_id: row.get(1)?,
        drive_id: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        heading: row.get(5)?,
        speed_kmh: row.get(6)?,
        power_kw: row.get(7)?,
        odometer_km: row.get(8)?,
        battery_level: row.get(9)?,
        range_km: row.get(10)?,
        inside_temp: row.get(11)?,
        outside_temp: row.get(12)?,
        elevation_m: row.get(13)?,
        tpms_pressure_fl: row.get(14)?,
        tpms_pressure_fr: row.get(15)?,
        tpms_pressure_rl: row.get(16)?,
        tpms_pressure_rr: row.get(17)?,
        recorded_at: read_timestamp(row, 18)?,
    })
}

pub fn create(connection: &Connection, position: &Position) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO positions (car_id, drive_id, latitude, longitude, heading, speed, power,
                                odometer, battery_level, range_km, inside_temp, outside_temp,
                                elevation, tpms_pressure_fl, tpms_pressure_fr, tpms_pressure_rl,
                                tpms_pressure_rr, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            position.car_id,
            position.drive_id,
            position.latitude,
            position.longitude,
            position.heading,
            position.speed_kmh,
            position.power_kw,
            position.odometer_km,
            position.battery_level,
            position.range_km,
            position.inside_temp,
            position.outside_temp,
            position.elevation_m,
            position.tpms_pressure_fl,
            position.tpms_pressure_fr,
            position.tpms_pressure_rl,
            position.tpms_pressure_rr,
            store_timestamp(position.recorded_at),
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

pub fn list_by_drive(connection: &Connection, drive_id: i64) -> Result<Vec<Position>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE drive_id = ?1 ORDER BY recorded_at, id"
    ))?;
    let rows = statement.query_map(params![drive_id], map_position)?;

    let mut positions = Vec::new();
    for row in rows {
        positions.push(row?);
    }
    Ok(positions)
}

/// Trajectory aggregates for one drive. Sample intervals of 60 s or more
/// are treated as gaps and excluded from the energy sums; the positive
/// part of power integrates into consumption, the negative part into
/// regeneration.
pub fn get_drive_stats(connection: &Connection, drive_id: i64) -> Result<DriveStats, DbError> {
    let stats = connection.query_row(
        "WITH spaced AS (
             SELECT speed, power, inside_temp, outside_temp,
                    (julianday(LEAD(recorded_at) OVER (ORDER BY recorded_at, id))
                     - julianday(recorded_at)) * 86400.0 AS dt
             FROM positions
             WHERE drive_id = ?1
         )
         SELECT MAX(speed),
                MAX(power),
                MIN(power),
                AVG(inside_temp),
                AVG(outside_temp),
                COALESCE(SUM(CASE WHEN dt IS NOT NULL AND dt < 60.0 AND power > 0
                                  THEN power * dt / 3600.0 ELSE 0.0 END), 0.0),
                COALESCE(SUM(CASE WHEN dt IS NOT NULL AND dt < 60.0 AND power < 0
                                  THEN -power * dt / 3600.0 ELSE 0.0 END), 0.0)
         FROM spaced",
        params![drive_id],
        |row| {
            Ok(DriveStats {
                speed_max: row.get(0)?,
                power_max: row.get(1)?,
                power_min: row.get(2)?,
                inside_temp_avg: row.get(3)?,
                outside_temp_avg: row.get(4)?,
                energy_used_kwh: row.get(5)?,
                energy_regen_kwh: row.get(6)?,
            })
        },
    )?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use crate::adapters::db::cars;
    use crate::adapters::db::drives;
    use crate::domain::models::Position;
    use crate::test_support::open_migrated_connection;

    use super::{create, get_drive_stats, list_by_drive};

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn seed_car(connection: &rusqlite::Connection) -> i64 {
        cars::upsert(connection, 1001, 2001, "5YJ3E1EA", "Daily", t0())
            .expect("car insert should succeed")
    }

    fn seed_drive(connection: &rusqlite::Connection, car_id: i64) -> i64 {
        let drive = crate::domain::models::Drive {
            car_id,
            start_time: t0(),
            start_battery_level: 80,
            start_range_km: 350.0,
            start_odometer_km: 12300.0,
            start_latitude: Some(30.25),
            start_longitude: Some(120.17),
            ..Default::default()
        };
        drives::create(connection, &drive).expect("drive insert should succeed")
    }

    fn sample(car_id: i64, drive_id: i64, offset_secs: i64, power: i64, speed: f64) -> Position {
        Position {
            car_id,
            drive_id: Some(drive_id),
            latitude: 30.25,
            longitude: 120.17,
            speed_kmh: Some(speed),
            power_kw: power,
            inside_temp: Some(21.0),
            outside_temp: Some(12.0),
            recorded_at: t0() + Duration::seconds(offset_secs),
            ..Position::default()
        }
    }

    #[test]
    fn positions_list_in_recorded_order() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = seed_drive(&connection, car_id);

        create(&connection, &sample(car_id, drive_id, 10, 20, 50.0)).unwrap();
        create(&connection, &sample(car_id, drive_id, 0, 10, 30.0)).unwrap();

        let positions = list_by_drive(&connection, drive_id).expect("list should succeed");
        assert_eq!(positions.len(), 2);
        assert!(positions[0].recorded_at < positions[1].recorded_at);
        assert!(positions.iter().all(|p| p.drive_id == Some(drive_id)));
    }

    #[test]
    fn drive_stats_integrate_power_over_time() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = seed_drive(&connection, car_id);

        // 10 s at 36 kW, then 10 s at -18 kW, final sample terminates the
        // series and contributes no interval.
        create(&connection, &sample(car_id, drive_id, 0, 36, 40.0)).unwrap();
        create(&connection, &sample(car_id, drive_id, 10, -18, 60.0)).unwrap();
        create(&connection, &sample(car_id, drive_id, 20, 5, 20.0)).unwrap();

        let stats = get_drive_stats(&connection, drive_id).expect("stats should compute");
        assert_eq!(stats.speed_max, Some(60.0));
        assert_eq!(stats.power_max, Some(36));
        assert_eq!(stats.power_min, Some(-18));
        assert!((stats.energy_used_kwh - 0.1).abs() < 1e-9, "{}", stats.energy_used_kwh);
        assert!((stats.energy_regen_kwh - 0.05).abs() < 1e-9, "{}", stats.energy_regen_kwh);
        assert_eq!(stats.inside_temp_avg, Some(21.0));
        assert_eq!(stats.outside_temp_avg, Some(12.0));
    }

    #[test]
    fn gaps_of_a_minute_or_more_are_discarded() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = seed_drive(&connection, car_id);

        create(&connection, &sample(car_id, drive_id, 0, 36, 40.0)).unwrap();
        // 60 s exactly: on the gap boundary, must not contribute.
        create(&connection, &sample(car_id, drive_id, 60, 36, 40.0)).unwrap();
        create(&connection, &sample(car_id, drive_id, 70, 0, 0.0)).unwrap();

        let stats = get_drive_stats(&connection, drive_id).expect("stats should compute");
        assert!((stats.energy_used_kwh - 0.1).abs() < 1e-9, "{}", stats.energy_used_kwh);
        assert_eq!(stats.energy_regen_kwh, 0.0);
    }

    #[test]
    fn stats_are_deterministic_for_a_fixed_trajectory() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = seed_drive(&connection, car_id);

        for (offset, power) in [(0, 12), (5, -7), (12, 30), (19, 0)] {
            create(&connection, &sample(car_id, drive_id, offset, power, 25.0)).unwrap();
        }

        let first = get_drive_stats(&connection, drive_id).expect("stats should compute");
        let second = get_drive_stats(&connection, drive_id).expect("stats should compute");
        assert_eq!(first, second);
        assert!(first.energy_used_kwh >= 0.0);
        assert!(first.energy_regen_kwh >= 0.0);
    }

    #[test]
    fn empty_trajectory_yields_zeroed_stats() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let drive_id = seed_drive(&connection, car_id);

        let stats = get_drive_stats(&connection, drive_id).expect("stats should compute");
        assert_eq!(stats.speed_max, None);
        assert_eq!(stats.energy_used_kwh, 0.0);
        assert_eq!(stats.energy_regen_kwh, 0.0);
    }
}
