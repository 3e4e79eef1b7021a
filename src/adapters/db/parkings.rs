use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::domain::models::{Parking, ParkingEvent, ParkingEventKind, ParkingFlags};

use super::{
    DbError, read_address, read_opt_timestamp, read_timestamp, store_address, store_opt_timestamp,
    store_timestamp,
};

const PARKING_COLUMNS: &str = "id, car_id, start_time, end_time, duration_min, latitude, \
                               longitude, address, start_battery_level, end_battery_level, \
                               start_range_km, end_range_km, start_odometer_km, end_odometer_km, \
                               energy_used_kwh, start_inside_temp, end_inside_temp, \
                               start_outside_temp, end_outside_temp, inside_temp_avg, \
                               outside_temp_avg, climate_used_min, sentry_mode_used_min, \
                               start_locked, start_sentry_mode, start_doors_open, \
                               start_windows_open, start_frunk_open, start_trunk_open, \
                               start_climate_on, start_user_present, end_locked, end_sentry_mode, \
                               end_doors_open, end_windows_open, end_frunk_open, end_trunk_open, \
                               end_climate_on, end_user_present, start_tpms_pressure_fl, \
                               start_tpms_pressure_fr, start_tpms_pressure_rl, \
                               start_tpms_pressure_rr, end_tpms_pressure_fl, \
                               end_tpms_pressure_fr, end_tpms_pressure_rl, end_tpms_pressure_rr, \
                               car_version";

fn read_end_flags(row: &Row<'_>, base: usize) -> rusqlite::Result<Option<ParkingFlags>> {
    let locked: Option<bool> = row.get(base)?;
    let Some(locked) = locked else {
        return Ok(None);
    };
    Ok(Some(ParkingFlags {
        locked,
        sentry_mode: row.get::<_, Option<bool>>(base + 1)?.unwrap_or(false),
        doors_open: row.get::<_, Option<bool>>(base + 2)?.unwrap_or(false),
        windows_open: row.get::<_, Option<bool>>(base + 3)?.unwrap_or(false),
        frunk_open: row.get::<_, Option<bool>>(base + 4)?.unwrap_or(false),
        trunk_open: row.get::<_, Option<bool>>(base + 5)?.unwrap_or(false),
        climate_on: row.get::<_, Option<bool>>(base + 6)?.unwrap_or(false),
        user_present: row.get::<_, Option<bool>>(base + 7)?.unwrap_or(false),
    }))
}

fn map_parking(row: &Row<'_>) -> rusqlite::Result<Parking> {
    Ok(Parking {
        id: row.get(0)?,
        car_id: row.get(1)?,
        start_time: read_timestamp(row, 2)?,
        end_time: read_opt_timestamp(row, 3)?,
        duration_min: row.get(4)?,
        latitude: row.get(5)?,
        longitude: row.get(6)?,
        address: read_address(row, 7)?,
        start_battery_level: row.get(8)?,
        end_battery_level: row.get(9)?,
        start_range_km: row.get(10)?,
        end_range_km: row.get(11)?,
        start_odometer_km: row.get(12)?,
        end_odometer_km: row.get(13)?,
        energy_used_kwh: row.get(14)?,
        start_inside_temp: row.get(15)?,
        end_inside_temp: row.get(16)?,
        start_outside_temp: row.get(17)?,
        end_outside_temp: row.get(18)?,
        inside_temp_avg: row.get(19)?,
        outside_temp_avg: row.get(20)?,
        climate_used_min: row.get(21)?,
        sentry_mode_used_min: row.get(22)?,
        start_flags: ParkingFlags {
            locked: row.get(23)?,
            sentry_mode: row.get(24)?,
            doors_open: row.get(25)?,
            windows_open: row.get(26)?,
            frunk_open: row.get(27)?,
            trunk_open: row.get(28)?,
            climate_on: row.get(29)?,
            user_present: row.get(30)?,
        },
        end_flags: read_end_flags(row, 31)?,
        start_tpms_pressure_fl: row.get(39)?,
        start_tpms_pressure_fr: row.get(40)?,
        start_tpms_pressure_rl: row.get(41)?,
        start_tpms_pressure_rr: row.get(42)?,
        end_tpms_pressure_fl: row.get(43)?,
        end_tpms_pressure_fr: row.get(44)?,
        end_tpms_pressure_rl: row.get(45)?,
        end_tpms_pressure_rr: row.get(46)?,
        car_version: row.get(47)?,
    })
}

pub fn create(connection: &Connection, parking: &Parking) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO parkings (car_id, start_time, latitude, longitude, address,
                               start_battery_level, start_range_km, start_odometer_km,
                               start_inside_temp, start_outside_temp,
                               start_locked, start_sentry_mode, start_doors_open,
                               start_windows_open, start_frunk_open, start_trunk_open,
                               start_climate_on, start_user_present,
                               start_tpms_pressure_fl, start_tpms_pressure_fr,
                               start_tpms_pressure_rl, start_tpms_pressure_rr, car_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                 ?19, ?20, ?21, ?22, ?23)",
        params![
            parking.car_id,
            store_timestamp(parking.start_time),
            parking.latitude,
            parking.longitude,
            store_address(&parking.address),
            parking.start_battery_level,
            parking.start_range_km,
            parking.start_odometer_km,
            parking.start_inside_temp,
            parking.start_outside_temp,
            parking.start_flags.locked,
            parking.start_flags.sentry_mode,
            parking.start_flags.doors_open,
            parking.start_flags.windows_open,
            parking.start_flags.frunk_open,
            parking.start_flags.trunk_open,
            parking.start_flags.climate_on,
            parking.start_flags.user_present,
            parking.start_tpms_pressure_fl,
            parking.start_tpms_pressure_fr,
            parking.start_tpms_pressure_rl,
            parking.start_tpms_pressure_rr,
            parking.car_version,
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

/// Live refresh of the open parking row (end-side mirror + accumulators).
pub fn update_snapshot(connection: &Connection, parking: &Parking) -> Result<(), DbError> {
    connection.execute(
        "UPDATE parkings SET
             end_battery_level = ?2, end_range_km = ?3, end_inside_temp = ?4,
             end_outside_temp = ?5, climate_used_min = ?6, sentry_mode_used_min = ?7,
             end_locked = ?8, end_sentry_mode = ?9, end_doors_open = ?10, end_windows_open = ?11,
             end_frunk_open = ?12, end_trunk_open = ?13, end_climate_on = ?14,
             end_user_present = ?15
         WHERE id = ?1 AND end_time IS NULL",
        params![
            parking.id,
            parking.end_battery_level,
            parking.end_range_km,
            parking.end_inside_temp,
            parking.end_outside_temp,
            parking.climate_used_min,
            parking.sentry_mode_used_min,
            parking.end_flags.map(|flags| flags.locked),
            parking.end_flags.map(|flags| flags.sentry_mode),
            parking.end_flags.map(|flags| flags.doors_open),
            parking.end_flags.map(|flags| flags.windows_open),
            parking.end_flags.map(|flags| flags.frunk_open),
            parking.end_flags.map(|flags| flags.trunk_open),
            parking.end_flags.map(|flags| flags.climate_on),
            parking.end_flags.map(|flags| flags.user_present),
        ],
    )?;
    Ok(())
}

/// Closes the parking. Returns false when the row was already closed.
pub fn complete(connection: &Connection, parking: &Parking) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE parkings SET
             end_time = ?2, duration_min = ?3, end_battery_level = ?4, end_range_km = ?5,
             end_odometer_km = ?6, energy_used_kwh = ?7, end_inside_temp = ?8,
             end_outside_temp = ?9, inside_temp_avg = ?10, outside_temp_avg = ?11,
             climate_used_min = ?12, sentry_mode_used_min = ?13,
             end_locked = ?14, end_sentry_mode = ?15, end_doors_open = ?16,
             end_windows_open = ?17, end_frunk_open = ?18, end_trunk_open = ?19,
             end_climate_on = ?20, end_user_present = ?21,
             end_tpms_pressure_fl = ?22, end_tpms_pressure_fr = ?23,
             end_tpms_pressure_rl = ?24, end_tpms_pressure_rr = ?25
         WHERE id = ?1 AND end_time IS NULL",
        params![
            parking.id,
            store_opt_timestamp(parking.end_time),
            parking.duration_min,
            parking.end_battery_level,
            parking.end_range_km,
            parking.end_odometer_km,
            parking.energy_used_kwh,
            parking.end_inside_temp,
            parking.end_outside_temp,
            parking.inside_temp_avg,
            parking.outside_temp_avg,
            parking.climate_used_min,
            parking.sentry_mode_used_min,
            parking.end_flags.map(|flags| flags.locked),
            parking.end_flags.map(|flags| flags.sentry_mode),
            parking.end_flags.map(|flags| flags.doors_open),
            parking.end_flags.map(|flags| flags.windows_open),
            parking.end_flags.map(|flags| flags.frunk_open),
            parking.end_flags.map(|flags| flags.trunk_open),
            parking.end_flags.map(|flags| flags.climate_on),
            parking.end_flags.map(|flags| flags.user_present),
            parking.end_tpms_pressure_fl,
            parking.end_tpms_pressure_fr,
            parking.end_tpms_pressure_rl,
            parking.end_tpms_pressure_rr,
        ],
    )?;
    Ok(updated > 0)
}

pub fn get_active(connection: &Connection, car_id: i64) -> Result<Option<Parking>, DbError> {
    let parking = connection
        .query_row(
            &format!(
                "SELECT {PARKING_COLUMNS} FROM parkings
                 WHERE car_id = ?1 AND end_time IS NULL
                 ORDER BY start_time DESC LIMIT 1"
            ),
            params![car_id],
            map_parking,
        )
        .optional()?;
    Ok(parking)
}

/// Invariant enforcement: closes every still-open parking for the car.
/// Returns the number of rows closed.
pub fn force_close_open(
    connection: &Connection,
    car_id: i64,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let closed = connection.execute(
        "UPDATE parkings SET
             end_time = ?2,
             duration_min = MAX((julianday(?2) - julianday(start_time)) * 1440.0, 0)
         WHERE car_id = ?1 AND end_time IS NULL",
        params![car_id, store_timestamp(now)],
    )?;
    Ok(closed)
}

pub fn list_by_car(
    connection: &Connection,
    car_id: i64,
    limit: u32,
    offset: u32,
) -> Result<Vec<Parking>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {PARKING_COLUMNS} FROM parkings
         WHERE car_id = ?1
         ORDER BY start_time DESC, id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = statement.query_map(
        params![car_id, i64::from(limit), i64::from(offset)],
        map_parking,
    )?;

    let mut parkings = Vec::new();
    for row in rows {
        parkings.push(row?);
    }
    Ok(parkings)
}

pub fn count_by_car(connection: &Connection, car_id: i64) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM parkings WHERE car_id = ?1",
        params![car_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn create_event(connection: &Connection, event: &ParkingEvent) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO parking_events (parking_id, event_type, event_time, details)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event.parking_id,
            event.kind.as_str(),
            store_timestamp(event.event_time),
            event.details.as_ref().map(|details| details.to_string()),
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

pub fn list_events(
    connection: &Connection,
    parking_id: i64,
) -> Result<Vec<ParkingEvent>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, parking_id, event_type, event_time, details
         FROM parking_events
         WHERE parking_id = ?1
         ORDER BY event_time, id",
    )?;
    let rows = statement.query_map(params![parking_id], |row| {
        let raw_kind: String = row.get(2)?;
        let kind = ParkingEventKind::parse(&raw_kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown parking event type: {raw_kind}").into(),
            )
        })?;
        let details: Option<String> = row.get(4)?;
        Ok(ParkingEvent {
            id: row.get(0)?,
            parking_id: row.get(1)?,
            kind,
            event_time: read_timestamp(row, 3)?,
            details: details.and_then(|raw| serde_json::from_str(&raw).ok()),
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use crate::adapters::db::cars;
    use crate::domain::models::{Parking, ParkingEvent, ParkingEventKind, ParkingFlags};
    use crate::test_support::open_migrated_connection;

    use super::{
        complete, count_by_car, create, create_event, force_close_open, get_active, list_by_car,
        list_events, update_snapshot,
    };

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn seed_car(connection: &rusqlite::Connection) -> i64 {
        cars::upsert(connection, 1001, 2001, "5YJ3E1EA", "Daily", t0())
            .expect("car insert should succeed")
    }

    fn open_parking(connection: &rusqlite::Connection, car_id: i64, offset_min: i64) -> i64 {
        let parking = Parking {
            car_id,
            start_time: t0() + Duration::minutes(offset_min),
            latitude: 30.25,
            longitude: 120.17,
            start_battery_level: 80,
            start_range_km: 350.0,
            start_odometer_km: 12318.5,
            start_flags: ParkingFlags {
                locked: true,
                ..ParkingFlags::default()
            },
            ..Default::default()
        };
        create(connection, &parking).expect("parking insert should succeed")
    }

    #[test]
    fn active_parking_is_the_open_row() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let parking_id = open_parking(&connection, car_id, 0);

        let active = get_active(&connection, car_id)
            .expect("query should succeed")
            .expect("parking should be active");
        assert_eq!(active.id, parking_id);
        assert!(active.start_flags.locked);
        assert_eq!(active.end_flags, None);
    }

    #[test]
    fn force_close_ends_every_open_row() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        open_parking(&connection, car_id, 0);
        open_parking(&connection, car_id, 10);

        let closed = force_close_open(&connection, car_id, t0() + Duration::minutes(30))
            .expect("force close should succeed");
        assert_eq!(closed, 2);
        assert_eq!(get_active(&connection, car_id).expect("query should succeed"), None);

        let rows = list_by_car(&connection, car_id, 10, 0).expect("list should succeed");
        assert!(rows.iter().all(|parking| parking.end_time.is_some()));
        assert!((rows[0].duration_min - 20.0).abs() < 1e-6);
        assert!((rows[1].duration_min - 30.0).abs() < 1e-6);
    }

    #[test]
    fn snapshot_update_keeps_the_row_open() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        open_parking(&connection, car_id, 0);

        let mut parking = get_active(&connection, car_id)
            .expect("query should succeed")
            .expect("parking should be active");
        parking.end_battery_level = Some(79);
        parking.climate_used_min = Some(4.0);
        parking.end_flags = Some(ParkingFlags {
            locked: true,
            sentry_mode: true,
            ..ParkingFlags::default()
        });
        update_snapshot(&connection, &parking).expect("snapshot update should succeed");

        let live = get_active(&connection, car_id)
            .expect("query should succeed")
            .expect("parking should still be active");
        assert_eq!(live.end_battery_level, Some(79));
        assert_eq!(live.climate_used_min, Some(4.0));
        assert_eq!(live.end_flags.map(|flags| flags.sentry_mode), Some(true));
    }

    #[test]
    fn complete_closes_exactly_once() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        open_parking(&connection, car_id, 0);

        let mut parking = get_active(&connection, car_id)
            .expect("query should succeed")
            .expect("parking should be active");
        parking.end_time = Some(t0() + Duration::minutes(90));
        parking.duration_min = 90.0;
        parking.end_battery_level = Some(78);
        parking.energy_used_kwh = Some(1.5);
        parking.end_flags = Some(parking.start_flags);

        assert!(complete(&connection, &parking).expect("complete should succeed"));
        assert!(!complete(&connection, &parking).expect("re-complete should be a no-op"));
        assert_eq!(get_active(&connection, car_id).expect("query should succeed"), None);
        assert_eq!(count_by_car(&connection, car_id).expect("count should succeed"), 1);
    }

    #[test]
    fn events_replay_in_recorded_order() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let parking_id = open_parking(&connection, car_id, 0);

        let sequence = [
            ParkingEventKind::DoorsOpened,
            ParkingEventKind::Unlocked,
            ParkingEventKind::DoorsClosed,
            ParkingEventKind::Locked,
        ];
        for (offset, kind) in sequence.iter().enumerate() {
            create_event(
                &connection,
                &ParkingEvent {
                    id: 0,
                    parking_id,
                    kind: *kind,
                    event_time: t0() + Duration::seconds(offset as i64 * 15),
                    details: None,
                },
            )
            .expect("event insert should succeed");
        }

        let events = list_events(&connection, parking_id).expect("list should succeed");
        let kinds: Vec<ParkingEventKind> = events.iter().map(|event| event.kind).collect();
        assert_eq!(kinds, sequence);
    }
}
