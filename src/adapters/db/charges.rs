use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::domain::models::{Charge, ChargingProcess};

use super::{
    DbError, read_address, read_opt_timestamp, read_timestamp, store_address, store_opt_timestamp,
    store_timestamp,
};

const PROCESS_COLUMNS: &str = "id, car_id, start_time, end_time, start_battery_level, \
                               end_battery_level, start_range_km, end_range_km, \
                               charge_energy_added, charger_power_max, duration_min, \
                               outside_temp_avg, cost, address";

fn map_process(row: &Row<'_>) -> rusqlite::Result<ChargingProcess> {
    Ok(ChargingProcess {
        id: row.get(0)?,
        car_id: row.get(1)?,
        start_time: read_timestamp(row, 2)?,
        end_time: read_opt_timestamp(row, 3)?,
        start_battery_level: row.get(4)?,
        end_battery_level: row.get(5)?,
        start_range_km: row.get(6)?,
        end_range_km: row.get(7)?,
        charge_energy_added_kwh: row.get(8)?,
        charger_power_max: row.get(9)?,
        duration_min: row.get(10)?,
        outside_temp_avg: row.get(11)?,
        cost: row.get(12)?,
        address: read_address(row, 13)?,
    })
}

pub fn create_process(
    connection: &Connection,
    process: &ChargingProcess,
) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO charging_processes (car_id, start_time, start_battery_level, start_range_km,
                                         address)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            process.car_id,
            store_timestamp(process.start_time),
            process.start_battery_level,
            process.start_range_km,
            store_address(&process.address),
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

/// Refreshes the live fields of an open process so reads see progress.
pub fn update_snapshot(
    connection: &Connection,
    process: &ChargingProcess,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE charging_processes SET
             end_battery_level = ?2, end_range_km = ?3, charge_energy_added = ?4,
             charger_power_max = ?5, duration_min = ?6, outside_temp_avg = ?7
         WHERE id = ?1 AND end_time IS NULL",
        params![
            process.id,
            process.end_battery_level,
            process.end_range_km,
            process.charge_energy_added_kwh,
            process.charger_power_max,
            process.duration_min,
            process.outside_temp_avg,
        ],
    )?;
    Ok(())
}

/// Closes the process. Returns false when the row was already closed.
pub fn complete_process(
    connection: &Connection,
    process: &ChargingProcess,
) -> Result<bool, DbError> {
    let updated = connection.execute(
        "UPDATE charging_processes SET
             end_time = ?2, end_battery_level = ?3, end_range_km = ?4, charge_energy_added = ?5,
             charger_power_max = ?6, duration_min = ?7, outside_temp_avg = ?8, cost = ?9
         WHERE id = ?1 AND end_time IS NULL",
        params![
            process.id,
            store_opt_timestamp(process.end_time),
            process.end_battery_level,
            process.end_range_km,
            process.charge_energy_added_kwh,
            process.charger_power_max,
            process.duration_min,
            process.outside_temp_avg,
            process.cost,
        ],
    )?;
    Ok(updated > 0)
}

pub fn get_active_process(
    connection: &Connection,
    car_id: i64,
) -> Result<Option<ChargingProcess>, DbError> {
    let process = connection
        .query_row(
            &format!(
                "SELECT {PROCESS_COLUMNS} FROM charging_processes
                 WHERE car_id = ?1 AND end_time IS NULL
                 ORDER BY start_time DESC LIMIT 1"
            ),
            params![car_id],
            map_process,
        )
        .optional()?;
    Ok(process)
}

pub fn list_by_car(
    connection: &Connection,
    car_id: i64,
    limit: u32,
    offset: u32,
) -> Result<Vec<ChargingProcess>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {PROCESS_COLUMNS} FROM charging_processes
         WHERE car_id = ?1
         ORDER BY start_time DESC, id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = statement.query_map(
        params![car_id, i64::from(limit), i64::from(offset)],
        map_process,
    )?;

    let mut processes = Vec::new();
    for row in rows {
        processes.push(row?);
    }
    Ok(processes)
}

pub fn count_by_car(connection: &Connection, car_id: i64) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM charging_processes WHERE car_id = ?1",
        params![car_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn create_charge_sample(connection: &Connection, charge: &Charge) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO charges (charging_process_id, battery_level, usable_battery_level, range_km,
                              charger_power, charger_voltage, charger_current, charge_energy_added,
                              outside_temp, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            charge.charging_process_id,
            charge.battery_level,
            charge.usable_battery_level,
            charge.range_km,
            charge.charger_power,
            charge.charger_voltage,
            charge.charger_current,
            charge.charge_energy_added_kwh,
            charge.outside_temp,
            store_timestamp(charge.recorded_at),
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

pub fn list_samples_by_process(
    connection: &Connection,
    charging_process_id: i64,
) -> Result<Vec<Charge>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, charging_process_id, battery_level, usable_battery_level, range_km,
                charger_power, charger_voltage, charger_current, charge_energy_added,
                outside_temp, recorded_at
         FROM charges
         WHERE charging_process_id = ?1
         ORDER BY recorded_at, id",
    )?;
    let rows = statement.query_map(params![charging_process_id], |row| {
        Ok(Charge {
            id: row.get(0)?,
            charging_process_id: row.get(1)?,
            battery_level: row.get(2)?,
            usable_battery_level: row.get(3)?,
            range_km: row.get(4)?,
            charger_power: row.get(5)?,
            charger_voltage: row.get(6)?,
            charger_current: row.get(7)?,
            charge_energy_added_kwh: row.get(8)?,
            outside_temp: row.get(9)?,
            recorded_at: read_timestamp(row, 10)?,
        })
    })?;

    let mut samples = Vec::new();
    for row in rows {
        samples.push(row?);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use crate::adapters::db::cars;
    use crate::domain::models::{Charge, ChargingProcess};
    use crate::test_support::open_migrated_connection;

    use super::{
        complete_process, count_by_car, create_charge_sample, create_process, get_active_process,
        list_by_car, list_samples_by_process, update_snapshot,
    };

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn seed_car(connection: &rusqlite::Connection) -> i64 {
        cars::upsert(connection, 1001, 2001, "5YJ3E1EA", "Daily", t0())
            .expect("car insert should succeed")
    }

    fn open_process(connection: &rusqlite::Connection, car_id: i64) -> i64 {
        let process = ChargingProcess {
            car_id,
            start_time: t0(),
            start_battery_level: 40,
            start_range_km: 180.0,
            ..Default::default()
        };
        create_process(connection, &process).expect("process insert should succeed")
    }

    #[test]
    fn open_process_reflects_snapshot_updates() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let process_id = open_process(&connection, car_id);

        let mut process = get_active_process(&connection, car_id)
            .expect("query should succeed")
            .expect("process should be active");
        assert_eq!(process.id, process_id);

        process.end_battery_level = Some(55);
        process.charge_energy_added_kwh = 5.0;
        process.charger_power_max = Some(120);
        process.duration_min = 12.0;
        update_snapshot(&connection, &process).expect("snapshot update should succeed");

        let live = get_active_process(&connection, car_id)
            .expect("query should succeed")
            .expect("process should still be active");
        assert_eq!(live.end_battery_level, Some(55));
        assert_eq!(live.charge_energy_added_kwh, 5.0);
        assert_eq!(live.charger_power_max, Some(120));
        assert_eq!(live.end_time, None);
    }

    #[test]
    fn complete_closes_exactly_once() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        open_process(&connection, car_id);

        let mut process = get_active_process(&connection, car_id)
            .expect("query should succeed")
            .expect("process should be active");
        process.end_time = Some(t0() + Duration::minutes(45));
        process.end_battery_level = Some(78);
        process.charge_energy_added_kwh = 7.5;
        process.duration_min = 45.0;

        assert!(complete_process(&connection, &process).expect("complete should succeed"));
        assert!(!complete_process(&connection, &process).expect("re-complete should be a no-op"));
        assert_eq!(
            get_active_process(&connection, car_id).expect("query should succeed"),
            None
        );
    }

    #[test]
    fn samples_list_in_recorded_order() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        let process_id = open_process(&connection, car_id);

        for (offset, power, added) in [(0, 50, 2.0), (60, 120, 5.0), (120, 80, 7.5)] {
            create_charge_sample(
                &connection,
                &Charge {
                    charging_process_id: process_id,
                    battery_level: 40 + offset / 30,
                    charger_power: power,
                    charge_energy_added_kwh: added,
                    recorded_at: t0() + Duration::seconds(offset),
                    ..Charge::default()
                },
            )
            .expect("sample insert should succeed");
        }

        let samples =
            list_samples_by_process(&connection, process_id).expect("list should succeed");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].charger_power, 50);
        assert_eq!(samples[2].charge_energy_added_kwh, 7.5);
    }

    #[test]
    fn listing_and_count_cover_closed_processes() {
        let (connection, _dir) = open_migrated_connection();
        let car_id = seed_car(&connection);
        open_process(&connection, car_id);

        assert_eq!(count_by_car(&connection, car_id).expect("count should succeed"), 1);
        let page = list_by_car(&connection, car_id, 10, 0).expect("list should succeed");
        assert_eq!(page.len(), 1);
    }
}
