use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::domain::models::Car;

use super::{DbError, read_timestamp, store_timestamp};

const CAR_COLUMNS: &str = "id, cloud_id, cloud_vehicle_id, vin, name, model, trim_badging, \
                           exterior_color, wheel_type, created_at, updated_at";

fn map_car(row: &Row<'_>) -> rusqlite::Result<Car> {
    Ok(Car {
        id: row.get(0)?,
        cloud_id: row.get(1)?,
        cloud_vehicle_id: row.get(2)?,
        vin: row.get(3)?,
        name: row.get(4)?,
        model: row.get(5)?,
        trim_badging: row.get(6)?,
        exterior_color: row.get(7)?,
        wheel_type: row.get(8)?,
        created_at: read_timestamp(row, 9)?,
        updated_at: read_timestamp(row, 10)?,
    })
}

pub fn list(connection: &Connection) -> Result<Vec<Car>, DbError> {
    let mut statement =
        connection.prepare(&format!("SELECT {CAR_COLUMNS} FROM cars ORDER BY id"))?;
    let rows = statement.query_map([], map_car)?;

    let mut cars = Vec::new();
    for row in rows {
        cars.push(row?);
    }
    Ok(cars)
}

pub fn get_by_id(connection: &Connection, car_id: i64) -> Result<Option<Car>, DbError> {
    let car = connection
        .query_row(
            &format!("SELECT {CAR_COLUMNS} FROM cars WHERE id = ?1"),
            params![car_id],
            map_car,
        )
        .optional()?;
    Ok(car)
}

/// Inserts the car on first sight keyed by its upstream id; later syncs
/// only refresh the display name and VIN. Returns the internal id.
pub fn upsert(
    connection: &Connection,
    cloud_id: i64,
    cloud_vehicle_id: i64,
    vin: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO cars (cloud_id, cloud_vehicle_id, vin, name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT (cloud_id) DO UPDATE SET
             cloud_vehicle_id = excluded.cloud_vehicle_id,
             vin = excluded.vin,
             name = excluded.name,
             updated_at = excluded.updated_at",
        params![
            cloud_id,
            cloud_vehicle_id,
            vin,
            name,
            store_timestamp(now)
        ],
    )?;

    let id = connection.query_row(
        "SELECT id FROM cars WHERE cloud_id = ?1",
        params![cloud_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Refreshes the config fields the upstream feed reports.
pub fn update_config(connection: &Connection, car: &Car, now: DateTime<Utc>) -> Result<(), DbError> {
    connection.execute(
        "UPDATE cars SET model = ?2, trim_badging = ?3, exterior_color = ?4, wheel_type = ?5,
                         updated_at = ?6
         WHERE id = ?1",
        params![
            car.id,
            car.model,
            car.trim_badging,
            car.exterior_color,
            car.wheel_type,
            store_timestamp(now)
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::test_support::open_migrated_connection;

    use super::{get_by_id, list, update_config, upsert};

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn upsert_is_keyed_by_cloud_id() {
        let (connection, _dir) = open_migrated_connection();

        let first = upsert(&connection, 1001, 2001, "5YJ3E1EA", "Daily", now())
            .expect("insert should succeed");
        let second = upsert(&connection, 1001, 2001, "5YJ3E1EA", "Daily (renamed)", now())
            .expect("upsert should succeed");
        assert_eq!(first, second);

        let cars = list(&connection).expect("list should succeed");
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0].name, "Daily (renamed)");
    }

    #[test]
    fn config_fields_are_updatable() {
        let (connection, _dir) = open_migrated_connection();
        let id = upsert(&connection, 1001, 2001, "5YJ3E1EA", "Daily", now())
            .expect("insert should succeed");

        let mut car = get_by_id(&connection, id)
            .expect("query should succeed")
            .expect("car should exist");
        car.model = "model3".to_string();
        car.exterior_color = "DeepBlue".to_string();
        update_config(&connection, &car, now()).expect("update should succeed");

        let reloaded = get_by_id(&connection, id)
            .expect("query should succeed")
            .expect("car should exist");
        assert_eq!(reloaded.model, "model3");
        assert_eq!(reloaded.exterior_color, "DeepBlue");
    }

    #[test]
    fn missing_car_reads_as_none() {
        let (connection, _dir) = open_migrated_connection();
        assert_eq!(get_by_id(&connection, 42).expect("query should succeed"), None);
    }
}
