use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::domain::models::{
    Address, Car, Charge, ChargingProcess, Drive, DrivePath, DriveStats, Parking, ParkingEvent,
    Position,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

pub trait CarRepository: Send + Sync + 'static {
    fn list(&self) -> Result<Vec<Car>, ServiceError>;
    fn get_by_id(&self, car_id: i64) -> Result<Option<Car>, ServiceError>;
    fn upsert(
        &self,
        cloud_id: i64,
        cloud_vehicle_id: i64,
        vin: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, ServiceError>;
    fn update_config(&self, car: &Car, now: DateTime<Utc>) -> Result<(), ServiceError>;
}

pub trait PositionRepository: Send + Sync + 'static {
    fn create(&self, position: &Position) -> Result<i64, ServiceError>;
    fn list_by_drive(&self, drive_id: i64) -> Result<Vec<Position>, ServiceError>;
    fn get_drive_stats(&self, drive_id: i64) -> Result<DriveStats, ServiceError>;
}

pub trait DriveRepository: Send + Sync + 'static {
    fn create(&self, drive: &Drive) -> Result<i64, ServiceError>;
    fn set_start_address(&self, drive_id: i64, address: &Address) -> Result<(), ServiceError>;
    fn complete(&self, drive: &Drive) -> Result<bool, ServiceError>;
    fn get_active(&self, car_id: i64) -> Result<Option<Drive>, ServiceError>;
    fn get_by_id(&self, drive_id: i64) -> Result<Option<Drive>, ServiceError>;
    fn list_by_car(&self, car_id: i64, limit: u32, offset: u32)
    -> Result<Vec<Drive>, ServiceError>;
    fn count_by_car(&self, car_id: i64) -> Result<i64, ServiceError>;
    fn get_paths_in_range(
        &self,
        car_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DrivePath>, ServiceError>;
}

pub trait ChargeRepository: Send + Sync + 'static {
    fn create_process(&self, process: &ChargingProcess) -> Result<i64, ServiceError>;
    fn update_snapshot(&self, process: &ChargingProcess) -> Result<(), ServiceError>;
    fn complete_process(&self, process: &ChargingProcess) -> Result<bool, ServiceError>;
    fn get_active_process(&self, car_id: i64) -> Result<Option<ChargingProcess>, ServiceError>;
    fn create_charge_sample(&self, charge: &Charge) -> Result<i64, ServiceError>;
    fn list_samples_by_process(
        &self,
        charging_process_id: i64,
    ) -> Result<Vec<Charge>, ServiceError>;
    fn list_by_car(
        &self,
        car_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChargingProcess>, ServiceError>;
    fn count_by_car(&self, car_id: i64) -> Result<i64, ServiceError>;
}

pub trait ParkingRepository: Send + Sync + 'static {
    fn create(&self, parking: &Parking) -> Result<i64, ServiceError>;
    fn update_snapshot(&self, parking: &Parking) -> Result<(), ServiceError>;
    fn complete(&self, parking: &Parking) -> Result<bool, ServiceError>;
    fn get_active(&self, car_id: i64) -> Result<Option<Parking>, ServiceError>;
    fn force_close_open(&self, car_id: i64, now: DateTime<Utc>) -> Result<usize, ServiceError>;
    fn create_event(&self, event: &ParkingEvent) -> Result<i64, ServiceError>;
    fn list_events(&self, parking_id: i64) -> Result<Vec<ParkingEvent>, ServiceError>;
    fn list_by_car(
        &self,
        car_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Parking>, ServiceError>;
    fn count_by_car(&self, car_id: i64) -> Result<i64, ServiceError>;
}

/// All repository contracts backed by one shared SQLite writer connection.
#[derive(Clone)]
pub struct SqliteRepositories {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteRepositories {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }
}

impl CarRepository for SqliteRepositories {
    fn list(&self) -> Result<Vec<Car>, ServiceError> {
        self.with_connection(db::cars::list)
    }

    fn get_by_id(&self, car_id: i64) -> Result<Option<Car>, ServiceError> {
        self.with_connection(|connection| db::cars::get_by_id(connection, car_id))
    }

    fn upsert(
        &self,
        cloud_id: i64,
        cloud_vehicle_id: i64,
        vin: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, ServiceError> {
        self.with_connection(|connection| {
            db::cars::upsert(connection, cloud_id, cloud_vehicle_id, vin, name, now)
        })
    }

    fn update_config(&self, car: &Car, now: DateTime<Utc>) -> Result<(), ServiceError> {
        self.with_connection(|connection| db::cars::update_config(connection, car, now))
    }
}

impl PositionRepository for SqliteRepositories {
    fn create(&self, position: &Position) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::positions::create(connection, position))
    }

    fn list_by_drive(&self, drive_id: i64) -> Result<Vec<Position>, ServiceError> {
        self.with_connection(|connection| db::positions::list_by_drive(connection, drive_id))
    }

    fn get_drive_stats(&self, drive_id: i64) -> Result<DriveStats, ServiceError> {
        self.with_connection(|connection| db::positions::get_drive_stats(connection, drive_id))
    }
}

impl DriveRepository for SqliteRepositories {
    fn create(&self, drive: &Drive) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::drives::create(connection, drive))
    }

    fn set_start_address(&self, drive_id: i64, address: &Address) -> Result<(), ServiceError> {
        self.with_connection(|connection| {
            db::drives::set_start_address(connection, drive_id, address)
        })
    }

    fn complete(&self, drive: &Drive) -> Result<bool, ServiceError> {
        self.with_connection(|connection| db::drives::complete(connection, drive))
    }

    fn get_active(&self, car_id: i64) -> Result<Option<Drive>, ServiceError> {
        self.with_connection(|connection| db::drives::get_active(connection, car_id))
    }

    fn get_by_id(&self, drive_id: i64) -> Result<Option<Drive>, ServiceError> {
        self.with_connection(|connection| db::drives::get_by_id(connection, drive_id))
    }

    fn list_by_car(
        &self,
        car_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Drive>, ServiceError> {
        self.with_connection(|connection| db::drives::list_by_car(connection, car_id, limit, offset))
    }

    fn count_by_car(&self, car_id: i64) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::drives::count_by_car(connection, car_id))
    }

    fn get_paths_in_range(
        &self,
        car_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DrivePath>, ServiceError> {
        self.with_connection(|connection| {
            db::drives::get_paths_in_range(connection, car_id, start, end)
        })
    }
}

impl ChargeRepository for SqliteRepositories {
    fn create_process(&self, process: &ChargingProcess) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::charges::create_process(connection, process))
    }

    fn update_snapshot(&self, process: &ChargingProcess) -> Result<(), ServiceError> {
        self.with_connection(|connection| db::charges::update_snapshot(connection, process))
    }

    fn complete_process(&self, process: &ChargingProcess) -> Result<bool, ServiceError> {
        self.with_connection(|connection| db::charges::complete_process(connection, process))
    }

    fn get_active_process(&self, car_id: i64) -> Result<Option<ChargingProcess>, ServiceError> {
        self.with_connection(|connection| db::charges::get_active_process(connection, car_id))
    }

    fn create_charge_sample(&self, charge: &Charge) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::charges::create_charge_sample(connection, charge))
    }

    fn list_samples_by_process(
        &self,
        charging_process_id: i64,
    ) -> Result<Vec<Charge>, ServiceError> {
        self.with_connection(|connection| {
            db::charges::list_samples_by_process(connection, charging_process_id)
        })
    }

    fn list_by_car(
        &self,
        car_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChargingProcess>, ServiceError> {
        self.with_connection(|connection| {
            db::charges::list_by_car(connection, car_id, limit, offset)
        })
    }

    fn count_by_car(&self, car_id: i64) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::charges::count_by_car(connection, car_id))
    }
}

impl ParkingRepository for SqliteRepositories {
    fn create(&self, parking: &Parking) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::parkings::create(connection, parking))
    }

    fn update_snapshot(&self, parking: &Parking) -> Result<(), ServiceError> {
        self.with_connection(|connection| db::parkings::update_snapshot(connection, parking))
    }

    fn complete(&self, parking: &Parking) -> Result<bool, ServiceError> {
        self.with_connection(|connection| db::parkings::complete(connection, parking))
    }

    fn get_active(&self, car_id: i64) -> Result<Option<Parking>, ServiceError> {
        self.with_connection(|connection| db::parkings::get_active(connection, car_id))
    }

    fn force_close_open(&self, car_id: i64, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        self.with_connection(|connection| db::parkings::force_close_open(connection, car_id, now))
    }

    fn create_event(&self, event: &ParkingEvent) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::parkings::create_event(connection, event))
    }

    fn list_events(&self, parking_id: i64) -> Result<Vec<ParkingEvent>, ServiceError> {
        self.with_connection(|connection| db::parkings::list_events(connection, parking_id))
    }

    fn list_by_car(
        &self,
        car_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Parking>, ServiceError> {
        self.with_connection(|connection| {
            db::parkings::list_by_car(connection, car_id, limit, offset)
        })
    }

    fn count_by_car(&self, car_id: i64) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::parkings::count_by_car(connection, car_id))
    }
}
