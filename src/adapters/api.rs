use std::sync::Arc;

use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use crate::app::services::{
    ChargeRepository, DriveRepository, ParkingRepository, SqliteRepositories,
};
use crate::core::service::{ControlError, VehicleService};
use crate::domain::models::{
    Address, Charge, ChargingProcess, Drive, DrivePath, Parking, ParkingEvent,
};
use crate::domain::units::{format_timestamp, parse_timestamp};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<VehicleService>,
    pub repos: SqliteRepositories,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Page<T: Serialize> {
    items: Vec<T>,
    total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DriveResponse {
    id: i64,
    car_id: i64,
    start_time: String,
    end_time: Option<String>,
    distance_km: f64,
    duration_min: f64,
    start_battery_level: i64,
    end_battery_level: Option<i64>,
    start_odometer_km: f64,
    end_odometer_km: Option<f64>,
    speed_max: Option<f64>,
    power_max: Option<i64>,
    power_min: Option<i64>,
    energy_used_kwh: Option<f64>,
    energy_regen_kwh: Option<f64>,
    start_address: Option<Address>,
    end_address: Option<Address>,
    start_latitude: Option<f64>,
    start_longitude: Option<f64>,
    end_latitude: Option<f64>,
    end_longitude: Option<f64>,
}

impl From<Drive> for DriveResponse {
    fn from(drive: Drive) -> Self {
        Self {
            id: drive.id,
            car_id: drive.car_id,
            start_time: format_timestamp(drive.start_time),
            end_time: drive.end_time.map(format_timestamp),
            distance_km: drive.distance_km,
            duration_min: drive.duration_min,
            start_battery_level: drive.start_battery_level,
            end_battery_level: drive.end_battery_level,
            start_odometer_km: drive.start_odometer_km,
            end_odometer_km: drive.end_odometer_km,
            speed_max: drive.speed_max,
            power_max: drive.power_max,
            power_min: drive.power_min,
            energy_used_kwh: drive.energy_used_kwh,
            energy_regen_kwh: drive.energy_regen_kwh,
            start_address: drive.start_address,
            end_address: drive.end_address,
            start_latitude: drive.start_latitude,
            start_longitude: drive.start_longitude,
            end_latitude: drive.end_latitude,
            end_longitude: drive.end_longitude,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChargingProcessResponse {
    id: i64,
    car_id: i64,
    start_time: String,
    end_time: Option<String>,
    start_battery_level: i64,
    end_battery_level: Option<i64>,
    charge_energy_added_kwh: f64,
    charger_power_max: Option<i64>,
    duration_min: f64,
    outside_temp_avg: Option<f64>,
    cost: Option<f64>,
    address: Option<Address>,
}

impl From<ChargingProcess> for ChargingProcessResponse {
    fn from(process: ChargingProcess) -> Self {
        Self {
            id: process.id,
            car_id: process.car_id,
            start_time: format_timestamp(process.start_time),
            end_time: process.end_time.map(format_timestamp),
            start_battery_level: process.start_battery_level,
            end_battery_level: process.end_battery_level,
            charge_energy_added_kwh: process.charge_energy_added_kwh,
            charger_power_max: process.charger_power_max,
            duration_min: process.duration_min,
            outside_temp_avg: process.outside_temp_avg,
            cost: process.cost,
            address: process.address,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChargeSampleResponse {
    battery_level: i64,
    charger_power: i64,
    charge_energy_added_kwh: f64,
    recorded_at: String,
}

impl From<Charge> for ChargeSampleResponse {
    fn from(charge: Charge) -> Self {
        Self {
            battery_level: charge.battery_level,
            charger_power: charge.charger_power,
            charge_energy_added_kwh: charge.charge_energy_added_kwh,
            recorded_at: format_timestamp(charge.recorded_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParkingResponse {
    id: i64,
    car_id: i64,
    start_time: String,
    end_time: Option<String>,
    duration_min: f64,
    latitude: f64,
    longitude: f64,
    address: Option<Address>,
    start_battery_level: i64,
    end_battery_level: Option<i64>,
    energy_used_kwh: Option<f64>,
    climate_used_min: Option<f64>,
    sentry_mode_used_min: Option<f64>,
    inside_temp_avg: Option<f64>,
    outside_temp_avg: Option<f64>,
}

impl From<Parking> for ParkingResponse {
    fn from(parking: Parking) -> Self {
        Self {
            id: parking.id,
            car_id: parking.car_id,
            start_time: format_timestamp(parking.start_time),
            end_time: parking.end_time.map(format_timestamp),
            duration_min: parking.duration_min,
            latitude: parking.latitude,
            longitude: parking.longitude,
            address: parking.address,
            start_battery_level: parking.start_battery_level,
            end_battery_level: parking.end_battery_level,
            energy_used_kwh: parking.energy_used_kwh,
            climate_used_min: parking.climate_used_min,
            sentry_mode_used_min: parking.sentry_mode_used_min,
            inside_temp_avg: parking.inside_temp_avg,
            outside_temp_avg: parking.outside_temp_avg,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParkingEventResponse {
    id: i64,
    parking_id: i64,
    event_type: String,
    event_time: String,
}

impl From<ParkingEvent> for ParkingEventResponse {
    fn from(event: ParkingEvent) -> Self {
        Self {
            id: event.id,
            parking_id: event.parking_id,
            event_type: event.kind.as_str().to_string(),
            event_time: format_timestamp(event.event_time),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DrivePathResponse {
    drive_id: i64,
    start_time: String,
    duration_min: f64,
    distance_km: f64,
    path: Vec<(f64, f64)>,
}

impl From<DrivePath> for DrivePathResponse {
    fn from(path: DrivePath) -> Self {
        Self {
            drive_id: path.drive_id,
            start_time: format_timestamp(path.start_time),
            duration_min: path.duration_min,
            distance_km: path.distance_km,
            path: path.path,
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(list_cars)
        .service(events_bootstrap)
        .service(get_all_states)
        .service(get_car_state)
        .service(suspend_logging)
        .service(resume_logging)
        .service(list_drives)
        .service(get_drive_paths)
        .service(list_charges)
        .service(list_charge_samples)
        .service(list_parkings)
        .service(list_parking_events);
}

fn error_json(message: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": message.to_string() })
}

fn page_query(query: &ListQuery) -> (u32, u32) {
    (query.limit.unwrap_or(50).clamp(1, 500), query.offset.unwrap_or(0))
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[get("/api/cars")]
async fn list_cars(state: web::Data<ApiState>) -> impl Responder {
    match crate::app::services::CarRepository::list(&state.repos) {
        Ok(cars) => HttpResponse::Ok().json(cars),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[get("/api/states")]
async fn get_all_states(state: web::Data<ApiState>) -> impl Responder {
    match state.service.get_all_states() {
        Ok(states) => HttpResponse::Ok().json(states),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

/// One-shot event-feed bootstrap for UIs: subscribes, drains whatever is
/// immediately available (always at least the `init` frame) and hands the
/// subscription back. Long-lived feeds belong to the WS front end.
#[get("/api/events/bootstrap")]
async fn events_bootstrap(state: web::Data<ApiState>) -> impl Responder {
    let subscription = match state.service.subscribe() {
        Ok(subscription) => subscription,
        Err(err) => return HttpResponse::InternalServerError().json(error_json(err)),
    };
    let frames: Vec<_> = subscription.receiver.try_iter().collect();
    if let Err(err) = state.service.unsubscribe(subscription.id) {
        tracing::warn!(error = %err, "failed to drop bootstrap subscription");
    }
    HttpResponse::Ok().json(frames)
}

#[get("/api/cars/{id}/state")]
async fn get_car_state(state: web::Data<ApiState>, path: web::Path<i64>) -> impl Responder {
    match state.service.get_state(path.into_inner()) {
        Ok(Some(snapshot)) => HttpResponse::Ok().json(snapshot),
        Ok(None) => HttpResponse::NotFound().json(error_json("vehicle not found")),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[post("/api/cars/{id}/logging/suspend")]
async fn suspend_logging(state: web::Data<ApiState>, path: web::Path<i64>) -> impl Responder {
    match state.service.suspend_logging(path.into_inner()) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "status": "ok" })),
        Err(ControlError::UnknownVehicle) => {
            HttpResponse::NotFound().json(error_json("vehicle not found"))
        }
        Err(err @ ControlError::CannotSuspend(_)) => {
            HttpResponse::BadRequest().json(error_json(err))
        }
        Err(err @ ControlError::Internal) => {
            HttpResponse::InternalServerError().json(error_json(err))
        }
    }
}

#[post("/api/cars/{id}/logging/resume")]
async fn resume_logging(state: web::Data<ApiState>, path: web::Path<i64>) -> impl Responder {
    match state.service.resume_logging(path.into_inner()) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "status": "ok" })),
        Err(ControlError::UnknownVehicle) => {
            HttpResponse::NotFound().json(error_json("vehicle not found"))
        }
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[get("/api/cars/{id}/drives")]
async fn list_drives(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    query: web::Query<ListQuery>,
) -> impl Responder {
    let car_id = path.into_inner();
    let (limit, offset) = page_query(&query);

    let total = match DriveRepository::count_by_car(&state.repos, car_id) {
        Ok(total) => total,
        Err(err) => return HttpResponse::InternalServerError().json(error_json(err)),
    };
    match DriveRepository::list_by_car(&state.repos, car_id, limit, offset) {
        Ok(drives) => HttpResponse::Ok().json(Page {
            items: drives.into_iter().map(DriveResponse::from).collect(),
            total,
        }),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[get("/api/cars/{id}/drives/paths")]
async fn get_drive_paths(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    query: web::Query<RangeQuery>,
) -> impl Responder {
    let car_id = path.into_inner();
    let (Some(start), Some(end)) = (parse_timestamp(&query.start), parse_timestamp(&query.end))
    else {
        return HttpResponse::BadRequest()
            .json(error_json("start and end must be RFC3339 timestamps"));
    };

    match DriveRepository::get_paths_in_range(&state.repos, car_id, start, end) {
        Ok(paths) => HttpResponse::Ok().json(
            paths
                .into_iter()
                .map(DrivePathResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[get("/api/cars/{id}/charges")]
async fn list_charges(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    query: web::Query<ListQuery>,
) -> impl Responder {
    let car_id = path.into_inner();
    let (limit, offset) = page_query(&query);

    let total = match ChargeRepository::count_by_car(&state.repos, car_id) {
        Ok(total) => total,
        Err(err) => return HttpResponse::InternalServerError().json(error_json(err)),
    };
    match ChargeRepository::list_by_car(&state.repos, car_id, limit, offset) {
        Ok(processes) => HttpResponse::Ok().json(Page {
            items: processes
                .into_iter()
                .map(ChargingProcessResponse::from)
                .collect(),
            total,
        }),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[get("/api/charges/{id}/samples")]
async fn list_charge_samples(state: web::Data<ApiState>, path: web::Path<i64>) -> impl Responder {
    match state.repos.list_samples_by_process(path.into_inner()) {
        Ok(samples) => HttpResponse::Ok().json(
            samples
                .into_iter()
                .map(ChargeSampleResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[get("/api/cars/{id}/parkings")]
async fn list_parkings(
    state: web::Data<ApiState>,
    path: web::Path<i64>,
    query: web::Query<ListQuery>,
) -> impl Responder {
    let car_id = path.into_inner();
    let (limit, offset) = page_query(&query);

    let total = match ParkingRepository::count_by_car(&state.repos, car_id) {
        Ok(total) => total,
        Err(err) => return HttpResponse::InternalServerError().json(error_json(err)),
    };
    match ParkingRepository::list_by_car(&state.repos, car_id, limit, offset) {
        Ok(parkings) => HttpResponse::Ok().json(Page {
            items: parkings.into_iter().map(ParkingResponse::from).collect(),
            total,
        }),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}

#[get("/api/parkings/{id}/events")]
async fn list_parking_events(state: web::Data<ApiState>, path: web::Path<i64>) -> impl Responder {
    match state.repos.list_events(path.into_inner()) {
        Ok(events) => HttpResponse::Ok().json(
            events
                .into_iter()
                .map(ParkingEventResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(err) => HttpResponse::InternalServerError().json(error_json(err)),
    }
}
