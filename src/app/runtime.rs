use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use rusqlite::Connection;

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::cloud::HttpCloudClient;
use crate::adapters::geocoder::Geocoder;
use crate::adapters::stream::StreamConfig;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::services::SqliteRepositories;
use crate::core::scheduler::SchedulerConfig;
use crate::core::service::{ServiceConfig, VehicleService};
use crate::domain::clock::SystemClock;

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let connection = open_writer_connection(&config.database_path)?;
    let repos = SqliteRepositories::new(connection);

    let cloud = HttpCloudClient::new(&config.cloud_api_host, &config.cloud_auth_host)
        .map_err(AppError::runtime)?
        .with_token_file(PathBuf::from(&config.token_file))
        .map_err(AppError::runtime)?;

    let geocoder = Geocoder::new(&config.geocoding_provider, &config.amap_api_key)
        .map_err(AppError::runtime)?;

    let service = VehicleService::new(
        service_config(&config),
        Arc::new(SystemClock),
        Arc::new(cloud),
        repos.clone(),
        Some(Arc::new(geocoder)),
    )
    .map_err(AppError::runtime)?;

    service.start().map_err(AppError::runtime)?;

    let api_state = ApiState {
        service: Arc::clone(&service),
        repos,
    };
    let server_result = run_http_server(&config.http_bind, api_state);

    service.stop();
    server_result
}

fn service_config(config: &AppConfig) -> ServiceConfig {
    ServiceConfig {
        scheduler: SchedulerConfig {
            interval_online: config.poll_interval_online,
            interval_driving: config.poll_interval_driving,
            interval_charging: config.poll_interval_charging,
            interval_asleep: config.poll_interval_asleep,
            backoff_initial: config.poll_backoff_initial,
            backoff_max: config.poll_backoff_max,
            backoff_factor: config.poll_backoff_factor,
            suspend_interval: Duration::from_secs(config.suspend_poll_interval_min * 60),
        },
        suspend_after_idle: chrono::Duration::minutes(config.suspend_after_idle_min as i64),
        require_not_unlocked: config.require_not_unlocked,
        nominal_capacity_kwh: config.nominal_battery_capacity_kwh,
        use_streaming_api: config.use_streaming_api,
        stream: StreamConfig {
            host: config.streaming_host.clone(),
            reconnect_initial: config.streaming_reconnect_delay,
            reconnect_max: Duration::from_secs(30),
        },
    }
}

fn open_writer_connection(path: &str) -> Result<Arc<Mutex<Connection>>, AppError> {
    if let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(AppError::database_init)?;
    }
    let mut connection =
        crate::adapters::db::open_connection(path).map_err(AppError::database_init)?;
    crate::adapters::db::run_migrations(&mut connection).map_err(AppError::database_init)?;
    Ok(Arc::new(Mutex::new(connection)))
}

fn run_http_server(http_bind: &str, api_state: ApiState) -> Result<(), AppError> {
    tracing::info!(bind = %http_bind, "http server starting");
    let server_result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        })
        .bind(http_bind)?
        .run()
        .await
    });
    server_result.map_err(AppError::runtime)
}
