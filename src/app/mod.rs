pub mod config;
mod error;
mod logging;
mod runtime;
pub mod services;

pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    logging::init()?;

    let config = config::AppConfig::from_env()?;

    tracing::info!(
        database_path = %config.database_path,
        http_bind = %config.http_bind,
        cloud_api_host = %config.cloud_api_host,
        use_streaming_api = config.use_streaming_api,
        geocoding_provider = %config.geocoding_provider,
        "application bootstrap initialized"
    );

    runtime::run(config)
}
