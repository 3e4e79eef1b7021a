use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Full-data sub-record selection requested from the vendor.
const DATA_ENDPOINTS: &str =
    "charge_state;climate_state;drive_state;location_data;vehicle_config;vehicle_state";

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("vehicle unavailable")]
    VehicleUnavailable,
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("token store lock poisoned")]
    TokenStorePoisoned,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected response: status={status} body={body}")]
    Api { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl CloudError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// OAuth token pair persisted to disk across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Refresh kicks in five minutes before the access token expires.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let expires_at =
            self.created_at + chrono::Duration::seconds(self.expires_in - TOKEN_REFRESH_MARGIN_SECS);
        now >= expires_at
    }
}

/// Listing/probe record: identity plus the coarse state string. The probe
/// endpoint never wakes the vehicle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CloudVehicle {
    pub id: i64,
    #[serde(default)]
    pub vehicle_id: i64,
    #[serde(default)]
    pub vin: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChargeState {
    #[serde(default)]
    pub battery_level: i64,
    #[serde(default)]
    pub usable_battery_level: i64,
    #[serde(default)]
    pub est_battery_range: f64,
    #[serde(default)]
    pub ideal_battery_range: f64,
    #[serde(default)]
    pub charging_state: String,
    #[serde(default)]
    pub charger_power: i64,
    #[serde(default)]
    pub charger_voltage: i64,
    #[serde(default)]
    pub charger_actual_current: i64,
    #[serde(default)]
    pub charge_limit_soc: i64,
    #[serde(default)]
    pub charge_energy_added: f64,
    #[serde(default)]
    pub time_to_full_charge: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClimateState {
    #[serde(default)]
    pub inside_temp: f64,
    #[serde(default)]
    pub outside_temp: f64,
    #[serde(default)]
    pub is_climate_on: bool,
    #[serde(default)]
    pub is_preconditioning: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DriveState {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub heading: i64,
    /// mph; absent while parked.
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub power: i64,
    #[serde(default)]
    pub shift_state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SoftwareUpdate {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub download_perc: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BodyState {
    /// miles
    #[serde(default)]
    pub odometer: f64,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub sentry_mode: bool,
    #[serde(default)]
    pub is_user_present: bool,
    #[serde(default)]
    pub car_version: String,
    #[serde(default)]
    pub software_update: Option<SoftwareUpdate>,
    // Per-door / per-window / trunk flags; non-zero means open.
    #[serde(default)]
    pub df: i64,
    #[serde(default)]
    pub pf: i64,
    #[serde(default)]
    pub dr: i64,
    #[serde(default)]
    pub pr: i64,
    #[serde(default)]
    pub ft: i64,
    #[serde(default)]
    pub rt: i64,
    #[serde(default)]
    pub fd_window: i64,
    #[serde(default)]
    pub fp_window: i64,
    #[serde(default)]
    pub rd_window: i64,
    #[serde(default)]
    pub rp_window: i64,
    #[serde(default)]
    pub tpms_pressure_fl: Option<f64>,
    #[serde(default)]
    pub tpms_pressure_fr: Option<f64>,
    #[serde(default)]
    pub tpms_pressure_rl: Option<f64>,
    #[serde(default)]
    pub tpms_pressure_rr: Option<f64>,
}

impl BodyState {
    pub fn any_door_open(&self) -> bool {
        self.df != 0 || self.pf != 0 || self.dr != 0 || self.pr != 0
    }

    pub fn any_window_open(&self) -> bool {
        self.fd_window != 0 || self.fp_window != 0 || self.rd_window != 0 || self.rp_window != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VehicleConfig {
    #[serde(default)]
    pub car_type: String,
    #[serde(default)]
    pub exterior_color: String,
    #[serde(default)]
    pub trim_badging: String,
    #[serde(default)]
    pub wheel_type: String,
}

/// Full acquisition bundle. Sub-records are optional; the feed omits them
/// for vehicles that withhold data.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VehicleData {
    pub id: i64,
    #[serde(default)]
    pub vehicle_id: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub charge_state: Option<ChargeState>,
    #[serde(default)]
    pub climate_state: Option<ClimateState>,
    #[serde(default)]
    pub drive_state: Option<DriveState>,
    #[serde(default, rename = "vehicle_state")]
    pub body_state: Option<BodyState>,
    #[serde(default)]
    pub vehicle_config: Option<VehicleConfig>,
}

/// Upstream acquisition seam. The poll loop only ever talks through this
/// trait, so tests can script responses.
pub trait CloudApi: Send + Sync + 'static {
    fn list_products(&self) -> Result<Vec<CloudVehicle>, CloudError>;
    /// State-only probe; never wakes the vehicle.
    fn get_vehicle(&self, cloud_id: i64) -> Result<CloudVehicle, CloudError>;
    /// Full bundle; may wake the vehicle.
    fn get_vehicle_data(&self, cloud_id: i64) -> Result<VehicleData, CloudError>;
    fn refresh_token(&self) -> Result<(), CloudError>;
    fn access_token(&self) -> Option<String>;
}

#[derive(Deserialize)]
struct Envelope {
    response: serde_json::Value,
}

pub struct HttpCloudClient {
    http: reqwest::blocking::Client,
    api_host: String,
    auth_host: String,
    token: Mutex<Option<Token>>,
    token_file: Option<PathBuf>,
}

impl HttpCloudClient {
    pub fn new(api_host: &str, auth_host: &str) -> Result<Self, CloudError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(CloudError::transport)?;
        Ok(Self {
            http,
            api_host: api_host.trim_end_matches('/').to_string(),
            auth_host: auth_host.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
            token_file: None,
        })
    }

    fn token_guard(&self) -> Result<std::sync::MutexGuard<'_, Option<Token>>, CloudError> {
        self.token
            .lock()
            .map_err(|_| CloudError::TokenStorePoisoned)
    }

    pub fn with_token(self, token: Token) -> Result<Self, CloudError> {
        *self.token_guard()? = Some(token);
        Ok(self)
    }

    pub fn with_token_file(mut self, path: PathBuf) -> Result<Self, CloudError> {
        if path.exists() {
            let raw = fs::read_to_string(&path).map_err(CloudError::transport)?;
            let token: Token =
                serde_json::from_str(&raw).map_err(|err| CloudError::Decode(err.to_string()))?;
            *self.token_guard()? = Some(token);
        }
        self.token_file = Some(path);
        Ok(self)
    }

    fn bearer(&self) -> Result<String, CloudError> {
        {
            let guard = self.token_guard()?;
            let token = guard.as_ref().ok_or(CloudError::NotAuthenticated)?;
            if !token.needs_refresh(Utc::now()) {
                return Ok(token.access_token.clone());
            }
        }
        self.refresh_token()?;
        let guard = self.token_guard()?;
        guard
            .as_ref()
            .map(|token| token.access_token.clone())
            .ok_or(CloudError::NotAuthenticated)
    }

    fn get_envelope(&self, path: &str) -> Result<serde_json::Value, CloudError> {
        let bearer = self.bearer()?;
        let response = self
            .http
            .get(format!("{}{path}", self.api_host))
            .bearer_auth(bearer)
            .header("User-Agent", "fleetgazer/0.1")
            .send()
            .map_err(CloudError::transport)?;

        let status = response.status().as_u16();
        let body = response.text().map_err(CloudError::transport)?;
        if let Some(err) = map_error_status(status, &body) {
            return Err(err);
        }

        let envelope: Envelope =
            serde_json::from_str(&body).map_err(|err| CloudError::Decode(err.to_string()))?;
        Ok(envelope.response)
    }

    fn persist_token(&self, token: &Token) {
        if let Some(path) = &self.token_file
            && let Ok(raw) = serde_json::to_string_pretty(token)
            && let Err(err) = fs::write(path, raw)
        {
            tracing::warn!(error = %err, path = %path.display(), "failed to persist token file");
        }
    }
}

/// Maps the vendor's status codes onto the fixed error kinds.
fn map_error_status(status: u16, body: &str) -> Option<CloudError> {
    match status {
        200 => None,
        408 => Some(CloudError::VehicleUnavailable),
        401 => Some(CloudError::Unauthorized),
        429 => Some(CloudError::RateLimited),
        _ => Some(CloudError::Api {
            status,
            body: body.chars().take(200).collect(),
        }),
    }
}

/// Keeps only listing entries that are vehicles (products with a
/// `vehicle_id`).
fn parse_products(response: serde_json::Value) -> Result<Vec<CloudVehicle>, CloudError> {
    let entries = response
        .as_array()
        .ok_or_else(|| CloudError::Decode("product listing is not an array".to_string()))?;

    let mut vehicles = Vec::new();
    for entry in entries {
        if entry.get("vehicle_id").is_none() {
            continue;
        }
        let vehicle: CloudVehicle = serde_json::from_value(entry.clone())
            .map_err(|err| CloudError::Decode(err.to_string()))?;
        vehicles.push(vehicle);
    }
    Ok(vehicles)
}

impl CloudApi for HttpCloudClient {
    fn list_products(&self) -> Result<Vec<CloudVehicle>, CloudError> {
        let response = self.get_envelope("/api/1/products")?;
        parse_products(response)
    }

    fn get_vehicle(&self, cloud_id: i64) -> Result<CloudVehicle, CloudError> {
        let response = self.get_envelope(&format!("/api/1/vehicles/{cloud_id}"))?;
        serde_json::from_value(response).map_err(|err| CloudError::Decode(err.to_string()))
    }

    fn get_vehicle_data(&self, cloud_id: i64) -> Result<VehicleData, CloudError> {
        let path = format!(
            "/api/1/vehicles/{cloud_id}/vehicle_data?endpoints={}",
            DATA_ENDPOINTS.replace(';', "%3B")
        );
        let response = self.get_envelope(&path)?;
        serde_json::from_value(response).map_err(|err| CloudError::Decode(err.to_string()))
    }

    fn refresh_token(&self) -> Result<(), CloudError> {
        let refresh_token = {
            let guard = self.token_guard()?;
            let token = guard.as_ref().ok_or(CloudError::NotAuthenticated)?;
            if token.refresh_token.is_empty() {
                return Err(CloudError::Unauthorized);
            }
            token.refresh_token.clone()
        };

        let response = self
            .http
            .post(format!("{}/oauth2/v3/token", self.auth_host))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", "ownerapi"),
                ("refresh_token", refresh_token.as_str()),
                ("scope", "openid email offline_access"),
            ])
            .send()
            .map_err(CloudError::transport)?;

        let status = response.status().as_u16();
        if status == 401 {
            return Err(CloudError::Unauthorized);
        }
        if status != 200 {
            let body = response.text().unwrap_or_default();
            return Err(CloudError::Api {
                status,
                body: body.chars().take(200).collect(),
            });
        }

        let mut token: Token = response
            .json()
            .map_err(|err| CloudError::Decode(err.to_string()))?;
        token.created_at = Utc::now();
        if token.refresh_token.is_empty() {
            token.refresh_token = refresh_token;
        }

        self.persist_token(&token);
        *self.token_guard()? = Some(token);
        Ok(())
    }

    /// A poisoned token store reads as "no token"; the stream client then
    /// treats the connect attempt as failed and keeps backing off.
    fn access_token(&self) -> Option<String> {
        self.token
            .lock()
            .ok()?
            .as_ref()
            .map(|token| token.access_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use chrono::{Duration, Utc};

    use super::{
        CloudApi, CloudError, HttpCloudClient, Token, map_error_status, parse_products,
    };

    fn token() -> Token {
        Token {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_in: 3600,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_codes_map_to_fixed_error_kinds() {
        assert!(map_error_status(200, "").is_none());
        assert!(matches!(
            map_error_status(408, ""),
            Some(CloudError::VehicleUnavailable)
        ));
        assert!(matches!(
            map_error_status(401, ""),
            Some(CloudError::Unauthorized)
        ));
        assert!(matches!(
            map_error_status(429, ""),
            Some(CloudError::RateLimited)
        ));
        assert!(matches!(
            map_error_status(503, "busy"),
            Some(CloudError::Api { status: 503, .. })
        ));
    }

    #[test]
    fn product_listing_keeps_only_vehicles() {
        let response = serde_json::json!([
            {"id": 1001, "vehicle_id": 2001, "vin": "5YJ3E1EA", "display_name": "Daily", "state": "online"},
            {"id": 9, "resource_type": "solar", "site_name": "Home"},
            {"id": 1002, "vehicle_id": 2002, "vin": "5YJ3E1EB", "display_name": "Track", "state": "asleep"}
        ]);

        let vehicles = parse_products(response).expect("products should parse");
        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[0].vehicle_id, 2001);
        assert_eq!(vehicles[1].state, "asleep");
    }

    #[test]
    fn token_refresh_margin_is_five_minutes() {
        let mut t = token();
        t.expires_in = 600;
        assert!(!t.needs_refresh(t.created_at + Duration::seconds(299)));
        assert!(t.needs_refresh(t.created_at + Duration::seconds(300)));
    }

    #[test]
    fn vehicle_data_fetch_parses_the_envelope() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("addr should resolve").port();

        let responder = thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("accept should succeed");
            let mut buffer = [0_u8; 2048];
            let _ = socket.read(&mut buffer);

            let body = r#"{"response":{"id":1001,"vehicle_id":2001,"state":"online","charge_state":{"battery_level":80,"est_battery_range":217.5,"charging_state":"Disconnected"},"drive_state":{"latitude":30.25,"longitude":120.17,"power":2,"shift_state":"P"}}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket
                .write_all(response.as_bytes())
                .expect("response write should succeed");
        });

        let client = HttpCloudClient::new(
            &format!("http://127.0.0.1:{port}"),
            "http://127.0.0.1:1",
        )
        .expect("client should build")
        .with_token(token())
        .expect("token install should succeed");

        let data = client
            .get_vehicle_data(1001)
            .expect("vehicle data should fetch");
        assert_eq!(data.state, "online");
        let charge = data.charge_state.expect("charge state should be present");
        assert_eq!(charge.battery_level, 80);
        let drive = data.drive_state.expect("drive state should be present");
        assert_eq!(drive.shift_state.as_deref(), Some("P"));

        responder.join().expect("responder should finish");
    }

    #[test]
    fn unavailable_vehicle_surfaces_the_typed_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("addr should resolve").port();

        let responder = thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("accept should succeed");
            let mut buffer = [0_u8; 2048];
            let _ = socket.read(&mut buffer);
            let response =
                "HTTP/1.1 408 Request Timeout\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            socket
                .write_all(response.as_bytes())
                .expect("response write should succeed");
        });

        let client = HttpCloudClient::new(
            &format!("http://127.0.0.1:{port}"),
            "http://127.0.0.1:1",
        )
        .expect("client should build")
        .with_token(token())
        .expect("token install should succeed");

        let err = client
            .get_vehicle_data(1001)
            .expect_err("408 must map to vehicle unavailable");
        assert!(matches!(err, CloudError::VehicleUnavailable));

        responder.join().expect("responder should finish");
    }

    #[test]
    fn requests_without_a_token_are_rejected_locally() {
        let client = HttpCloudClient::new("http://127.0.0.1:1", "http://127.0.0.1:1")
            .expect("client should build");
        let err = client
            .list_products()
            .expect_err("missing token must be rejected");
        assert!(matches!(err, CloudError::NotAuthenticated));
    }
}
