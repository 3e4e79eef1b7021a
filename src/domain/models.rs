use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Vehicle identity row. Immutable after discovery except for the config
/// fields (model, trim, color, wheels) which follow the upstream feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Car {
    pub id: i64,
    pub cloud_id: i64,
    pub cloud_vehicle_id: i64,
    pub vin: String,
    pub name: String,
    pub model: String,
    pub trim_badging: String,
    pub exterior_color: String,
    pub wheel_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Structured reverse-geocoding result, stored as a JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub formatted: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub province: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub district: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub township: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub street: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub street_number: String,
}

/// A single trajectory sample. `drive_id` is set whenever the sample was
/// recorded while the owning car was driving.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub id: i64,
    pub car_id: i64,
    pub drive_id: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: i64,
    pub speed_kmh: Option<f64>,
    pub power_kw: i64,
    pub odometer_km: f64,
    pub battery_level: i64,
    pub range_km: f64,
    pub inside_temp: Option<f64>,
    pub outside_temp: Option<f64>,
    pub elevation_m: Option<i64>,
    pub tpms_pressure_fl: Option<f64>,
    pub tpms_pressure_fr: Option<f64>,
    pub tpms_pressure_rl: Option<f64>,
    pub tpms_pressure_rr: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// One driving trip, open while `end_time` is null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drive {
    pub id: i64,
    pub car_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub distance_km: f64,
    pub duration_min: f64,
    pub start_battery_level: i64,
    pub end_battery_level: Option<i64>,
    pub start_range_km: f64,
    pub end_range_km: Option<f64>,
    pub start_odometer_km: f64,
    pub end_odometer_km: Option<f64>,
    pub speed_max: Option<f64>,
    pub power_max: Option<i64>,
    pub power_min: Option<i64>,
    pub inside_temp_avg: Option<f64>,
    pub outside_temp_avg: Option<f64>,
    pub energy_used_kwh: Option<f64>,
    pub energy_regen_kwh: Option<f64>,
    pub start_address: Option<Address>,
    pub end_address: Option<Address>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
}

/// Aggregates derived from the persisted trajectory of one drive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriveStats {
    pub speed_max: Option<f64>,
    pub power_max: Option<i64>,
    pub power_min: Option<i64>,
    pub inside_temp_avg: Option<f64>,
    pub outside_temp_avg: Option<f64>,
    pub energy_used_kwh: f64,
    pub energy_regen_kwh: f64,
}

/// Compact drive + polyline used by the map endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DrivePath {
    pub drive_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_min: f64,
    pub distance_km: f64,
    pub path: Vec<(f64, f64)>,
}

/// One charging session, open while `end_time` is null. The end-side fields
/// are refreshed while the process is open so reads see live progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChargingProcess {
    pub id: i64,
    pub car_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_battery_level: i64,
    pub end_battery_level: Option<i64>,
    pub start_range_km: f64,
    pub end_range_km: Option<f64>,
    pub charge_energy_added_kwh: f64,
    pub charger_power_max: Option<i64>,
    pub duration_min: f64,
    pub outside_temp_avg: Option<f64>,
    pub cost: Option<f64>,
    pub address: Option<Address>,
}

/// Per-poll sample taken while a charging process is open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Charge {
    pub id: i64,
    pub charging_process_id: i64,
    pub battery_level: i64,
    pub usable_battery_level: i64,
    pub range_km: f64,
    pub charger_power: i64,
    pub charger_voltage: i64,
    pub charger_current: i64,
    pub charge_energy_added_kwh: f64,
    pub outside_temp: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// The eight boolean flags tracked over a parking session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParkingFlags {
    pub locked: bool,
    pub sentry_mode: bool,
    pub doors_open: bool,
    pub windows_open: bool,
    pub frunk_open: bool,
    pub trunk_open: bool,
    pub climate_on: bool,
    pub user_present: bool,
}

/// One parking interval, opened on every transition out of driving.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parking {
    pub id: i64,
    pub car_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_min: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<Address>,
    pub start_battery_level: i64,
    pub end_battery_level: Option<i64>,
    pub start_range_km: f64,
    pub end_range_km: Option<f64>,
    pub start_odometer_km: f64,
    pub end_odometer_km: Option<f64>,
    pub energy_used_kwh: Option<f64>,
    pub start_inside_temp: Option<f64>,
    pub end_inside_temp: Option<f64>,
    pub start_outside_temp: Option<f64>,
    pub end_outside_temp: Option<f64>,
    pub inside_temp_avg: Option<f64>,
    pub outside_temp_avg: Option<f64>,
    pub climate_used_min: Option<f64>,
    pub sentry_mode_used_min: Option<f64>,
    pub start_flags: ParkingFlags,
    pub end_flags: Option<ParkingFlags>,
    pub start_tpms_pressure_fl: Option<f64>,
    pub start_tpms_pressure_fr: Option<f64>,
    pub start_tpms_pressure_rl: Option<f64>,
    pub start_tpms_pressure_rr: Option<f64>,
    pub end_tpms_pressure_fl: Option<f64>,
    pub end_tpms_pressure_fr: Option<f64>,
    pub end_tpms_pressure_rl: Option<f64>,
    pub end_tpms_pressure_rr: Option<f64>,
    pub car_version: String,
}

/// Edge events recorded while a parking session is open, one per observed
/// flag transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkingEventKind {
    DoorsOpened,
    DoorsClosed,
    WindowsOpened,
    WindowsClosed,
    TrunkOpened,
    TrunkClosed,
    FrunkOpened,
    FrunkClosed,
    Locked,
    Unlocked,
    SentryEnabled,
    SentryDisabled,
    ClimateOn,
    ClimateOff,
    UserPresent,
    UserLeft,
}

impl ParkingEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DoorsOpened => "doors_opened",
            Self::DoorsClosed => "doors_closed",
            Self::WindowsOpened => "windows_opened",
            Self::WindowsClosed => "windows_closed",
            Self::TrunkOpened => "trunk_opened",
            Self::TrunkClosed => "trunk_closed",
            Self::FrunkOpened => "frunk_opened",
            Self::FrunkClosed => "frunk_closed",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::SentryEnabled => "sentry_enabled",
            Self::SentryDisabled => "sentry_disabled",
            Self::ClimateOn => "climate_on",
            Self::ClimateOff => "climate_off",
            Self::UserPresent => "user_present",
            Self::UserLeft => "user_left",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "doors_opened" => Self::DoorsOpened,
            "doors_closed" => Self::DoorsClosed,
            "windows_opened" => Self::WindowsOpened,
            "windows_closed" => Self::WindowsClosed,
            "trunk_opened" => Self::TrunkOpened,
            "trunk_closed" => Self::TrunkClosed,
            "frunk_opened" => Self::FrunkOpened,
            "frunk_closed" => Self::FrunkClosed,
            "locked" => Self::Locked,
            "unlocked" => Self::Unlocked,
            "sentry_enabled" => Self::SentryEnabled,
            "sentry_disabled" => Self::SentryDisabled,
            "climate_on" => Self::ClimateOn,
            "climate_off" => Self::ClimateOff,
            "user_present" => Self::UserPresent,
            "user_left" => Self::UserLeft,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParkingEvent {
    pub id: i64,
    pub parking_id: i64,
    pub kind: ParkingEventKind,
    pub event_time: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::{Address, ParkingEventKind};

    #[test]
    fn parking_event_kind_roundtrips_all_sixteen_tags() {
        let kinds = [
            ParkingEventKind::DoorsOpened,
            ParkingEventKind::DoorsClosed,
            ParkingEventKind::WindowsOpened,
            ParkingEventKind::WindowsClosed,
            ParkingEventKind::TrunkOpened,
            ParkingEventKind::TrunkClosed,
            ParkingEventKind::FrunkOpened,
            ParkingEventKind::FrunkClosed,
            ParkingEventKind::Locked,
            ParkingEventKind::Unlocked,
            ParkingEventKind::SentryEnabled,
            ParkingEventKind::SentryDisabled,
            ParkingEventKind::ClimateOn,
            ParkingEventKind::ClimateOff,
            ParkingEventKind::UserPresent,
            ParkingEventKind::UserLeft,
        ];
        for kind in kinds {
            assert_eq!(ParkingEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ParkingEventKind::parse("hood_popped"), None);
    }

    #[test]
    fn address_json_omits_empty_fields() {
        let address = Address {
            formatted: "1 Example Rd".to_string(),
            city: "Springfield".to_string(),
            ..Address::default()
        };
        let json = serde_json::to_string(&address).expect("address should serialize");
        assert!(json.contains("formatted"));
        assert!(!json.contains("province"));

        let parsed: Address = serde_json::from_str(&json).expect("address should parse");
        assert_eq!(parsed, address);
    }
}
