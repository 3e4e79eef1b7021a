use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::domain::models::Address;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_CAPACITY: usize = 10_000;
/// ~11 m at the equator; good enough to dedupe parking spots.
const CACHE_PRECISION: f64 = 1e4;
/// The open provider's usage policy allows one request per second.
const OPEN_PROVIDER_MIN_GAP: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("provider rejected the request: {0}")]
    Api(String),
    #[error("geocoder lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Provider {
    /// Keyed commercial service.
    Amap { api_key: String },
    /// Free open service, rate-limited to 1 req/s.
    Nominatim,
}

type CacheKey = (i64, i64);

/// Bounded coordinate->address cache with insertion-order eviction.
struct Cache {
    capacity: usize,
    entries: HashMap<CacheKey, Address>,
    order: VecDeque<CacheKey>,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Address> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, address: Address) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, address);
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&evicted);
        }
        self.order.push_back(key);
        self.entries.insert(key, address);
    }
}

/// Best-effort reverse geocoder shared by the session segmenter. Failures
/// are reported, never fatal; sessions persist without an address.
pub struct Geocoder {
    provider: Provider,
    http: reqwest::blocking::Client,
    cache: Mutex<Cache>,
    open_last_request: Mutex<Option<Instant>>,
}

impl Geocoder {
    pub fn new(provider_name: &str, api_key: &str) -> Result<Self, GeocodeError> {
        let provider = match provider_name {
            "amap" if !api_key.is_empty() => Provider::Amap {
                api_key: api_key.to_string(),
            },
            "amap" => {
                tracing::warn!("amap selected without an api key, falling back to nominatim");
                Provider::Nominatim
            }
            _ => Provider::Nominatim,
        };

        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent("fleetgazer/0.1")
            .build()
            .map_err(|err| GeocodeError::Transport(err.to_string()))?;

        Ok(Self {
            provider,
            http,
            cache: Mutex::new(Cache::new(CACHE_CAPACITY)),
            open_last_request: Mutex::new(None),
        })
    }

    fn cache_guard(&self) -> Result<std::sync::MutexGuard<'_, Cache>, GeocodeError> {
        self.cache.lock().map_err(|_| GeocodeError::LockPoisoned)
    }

    pub fn reverse_geocode(&self, lat: f64, lng: f64) -> Result<Address, GeocodeError> {
        let key = cache_key(lat, lng);
        if let Some(address) = self.cache_guard()?.get(&key) {
            return Ok(address);
        }

        let address = match &self.provider {
            Provider::Amap { api_key } => self.fetch_amap(api_key, lat, lng)?,
            Provider::Nominatim => self.fetch_nominatim(lat, lng)?,
        };

        self.cache_guard()?.insert(key, address.clone());
        Ok(address)
    }

    fn fetch_amap(&self, api_key: &str, lat: f64, lng: f64) -> Result<Address, GeocodeError> {
        let url = format!(
            "https://restapi.amap.com/v3/geocode/regeo?location={lng:.6},{lat:.6}&key={api_key}"
        );
        let response: serde_json::Value = self
            .http
            .get(url)
            .send()
            .map_err(|err| GeocodeError::Transport(err.to_string()))?
            .json()
            .map_err(|err| GeocodeError::Decode(err.to_string()))?;
        parse_amap(&response)
    }

    fn fetch_nominatim(&self, lat: f64, lng: f64) -> Result<Address, GeocodeError> {
        self.respect_open_rate_limit()?;

        let url = format!(
            "https://nominatim.openstreetmap.org/reverse?format=jsonv2&lat={lat:.6}&lon={lng:.6}"
        );
        let response: serde_json::Value = self
            .http
            .get(url)
            .send()
            .map_err(|err| GeocodeError::Transport(err.to_string()))?
            .json()
            .map_err(|err| GeocodeError::Decode(err.to_string()))?;
        parse_nominatim(&response)
    }

    fn respect_open_rate_limit(&self) -> Result<(), GeocodeError> {
        let mut last = self
            .open_last_request
            .lock()
            .map_err(|_| GeocodeError::LockPoisoned)?;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < OPEN_PROVIDER_MIN_GAP {
                std::thread::sleep(OPEN_PROVIDER_MIN_GAP - elapsed);
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

fn cache_key(lat: f64, lng: f64) -> CacheKey {
    (
        (lat * CACHE_PRECISION).round() as i64,
        (lng * CACHE_PRECISION).round() as i64,
    )
}

fn text(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|field| field.as_str())
        .unwrap_or_default()
        .to_string()
}

fn parse_amap(response: &serde_json::Value) -> Result<Address, GeocodeError> {
    if response.get("status").and_then(|status| status.as_str()) != Some("1") {
        return Err(GeocodeError::Api(text(response, "info")));
    }
    let regeocode = response
        .get("regeocode")
        .ok_or_else(|| GeocodeError::Decode("missing regeocode".to_string()))?;
    let component = regeocode
        .get("addressComponent")
        .cloned()
        .unwrap_or_default();
    let street_number = component.get("streetNumber").cloned().unwrap_or_default();

    Ok(Address {
        formatted: text(regeocode, "formatted_address"),
        country: text(&component, "country"),
        province: text(&component, "province"),
        // The provider sends an empty array instead of a string for
        // municipality-level cities.
        city: text(&component, "city"),
        district: text(&component, "district"),
        township: text(&component, "township"),
        street: text(&street_number, "street"),
        street_number: text(&street_number, "number"),
    })
}

fn parse_nominatim(response: &serde_json::Value) -> Result<Address, GeocodeError> {
    if let Some(error) = response.get("error").and_then(|error| error.as_str()) {
        return Err(GeocodeError::Api(error.to_string()));
    }
    let address = response.get("address").cloned().unwrap_or_default();

    let city = [text(&address, "city"), text(&address, "town"), text(&address, "village")]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or_default();

    Ok(Address {
        formatted: text(response, "display_name"),
        country: text(&address, "country"),
        province: text(&address, "state"),
        city,
        district: text(&address, "county"),
        township: text(&address, "suburb"),
        street: text(&address, "road"),
        street_number: text(&address, "house_number"),
    })
}

#[cfg(test)]
mod tests {
    use crate::domain::models::Address;

    use super::{Cache, cache_key, parse_amap, parse_nominatim};

    #[test]
    fn cache_key_rounds_to_four_decimals() {
        assert_eq!(cache_key(30.25001, 120.17004), cache_key(30.25, 120.1700));
        assert_ne!(cache_key(30.2501, 120.17), cache_key(30.25, 120.17));
    }

    #[test]
    fn cache_evicts_oldest_insertion_at_capacity() {
        let mut cache = Cache::new(2);
        let first = cache_key(1.0, 1.0);
        let second = cache_key(2.0, 2.0);
        let third = cache_key(3.0, 3.0);

        cache.insert(first, Address::default());
        cache.insert(second, Address::default());
        cache.insert(third, Address::default());

        assert!(cache.get(&first).is_none());
        assert!(cache.get(&second).is_some());
        assert!(cache.get(&third).is_some());
    }

    #[test]
    fn amap_payload_maps_to_structured_address() {
        let response = serde_json::json!({
            "status": "1",
            "regeocode": {
                "formatted_address": "Zhejiang Hangzhou Xihu District Longjing Rd",
                "addressComponent": {
                    "country": "China",
                    "province": "Zhejiang",
                    "city": "Hangzhou",
                    "district": "Xihu District",
                    "township": "Lingyin Street",
                    "streetNumber": {"street": "Longjing Rd", "number": "12"}
                }
            }
        });

        let address = parse_amap(&response).expect("payload should parse");
        assert_eq!(address.city, "Hangzhou");
        assert_eq!(address.street, "Longjing Rd");
        assert_eq!(address.street_number, "12");
    }

    #[test]
    fn amap_error_status_is_an_api_error() {
        let response = serde_json::json!({"status": "0", "info": "INVALID_USER_KEY"});
        let err = parse_amap(&response).expect_err("error status must be surfaced");
        assert!(err.to_string().contains("INVALID_USER_KEY"));
    }

    #[test]
    fn nominatim_payload_maps_to_structured_address() {
        let response = serde_json::json!({
            "display_name": "12, Long Road, Springfield, Example County, 12345, Country",
            "address": {
                "country": "Country",
                "state": "Example State",
                "town": "Springfield",
                "county": "Example County",
                "suburb": "Old Town",
                "road": "Long Road",
                "house_number": "12"
            }
        });

        let address = parse_nominatim(&response).expect("payload should parse");
        assert_eq!(address.city, "Springfield");
        assert_eq!(address.province, "Example State");
        assert_eq!(address.street, "Long Road");
    }

    #[test]
    fn nominatim_unable_to_geocode_is_an_api_error() {
        let response = serde_json::json!({"error": "Unable to geocode"});
        assert!(parse_nominatim(&response).is_err());
    }
}
