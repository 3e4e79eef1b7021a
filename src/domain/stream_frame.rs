use thiserror::Error;

/// Field order pushed by the streaming endpoint:
/// `ts,speed,odometer,soc,elevation,est_heading,est_lat,est_lng,power,shift_state,range,est_range,heading`.
/// Distances and speeds arrive imperial; conversion happens in the
/// reconciler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFrame {
    pub timestamp_ms: i64,
    pub speed_mph: Option<i64>,
    pub odometer_miles: f64,
    pub soc: i64,
    pub elevation_m: i64,
    pub est_heading: i64,
    pub est_lat: f64,
    pub est_lng: f64,
    pub power_kw: i64,
    pub shift_state: String,
    pub range_miles: i64,
    pub est_range_miles: i64,
    pub heading: i64,
}

pub const STREAM_FIELD_COUNT: usize = 13;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameParseError {
    #[error("incomplete stream tuple: expected {STREAM_FIELD_COUNT} fields, got {0}")]
    FieldCount(usize),
}

impl StreamFrame {
    /// Parses one comma-delimited `data:update` payload. Individual fields
    /// that fail to parse fall back to zero/empty, matching the vendor's
    /// habit of sending empty strings for absent values.
    pub fn parse(value: &str) -> Result<Self, FrameParseError> {
        let parts: Vec<&str> = value.split(',').collect();
        if parts.len() < STREAM_FIELD_COUNT {
            return Err(FrameParseError::FieldCount(parts.len()));
        }

        Ok(Self {
            timestamp_ms: parts[0].parse().unwrap_or(0),
            speed_mph: parts[1].parse().ok(),
            odometer_miles: parts[2].parse().unwrap_or(0.0),
            soc: parts[3].parse().unwrap_or(0),
            elevation_m: parts[4].parse().unwrap_or(0),
            est_heading: parts[5].parse().unwrap_or(0),
            est_lat: parts[6].parse().unwrap_or(0.0),
            est_lng: parts[7].parse().unwrap_or(0.0),
            power_kw: parts[8].parse().unwrap_or(0),
            shift_state: parts[9].to_string(),
            range_miles: parts[10].parse().unwrap_or(0),
            est_range_miles: parts[11].parse().unwrap_or(0),
            heading: parts[12].parse().unwrap_or(0),
        })
    }

    /// A gear that means the vehicle is being driven.
    pub fn is_driving_shift(&self) -> bool {
        matches!(self.shift_state.as_str(), "D" | "N" | "R")
    }

    /// Whether the tuple carries a usable coordinate pair.
    pub fn has_fix(&self) -> bool {
        self.est_lat != 0.0 && self.est_lng != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameParseError, StreamFrame};

    #[test]
    fn parses_a_full_tuple() {
        let frame = StreamFrame::parse(
            "1708444800000,30,12300.0,80,8,90,30.25,120.17,25,D,350,340,90",
        )
        .expect("tuple should parse");

        assert_eq!(frame.timestamp_ms, 1_708_444_800_000);
        assert_eq!(frame.speed_mph, Some(30));
        assert!((frame.odometer_miles - 12300.0).abs() < 1e-9);
        assert_eq!(frame.soc, 80);
        assert_eq!(frame.elevation_m, 8);
        assert_eq!(frame.est_heading, 90);
        assert!((frame.est_lat - 30.25).abs() < 1e-9);
        assert!((frame.est_lng - 120.17).abs() < 1e-9);
        assert_eq!(frame.power_kw, 25);
        assert_eq!(frame.shift_state, "D");
        assert_eq!(frame.range_miles, 350);
        assert_eq!(frame.est_range_miles, 340);
        assert_eq!(frame.heading, 90);
        assert!(frame.is_driving_shift());
        assert!(frame.has_fix());
    }

    #[test]
    fn parked_tuple_has_empty_speed_and_shift() {
        let frame = StreamFrame::parse("1708444800000,,12300.0,80,8,90,30.25,120.17,0,,350,340,90")
            .expect("tuple should parse");
        assert_eq!(frame.speed_mph, None);
        assert_eq!(frame.shift_state, "");
        assert!(!frame.is_driving_shift());
    }

    #[test]
    fn reverse_and_neutral_count_as_driving() {
        for shift in ["R", "N"] {
            let value = format!("0,5,1.0,50,0,0,1.0,1.0,3,{shift},100,100,0");
            let frame = StreamFrame::parse(&value).expect("tuple should parse");
            assert!(frame.is_driving_shift(), "{shift}");
        }
        let parked = StreamFrame::parse("0,0,1.0,50,0,0,1.0,1.0,0,P,100,100,0").unwrap();
        assert!(!parked.is_driving_shift());
    }

    #[test]
    fn short_tuple_is_rejected() {
        assert_eq!(
            StreamFrame::parse("1,2,3"),
            Err(FrameParseError::FieldCount(3))
        );
    }

    #[test]
    fn zero_coordinates_are_not_a_fix() {
        let frame = StreamFrame::parse("0,,0,0,0,0,0,0,0,,0,0,0").unwrap();
        assert!(!frame.has_fix());
    }
}
