use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const TYPE_ENERGY: &str = "energy";
pub const TYPE_AIR_QUALITY: &str = "air_quality";
pub const TYPE_MOTION: &str = "motion";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed reading payload: {0}")]
    Malformed(#[from] simd_json::Error),
    #[error("reading is missing an id")]
    MissingId,
    #[error("invalid reading timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Type-specific part of a reading. Only the fields of the reading's own
/// type exist; unknown types keep their tag and carry nothing else.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Energy {
        consumption: Option<Decimal>,
    },
    AirQuality {
        co2: Option<i32>,
        pm25: Option<i32>,
        humidity: Option<i32>,
    },
    Motion {
        detected: Option<bool>,
    },
    Other {
        kind: String,
    },
}

/// Nullable per-type columns as they appear on the wire and in `sensor_readings`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasurementColumns {
    pub energy_consumption: Option<Decimal>,
    pub co2: Option<i32>,
    pub pm25: Option<i32>,
    pub humidity: Option<i32>,
    pub motion_detected: Option<bool>,
}

impl Measurement {
    /// Builds the variant for `kind`, keeping only the columns that belong to it.
    pub fn from_parts(kind: &str, columns: MeasurementColumns) -> Self {
        match kind {
            TYPE_ENERGY => Measurement::Energy {
                consumption: columns.energy_consumption,
            },
            TYPE_AIR_QUALITY => Measurement::AirQuality {
                co2: columns.co2,
                pm25: columns.pm25,
                humidity: columns.humidity,
            },
            TYPE_MOTION => Measurement::Motion {
                detected: columns.motion_detected,
            },
            other => Measurement::Other {
                kind: other.to_string(),
            },
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Measurement::Energy { .. } => TYPE_ENERGY,
            Measurement::AirQuality { .. } => TYPE_AIR_QUALITY,
            Measurement::Motion { .. } => TYPE_MOTION,
            Measurement::Other { kind } => kind,
        }
    }

    pub fn columns(&self) -> MeasurementColumns {
        match self {
            Measurement::Energy { consumption } => MeasurementColumns {
                energy_consumption: *consumption,
                ..Default::default()
            },
            Measurement::AirQuality { co2, pm25, humidity } => MeasurementColumns {
                co2: *co2,
                pm25: *pm25,
                humidity: *humidity,
                ..Default::default()
            },
            Measurement::Motion { detected } => MeasurementColumns {
                motion_detected: *detected,
                ..Default::default()
            },
            Measurement::Other { .. } => MeasurementColumns::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireReading", into = "WireReading")]
pub struct Reading {
    pub id: String,
    pub sensor_id: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub measurement: Measurement,
}

impl Reading {
    pub fn kind(&self) -> &str {
        self.measurement.kind()
    }

    /// Headline value of the reading: energy consumption for energy sensors,
    /// co2, then pm25, then humidity for air quality sensors, nothing otherwise.
    pub fn numeric_value(&self) -> Option<Decimal> {
        match &self.measurement {
            Measurement::Energy { consumption } => *consumption,
            Measurement::AirQuality { co2, pm25, humidity } => {
                co2.or(*pm25).or(*humidity).map(Decimal::from)
            }
            Measurement::Motion { .. } | Measurement::Other { .. } => None,
        }
    }
}

/// Decodes one broker message body (UTF-8 JSON) into a reading.
pub fn decode_reading(body: &mut [u8]) -> Result<Reading, DecodeError> {
    let wire: WireReading = simd_json::serde::from_slice(body)?;
    Reading::try_from(wire)
}

pub fn encode_reading(reading: &Reading) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(reading)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReading {
    #[serde(default, alias = "Id")]
    id: Option<String>,
    #[serde(default, alias = "SensorId")]
    sensor_id: Option<String>,
    #[serde(rename = "type", default, alias = "Type")]
    kind: Option<String>,
    #[serde(default, alias = "Location")]
    location: Option<String>,
    #[serde(default, alias = "Timestamp")]
    timestamp: Option<WireTimestamp>,
    #[serde(
        default,
        alias = "EnergyConsumption",
        with = "rust_decimal::serde::float_option"
    )]
    energy_consumption: Option<Decimal>,
    #[serde(default, alias = "Co2")]
    co2: Option<i32>,
    #[serde(default, alias = "Pm25")]
    pm25: Option<i32>,
    #[serde(default, alias = "Humidity")]
    humidity: Option<i32>,
    #[serde(default, alias = "MotionDetected")]
    motion_detected: Option<bool>,
    #[serde(
        default,
        skip_deserializing,
        serialize_with = "rust_decimal::serde::float_option::serialize"
    )]
    numeric_value: Option<Decimal>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Str(String),
    Int(i64),
    Float(f64),
}

impl WireTimestamp {
    fn to_datetime(&self) -> Result<DateTime<Utc>, DecodeError> {
        match self {
            WireTimestamp::Str(raw) => parse_timestamp(raw),
            WireTimestamp::Int(ms) => millis_to_dt(*ms),
            WireTimestamp::Float(ts) => millis_to_dt((*ts * 1000.0) as i64),
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Offset-less timestamps are taken as UTC.
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::InvalidTimestamp(raw.to_string()))
}

fn millis_to_dt(ms: i64) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DecodeError::InvalidTimestamp(ms.to_string()))
}

impl TryFrom<WireReading> for Reading {
    type Error = DecodeError;

    fn try_from(wire: WireReading) -> Result<Self, Self::Error> {
        let id = wire
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(DecodeError::MissingId)?;
        let timestamp = match wire.timestamp.as_ref() {
            Some(ts) => ts.to_datetime()?,
            None => Utc::now(),
        };
        let columns = MeasurementColumns {
            energy_consumption: wire.energy_consumption,
            co2: wire.co2,
            pm25: wire.pm25,
            humidity: wire.humidity,
            motion_detected: wire.motion_detected,
        };
        let kind = wire.kind.unwrap_or_default();

        Ok(Reading {
            id,
            sensor_id: wire.sensor_id.unwrap_or_default(),
            location: wire.location.unwrap_or_default(),
            timestamp,
            measurement: Measurement::from_parts(&kind, columns),
        })
    }
}

impl From<Reading> for WireReading {
    fn from(reading: Reading) -> Self {
        let numeric_value = reading.numeric_value();
        let columns = reading.measurement.columns();
        WireReading {
            timestamp: Some(WireTimestamp::Str(
                reading.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            kind: Some(reading.measurement.kind().to_string()),
            id: Some(reading.id),
            sensor_id: Some(reading.sensor_id),
            location: Some(reading.location),
            energy_consumption: columns.energy_consumption,
            co2: columns.co2,
            pm25: columns.pm25,
            humidity: columns.humidity,
            motion_detected: columns.motion_detected,
            numeric_value,
        }
    }
}
