//! Request events and persisted log entries

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::{Map, Value};

use crate::geo::GeoInfo;

/// Timestamp layout: ISO-8601 with microseconds and no offset.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Description of a single HTTP(S) request handed to the tracker. Any field may be missing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Address of the client that made the request
    #[serde(default)]
    pub client_ip: Option<String>,
    /// HTTP method, e.g. `GET`
    #[serde(default)]
    pub method: Option<String>,
    /// Requested host
    #[serde(default)]
    pub host: Option<String>,
    /// Requested path
    #[serde(default)]
    pub url: Option<String>,
    /// `User-Agent` header of the request
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Event {
    /// Parse an event from a JSON object. Any other JSON value is rejected.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        from_object(json)
    }
}

/// One line of the request log.
///
/// Missing request fields are written as `null`. Reading is lenient: keys may be absent, `geo`
/// may be `null` or missing, which reads back as an unknown location, and a timestamp that is
/// missing or not a date reads back as `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// UTC time the entry was recorded
    #[serde(
        default,
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: Option<NaiveDateTime>,
    /// [`Event::client_ip`]
    #[serde(default)]
    pub client_ip: Option<String>,
    /// [`Event::method`]
    #[serde(default)]
    pub method: Option<String>,
    /// [`Event::host`]
    #[serde(default)]
    pub host: Option<String>,
    /// [`Event::url`]
    #[serde(default)]
    pub url: Option<String>,
    /// [`Event::user_agent`]
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Location of `client_ip`, empty if unknown
    #[serde(default, deserialize_with = "deserialize_geo")]
    pub geo: GeoInfo,
}

impl LogEntry {
    /// Combine `event` with its geolocation, stamped with the current time.
    pub fn new(event: Event, geo: GeoInfo) -> Self {
        // Truncated to the precision that gets written out
        Self::at(Utc::now().naive_utc().trunc_subsecs(6), event, geo)
    }

    /// Combine `event` with its geolocation at a given time.
    ///
    /// Split apart to allow injecting the current time for testing purposes.
    pub fn at(timestamp: NaiveDateTime, event: Event, geo: GeoInfo) -> Self {
        let Event {
            client_ip,
            method,
            host,
            url,
            user_agent,
        } = event;
        LogEntry {
            timestamp: Some(timestamp),
            client_ip,
            method,
            host,
            url,
            user_agent,
            geo,
        }
    }

    /// Render as a single JSON line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one line of the request log. The line must hold a JSON object.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        from_object(line)
    }
}

/// Deserialize `T` from JSON text, accepting only an object.
///
/// Derived struct impls would also accept an array as positional fields.
fn from_object<T: de::DeserializeOwned>(json: &str) -> serde_json::Result<T> {
    let object: Map<String, Value> = serde_json::from_str(json)?;
    serde_json::from_value(Value::Object(object))
}

/// Write `timestamp` in [`TIMESTAMP_FORMAT`], or `null` if unknown.
fn serialize_timestamp<S>(timestamp: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match timestamp {
        Some(timestamp) => serializer.collect_str(&timestamp.format(TIMESTAMP_FORMAT)),
        None => serializer.serialize_none(),
    }
}

/// Read a timestamp written by this or another tool. Offsets are converted to UTC and anything
/// unreadable becomes `None` instead of failing the line.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::String(s) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };
    Ok(s.parse::<NaiveDateTime>()
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.naive_utc())))
}

/// Read a geo block, where `null` means an unknown location.
fn deserialize_geo<'de, D>(deserializer: D) -> Result<GeoInfo, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Map<String, Value>>::deserialize(deserializer)? {
        Some(object) => serde_json::from_value(Value::Object(object)).map_err(de::Error::custom),
        None => Ok(GeoInfo::default()),
    }
}
