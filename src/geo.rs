//! IP geolocation lookups
//!
//! Uses the [ip-api.com JSON endpoint][ip-api-ref]. A lookup either yields a populated
//! [`GeoInfo`] or a [`GeoError`]; callers that only want best-effort enrichment use
//! [`GeoLocator::geolocate`], which downgrades every failure to an empty record.
//!
//! [ip-api-ref]: https://ip-api.com/docs/api:json

use reqwest::{Client, Url, header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Fields requested from the lookup service.
const FIELDS: &str = "status,country,regionName,city,org,as,query,zip,timezone";

/// A user agent representing our program.
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Geolocation metadata for an IP address. Every field is optional and a failed lookup is
/// represented by the empty record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    /// Country name, in English
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Region or state name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Postal code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    /// IANA time zone, e.g. `Europe/Rome`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Organization owning the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    /// Autonomous system, e.g. `AS36459 GitHub, Inc.`
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<String>,
    /// The address the service resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl GeoInfo {
    /// Whether this record carries no information at all.
    pub fn is_empty(&self) -> bool {
        *self == GeoInfo::default()
    }
}

/// Body returned by the lookup service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    status: Option<String>,
    /// Reason for a failed lookup, e.g. `private range` or `invalid query`
    message: Option<String>,
    country: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
    zip: Option<String>,
    timezone: Option<String>,
    org: Option<String>,
    #[serde(rename = "as")]
    asn: Option<String>,
    query: Option<String>,
}

impl From<LookupResponse> for GeoInfo {
    fn from(res: LookupResponse) -> Self {
        GeoInfo {
            country: res.country,
            region: res.region_name,
            city: res.city,
            zip: res.zip,
            timezone: res.timezone,
            org: res.org,
            asn: res.asn,
            ip: res.query,
        }
    }
}

/// Reasons a lookup produced no location.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("no client address to look up")]
    MissingAddress,
    #[error("lookup request failed")]
    Request(#[source] reqwest::Error),
    #[error("lookup response is not valid JSON")]
    InvalidBody(#[source] reqwest::Error),
    #[error("lookup rejected with status {status:?}: {}", .message.as_deref().unwrap_or("no reason given"))]
    Rejected {
        status: Option<String>,
        message: Option<String>,
    },
}

/// Client for the geolocation service.
#[derive(Clone, Debug)]
pub struct GeoLocator {
    /// Base URL; the address is appended as the final path segment.
    endpoint: Url,
    /// HTTP client used to send requests.
    client: Client,
}

impl GeoLocator {
    /// Create a locator that queries the service at `endpoint`.
    pub fn new(endpoint: &Url) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            client: Client::new(),
        }
    }

    /// Look up `ip`, treating any failure as an unknown location.
    pub async fn geolocate(&self, ip: Option<&str>) -> GeoInfo {
        match self.lookup(ip).await {
            Ok(geo) => geo,
            Err(err) => {
                debug!("Geolocation unavailable, recording as unknown: {err}");
                GeoInfo::default()
            }
        }
    }

    /// Look up `ip` with the service.
    ///
    /// The address is forwarded without validation. One request is sent per call.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if there is no address, the request fails, the body is not JSON, or the
    /// service reports anything other than `success`.
    #[instrument(name = "geo.lookup", skip(self))]
    pub async fn lookup(&self, ip: Option<&str>) -> Result<GeoInfo, GeoError> {
        let ip = ip.ok_or(GeoError::MissingAddress)?;
        let url = format!(
            "{}/{ip}?fields={FIELDS}",
            self.endpoint.as_str().trim_end_matches('/')
        );

        let body: LookupResponse = self
            .client
            .get(url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(GeoError::Request)?
            .json()
            .await
            .map_err(GeoError::InvalidBody)?;

        if body.status.as_deref() == Some("success") {
            Ok(body.into())
        } else {
            Err(GeoError::Rejected {
                status: body.status,
                message: body.message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::{Method::GET, MockServer};
    use pretty_assertions::assert_eq;
    use reqwest::Url;
    use serde_json::json;

    use super::{FIELDS, GeoError, GeoInfo, GeoLocator};

    fn locator(server: &MockServer) -> GeoLocator {
        GeoLocator::new(&Url::parse(&server.url("/json")).unwrap())
    }

    #[tokio::test]
    async fn maps_successful_lookup() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/json/185.199.111.153")
                    .query_param("fields", FIELDS);
                then.status(200).json_body(json!({
                    "status": "success",
                    "country": "United States",
                    "regionName": "California",
                    "city": "San Francisco",
                    "zip": "94107",
                    "timezone": "America/Los_Angeles",
                    "org": "GitHub, Inc.",
                    "as": "AS36459 GitHub, Inc.",
                    "query": "185.199.111.153"
                }));
            })
            .await;

        let geo = locator(&server)
            .lookup(Some("185.199.111.153"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            geo,
            GeoInfo {
                country: Some("United States".to_owned()),
                region: Some("California".to_owned()),
                city: Some("San Francisco".to_owned()),
                zip: Some("94107".to_owned()),
                timezone: Some("America/Los_Angeles".to_owned()),
                org: Some("GitHub, Inc.".to_owned()),
                asn: Some("AS36459 GitHub, Inc.".to_owned()),
                ip: Some("185.199.111.153".to_owned()),
            }
        );
    }

    #[tokio::test]
    async fn fail_status_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/json/10.0.0.1");
                then.status(200).json_body(json!({
                    "status": "fail",
                    "message": "private range",
                    "query": "10.0.0.1"
                }));
            })
            .await;

        let err = locator(&server).lookup(Some("10.0.0.1")).await.unwrap_err();
        assert!(
            matches!(&err, GeoError::Rejected { status: Some(s), message: Some(m) } if s == "fail" && m == "private range"),
            "{err:?}"
        );
        assert!(locator(&server).geolocate(Some("10.0.0.1")).await.is_empty());
    }

    #[tokio::test]
    async fn non_json_body_is_invalid() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/json/1.1.1.1");
                then.status(502).body("<html>Bad Gateway</html>");
            })
            .await;

        let err = locator(&server).lookup(Some("1.1.1.1")).await.unwrap_err();
        assert!(matches!(err, GeoError::InvalidBody(_)), "{err:?}");
        // The cause is reachable through `source`, not repeated in the message
        assert_eq!(err.to_string(), "lookup response is not valid JSON");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn unreachable_service_yields_empty_record() {
        // Nothing listens on the discard port
        let locator = GeoLocator::new(&Url::parse("http://127.0.0.1:9/json").unwrap());

        let err = locator.lookup(Some("8.8.8.8")).await.unwrap_err();
        assert!(matches!(err, GeoError::Request(_)), "{err:?}");
        assert_eq!(err.to_string(), "lookup request failed");
        assert_eq!(locator.geolocate(Some("8.8.8.8")).await, GeoInfo::default());
    }

    #[tokio::test]
    async fn missing_address_sends_no_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).json_body(json!({ "status": "success" }));
            })
            .await;

        let err = locator(&server).lookup(None).await.unwrap_err();
        assert!(matches!(err, GeoError::MissingAddress));
        assert_eq!(mock.hits_async().await, 0);
    }

    #[tokio::test]
    async fn repeated_lookups_are_not_cached() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/json/2.196.16.26");
                then.status(200)
                    .json_body(json!({ "status": "success", "country": "Italy", "query": "2.196.16.26" }));
            })
            .await;

        let locator = locator(&server);
        for _ in 0..2 {
            let geo = locator.geolocate(Some("2.196.16.26")).await;
            assert_eq!(geo.country.as_deref(), Some("Italy"));
        }
        mock.assert_hits_async(2).await;
    }

    #[test]
    fn empty_record_serializes_to_empty_object() {
        assert_eq!(serde_json::to_string(&GeoInfo::default()).unwrap(), "{}");

        let geo = GeoInfo {
            country: Some("Italy".to_owned()),
            asn: Some("AS1267 WIND TRE S.P.A.".to_owned()),
            ..GeoInfo::default()
        };
        assert_eq!(
            serde_json::to_string(&geo).unwrap(),
            r#"{"country":"Italy","as":"AS1267 WIND TRE S.P.A."}"#
        );
    }
}
