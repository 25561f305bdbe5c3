//! Source adapters: one per provider. Each adapter turns the raw bytes served
//! by its provider into provider-native records keyed by whatever identifier
//! the provider uses. Key normalisation happens later, in the reconciler.

pub mod centroids;
pub mod geo_stats;
pub mod http;
pub mod population;
pub mod postal;
pub mod registry;

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::italia::opendata::config::{Endpoint, SourceEndpoints};
use crate::italia::opendata::error::{FetchError, Result};

pub use centroids::CentroidRecord;
pub use geo_stats::GeoStatsRecord;
pub use http::HttpTransport;
pub use population::PopulationRecord;
pub use postal::PostalRecord;
pub use registry::RegistryRecord;

/// Identifies a data provider. The declaration order is the fixed order in
/// which sources are joined onto the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// ISTAT "Elenco comuni italiani", the anchor source.
    IstatRegistry,
    /// ISTAT statistical classifications (surface, altitude, zones).
    IstatGeo,
    /// ANPR resident population.
    AnprPopulation,
    /// Community centroid coordinates.
    Centroids,
    /// Community postal-code dataset.
    PostalCodes,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::IstatRegistry,
        SourceKind::IstatGeo,
        SourceKind::AnprPopulation,
        SourceKind::Centroids,
        SourceKind::PostalCodes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SourceKind::IstatRegistry => "istat_registry",
            SourceKind::IstatGeo => "istat_geo",
            SourceKind::AnprPopulation => "anpr_population",
            SourceKind::Centroids => "centroids",
            SourceKind::PostalCodes => "postal_codes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        SourceKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Only the official registry defines the entity set.
    pub fn is_anchor(self) -> bool {
        self == SourceKind::IstatRegistry
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Provider-native record, tagged by provider.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Registry(RegistryRecord),
    GeoStats(GeoStatsRecord),
    Population(PopulationRecord),
    Centroid(CentroidRecord),
    Postal(PostalRecord),
}

/// Records parsed out of one payload, plus the number of data rows that
/// could not be parsed and were skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSource {
    pub kind: SourceKind,
    pub records: Vec<SourceRecord>,
    pub skipped: usize,
}

impl ParsedSource {
    fn from_records<T>(kind: SourceKind, (records, skipped): (Vec<T>, usize), wrap: fn(T) -> SourceRecord) -> Self {
        Self {
            kind,
            records: records.into_iter().map(wrap).collect(),
            skipped,
        }
    }
}

/// Outcome of fetching one source during a refresh cycle.
#[derive(Debug, Clone)]
pub struct SourceFetch {
    pub kind: SourceKind,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub result: std::result::Result<ParsedSource, FetchError>,
}

/// Byte transport used by the adapters. The HTTP implementation lives in
/// [`http`]; tests plug in canned payloads.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Downloads `url`, giving up after `timeout`.
    async fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

/// Parses a payload with the adapter matching `kind`.
pub fn parse(kind: SourceKind, bytes: &[u8]) -> Result<ParsedSource> {
    Ok(match kind {
        SourceKind::IstatRegistry => {
            ParsedSource::from_records(kind, registry::parse(bytes)?, SourceRecord::Registry)
        }
        SourceKind::IstatGeo => {
            ParsedSource::from_records(kind, geo_stats::parse(bytes)?, SourceRecord::GeoStats)
        }
        SourceKind::AnprPopulation => {
            ParsedSource::from_records(kind, population::parse(bytes)?, SourceRecord::Population)
        }
        SourceKind::Centroids => {
            ParsedSource::from_records(kind, centroids::parse(bytes)?, SourceRecord::Centroid)
        }
        SourceKind::PostalCodes => {
            ParsedSource::from_records(kind, postal::parse(bytes)?, SourceRecord::Postal)
        }
    })
}

/// Fetches and parses one source. Unreachable remotes, undecodable payloads
/// and payloads without a single usable record all fail with [`FetchError`].
#[instrument(level = "info", skip(transport, endpoint), fields(url = %endpoint.url))]
pub async fn fetch_source(
    transport: &dyn Transport,
    kind: SourceKind,
    endpoint: &Endpoint,
) -> std::result::Result<ParsedSource, FetchError> {
    let bytes = transport
        .get(&endpoint.url, endpoint.timeout)
        .await
        .map_err(|err| FetchError::new(kind, err.to_string()))?;
    let parsed = parse(kind, &bytes).map_err(|err| FetchError::new(kind, err.to_string()))?;
    if parsed.records.is_empty() {
        return Err(FetchError::new(kind, "payload contained no usable records"));
    }
    if parsed.skipped > 0 {
        warn!(skipped = parsed.skipped, "skipped unparseable rows");
    }
    info!(records = parsed.records.len(), bytes = bytes.len(), "source parsed");
    Ok(parsed)
}

/// Fetches every source concurrently. All fetches complete (or fail) before
/// this returns; results come back in [`SourceKind::ALL`] order.
pub async fn fetch_all(transport: &dyn Transport, endpoints: &SourceEndpoints) -> Vec<SourceFetch> {
    let fetches = SourceKind::ALL.into_iter().map(|kind| async move {
        let endpoint = endpoints.get(kind);
        let result = fetch_source(transport, kind, endpoint).await;
        if let Err(err) = &result {
            warn!(source = %kind, cause = %err.cause, "source fetch failed");
        }
        SourceFetch {
            kind,
            url: endpoint.url.clone(),
            fetched_at: Utc::now(),
            result,
        }
    });
    join_all(fetches).await
}

/// Decodes a text payload. Providers have switched between UTF-8 and
/// Windows-1252 without notice, so valid UTF-8 wins and anything else is read
/// as Windows-1252.
pub(crate) fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes).0,
    }
}

/// True when the field holds at least one digit, i.e. it can be a data row
/// key rather than a header label.
pub(crate) fn looks_numeric(field: &str) -> bool {
    field.chars().any(|c| c.is_ascii_digit())
}

/// Parses a decimal that may use a comma as separator.
pub(crate) fn parse_decimal(field: &str) -> Option<f64> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}
