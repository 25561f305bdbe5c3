use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Canonical 6-digit ISTAT municipality code. It is the join key shared by
/// every source and is kept as a plain zero-padded string.
pub type IstatCode = String;

/// ISTAT's categorical classification of a municipality's terrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AltimetricZone {
    #[serde(rename = "Montagna interna")]
    InlandMountain,
    #[serde(rename = "Montagna litoranea")]
    CoastalMountain,
    #[serde(rename = "Collina interna")]
    InlandHill,
    #[serde(rename = "Collina litoranea")]
    CoastalHill,
    #[serde(rename = "Pianura")]
    Plain,
}

impl AltimetricZone {
    /// Maps the numeric ISTAT code (1-5) onto a zone.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(AltimetricZone::InlandMountain),
            "2" => Some(AltimetricZone::CoastalMountain),
            "3" => Some(AltimetricZone::InlandHill),
            "4" => Some(AltimetricZone::CoastalHill),
            "5" => Some(AltimetricZone::Plain),
            _ => None,
        }
    }

    /// Italian label used in the published classification.
    pub fn label(self) -> &'static str {
        match self {
            AltimetricZone::InlandMountain => "Montagna interna",
            AltimetricZone::CoastalMountain => "Montagna litoranea",
            AltimetricZone::InlandHill => "Collina interna",
            AltimetricZone::CoastalHill => "Collina litoranea",
            AltimetricZone::Plain => "Pianura",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [
            AltimetricZone::InlandMountain,
            AltimetricZone::CoastalMountain,
            AltimetricZone::InlandHill,
            AltimetricZone::CoastalHill,
            AltimetricZone::Plain,
        ]
        .into_iter()
        .find(|zone| zone.label() == label)
    }
}

/// Represents a region as published by the official registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Two-digit region code.
    pub code: String,
    pub name: String,
}

/// Represents a province (supra-municipal territorial unit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Province {
    /// Three-digit province code.
    pub code: String,
    pub name: String,
    /// Vehicle-plate style abbreviation, e.g. `MI`.
    pub abbreviation: String,
    /// Owning region. Every province belongs to exactly one region.
    pub region_code: String,
}

/// Represents one municipality row of the merged dataset.
///
/// Only the identity and hierarchy fields come from the anchor registry; the
/// optional fields are filled by the other sources and stay `None` when their
/// coverage is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Municipality {
    pub istat_code: IstatCode,
    pub name: String,
    pub cadastral_code: Option<String>,
    pub province_code: String,
    pub region_code: String,
    pub population: Option<u64>,
    pub surface_km2: Option<f64>,
    pub altitude_m: Option<i32>,
    pub altimetric_zone: Option<AltimetricZone>,
    pub coastal: Option<bool>,
    pub island: Option<bool>,
    pub urbanization_degree: Option<u8>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Municipality {
    /// Creates a municipality carrying only the registry fields.
    pub fn new(
        istat_code: impl Into<IstatCode>,
        name: impl Into<String>,
        province_code: impl Into<String>,
        region_code: impl Into<String>,
    ) -> Self {
        Self {
            istat_code: istat_code.into(),
            name: name.into(),
            cadastral_code: None,
            province_code: province_code.into(),
            region_code: region_code.into(),
            population: None,
            surface_km2: None,
            altitude_m: None,
            altimetric_zone: None,
            coastal: None,
            island: None,
            urbanization_degree: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn has_geo_stats(&self) -> bool {
        self.surface_km2.is_some()
    }
}

/// One row of the postal-code association table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostalLink {
    pub postal_code: String,
    pub istat_code: IstatCode,
}

/// The merged entity graph produced by one refresh cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub regions: Vec<Region>,
    pub provinces: Vec<Province>,
    pub municipalities: Vec<Municipality>,
    /// Sorted by postal code, then ISTAT code.
    pub postal_links: Vec<PostalLink>,
}

impl Dataset {
    pub fn coverage(&self) -> CoverageStats {
        let with_postal_codes = self
            .postal_links
            .iter()
            .map(|link| link.istat_code.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        CoverageStats {
            regions: self.regions.len(),
            provinces: self.provinces.len(),
            municipalities: self.municipalities.len(),
            with_population: count(&self.municipalities, |m| m.population.is_some()),
            with_coordinates: count(&self.municipalities, |m| m.latitude.is_some()),
            with_postal_codes,
            with_geo_stats: count(&self.municipalities, Municipality::has_geo_stats),
        }
    }
}

fn count(municipalities: &[Municipality], predicate: impl Fn(&Municipality) -> bool) -> usize {
    municipalities.iter().filter(|m| predicate(m)).count()
}

/// Record counts describing how much of the dataset each source filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoverageStats {
    pub regions: usize,
    pub provinces: usize,
    pub municipalities: usize,
    pub with_population: usize,
    pub with_coordinates: usize,
    pub with_postal_codes: usize,
    pub with_geo_stats: usize,
}

/// Region listing entry with aggregates computed from the municipality set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionSummary {
    pub code: String,
    pub name: String,
    pub municipality_count: usize,
    pub total_population: u64,
}

/// Province listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvinceSummary {
    pub code: String,
    pub name: String,
    pub abbreviation: String,
    pub region_code: String,
    pub region: String,
    pub municipality_count: usize,
    pub total_population: u64,
}

/// Compact municipality listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MunicipalitySummary {
    pub istat_code: IstatCode,
    pub name: String,
    pub province_abbreviation: String,
    pub province: String,
    pub region: String,
    pub population: Option<u64>,
}

/// Fully resolved municipality: the stored row, its hierarchy names, and its
/// postal codes in ascending order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MunicipalityRecord {
    #[serde(flatten)]
    pub municipality: Municipality,
    pub province: String,
    pub province_abbreviation: String,
    pub region: String,
    pub postal_codes: Vec<String>,
}
