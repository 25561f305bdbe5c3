//! Merge engine: left-joins every non-anchor source onto the registry's
//! municipality set.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::italia::opendata::model::{Dataset, Municipality, PostalLink, Province, Region};
use crate::italia::opendata::reconcile::{KeyReconciler, canonical_code};
use crate::italia::opendata::sources::{
    CentroidRecord, GeoStatsRecord, ParsedSource, PopulationRecord, PostalRecord,
    RegistryRecord, SourceKind, SourceRecord,
};

/// How many rows of one source made it into the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceCoverage {
    pub source: SourceKind,
    /// Records the adapter produced.
    pub parsed: usize,
    /// Rows the adapter could not parse.
    pub skipped: usize,
    /// Records joined onto a registry municipality.
    pub matched: usize,
    /// Records whose key did not resolve, or registry rows rejected for an
    /// inconsistent hierarchy. Reported as coverage loss.
    pub unmatched: usize,
}

impl SourceCoverage {
    fn new(source: &ParsedSource) -> Self {
        Self {
            source: source.kind,
            parsed: source.records.len(),
            skipped: source.skipped,
            matched: 0,
            unmatched: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    /// One entry per merged source, registry first, then in join order.
    pub coverage: Vec<SourceCoverage>,
}

/// Builds the dataset from the registry and whichever other sources were
/// fetched successfully.
///
/// Sources are joined in [`SourceKind`] order regardless of the order they
/// are passed in, and records inside a source are applied in payload order,
/// so identical inputs always produce an identical dataset. When two records
/// of a source resolve to the same municipality the later one wins. The
/// geo-stats population is only a fallback: ANPR joins after it and
/// overrides it where present.
#[instrument(level = "info", skip_all, fields(sources = others.len()))]
pub fn merge(registry: &ParsedSource, others: &[ParsedSource]) -> MergeOutcome {
    let mut builder = DatasetBuilder::default();
    let mut registry_coverage = SourceCoverage::new(registry);
    for record in &registry.records {
        if let SourceRecord::Registry(row) = record {
            if builder.push_registry_row(row) {
                registry_coverage.matched += 1;
            } else {
                registry_coverage.unmatched += 1;
            }
        }
    }

    let reconciler = KeyReconciler::new(
        builder
            .municipalities
            .iter()
            .map(|m| (m.istat_code.as_str(), m.name.as_str())),
    );

    let mut ordered: Vec<&ParsedSource> = others
        .iter()
        .filter(|source| !source.kind.is_anchor())
        .collect();
    ordered.sort_by_key(|source| source.kind);

    let mut coverage = vec![registry_coverage];
    for source in ordered {
        let mut stats = SourceCoverage::new(source);
        for record in &source.records {
            if builder.join(&reconciler, record) {
                stats.matched += 1;
            } else {
                stats.unmatched += 1;
            }
        }
        if stats.unmatched > 0 {
            debug!(source = %stats.source, unmatched = stats.unmatched, "records without a registry match");
        }
        coverage.push(stats);
    }

    let dataset = builder.finish();
    debug!(
        municipalities = dataset.municipalities.len(),
        postal_links = dataset.postal_links.len(),
        "dataset merged"
    );
    MergeOutcome { dataset, coverage }
}

#[derive(Default)]
struct DatasetBuilder {
    regions: Vec<Region>,
    provinces: Vec<Province>,
    municipalities: Vec<Municipality>,
    region_index: HashMap<String, usize>,
    province_index: HashMap<String, usize>,
    municipality_index: HashMap<String, usize>,
    postal_links: BTreeSet<PostalLink>,
}

impl DatasetBuilder {
    /// Adds a registry row. Duplicate codes keep the first row; rows whose
    /// region disagrees with their province's region are rejected.
    fn push_registry_row(&mut self, row: &RegistryRecord) -> bool {
        let Some(code) = canonical_code(&row.istat_code) else {
            return false;
        };
        if self.municipality_index.contains_key(&code) {
            return false;
        }

        match self.province_index.get(&row.province_code) {
            Some(&idx) if self.provinces[idx].region_code != row.region_code => {
                warn!(
                    istat_code = %code,
                    province = %row.province_code,
                    "registry row disagrees with its province's region"
                );
                return false;
            }
            Some(_) => {}
            None => {
                if !self.region_index.contains_key(&row.region_code) {
                    self.region_index
                        .insert(row.region_code.clone(), self.regions.len());
                    self.regions.push(Region {
                        code: row.region_code.clone(),
                        name: row.region_name.clone(),
                    });
                }
                self.province_index
                    .insert(row.province_code.clone(), self.provinces.len());
                self.provinces.push(Province {
                    code: row.province_code.clone(),
                    name: row.province_name.clone(),
                    abbreviation: row.abbreviation.clone(),
                    region_code: row.region_code.clone(),
                });
            }
        }

        let mut municipality = Municipality::new(
            code.clone(),
            row.name.clone(),
            row.province_code.clone(),
            row.region_code.clone(),
        );
        municipality.cadastral_code = row.cadastral_code.clone();
        self.municipality_index
            .insert(code, self.municipalities.len());
        self.municipalities.push(municipality);
        true
    }

    fn join(&mut self, reconciler: &KeyReconciler, record: &SourceRecord) -> bool {
        match record {
            SourceRecord::Registry(_) => false,
            SourceRecord::GeoStats(geo) => {
                self.with_row(reconciler.resolve_code(&geo.raw_code), |m| apply_geo(m, geo))
            }
            SourceRecord::Population(population) => {
                self.with_row(reconciler.resolve_code(&population.raw_code), |m| {
                    apply_population(m, population)
                })
            }
            SourceRecord::Centroid(centroid) => {
                self.with_row(reconciler.resolve_code(&centroid.raw_code), |m| {
                    apply_centroid(m, centroid)
                })
            }
            SourceRecord::Postal(postal) => self.push_postal(reconciler, postal),
        }
    }

    fn with_row(&mut self, code: Option<String>, apply: impl FnOnce(&mut Municipality)) -> bool {
        let Some(&idx) = code.and_then(|code| self.municipality_index.get(&code)) else {
            return false;
        };
        apply(&mut self.municipalities[idx]);
        true
    }

    /// Postal codes go to the association table, never onto the row.
    fn push_postal(&mut self, reconciler: &KeyReconciler, postal: &PostalRecord) -> bool {
        let Some(code) = reconciler.resolve(postal.raw_code.as_deref(), postal.name.as_deref()) else {
            return false;
        };
        for postal_code in &postal.postal_codes {
            self.postal_links.insert(PostalLink {
                postal_code: postal_code.clone(),
                istat_code: code.clone(),
            });
        }
        true
    }

    fn finish(self) -> Dataset {
        Dataset {
            regions: self.regions,
            provinces: self.provinces,
            municipalities: self.municipalities,
            postal_links: self.postal_links.into_iter().collect(),
        }
    }
}

fn apply_geo(municipality: &mut Municipality, geo: &GeoStatsRecord) {
    municipality.surface_km2 = geo.surface_km2.or(municipality.surface_km2);
    municipality.altitude_m = geo.altitude_m.or(municipality.altitude_m);
    municipality.altimetric_zone = geo.altimetric_zone.or(municipality.altimetric_zone);
    municipality.coastal = geo.coastal.or(municipality.coastal);
    municipality.island = geo.island.or(municipality.island);
    municipality.urbanization_degree = geo.urbanization_degree.or(municipality.urbanization_degree);
    municipality.population = geo.population.or(municipality.population);
}

fn apply_population(municipality: &mut Municipality, population: &PopulationRecord) {
    municipality.population = Some(population.residents);
}

fn apply_centroid(municipality: &mut Municipality, centroid: &CentroidRecord) {
    municipality.latitude = Some(centroid.latitude);
    municipality.longitude = Some(centroid.longitude);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_row(code: &str, name: &str, province: &str, region: &str) -> SourceRecord {
        SourceRecord::Registry(RegistryRecord {
            istat_code: code.into(),
            name: name.into(),
            cadastral_code: None,
            province_code: province.into(),
            province_name: format!("Provincia {province}"),
            abbreviation: "XX".into(),
            region_code: region.into(),
            region_name: format!("Regione {region}"),
        })
    }

    fn registry() -> ParsedSource {
        ParsedSource {
            kind: SourceKind::IstatRegistry,
            records: vec![
                registry_row("058091", "Roma", "058", "12"),
                registry_row("058047", "Fiumicino", "058", "12"),
                registry_row("058091", "Roma duplicate", "058", "12"),
                registry_row("058999", "Misplaced", "058", "03"),
            ],
            skipped: 0,
        }
    }

    fn population(records: &[(&str, u64)]) -> ParsedSource {
        ParsedSource {
            kind: SourceKind::AnprPopulation,
            records: records
                .iter()
                .map(|(code, residents)| {
                    SourceRecord::Population(PopulationRecord {
                        raw_code: code.to_string(),
                        residents: *residents,
                    })
                })
                .collect(),
            skipped: 0,
        }
    }

    fn geo(code: &str, population: Option<u64>) -> ParsedSource {
        ParsedSource {
            kind: SourceKind::IstatGeo,
            records: vec![SourceRecord::GeoStats(GeoStatsRecord {
                raw_code: code.into(),
                surface_km2: Some(1287.36),
                population,
                altimetric_zone: None,
                altitude_m: Some(20),
                coastal: Some(true),
                island: Some(false),
                urbanization_degree: Some(1),
            })],
            skipped: 0,
        }
    }

    #[test]
    fn registry_defines_the_entity_set() {
        let outcome = merge(&registry(), &[]);

        let codes: Vec<_> = outcome
            .dataset
            .municipalities
            .iter()
            .map(|m| m.istat_code.as_str())
            .collect();
        assert_eq!(codes, vec!["058091", "058047"]);
        assert_eq!(outcome.dataset.municipalities[0].name, "Roma");
        assert_eq!(outcome.dataset.regions.len(), 1);
        assert_eq!(outcome.coverage[0].unmatched, 2);
    }

    #[test]
    fn unmatched_source_rows_are_counted_not_joined() {
        let outcome = merge(&registry(), &[population(&[("58091", 10), ("999999", 5)])]);

        assert_eq!(outcome.dataset.municipalities[0].population, Some(10));
        assert_eq!(outcome.dataset.municipalities[1].population, None);
        let anpr = outcome.coverage[1];
        assert_eq!((anpr.matched, anpr.unmatched), (1, 1));
    }

    #[test]
    fn anpr_population_wins_over_geo_fallback_regardless_of_input_order() {
        let sources = [population(&[("058091", 2_754_719)]), geo("058091", Some(2_700_000))];
        let outcome = merge(&registry(), &sources);
        let roma = &outcome.dataset.municipalities[0];
        assert_eq!(roma.population, Some(2_754_719));
        assert_eq!(roma.surface_km2, Some(1287.36));

        let fallback = merge(&registry(), &[geo("058047", Some(80_000))]);
        assert_eq!(fallback.dataset.municipalities[1].population, Some(80_000));
    }

    #[test]
    fn postal_codes_form_a_sorted_association_table() {
        let postal = ParsedSource {
            kind: SourceKind::PostalCodes,
            records: vec![
                SourceRecord::Postal(PostalRecord {
                    raw_code: Some("058091".into()),
                    name: Some("Roma".into()),
                    postal_codes: vec!["00119".into(), "00054".into()],
                }),
                SourceRecord::Postal(PostalRecord {
                    raw_code: None,
                    name: Some("FIUMICINO".into()),
                    postal_codes: vec!["00054".into()],
                }),
            ],
            skipped: 0,
        };

        let outcome = merge(&registry(), &[postal]);
        let links: Vec<_> = outcome
            .dataset
            .postal_links
            .iter()
            .map(|link| (link.postal_code.as_str(), link.istat_code.as_str()))
            .collect();
        assert_eq!(
            links,
            vec![("00054", "058047"), ("00054", "058091"), ("00119", "058091")]
        );
    }

    #[test]
    fn identical_inputs_merge_identically() {
        let sources = [geo("058091", None), population(&[("058091", 1)])];
        let first = merge(&registry(), &sources);
        let second = merge(&registry(), &sources);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first.dataset).unwrap(),
            serde_json::to_vec(&second.dataset).unwrap()
        );
    }
}
