//! Query engine: read-only lookups over one loaded snapshot.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::italia::opendata::error::{DatasetError, Result};
use crate::italia::opendata::model::{
    Municipality, MunicipalityRecord, MunicipalitySummary, Province, ProvinceSummary, Region,
    RegionSummary,
};
use crate::italia::opendata::normalise::{normalise, tokens};
use crate::italia::opendata::reconcile::{KeyReconciler, pad_code};
use crate::italia::opendata::sources::postal::is_postal_code;
use crate::italia::opendata::store::Snapshot;

/// Lowest score a fuzzy name match must reach to be returned.
pub const MIN_SIMILARITY: f64 = 0.75;

/// Score granted when every query word appears in the candidate name, before
/// the bonus for covering more of the candidate.
const TOKEN_MATCH_BASE: f64 = 0.75;

/// Similarity in `[0, 1]` between two normalised names.
///
/// The score is the larger of the normalised Levenshtein similarity and a
/// token rule: when every query word of two or more letters is one of the
/// candidate's words, the score is `0.75 + 0.25 * query_words / candidate_words`.
/// The token rule lets `"reggio emilia"` find `"reggio nell'emilia"`. A lone
/// query word only counts when it covers at least half of the candidate, so
/// filler such as `"di"` or `"san"` never matches on its own.
pub fn similarity(query: &str, candidate: &str) -> f64 {
    strsim::normalized_levenshtein(query, candidate).max(token_similarity(query, candidate))
}

/// Trims a municipality query, rejecting blank input.
pub fn validate_query(query: &str) -> Result<&str> {
    let query = query.trim();
    if query.is_empty() {
        return Err(DatasetError::Validation(
            "municipality query must not be empty".into(),
        ));
    }
    Ok(query)
}

/// Trims a postal code, rejecting anything but exactly five ASCII digits.
pub fn validate_postal_code(postal_code: &str) -> Result<&str> {
    let postal_code = postal_code.trim();
    if !is_postal_code(postal_code) {
        return Err(DatasetError::Validation(format!(
            "postal code must be exactly 5 digits, got '{postal_code}'"
        )));
    }
    Ok(postal_code)
}

fn token_similarity(query: &str, candidate: &str) -> f64 {
    let query_tokens: Vec<&str> = tokens(query)
        .into_iter()
        .filter(|token| token.chars().count() >= 2)
        .collect();
    let candidate_tokens = tokens(candidate);
    if query_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }
    if !query_tokens
        .iter()
        .all(|token| candidate_tokens.contains(token))
    {
        return 0.0;
    }
    let ratio = query_tokens.len() as f64 / candidate_tokens.len() as f64;
    if query_tokens.len() < 2 && ratio < 0.5 {
        return 0.0;
    }
    TOKEN_MATCH_BASE + (1.0 - TOKEN_MATCH_BASE) * ratio.min(1.0)
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    municipalities: usize,
    population: u64,
}

impl Totals {
    fn add(&mut self, municipality: &Municipality) {
        self.municipalities += 1;
        self.population += municipality.population.unwrap_or(0);
    }
}

/// In-memory view of a snapshot with the lookup indexes the queries need.
/// A catalog never changes; a refresh builds a new one and swaps it in.
#[derive(Debug)]
pub struct Catalog {
    snapshot: Snapshot,
    list_limit: usize,
    reconciler: KeyReconciler,
    regions: HashMap<String, usize>,
    provinces: HashMap<String, usize>,
    municipalities: HashMap<String, usize>,
    /// Normalised name of each municipality, by position.
    normalised_names: Vec<String>,
    names: HashMap<String, Vec<usize>>,
    by_postal_code: HashMap<String, Vec<usize>>,
    postal_codes: HashMap<usize, Vec<String>>,
    region_totals: HashMap<String, Totals>,
    province_totals: HashMap<String, Totals>,
}

impl Catalog {
    /// Indexes `snapshot`. `list_limit` caps `list_municipalities` when the
    /// caller gives no limit.
    pub fn new(snapshot: Snapshot, list_limit: usize) -> Self {
        let dataset = &snapshot.dataset;
        let regions = position_index(dataset.regions.iter().map(|r| r.code.as_str()));
        let provinces = position_index(dataset.provinces.iter().map(|p| p.code.as_str()));
        let municipalities =
            position_index(dataset.municipalities.iter().map(|m| m.istat_code.as_str()));

        let normalised_names: Vec<String> = dataset
            .municipalities
            .iter()
            .map(|m| normalise(&m.name))
            .collect();
        let mut names: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, name) in normalised_names.iter().enumerate() {
            names.entry(name.clone()).or_default().push(idx);
        }

        let mut by_postal_code: HashMap<String, Vec<usize>> = HashMap::new();
        let mut postal_codes: HashMap<usize, Vec<String>> = HashMap::new();
        for link in &dataset.postal_links {
            if let Some(&idx) = municipalities.get(&link.istat_code) {
                by_postal_code
                    .entry(link.postal_code.clone())
                    .or_default()
                    .push(idx);
                postal_codes
                    .entry(idx)
                    .or_default()
                    .push(link.postal_code.clone());
            }
        }
        for codes in postal_codes.values_mut() {
            codes.sort();
            codes.dedup();
        }

        let mut region_totals: HashMap<String, Totals> = HashMap::new();
        let mut province_totals: HashMap<String, Totals> = HashMap::new();
        for m in &dataset.municipalities {
            region_totals.entry(m.region_code.clone()).or_default().add(m);
            province_totals
                .entry(m.province_code.clone())
                .or_default()
                .add(m);
        }

        let reconciler = KeyReconciler::new(
            dataset
                .municipalities
                .iter()
                .map(|m| (m.istat_code.as_str(), m.name.as_str())),
        );

        Self {
            snapshot,
            list_limit,
            reconciler,
            regions,
            provinces,
            municipalities,
            normalised_names,
            names,
            by_postal_code,
            postal_codes,
            region_totals,
            province_totals,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Every region with its municipality count and total population,
    /// sorted by name.
    pub fn list_regions(&self) -> Vec<RegionSummary> {
        let mut regions: Vec<&Region> = self.snapshot.dataset.regions.iter().collect();
        regions.sort_by_cached_key(|region| (normalise(&region.name), region.code.clone()));
        regions
            .into_iter()
            .map(|region| {
                let totals = self.region_totals.get(&region.code).copied().unwrap_or_default();
                RegionSummary {
                    code: region.code.clone(),
                    name: region.name.clone(),
                    municipality_count: totals.municipalities,
                    total_population: totals.population,
                }
            })
            .collect()
    }

    /// Provinces sorted by name, optionally restricted to one region given by
    /// code or name. Fails with [`DatasetError::NotFound`] when the filter
    /// matches no region.
    pub fn list_provinces(&self, region: Option<&str>) -> Result<Vec<ProvinceSummary>> {
        let region_code = match region {
            Some(filter) => Some(
                self.find_region(filter)
                    .map(|region| region.code.as_str())
                    .ok_or_else(|| DatasetError::NotFound(format!("region '{}'", filter.trim())))?,
            ),
            None => None,
        };

        let mut provinces: Vec<&Province> = self
            .snapshot
            .dataset
            .provinces
            .iter()
            .filter(|province| region_code.is_none_or(|code| province.region_code == code))
            .collect();
        provinces.sort_by_cached_key(|province| (normalise(&province.name), province.code.clone()));
        Ok(provinces
            .into_iter()
            .map(|province| {
                let totals = self
                    .province_totals
                    .get(&province.code)
                    .copied()
                    .unwrap_or_default();
                ProvinceSummary {
                    code: province.code.clone(),
                    name: province.name.clone(),
                    abbreviation: province.abbreviation.clone(),
                    region_code: province.region_code.clone(),
                    region: self.region_name(&province.region_code),
                    municipality_count: totals.municipalities,
                    total_population: totals.population,
                }
            })
            .collect())
    }

    /// Municipalities sorted by name. Region and province filters combine
    /// with AND; a filter that matches nothing yields an empty list. The
    /// result holds at most `limit` entries, or the configured cap.
    pub fn list_municipalities(
        &self,
        region: Option<&str>,
        province: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<MunicipalitySummary> {
        let region_code = match region.map(|filter| self.find_region(filter)) {
            Some(None) => return Vec::new(),
            Some(Some(region)) => Some(region.code.as_str()),
            None => None,
        };
        let province_code = match province.map(|filter| self.find_province(filter)) {
            Some(None) => return Vec::new(),
            Some(Some(province)) => Some(province.code.as_str()),
            None => None,
        };

        let mut selected: Vec<usize> = self
            .snapshot
            .dataset
            .municipalities
            .iter()
            .enumerate()
            .filter(|(_, m)| region_code.is_none_or(|code| m.region_code == code))
            .filter(|(_, m)| province_code.is_none_or(|code| m.province_code == code))
            .map(|(idx, _)| idx)
            .collect();
        selected.sort_by(|a, b| self.by_name_then_code(*a, *b));
        selected.truncate(limit.unwrap_or(self.list_limit));
        selected
            .into_iter()
            .map(|idx| self.summary(&self.snapshot.dataset.municipalities[idx]))
            .collect()
    }

    /// Looks a municipality up by ISTAT code or by name.
    ///
    /// All-digit queries are treated as codes, retired codes included. Names
    /// are matched exactly after normalisation first, then by [`similarity`];
    /// the best candidate scoring at least [`MIN_SIMILARITY`] wins. Equal
    /// scores, homonyms included, go to the larger population, then to the
    /// lower code.
    pub fn get_municipality(&self, query: &str) -> Result<MunicipalityRecord> {
        let query = validate_query(query)?;
        if query.chars().all(|c| c.is_ascii_digit()) {
            return self
                .reconciler
                .resolve_code(query)
                .and_then(|code| self.municipalities.get(&code).copied())
                .map(|idx| self.record(idx))
                .ok_or_else(|| DatasetError::NotFound(format!("no municipality with code '{query}'")));
        }

        let needle = normalise(query);
        if let Some(idx) = self
            .names
            .get(&needle)
            .and_then(|candidates| candidates.iter().copied().min_by(|a, b| self.by_prominence(*a, *b)))
        {
            return Ok(self.record(idx));
        }

        self.normalised_names
            .iter()
            .enumerate()
            .map(|(idx, name)| (idx, similarity(&needle, name)))
            .filter(|(_, score)| *score >= MIN_SIMILARITY)
            .min_by(|(a, score_a), (b, score_b)| {
                score_b
                    .partial_cmp(score_a)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| self.by_prominence(*a, *b))
            })
            .map(|(idx, _)| self.record(idx))
            .ok_or_else(|| DatasetError::NotFound(format!("no municipality matches '{query}'")))
    }

    /// Municipalities served by a 5-digit postal code, sorted by name. A
    /// well-formed code without municipalities yields an empty list.
    pub fn get_by_postal_code(&self, postal_code: &str) -> Result<Vec<MunicipalityRecord>> {
        let postal_code = validate_postal_code(postal_code)?;
        let mut matches = self
            .by_postal_code
            .get(postal_code)
            .cloned()
            .unwrap_or_default();
        matches.sort_by(|a, b| self.by_name_then_code(*a, *b));
        matches.dedup();
        Ok(matches.into_iter().map(|idx| self.record(idx)).collect())
    }

    fn find_region(&self, filter: &str) -> Option<&Region> {
        let filter = filter.trim();
        let regions = &self.snapshot.dataset.regions;
        if filter.chars().all(|c| c.is_ascii_digit()) {
            let code = pad_code(filter, 2)?;
            return self.regions.get(&code).map(|&idx| &regions[idx]);
        }
        let needle = normalise(filter);
        regions.iter().find(|region| names_match(&region.name, &needle))
    }

    fn find_province(&self, filter: &str) -> Option<&Province> {
        let filter = filter.trim();
        let provinces = &self.snapshot.dataset.provinces;
        if filter.chars().all(|c| c.is_ascii_digit()) {
            let code = pad_code(filter, 3)?;
            return self.provinces.get(&code).map(|&idx| &provinces[idx]);
        }
        let needle = normalise(filter);
        provinces.iter().find(|province| {
            province.abbreviation.eq_ignore_ascii_case(filter) || names_match(&province.name, &needle)
        })
    }

    fn region_name(&self, code: &str) -> String {
        self.regions
            .get(code)
            .map(|&idx| self.snapshot.dataset.regions[idx].name.clone())
            .unwrap_or_default()
    }

    fn province(&self, code: &str) -> Option<&Province> {
        self.provinces
            .get(code)
            .map(|&idx| &self.snapshot.dataset.provinces[idx])
    }

    fn summary(&self, m: &Municipality) -> MunicipalitySummary {
        let province = self.province(&m.province_code);
        MunicipalitySummary {
            istat_code: m.istat_code.clone(),
            name: m.name.clone(),
            province_abbreviation: province.map(|p| p.abbreviation.clone()).unwrap_or_default(),
            province: province.map(|p| p.name.clone()).unwrap_or_default(),
            region: self.region_name(&m.region_code),
            population: m.population,
        }
    }

    fn record(&self, idx: usize) -> MunicipalityRecord {
        let m = &self.snapshot.dataset.municipalities[idx];
        let province = self.province(&m.province_code);
        MunicipalityRecord {
            municipality: m.clone(),
            province: province.map(|p| p.name.clone()).unwrap_or_default(),
            province_abbreviation: province.map(|p| p.abbreviation.clone()).unwrap_or_default(),
            region: self.region_name(&m.region_code),
            postal_codes: self.postal_codes.get(&idx).cloned().unwrap_or_default(),
        }
    }

    fn by_name_then_code(&self, a: usize, b: usize) -> Ordering {
        let municipalities = &self.snapshot.dataset.municipalities;
        self.normalised_names[a]
            .cmp(&self.normalised_names[b])
            .then_with(|| municipalities[a].istat_code.cmp(&municipalities[b].istat_code))
    }

    /// Larger population first, then lower code.
    fn by_prominence(&self, a: usize, b: usize) -> Ordering {
        let municipalities = &self.snapshot.dataset.municipalities;
        municipalities[b]
            .population
            .unwrap_or(0)
            .cmp(&municipalities[a].population.unwrap_or(0))
            .then_with(|| municipalities[a].istat_code.cmp(&municipalities[b].istat_code))
    }
}

/// Exact match against a registry name or, for bilingual names such as
/// `"Bolzano/Bozen"`, against either of its parts.
fn names_match(name: &str, needle: &str) -> bool {
    normalise(name) == needle || name.split('/').any(|part| normalise(part) == needle)
}

fn position_index<'a>(codes: impl Iterator<Item = &'a str>) -> HashMap<String, usize> {
    codes
        .enumerate()
        .map(|(idx, code)| (code.to_string(), idx))
        .collect()
}
