use crate::italia::opendata::error::Result;
use crate::italia::opendata::sources::{decode_text, looks_numeric, parse_decimal};

/// Centroid of one municipality.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidRecord {
    pub raw_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Parses the three-column `code,lat,lng` CSV. The first line is a header.
pub fn parse(bytes: &[u8]) -> Result<(Vec<CentroidRecord>, usize)> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    let mut skipped = 0;
    for row in reader.records() {
        let Ok(row) = row else {
            skipped += 1;
            continue;
        };
        if row.len() != 3 {
            skipped += 1;
            continue;
        }
        let code = row[0].trim();
        let latitude = parse_decimal(&row[1]).filter(|lat| (-90.0..=90.0).contains(lat));
        let longitude = parse_decimal(&row[2]).filter(|lng| (-180.0..=180.0).contains(lng));
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) if looks_numeric(code) => {
                records.push(CentroidRecord {
                    raw_code: code.to_string(),
                    latitude,
                    longitude,
                })
            }
            _ => skipped += 1,
        }
    }
    Ok((records, skipped))
}
