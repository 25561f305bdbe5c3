use serde_json::Value;

use crate::italia::opendata::error::{DatasetError, Result};
use crate::italia::opendata::sources::decode_text;

/// Postal codes of one municipality. The provider keys entries by ISTAT code
/// but also carries the name, which serves as fallback key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostalRecord {
    pub raw_code: Option<String>,
    pub name: Option<String>,
    pub postal_codes: Vec<String>,
}

/// True for exactly five ASCII digits.
pub fn is_postal_code(value: &str) -> bool {
    value.len() == 5 && value.bytes().all(|b| b.is_ascii_digit())
}

/// Parses the community JSON array of municipalities. The payload may carry
/// a BOM or arrive as Windows-1252.
pub fn parse(bytes: &[u8]) -> Result<(Vec<PostalRecord>, usize)> {
    let document: Value = serde_json::from_str(&decode_text(bytes))?;
    let Value::Array(items) = document else {
        return Err(DatasetError::InvalidPayload(
            "expected a JSON array of municipalities".into(),
        ));
    };

    let mut records = Vec::new();
    let mut skipped = 0;
    for item in &items {
        match parse_item(item) {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    Ok((records, skipped))
}

fn parse_item(item: &Value) -> Option<PostalRecord> {
    let object = item.as_object()?;
    let raw_code = object.get("codice").and_then(scalar_to_string);
    let name = object
        .get("nome")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    if raw_code.is_none() && name.is_none() {
        return None;
    }

    let mut postal_codes: Vec<String> = match object.get("cap") {
        Some(Value::Array(values)) => values.iter().filter_map(scalar_to_string).collect(),
        Some(other) => scalar_to_string(other).into_iter().collect(),
        None => Vec::new(),
    };
    postal_codes.retain(|code| is_postal_code(code));
    postal_codes.sort();
    postal_codes.dedup();
    if postal_codes.is_empty() {
        return None;
    }

    Some(PostalRecord {
        raw_code,
        name,
        postal_codes,
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_valid_postal_codes() {
        let payload = serde_json::json!([
            {"nome": "Roma", "codice": "058091", "cap": ["00119", "00118", "00118", "0011"]},
            {"nome": "Agliè", "codice": 1001, "cap": "10011"},
            {"nome": "Nowhere", "codice": "999999", "cap": []},
            "garbage"
        ]);

        let (records, skipped) = parse(payload.to_string().as_bytes()).expect("postal parsed");

        assert_eq!(skipped, 2);
        assert_eq!(records[0].postal_codes, vec!["00118", "00119"]);
        assert_eq!(records[1].raw_code.as_deref(), Some("1001"));
        assert_eq!(records[1].postal_codes, vec!["10011"]);
    }

    #[test]
    fn tolerates_bom_and_windows_1252() {
        let mut payload = b"\xEF\xBB\xBF".to_vec();
        payload.extend_from_slice(r#"[{"nome": "Roma", "codice": "058091", "cap": ["00118"]}]"#.as_bytes());
        let (records, skipped) = parse(&payload).expect("BOM-prefixed payload");
        assert_eq!(skipped, 0);
        assert_eq!(records[0].postal_codes, vec!["00118"]);

        let mut latin = br#"[{"nome": "Agli"#.to_vec();
        latin.push(0xE8);
        latin.extend_from_slice(br#"", "codice": "001001", "cap": ["10011"]}]"#);
        let (records, _) = parse(&latin).expect("Windows-1252 payload");
        assert_eq!(records[0].name.as_deref(), Some("Agliè"));
    }

    #[test]
    fn rejects_non_array_documents() {
        assert!(parse(br#"{"comuni": []}"#).is_err());
    }

    #[test]
    fn postal_code_shape() {
        assert!(is_postal_code("00118"));
        assert!(!is_postal_code("0011"));
        assert!(!is_postal_code("0011a"));
    }
}
