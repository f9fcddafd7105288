//! Field normalization and the closed set of entity extractors.

use codi_core::{ExtractOutput, NormalizedRecord, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "codi-extract";

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static COMPANY_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(inc|inc\.|llc|l\.l\.c\.|corp|corporation|co|company|ltd|limited)\b")
        .expect("company suffix regex")
});
static COMPANY_PUNCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\s\-']").expect("company punctuation regex"));
static LICENSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9A-Za-z]").expect("license regex"));
static STREET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(\d+)\s+(.+?)\s+(st|street|ave|avenue|blvd|boulevard|rd|road|dr|drive|ln|lane|ct|court|pl|place)\b\.?$",
    )
    .expect("street address regex")
});

pub fn norm_whitespace(s: &str) -> String {
    WHITESPACE_RE.replace_all(s, " ").trim().to_string()
}

/// Canonical company-name form: collapsed whitespace, `&` spelled out,
/// punctuation stripped, legal suffixes removed, uppercased.
pub fn norm_company_name(s: &str) -> String {
    let s = norm_whitespace(s);
    let s = s.replace('&', "and");
    let s = COMPANY_PUNCT_RE.replace_all(&s, " ");
    let s = COMPANY_SUFFIX_RE.replace_all(&s, "");
    norm_whitespace(&s).to_uppercase()
}

/// License numbers compare as their alphanumeric characters only.
pub fn norm_license(s: &str) -> Option<String> {
    let cleaned = LICENSE_RE.replace_all(s, "").to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressParts {
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub street_suffix: Option<String>,
    pub raw: String,
}

/// Best-effort street address split; unmatched inputs keep only `raw`.
pub fn parse_street_address(full: &str) -> AddressParts {
    let full = norm_whitespace(full);
    match STREET_RE.captures(&full) {
        Some(caps) => AddressParts {
            street_number: Some(caps[1].to_string()),
            street_name: Some(caps[2].to_string()),
            street_suffix: Some(caps[3].to_uppercase()),
            raw: full,
        },
        None => AddressParts {
            street_number: None,
            street_name: None,
            street_suffix: None,
            raw: full,
        },
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unknown entity extractor {0:?}")]
    UnknownEntity(String),
}

/// Closed set of entity extractors. Dataset configuration references these
/// variants directly; string names resolve through [`EntityExtractor::from_name`]
/// and unknown names are a validation error, never a dispatch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityExtractor {
    ContractorContact,
    PermitBuilding,
    PermitPlumbing,
    Complaint,
}

const EXTRACTOR_NAMES: &[(&str, EntityExtractor)] = &[
    ("contractor_contact", EntityExtractor::ContractorContact),
    ("permit_building", EntityExtractor::PermitBuilding),
    ("permit_plumbing", EntityExtractor::PermitPlumbing),
    ("complaint", EntityExtractor::Complaint),
];

impl EntityExtractor {
    pub fn entity(&self) -> &'static str {
        match self {
            EntityExtractor::ContractorContact => "contractor_contact",
            EntityExtractor::PermitBuilding => "permit_building",
            EntityExtractor::PermitPlumbing => "permit_plumbing",
            EntityExtractor::Complaint => "complaint",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ExtractError> {
        EXTRACTOR_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, e)| *e)
            .ok_or_else(|| ExtractError::UnknownEntity(name.to_string()))
    }

    /// Runs normalization over a fetched batch. Rows pass through with
    /// `_norm` derivative fields added; rows that yield no canonical key
    /// are kept and counted in the warnings.
    pub fn run(&self, request_id: &str, rows: &[Row]) -> ExtractOutput {
        let mut out = ExtractOutput::new(request_id, self.entity());
        let mut missing_key = 0usize;

        for raw in rows {
            let record = match self {
                EntityExtractor::ContractorContact => extract_contractor_contact(raw),
                EntityExtractor::PermitBuilding => {
                    extract_permit(raw, self.entity(), "building_contractor_name", "building_contractor_license")
                }
                EntityExtractor::PermitPlumbing => {
                    extract_permit(raw, self.entity(), "plumbing_contractor_name", "plumbing_contractor_license")
                }
                EntityExtractor::Complaint => extract_complaint(raw),
            };
            if record.canonical_key.is_none() {
                missing_key += 1;
            }
            out.push(record);
        }

        if missing_key > 0 {
            out.warnings
                .push(format!("{missing_key} rows without a canonical key"));
        }
        out
    }
}

fn field_str(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_str(row: &Row, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| field_str(row, k))
}

fn set_norm(row: &mut Row, key: &str, value: Option<JsonValue>) {
    row.insert(key.to_string(), value.unwrap_or(JsonValue::Null));
}

fn extract_contractor_contact(raw: &Row) -> NormalizedRecord {
    let mut row = raw.clone();

    let company = field_str(raw, "company_name");
    set_norm(
        &mut row,
        "company_name_norm",
        company.map(|c| JsonValue::String(norm_company_name(&c))),
    );

    let contact = field_str(raw, "contact_name");
    set_norm(
        &mut row,
        "contact_name_norm",
        contact.map(|c| JsonValue::String(norm_whitespace(&c).to_uppercase())),
    );

    let license = first_str(raw, &["license_number", "contractor_license"]);
    set_norm(
        &mut row,
        "license_norm",
        license
            .and_then(|l| norm_license(&l))
            .map(JsonValue::String),
    );

    let address = first_str(raw, &["address", "street_address"]);
    set_norm(
        &mut row,
        "address_norm",
        address.map(|a| {
            serde_json::to_value(parse_street_address(&a)).expect("address parts serialize")
        }),
    );

    NormalizedRecord {
        entity: "contractor_contact".to_string(),
        canonical_key: field_str(raw, "application_number"),
        row,
    }
}

fn extract_permit(
    raw: &Row,
    entity: &str,
    contractor_name_field: &str,
    contractor_license_field: &str,
) -> NormalizedRecord {
    let mut row = raw.clone();

    let name = first_str(raw, &[contractor_name_field, "contractor_name"]);
    set_norm(
        &mut row,
        "contractor_name_norm",
        name.map(|n| JsonValue::String(norm_company_name(&n))),
    );

    let license = first_str(raw, &[contractor_license_field, "contractor_license"]);
    set_norm(
        &mut row,
        "contractor_license_norm",
        license
            .and_then(|l| norm_license(&l))
            .map(JsonValue::String),
    );

    let address = first_str(raw, &["job_address", "address", "site_address"]);
    set_norm(
        &mut row,
        "address_norm",
        address.map(|a| {
            serde_json::to_value(parse_street_address(&a)).expect("address parts serialize")
        }),
    );

    NormalizedRecord {
        entity: entity.to_string(),
        canonical_key: first_str(
            raw,
            &[
                "permit_number",
                "parent_permit_number",
                "complaint_number",
                "addenda_number",
            ],
        ),
        row,
    }
}

fn extract_complaint(raw: &Row) -> NormalizedRecord {
    let mut row = raw.clone();

    let description = first_str(raw, &["complaint_description", "description"]);
    set_norm(
        &mut row,
        "description_norm",
        description.map(|d| JsonValue::String(norm_whitespace(&d))),
    );

    let address = first_str(raw, &["address", "site_address"]);
    set_norm(
        &mut row,
        "address_norm",
        address.map(|a| {
            serde_json::to_value(parse_street_address(&a)).expect("address parts serialize")
        }),
    );

    NormalizedRecord {
        entity: "complaint".to_string(),
        canonical_key: field_str(raw, "complaint_number"),
        row,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).expect("row fixture")
    }

    #[test]
    fn company_names_normalize_to_comparable_form() {
        assert_eq!(norm_company_name("  Ace   Plumbing, Inc. "), "ACE PLUMBING");
        assert_eq!(norm_company_name("Smith & Sons LLC"), "SMITH AND SONS");
        assert_eq!(norm_company_name("O'Brien Co"), "O'BRIEN");
    }

    #[test]
    fn license_numbers_keep_only_alphanumerics() {
        assert_eq!(norm_license(" C-12345 ").as_deref(), Some("C12345"));
        assert_eq!(norm_license("##--"), None);
    }

    #[test]
    fn street_addresses_split_into_parts() {
        let parts = parse_street_address("123  Mission   St.");
        assert_eq!(parts.street_number.as_deref(), Some("123"));
        assert_eq!(parts.street_name.as_deref(), Some("Mission"));
        assert_eq!(parts.street_suffix.as_deref(), Some("ST"));
        assert_eq!(parts.raw, "123 Mission St.");

        let unmatched = parse_street_address("Pier 39");
        assert!(unmatched.street_number.is_none());
        assert_eq!(unmatched.raw, "Pier 39");
    }

    #[test]
    fn unknown_extractor_names_are_rejected() {
        assert!(matches!(
            EntityExtractor::from_name("permit_roofing"),
            Err(ExtractError::UnknownEntity(_))
        ));
        assert_eq!(
            EntityExtractor::from_name("contractor_contact").unwrap(),
            EntityExtractor::ContractorContact
        );
    }

    #[test]
    fn contractor_rows_gain_norm_fields_and_canonical_key() {
        let rows = vec![row(json!({
            "application_number": "A-100",
            "company_name": "Ace Plumbing, Inc.",
            "contact_name": "  jane   doe ",
            "license_number": "C-12345",
            "address": "123 Mission St"
        }))];

        let out = EntityExtractor::ContractorContact.run("run-1", &rows);
        assert_eq!(out.stats.count, 1);
        assert!(out.warnings.is_empty());

        let record = &out.rows[0];
        assert_eq!(record.canonical_key.as_deref(), Some("A-100"));
        assert_eq!(record.row["company_name_norm"], json!("ACE PLUMBING"));
        assert_eq!(record.row["contact_name_norm"], json!("JANE DOE"));
        assert_eq!(record.row["license_norm"], json!("C12345"));
        assert_eq!(record.row["address_norm"]["street_number"], json!("123"));
    }

    #[test]
    fn plumbing_permits_prefer_dataset_specific_fields() {
        let rows = vec![row(json!({
            "permit_number": "P-9",
            "plumbing_contractor_name": "Smith & Sons LLC",
            "plumbing_contractor_license": "PL 77-88",
            "contractor_name": "SHOULD NOT WIN",
            "job_address": "42 Oak Ave"
        }))];

        let out = EntityExtractor::PermitPlumbing.run("run-1", &rows);
        let record = &out.rows[0];
        assert_eq!(record.canonical_key.as_deref(), Some("P-9"));
        assert_eq!(record.row["contractor_name_norm"], json!("SMITH AND SONS"));
        assert_eq!(record.row["contractor_license_norm"], json!("PL7788"));
    }

    #[test]
    fn rows_without_canonical_keys_are_kept_with_a_warning() {
        let rows = vec![row(json!({"company_name": "Ace"}))];
        let out = EntityExtractor::ContractorContact.run("run-1", &rows);
        assert_eq!(out.stats.count, 1);
        assert!(out.rows[0].canonical_key.is_none());
        assert_eq!(out.warnings.len(), 1);
    }
}
