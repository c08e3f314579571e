#![forbid(unsafe_code)]

use medshare_kernel_contracts::consent::ConsentScope;
use serde_json::{Map, Value};

pub const IDENTIFIER_FIELDS: &[&str] = &["recordId", "patientId"];

const FULL_FIELDS: &[&str] = &[
    "category",
    "visitDate",
    "severity",
    "diagnoses",
    "medications",
    "labResults",
    "imagingResults",
    "notes",
    "bloodType",
    "allergies",
];
const SUMMARY_FIELDS: &[&str] = &["category", "visitDate", "severity"];
const EMERGENCY_FIELDS: &[&str] = &["severity", "bloodType", "allergies"];

/// Content fields a scope exposes on top of the identifiers. Anything not
/// listed here is never returned.
pub fn scope_fields(scope: ConsentScope) -> &'static [&'static str] {
    match scope {
        ConsentScope::Full => FULL_FIELDS,
        ConsentScope::Summary => SUMMARY_FIELDS,
        ConsentScope::Emergency => EMERGENCY_FIELDS,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectionSource<'a> {
    pub record_id: &'a str,
    pub patient_id: &'a str,
    pub category: &'a str,
    pub content: &'a Value,
}

pub fn project_record(scope: ConsentScope, src: ProjectionSource<'_>) -> Value {
    let mut out = Map::new();
    out.insert("recordId".to_string(), Value::from(src.record_id));
    out.insert("patientId".to_string(), Value::from(src.patient_id));
    for field in scope_fields(scope) {
        if *field == "category" {
            out.insert("category".to_string(), Value::from(src.category));
            continue;
        }
        if let Some(v) = src.content.get(*field) {
            out.insert((*field).to_string(), v.clone());
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content() -> Value {
        json!({
            "recordId": "spoofed",
            "visitDate": "2024-03-01",
            "severity": "moderate",
            "diagnoses": ["J45"],
            "medications": ["salbutamol"],
            "labResults": {"ige": 310},
            "imagingResults": [],
            "notes": "wheezing",
            "bloodType": "O-",
            "allergies": ["penicillin"],
            "ssn": "000-00-0000",
        })
    }

    fn project(scope: ConsentScope) -> Value {
        let c = content();
        project_record(
            scope,
            ProjectionSource {
                record_id: "rec_1",
                patient_id: "patient_1",
                category: "visit",
                content: &c,
            },
        )
    }

    fn keys(v: &Value) -> Vec<String> {
        let mut k: Vec<String> = v.as_object().unwrap().keys().cloned().collect();
        k.sort();
        k
    }

    #[test]
    fn at_projection_01_summary_exposes_only_summary_fields() {
        let out = project(ConsentScope::Summary);
        assert_eq!(
            keys(&out),
            vec!["category", "patientId", "recordId", "severity", "visitDate"]
        );
        assert_eq!(out["recordId"], json!("rec_1"));
        assert_eq!(out["category"], json!("visit"));
    }

    #[test]
    fn at_projection_02_emergency_exposes_safety_fields() {
        let out = project(ConsentScope::Emergency);
        assert_eq!(
            keys(&out),
            vec!["allergies", "bloodType", "patientId", "recordId", "severity"]
        );
    }

    #[test]
    fn at_projection_03_unknown_fields_never_leak() {
        for scope in [
            ConsentScope::Full,
            ConsentScope::Summary,
            ConsentScope::Emergency,
        ] {
            let out = project(scope);
            assert!(out.get("ssn").is_none());
        }
        let full = project(ConsentScope::Full);
        assert_eq!(full["notes"], json!("wheezing"));
        assert_eq!(keys(&full).len(), 12);
    }
}
