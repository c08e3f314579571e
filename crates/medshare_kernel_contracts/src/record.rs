#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_ascii_id;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for RecordId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_id("record_id", &self.0, 64)
    }
}

impl TryFrom<String> for RecordId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

/// Free-form record category ("visit", "lab", "imaging", ...), kept opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordCategory(String);

impl RecordCategory {
    pub fn new(category: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(category.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for RecordCategory {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_id("record_category", &self.0, 64)
    }
}

impl TryFrom<String> for RecordCategory {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordCategory> for String {
    fn from(value: RecordCategory) -> Self {
        value.0
    }
}

pub const MAX_RECORDS_PER_SHARE: usize = 64;

/// Validates a list of record ids for a share: non-empty, bounded, no duplicates.
pub fn validate_record_id_set(record_ids: &[RecordId]) -> Result<(), ContractViolation> {
    if record_ids.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field: "record_ids",
            reason: "must not be empty",
        });
    }
    if record_ids.len() > MAX_RECORDS_PER_SHARE {
        return Err(ContractViolation::InvalidRange {
            field: "record_ids",
            min: 1,
            max: MAX_RECORDS_PER_SHARE as u64,
            got: record_ids.len() as u64,
        });
    }
    for (i, id) in record_ids.iter().enumerate() {
        id.validate()?;
        if record_ids[..i].contains(id) {
            return Err(ContractViolation::InvalidValue {
                field: "record_ids",
                reason: "must not contain duplicates",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    #[test]
    fn record_id_set_rejects_empty_and_duplicates() {
        assert!(validate_record_id_set(&[]).is_err());
        assert!(validate_record_id_set(&[rid("r1"), rid("r1")]).is_err());
        assert!(validate_record_id_set(&[rid("r1"), rid("r2")]).is_ok());
    }

    #[test]
    fn record_id_set_is_bounded() {
        let ids: Vec<RecordId> = (0..=MAX_RECORDS_PER_SHARE)
            .map(|i| rid(&format!("r{i}")))
            .collect();
        assert!(matches!(
            validate_record_id_set(&ids),
            Err(ContractViolation::InvalidRange { .. })
        ));
    }
}
