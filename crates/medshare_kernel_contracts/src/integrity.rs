#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_ascii_id;
use crate::identity::UserId;
use crate::record::RecordId;
use crate::{ContractViolation, SchemaVersion, UnixTimeNs, Validate};

pub const INTEGRITY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Lower-case hex SHA-256 digest of a record's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalHash(String);

impl CanonicalHash {
    pub fn new(digest_hex: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(digest_hex.into());
        v.validate()?;
        Ok(v)
    }

    pub fn from_sha256(digest: [u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for CanonicalHash {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() != 64 {
            return Err(ContractViolation::InvalidValue {
                field: "canonical_hash",
                reason: "must be 64 hex chars",
            });
        }
        if !self
            .0
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ContractViolation::InvalidValue {
                field: "canonical_hash",
                reason: "must be lower-case hex",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for CanonicalHash {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CanonicalHash> for String {
    fn from(value: CanonicalHash) -> Self {
        value.0
    }
}

/// Opaque reference to a ledger entry (a transaction hash on a JSON-RPC chain).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LedgerRef(String);

impl LedgerRef {
    pub fn new(r: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(r.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for LedgerRef {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_id("ledger_ref", &self.0, 128)
    }
}

impl TryFrom<String> for LedgerRef {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LedgerRef> for String {
    fn from(value: LedgerRef) -> Self {
        value.0
    }
}

/// Proof that `canonical_hash` was published at `anchored_at`. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityAnchor {
    pub schema_version: SchemaVersion,
    pub subject_id: UserId,
    pub record_id: RecordId,
    pub canonical_hash: CanonicalHash,
    pub ledger_ref: LedgerRef,
    pub anchored_at: UnixTimeNs,
}

impl IntegrityAnchor {
    pub fn v1(
        subject_id: UserId,
        record_id: RecordId,
        canonical_hash: CanonicalHash,
        ledger_ref: LedgerRef,
        anchored_at: UnixTimeNs,
    ) -> Result<Self, ContractViolation> {
        let a = Self {
            schema_version: INTEGRITY_CONTRACT_VERSION,
            subject_id,
            record_id,
            canonical_hash,
            ledger_ref,
            anchored_at,
        };
        a.validate()?;
        Ok(a)
    }
}

impl Validate for IntegrityAnchor {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != INTEGRITY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "integrity_anchor.schema_version",
                reason: "must match INTEGRITY_CONTRACT_VERSION",
            });
        }
        self.subject_id.validate()?;
        self.record_id.validate()?;
        self.canonical_hash.validate()?;
        self.ledger_ref.validate()?;
        if self.anchored_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "integrity_anchor.anchored_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationStatus {
    Verified,
    Tampered,
    NotFound,
    /// The check could not run (transport failure, timeout, no ledger configured).
    Unavailable,
    /// Only reported for stored records that were never successfully anchored.
    NotAnchored,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Tampered => "tampered",
            VerificationStatus::NotFound => "not_found",
            VerificationStatus::Unavailable => "unavailable",
            VerificationStatus::NotAnchored => "not_anchored",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn canonical_hash_requires_lowercase_sha256_hex() {
        assert!(CanonicalHash::new(HASH).is_ok());
        assert!(CanonicalHash::new(HASH.to_ascii_uppercase()).is_err());
        assert!(CanonicalHash::new(&HASH[..63]).is_err());
    }

    #[test]
    fn canonical_hash_from_digest_is_lowercase_hex() {
        let digest: [u8; 32] = hex::decode(HASH).unwrap().try_into().unwrap();
        let h = CanonicalHash::from_sha256(digest);
        assert_eq!(h.as_str(), HASH);
        assert!(h.validate().is_ok());
    }

    #[test]
    fn anchor_requires_nonzero_timestamp() {
        let out = IntegrityAnchor::v1(
            UserId::new("patient_1").unwrap(),
            RecordId::new("rec_1").unwrap(),
            CanonicalHash::new(HASH).unwrap(),
            LedgerRef::new("0xabc").unwrap(),
            UnixTimeNs(0),
        );
        assert!(out.is_err());
    }
}
