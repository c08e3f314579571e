#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_ascii_id;
use crate::identity::{FacilityId, UserId};
use crate::integrity::LedgerRef;
use crate::record::{validate_record_id_set, RecordId};
use crate::{ContractViolation, SchemaVersion, UnixTimeNs, Validate};

pub const CONSENT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Marker written into the external token bundle.
pub const CONSENT_BUNDLE_TYPE: &str = "medshare_consent";

pub const MAX_TTL_HOURS_HARD_LIMIT: u32 = 24 * 365;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TokenId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_id("token_id", &self.0, 128)?;
        if self.0.len() < 16 {
            return Err(ContractViolation::InvalidValue {
                field: "token_id",
                reason: "must be >= 16 chars",
            });
        }
        if !self
            .0
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ContractViolation::InvalidValue {
                field: "token_id",
                reason: "must be URL-safe",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConsentScope {
    Full,
    Summary,
    Emergency,
}

impl ConsentScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Some(ConsentScope::Full),
            "summary" => Some(ConsentScope::Summary),
            "emergency" => Some(ConsentScope::Emergency),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConsentScope::Full => "full",
            ConsentScope::Summary => "summary",
            ConsentScope::Emergency => "emergency",
        }
    }

    pub fn permissions(self) -> Vec<ConsentPermission> {
        match self {
            ConsentScope::Full => vec![ConsentPermission::Read, ConsentPermission::Export],
            ConsentScope::Summary | ConsentScope::Emergency => vec![ConsentPermission::Read],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConsentPermission {
    Read,
    Export,
}

impl ConsentPermission {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentPermission::Read => "read",
            ConsentPermission::Export => "export",
        }
    }
}

/// Derived token state; only `revoked` is ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenState {
    Active,
    Expired,
    Revoked,
}

impl TokenState {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::Active => "active",
            TokenState::Expired => "expired",
            TokenState::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentToken {
    pub schema_version: SchemaVersion,
    pub token_id: TokenId,
    pub owner_id: UserId,
    pub record_ids: Vec<RecordId>,
    pub scope: ConsentScope,
    pub permissions: Vec<ConsentPermission>,
    pub facility_id: Option<FacilityId>,
    pub created_at: UnixTimeNs,
    pub expires_at: UnixTimeNs,
    pub revoked: bool,
    pub access_count: u64,
    pub last_accessed_at: Option<UnixTimeNs>,
    pub ledger_consent_ref: Option<LedgerRef>,
    pub revocation_ledger_ref: Option<LedgerRef>,
}

impl ConsentToken {
    /// A freshly issued token: not revoked, never accessed.
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        token_id: TokenId,
        owner_id: UserId,
        record_ids: Vec<RecordId>,
        scope: ConsentScope,
        facility_id: Option<FacilityId>,
        created_at: UnixTimeNs,
        expires_at: UnixTimeNs,
        ledger_consent_ref: Option<LedgerRef>,
    ) -> Result<Self, ContractViolation> {
        let t = Self {
            schema_version: CONSENT_CONTRACT_VERSION,
            token_id,
            owner_id,
            record_ids,
            scope,
            permissions: scope.permissions(),
            facility_id,
            created_at,
            expires_at,
            revoked: false,
            access_count: 0,
            last_accessed_at: None,
            ledger_consent_ref,
            revocation_ledger_ref: None,
        };
        t.validate()?;
        Ok(t)
    }

    /// Revocation wins over expiry so a revoked token always reports `Revoked`.
    pub fn state_at(&self, now: UnixTimeNs) -> TokenState {
        if self.revoked {
            TokenState::Revoked
        } else if now >= self.expires_at {
            TokenState::Expired
        } else {
            TokenState::Active
        }
    }

    pub fn is_valid_at(&self, now: UnixTimeNs) -> bool {
        self.state_at(now) == TokenState::Active
    }
}

impl Validate for ConsentToken {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CONSENT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "consent_token.schema_version",
                reason: "must match CONSENT_CONTRACT_VERSION",
            });
        }
        self.token_id.validate()?;
        self.owner_id.validate()?;
        validate_record_id_set(&self.record_ids)?;
        if let Some(f) = &self.facility_id {
            f.validate()?;
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "consent_token.created_at",
                reason: "must be > 0",
            });
        }
        if self.expires_at <= self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "consent_token.expires_at",
                reason: "must be after created_at",
            });
        }
        if self.permissions != self.scope.permissions() {
            return Err(ContractViolation::InvalidValue {
                field: "consent_token.permissions",
                reason: "must match scope",
            });
        }
        Ok(())
    }
}

/// One successful `access()`; append-only apart from the ledger ref backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub schema_version: SchemaVersion,
    pub token_id: TokenId,
    pub event_seq: u64,
    pub accessor_id: String,
    pub facility_id: Option<FacilityId>,
    pub purpose: String,
    pub timestamp: UnixTimeNs,
    pub ledger_log_ref: Option<LedgerRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub accessor_id: String,
    pub facility_id: Option<FacilityId>,
    pub purpose: String,
}

impl AccessContext {
    pub const UNSPECIFIED: &'static str = "unspecified";

    pub fn v1(
        accessor_id: Option<String>,
        facility_id: Option<FacilityId>,
        purpose: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let c = Self {
            accessor_id: accessor_id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| Self::UNSPECIFIED.to_string()),
            facility_id,
            purpose: purpose
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| Self::UNSPECIFIED.to_string()),
        };
        c.validate()?;
        Ok(c)
    }
}

impl Validate for AccessContext {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ascii_id("access_context.accessor_id", &self.accessor_id, 128)?;
        if let Some(f) = &self.facility_id {
            f.validate()?;
        }
        if self.purpose.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "access_context.purpose",
                reason: "must be <= 256 chars",
            });
        }
        if self.purpose.chars().any(|c| c.is_control()) {
            return Err(ContractViolation::InvalidValue {
                field: "access_context.purpose",
                reason: "must not contain control characters",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueConsentRequest {
    pub owner_id: UserId,
    pub record_ids: Vec<RecordId>,
    pub scope: ConsentScope,
    pub ttl_hours: u32,
    pub facility_id: Option<FacilityId>,
}

impl IssueConsentRequest {
    pub fn v1(
        owner_id: UserId,
        record_ids: Vec<RecordId>,
        scope: ConsentScope,
        ttl_hours: u32,
        facility_id: Option<FacilityId>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            owner_id,
            record_ids,
            scope,
            ttl_hours,
            facility_id,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for IssueConsentRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.owner_id.validate()?;
        validate_record_id_set(&self.record_ids)?;
        if self.ttl_hours == 0 || self.ttl_hours > MAX_TTL_HOURS_HARD_LIMIT {
            return Err(ContractViolation::InvalidRange {
                field: "issue_consent_request.ttl_hours",
                min: 1,
                max: u64::from(MAX_TTL_HOURS_HARD_LIMIT),
                got: u64::from(self.ttl_hours),
            });
        }
        if let Some(f) = &self.facility_id {
            f.validate()?;
        }
        Ok(())
    }
}

/// External representation handed to the sharer, e.g. rendered into a 2D barcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentTokenBundle {
    pub token: String,
    #[serde(rename = "type")]
    pub type_marker: String,
    pub scope: String,
    pub record_count: u32,
    pub generated_at_ns: u64,
    pub expires_at_ns: u64,
    pub checksum: String,
}
