#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;

use medshare_engines::canonical::canonical_hash;
use medshare_engines::ledger::LedgerGateway;
use medshare_engines::projection::{project_record, ProjectionSource};
use medshare_engines::token_codec::{
    bundle_for, bundle_matches, encode_bundle, generate_token_id, parse_presented,
    token_fingerprint, PresentedToken, TokenCodecError,
};
use medshare_kernel_contracts::consent::{
    AccessContext, AccessEvent, ConsentPermission, ConsentScope, ConsentToken,
    IssueConsentRequest, TokenId, TokenState, MAX_TTL_HOURS_HARD_LIMIT,
};
use medshare_kernel_contracts::identity::{FacilityId, Identity, Role, UserId};
use medshare_kernel_contracts::integrity::LedgerRef;
use medshare_kernel_contracts::ledger::{
    AccessLogEntry, ConsentGrantEntry, LedgerEnvelope, LedgerPayload, RevocationEntry,
};
use medshare_kernel_contracts::record::RecordId;
use medshare_kernel_contracts::{ContractViolation, ReasonCodeId, UnixTimeNs};
use medshare_storage::repo::ConsentTokensRepo;
use medshare_storage::store::{ConsentAccessGate, StorageError};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit_worker::{LedgerAuditHandle, LedgerAuditJob};
use crate::{lock_store, SharedStore, StoreLockPoisoned};

pub mod reason_codes {
    use medshare_kernel_contracts::ReasonCodeId;

    pub const CONSENT_OK_ISSUE: ReasonCodeId = ReasonCodeId(0x4354_0001);
    pub const CONSENT_OK_VALIDATE: ReasonCodeId = ReasonCodeId(0x4354_0002);
    pub const CONSENT_OK_ACCESS: ReasonCodeId = ReasonCodeId(0x4354_0003);
    pub const CONSENT_OK_REVOKE: ReasonCodeId = ReasonCodeId(0x4354_0004);
    pub const CONSENT_OK_HISTORY: ReasonCodeId = ReasonCodeId(0x4354_0005);
    pub const CONSENT_OK_ACCESS_LOG: ReasonCodeId = ReasonCodeId(0x4354_0006);
    pub const CONSENT_REFUSE_EXPIRED: ReasonCodeId = ReasonCodeId(0x4354_00F1);
    pub const CONSENT_REFUSE_REVOKED: ReasonCodeId = ReasonCodeId(0x4354_00F2);
    pub const CONSENT_REFUSE_NOT_FOUND: ReasonCodeId = ReasonCodeId(0x4354_00F3);
    pub const CONSENT_REFUSE_FORBIDDEN: ReasonCodeId = ReasonCodeId(0x4354_00F4);
    pub const CONSENT_REFUSE_CHECKSUM_MISMATCH: ReasonCodeId = ReasonCodeId(0x4354_00F5);
    pub const CONSENT_REFUSE_INVALID: ReasonCodeId = ReasonCodeId(0x4354_00F6);
    pub const CONSENT_INTERNAL_ERROR: ReasonCodeId = ReasonCodeId(0x4354_00FF);
}

pub const CONSENT_DEFAULT_TTL_HOURS: u32 = 24;
pub const CONSENT_MAX_TTL_HOURS: u32 = 720;
pub const HISTORY_DEFAULT_PAGE_SIZE: u32 = 20;
pub const HISTORY_MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentConfig {
    pub default_ttl_hours: u32,
    /// Requested lifetimes above this are clamped, not refused.
    pub max_ttl_hours: u32,
}

impl ConsentConfig {
    pub fn mvp_v1() -> Self {
        Self {
            default_ttl_hours: CONSENT_DEFAULT_TTL_HOURS,
            max_ttl_hours: CONSENT_MAX_TTL_HOURS,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let hours = |key: &str, default: u32| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| (1..=MAX_TTL_HOURS_HARD_LIMIT).contains(v))
                .unwrap_or(default)
        };
        let max_ttl_hours = hours("MEDSHARE_CONSENT_MAX_TTL_HOURS", CONSENT_MAX_TTL_HOURS);
        let default_ttl_hours =
            hours("MEDSHARE_CONSENT_DEFAULT_TTL_HOURS", CONSENT_DEFAULT_TTL_HOURS)
                .min(max_ttl_hours);
        Self {
            default_ttl_hours,
            max_ttl_hours,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConsentError {
    #[error("consent token expired")]
    Expired,
    #[error("consent token revoked")]
    Revoked,
    #[error("consent token not found")]
    NotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("consent token checksum mismatch")]
    ChecksumMismatch,
    #[error("invalid input: {0}")]
    Invalid(#[from] ContractViolation),
    #[error("consent bundle: {0}")]
    Codec(#[from] TokenCodecError),
    #[error("storage: {0}")]
    Storage(StorageError),
    #[error("care store lock poisoned")]
    StoreUnavailable,
}

impl From<StoreLockPoisoned> for ConsentError {
    fn from(_: StoreLockPoisoned) -> Self {
        ConsentError::StoreUnavailable
    }
}

impl From<StorageError> for ConsentError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::OwnerMismatch { key, .. } => {
                ConsentError::Forbidden(format!("record {key} is not owned by the caller"))
            }
            StorageError::ForeignKeyViolation { table, key } if table.starts_with("medical_records") => {
                ConsentError::Forbidden(format!("record {key} is not owned by the caller"))
            }
            StorageError::ForeignKeyViolation { table, .. } if table.starts_with("consent_tokens") => {
                ConsentError::NotFound
            }
            StorageError::ContractViolation(v) => ConsentError::Invalid(v),
            other => ConsentError::Storage(other),
        }
    }
}

impl ConsentError {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            ConsentError::Expired => reason_codes::CONSENT_REFUSE_EXPIRED,
            ConsentError::Revoked => reason_codes::CONSENT_REFUSE_REVOKED,
            ConsentError::NotFound => reason_codes::CONSENT_REFUSE_NOT_FOUND,
            ConsentError::Forbidden(_) => reason_codes::CONSENT_REFUSE_FORBIDDEN,
            ConsentError::ChecksumMismatch => reason_codes::CONSENT_REFUSE_CHECKSUM_MISMATCH,
            ConsentError::Invalid(_) => reason_codes::CONSENT_REFUSE_INVALID,
            ConsentError::Codec(_) | ConsentError::Storage(_) | ConsentError::StoreUnavailable => {
                reason_codes::CONSENT_INTERNAL_ERROR
            }
        }
    }

    /// Wire outcome for expected refusals; `None` for internal failures.
    pub fn outcome(&self) -> Option<&'static str> {
        match self {
            ConsentError::Expired => Some("EXPIRED"),
            ConsentError::Revoked => Some("REVOKED"),
            ConsentError::NotFound => Some("NOT_FOUND"),
            ConsentError::Forbidden(_) => Some("FORBIDDEN"),
            ConsentError::ChecksumMismatch => Some("CHECKSUM_MISMATCH"),
            ConsentError::Invalid(_) => Some("INVALID"),
            ConsentError::Codec(_) | ConsentError::Storage(_) | ConsentError::StoreUnavailable => {
                None
            }
        }
    }

    fn from_state(state: TokenState) -> Option<Self> {
        match state {
            TokenState::Active => None,
            TokenState::Expired => Some(ConsentError::Expired),
            TokenState::Revoked => Some(ConsentError::Revoked),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedConsent {
    pub token_id: TokenId,
    pub encoded_payload: String,
    pub scope: ConsentScope,
    pub record_count: u32,
    pub created_at: UnixTimeNs,
    pub expires_at: UnixTimeNs,
    /// `None` when the ledger could not notarize the grant; the token is valid regardless.
    pub ledger_consent_ref: Option<LedgerRef>,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMetadata {
    pub scope: ConsentScope,
    pub permissions: Vec<ConsentPermission>,
    pub record_count: u32,
    pub facility_id: Option<FacilityId>,
    pub expires_at: UnixTimeNs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentValidation {
    pub valid: bool,
    pub state: Option<TokenState>,
    pub scope_metadata: Option<ScopeMetadata>,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsentAccessResult {
    pub token_id: TokenId,
    pub scope: ConsentScope,
    pub access_count: u64,
    pub event_seq: u64,
    pub last_accessed_at: Option<UnixTimeNs>,
    pub projected_records: Vec<Value>,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRevocation {
    pub token_id: TokenId,
    pub revoked: bool,
    pub newly_revoked: bool,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentHistoryItem {
    pub token_id: TokenId,
    pub scope: ConsentScope,
    pub record_ids: Vec<RecordId>,
    pub facility_id: Option<FacilityId>,
    pub status: TokenState,
    pub access_count: u64,
    pub created_at: UnixTimeNs,
    pub expires_at: UnixTimeNs,
    pub last_accessed_at: Option<UnixTimeNs>,
    pub ledger_consent_ref: Option<LedgerRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentHistoryPage {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub items: Vec<ConsentHistoryItem>,
    pub reason_code: ReasonCodeId,
}

/// Identity derived from an active consent token, for the auth gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentDerivedIdentity {
    pub token_id: TokenId,
    pub owner: Identity,
    pub scope: ConsentScope,
    pub record_ids: Vec<RecordId>,
}

#[derive(Clone)]
pub struct ConsentTokenManager {
    config: ConsentConfig,
    store: SharedStore,
    ledger: Arc<dyn LedgerGateway>,
    audit: LedgerAuditHandle,
}

impl ConsentTokenManager {
    pub fn new(
        config: ConsentConfig,
        store: SharedStore,
        ledger: Arc<dyn LedgerGateway>,
        audit: LedgerAuditHandle,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            audit,
        }
    }

    pub fn config(&self) -> ConsentConfig {
        self.config
    }

    pub fn audit(&self) -> &LedgerAuditHandle {
        &self.audit
    }

    pub async fn issue(
        &self,
        now: UnixTimeNs,
        owner_id: &UserId,
        record_ids: Vec<RecordId>,
        scope: ConsentScope,
        ttl_hours: Option<u32>,
        facility_id: Option<FacilityId>,
    ) -> Result<IssuedConsent, ConsentError> {
        let ttl = ttl_hours
            .unwrap_or(self.config.default_ttl_hours)
            .min(self.config.max_ttl_hours);
        let req = IssueConsentRequest::v1(owner_id.clone(), record_ids, scope, ttl, facility_id)?;

        // Refuse before anything is notarized.
        lock_store(&self.store)?.records_owned_check(&req.owner_id, &req.record_ids)?;

        let token_id = generate_token_id()?;
        let token_fp = token_fingerprint(&token_id);
        let expires_at = now.plus_hours(req.ttl_hours);
        let ledger_consent_ref = self
            .notarize_grant(&token_fp, &req, expires_at)
            .await;

        let token = ConsentToken::v1(
            token_id,
            req.owner_id,
            req.record_ids,
            req.scope,
            req.facility_id,
            now,
            expires_at,
            ledger_consent_ref,
        )?;
        lock_store(&self.store)?.insert_consent_token_row(token.clone())?;

        let bundle = bundle_for(&token, now);
        let encoded_payload = encode_bundle(&bundle)?;
        info!(
            target: "medshare::consent",
            token_fp = %token_fp,
            scope = token.scope.as_str(),
            record_count = bundle.record_count,
            ttl_hours = ttl,
            notarized = token.ledger_consent_ref.is_some(),
            "consent token issued"
        );
        Ok(IssuedConsent {
            token_id: token.token_id,
            encoded_payload,
            scope: token.scope,
            record_count: bundle.record_count,
            created_at: token.created_at,
            expires_at: token.expires_at,
            ledger_consent_ref: token.ledger_consent_ref,
            reason_code: reason_codes::CONSENT_OK_ISSUE,
        })
    }

    async fn notarize_grant(
        &self,
        token_fp: &str,
        req: &IssueConsentRequest,
        expires_at: UnixTimeNs,
    ) -> Option<LedgerRef> {
        let record_ids: Vec<String> = req
            .record_ids
            .iter()
            .map(|r| r.as_str().to_string())
            .collect();
        let permissions: Vec<String> = req
            .scope
            .permissions()
            .into_iter()
            .map(|p| p.as_str().to_string())
            .collect();
        let descriptor = json!({
            "scope": req.scope.as_str(),
            "recordIds": record_ids,
            "permissions": permissions,
            "expiresAt": expires_at.0,
        });
        let envelope = LedgerEnvelope::v1(LedgerPayload::ConsentGrant(ConsentGrantEntry {
            token_fingerprint: token_fp.to_string(),
            scope: req.scope.as_str().to_string(),
            record_ids,
            permissions,
            expires_at_ns: expires_at.0,
            descriptor_hash: canonical_hash(&descriptor).as_str().to_string(),
        }));
        let bytes = match envelope.to_json_bytes() {
            Ok(b) => b,
            Err(err) => {
                warn!(target: "medshare::consent", token_fp, error = %err, "consent grant payload encoding failed");
                return None;
            }
        };
        match self.ledger.submit(&bytes).await {
            Ok(receipt) => Some(receipt.ledger_ref),
            Err(err) => {
                warn!(target: "medshare::consent", token_fp, error = %err, "consent grant not notarized; issuing without ledger ref");
                None
            }
        }
    }

    /// Maps a raw token id or an encoded bundle onto a stored token id.
    pub fn resolve_presented(&self, presented: &str) -> Result<TokenId, ConsentError> {
        let parsed = parse_presented(presented).map_err(|_| ConsentError::ChecksumMismatch)?;
        match parsed {
            PresentedToken::RawId(token_id) => Ok(token_id),
            PresentedToken::Bundle { token_id, bundle } => {
                let store = lock_store(&self.store)?;
                let token = store
                    .consent_token_row(&token_id)
                    .ok_or(ConsentError::NotFound)?;
                if !bundle_matches(&bundle, token) {
                    warn!(target: "medshare::consent", token_fp = %token_fingerprint(&token_id), "consent bundle checksum mismatch");
                    return Err(ConsentError::ChecksumMismatch);
                }
                Ok(token_id)
            }
        }
    }

    /// Read-only; never touches the access counter.
    pub fn validate(&self, now: UnixTimeNs, presented: &str) -> Result<ConsentValidation, ConsentError> {
        let token_id = match self.resolve_presented(presented) {
            Ok(id) => id,
            Err(ConsentError::StoreUnavailable) => return Err(ConsentError::StoreUnavailable),
            Err(e) => {
                return Ok(ConsentValidation {
                    valid: false,
                    state: None,
                    scope_metadata: None,
                    reason_code: e.reason_code(),
                })
            }
        };
        let store = lock_store(&self.store)?;
        let Some(token) = store.consent_token_row(&token_id) else {
            return Ok(ConsentValidation {
                valid: false,
                state: None,
                scope_metadata: None,
                reason_code: reason_codes::CONSENT_REFUSE_NOT_FOUND,
            });
        };
        let state = token.state_at(now);
        let reason_code = ConsentError::from_state(state)
            .map(|e| e.reason_code())
            .unwrap_or(reason_codes::CONSENT_OK_VALIDATE);
        Ok(ConsentValidation {
            valid: state == TokenState::Active,
            state: Some(state),
            scope_metadata: Some(ScopeMetadata {
                scope: token.scope,
                permissions: token.permissions.clone(),
                record_count: u32::try_from(token.record_ids.len()).unwrap_or(u32::MAX),
                facility_id: token.facility_id.clone(),
                expires_at: token.expires_at,
            }),
            reason_code,
        })
    }

    pub async fn access(
        &self,
        now: UnixTimeNs,
        presented: &str,
        ctx: AccessContext,
    ) -> Result<ConsentAccessResult, ConsentError> {
        let token_id = self.resolve_presented(presented)?;
        let token_fp = token_fingerprint(&token_id);
        let gate = lock_store(&self.store)?.consent_access_commit_row(now, &token_id, ctx)?;
        let grant = match gate {
            ConsentAccessGate::Granted(grant) => grant,
            ConsentAccessGate::NotFound => return Err(ConsentError::NotFound),
            ConsentAccessGate::Expired => {
                info!(target: "medshare::consent", token_fp = %token_fp, "access refused: token expired");
                return Err(ConsentError::Expired);
            }
            ConsentAccessGate::Revoked => {
                info!(target: "medshare::consent", token_fp = %token_fp, "access refused: token revoked");
                return Err(ConsentError::Revoked);
            }
        };

        let scope = grant.token.scope;
        let projected_records = grant
            .records
            .iter()
            .map(|row| {
                project_record(
                    scope,
                    ProjectionSource {
                        record_id: row.record_id.as_str(),
                        patient_id: row.owner_id.as_str(),
                        category: row.category.as_str(),
                        content: &row.content,
                    },
                )
            })
            .collect();

        self.audit.enqueue(LedgerAuditJob::AccessLog {
            token_id: token_id.clone(),
            entry: AccessLogEntry {
                token_fingerprint: token_fp.clone(),
                event_seq: grant.event.event_seq,
                accessor_id: grant.event.accessor_id.clone(),
                facility_id: grant
                    .event
                    .facility_id
                    .as_ref()
                    .map(|f| f.as_str().to_string()),
                purpose: grant.event.purpose.clone(),
                timestamp_ns: now.0,
            },
        });
        info!(
            target: "medshare::consent",
            token_fp = %token_fp,
            event_seq = grant.event.event_seq,
            access_count = grant.token.access_count,
            scope = scope.as_str(),
            "consent access granted"
        );
        Ok(ConsentAccessResult {
            token_id,
            scope,
            access_count: grant.token.access_count,
            event_seq: grant.event.event_seq,
            last_accessed_at: grant.token.last_accessed_at,
            projected_records,
            reason_code: reason_codes::CONSENT_OK_ACCESS,
        })
    }

    /// Owner or admin only. Repeating a revoke succeeds without a second ledger marker.
    pub fn revoke(
        &self,
        now: UnixTimeNs,
        presented: &str,
        requester: &Identity,
    ) -> Result<ConsentRevocation, ConsentError> {
        let token_id = self.resolve_presented(presented)?;
        let outcome = {
            let mut store = lock_store(&self.store)?;
            let token = store
                .consent_token_row(&token_id)
                .ok_or(ConsentError::NotFound)?;
            if token.owner_id != requester.user_id && !requester.is_admin() {
                return Err(ConsentError::Forbidden(
                    "only the owner or an admin may revoke".to_string(),
                ));
            }
            store.consent_revoke_commit_row(&token_id)?
        };

        let token_fp = token_fingerprint(&token_id);
        if outcome.newly_revoked {
            self.audit.enqueue(LedgerAuditJob::Revocation {
                token_id: token_id.clone(),
                entry: RevocationEntry {
                    token_fingerprint: token_fp.clone(),
                    revoked_by: requester.user_id.as_str().to_string(),
                    timestamp_ns: now.0,
                },
            });
            info!(target: "medshare::consent", token_fp = %token_fp, revoked_by = %requester.user_id.as_str(), "consent token revoked");
        } else {
            debug!(target: "medshare::consent", token_fp = %token_fp, "consent token already revoked");
        }
        Ok(ConsentRevocation {
            token_id,
            revoked: outcome.token.revoked,
            newly_revoked: outcome.newly_revoked,
            reason_code: reason_codes::CONSENT_OK_REVOKE,
        })
    }

    /// Newest first. `page` is 1-based.
    pub fn history(
        &self,
        now: UnixTimeNs,
        owner_id: &UserId,
        page: Option<u32>,
        page_size: Option<u32>,
    ) -> Result<ConsentHistoryPage, ConsentError> {
        let page = page.unwrap_or(1);
        if page == 0 {
            return Err(ConsentError::Invalid(ContractViolation::InvalidRange {
                field: "history.page",
                min: 1,
                max: u64::from(u32::MAX),
                got: 0,
            }));
        }
        let page_size = page_size.unwrap_or(HISTORY_DEFAULT_PAGE_SIZE);
        if !(1..=HISTORY_MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ConsentError::Invalid(ContractViolation::InvalidRange {
                field: "history.page_size",
                min: 1,
                max: u64::from(HISTORY_MAX_PAGE_SIZE),
                got: u64::from(page_size),
            }));
        }

        let store = lock_store(&self.store)?;
        let tokens = store.consent_token_rows_for_owner(owner_id);
        let skip = (page as usize - 1).saturating_mul(page_size as usize);
        let items = tokens
            .iter()
            .skip(skip)
            .take(page_size as usize)
            .map(|t| ConsentHistoryItem {
                token_id: t.token_id.clone(),
                scope: t.scope,
                record_ids: t.record_ids.clone(),
                facility_id: t.facility_id.clone(),
                status: t.state_at(now),
                access_count: t.access_count,
                created_at: t.created_at,
                expires_at: t.expires_at,
                last_accessed_at: t.last_accessed_at,
                ledger_consent_ref: t.ledger_consent_ref.clone(),
            })
            .collect();
        Ok(ConsentHistoryPage {
            page,
            page_size,
            total: tokens.len() as u64,
            items,
            reason_code: reason_codes::CONSENT_OK_HISTORY,
        })
    }

    pub fn access_log(
        &self,
        requester: &Identity,
        presented: &str,
    ) -> Result<Vec<AccessEvent>, ConsentError> {
        let token_id = self.resolve_presented(presented)?;
        let store = lock_store(&self.store)?;
        let token = store
            .consent_token_row(&token_id)
            .ok_or(ConsentError::NotFound)?;
        if token.owner_id != requester.user_id && !requester.is_admin() {
            return Err(ConsentError::Forbidden(
                "only the owner or an admin may read the access log".to_string(),
            ));
        }
        Ok(store
            .access_event_rows_for_token(&token_id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn consent_identity(
        &self,
        now: UnixTimeNs,
        presented: &str,
    ) -> Result<ConsentDerivedIdentity, ConsentError> {
        let token_id = self.resolve_presented(presented)?;
        let store = lock_store(&self.store)?;
        let token = store
            .consent_token_row(&token_id)
            .ok_or(ConsentError::NotFound)?;
        if let Some(refusal) = ConsentError::from_state(token.state_at(now)) {
            return Err(refusal);
        }
        Ok(ConsentDerivedIdentity {
            token_id: token.token_id.clone(),
            owner: Identity::new(token.owner_id.clone(), Role::Patient),
            scope: token.scope,
            record_ids: token.record_ids.clone(),
        })
    }
}
