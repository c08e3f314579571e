#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use medshare_engines::bearer::{CredentialVerifier, DisabledVerifier, Hs256Verifier};
use medshare_engines::ledger::{build_ledger_gateway, LedgerConfig, LedgerError, LedgerGateway};
use medshare_engines::projection::{project_record, ProjectionSource};
use medshare_kernel_contracts::consent::{AccessContext, AccessEvent, ConsentScope};
use medshare_kernel_contracts::identity::{FacilityId, Identity, Role, UserId};
use medshare_kernel_contracts::integrity::{CanonicalHash, LedgerRef};
use medshare_kernel_contracts::ledger::ConnectionStatus;
use medshare_kernel_contracts::record::{RecordCategory, RecordId};
use medshare_kernel_contracts::{ContractViolation, ReasonCodeId, UnixTimeNs};
use medshare_os::audit_worker::{spawn_ledger_audit_worker, LedgerAuditCounters};
use medshare_os::auth_gate::{reason_codes as auth_reason_codes, AuthResolution, DualModeAuthGate};
use medshare_os::consent::{ConsentConfig, ConsentError, ConsentTokenManager};
use medshare_os::integrity::{verification_reason_code, AnchorError, DataIntegrityAnchor};
use medshare_os::{shared_store, SharedStore};
use medshare_storage::repo::{ConsentTokensRepo, MedicalRecordsRepo};
use medshare_storage::store::{CareStore, MedicalRecordRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub mod reason_codes {
    use medshare_kernel_contracts::ReasonCodeId;

    pub const ADAPTER_OK_INSIGHTS: ReasonCodeId = ReasonCodeId(0xAD70_0001);
    pub const ADAPTER_OK_HEALTH: ReasonCodeId = ReasonCodeId(0xAD70_0002);
    pub const ADAPTER_REFUSE_INVALID: ReasonCodeId = ReasonCodeId(0xAD70_00F1);
    pub const ADAPTER_REFUSE_FORBIDDEN: ReasonCodeId = ReasonCodeId(0xAD70_00F2);
    pub const ADAPTER_INTERNAL_ERROR: ReasonCodeId = ReasonCodeId(0xAD70_00FF);
}

const DEFAULT_SHARE_TYPE: ConsentScope = ConsentScope::Summary;
const INSIGHTS_ACCESSOR: &str = "consent_holder";
const INSIGHTS_PURPOSE: &str = "shared_insights";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("caller is not authenticated")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Consent(#[from] ConsentError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error("ledger setup failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("care store lock poisoned")]
    StoreUnavailable,
}

impl From<ContractViolation> for AdapterError {
    fn from(v: ContractViolation) -> Self {
        AdapterError::Invalid(v.to_string())
    }
}

impl AdapterError {
    pub fn http_status(&self) -> u16 {
        match self {
            AdapterError::Unauthenticated => 401,
            AdapterError::Forbidden(_) => 403,
            AdapterError::Invalid(_) => 400,
            AdapterError::Consent(e) => match e {
                ConsentError::Expired | ConsentError::Revoked => 410,
                ConsentError::NotFound => 404,
                ConsentError::Forbidden(_) => 403,
                ConsentError::ChecksumMismatch | ConsentError::Invalid(_) => 400,
                ConsentError::Codec(_) | ConsentError::Storage(_) | ConsentError::StoreUnavailable => 500,
            },
            AdapterError::Anchor(e) => match e {
                AnchorError::Forbidden(_) => 403,
                AnchorError::NotFound(_) => 404,
                AnchorError::Invalid(_) | AnchorError::Payload(_) => 400,
                AnchorError::Ledger(_) => 503,
                AnchorError::Storage(_) | AnchorError::StoreUnavailable => 500,
            },
            AdapterError::Ledger(_) => 503,
            AdapterError::StoreUnavailable => 500,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            AdapterError::Unauthenticated => "UNAUTHENTICATED",
            AdapterError::Forbidden(_) => "FORBIDDEN",
            AdapterError::Invalid(_) => "INVALID",
            AdapterError::Consent(e) => e.outcome().unwrap_or("INTERNAL"),
            AdapterError::Anchor(e) => match e {
                AnchorError::Forbidden(_) => "FORBIDDEN",
                AnchorError::NotFound(_) => "NOT_FOUND",
                AnchorError::Invalid(_) | AnchorError::Payload(_) => "INVALID",
                AnchorError::Ledger(_) => "UNAVAILABLE",
                AnchorError::Storage(_) | AnchorError::StoreUnavailable => "INTERNAL",
            },
            AdapterError::Ledger(_) => "UNAVAILABLE",
            AdapterError::StoreUnavailable => "INTERNAL",
        }
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            AdapterError::Unauthenticated => auth_reason_codes::AUTH_REFUSE_UNAUTHENTICATED,
            AdapterError::Forbidden(_) => reason_codes::ADAPTER_REFUSE_FORBIDDEN,
            AdapterError::Invalid(_) => reason_codes::ADAPTER_REFUSE_INVALID,
            AdapterError::Consent(e) => e.reason_code(),
            AdapterError::Anchor(e) => e.reason_code(),
            AdapterError::Ledger(_) | AdapterError::StoreUnavailable => {
                reason_codes::ADAPTER_INTERNAL_ERROR
            }
        }
    }

    pub fn to_response(&self) -> AdapterErrorResponse {
        AdapterErrorResponse {
            status: "error".to_string(),
            outcome: self.outcome().to_string(),
            reason_code: self.reason_code().hex(),
            reason: Some(self.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason_code: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueConsentAdapterRequest {
    pub record_ids: Vec<String>,
    pub facility_id: Option<String>,
    pub expires_in_hours: Option<u32>,
    pub share_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueConsentAdapterResponse {
    pub status: String,
    pub token: String,
    pub encoded_payload: String,
    pub scope: String,
    pub record_count: u32,
    /// Unix milliseconds.
    pub expires_at: u64,
    pub ledger_consent_ref: Option<String>,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentTokenAdapterRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMetadataDto {
    pub scope: String,
    pub permissions: Vec<String>,
    pub record_count: u32,
    pub facility_id: Option<String>,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateConsentAdapterResponse {
    pub status: String,
    pub valid: bool,
    pub state: Option<String>,
    pub scope_metadata: Option<ScopeMetadataDto>,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConsentAdapterRequest {
    pub token: String,
    pub accessor_id: Option<String>,
    pub facility_id: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConsentAdapterResponse {
    pub status: String,
    pub scope: String,
    pub projected_records: Vec<Value>,
    pub access_count: u64,
    pub event_seq: u64,
    pub reason_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeConsentAdapterResponse {
    pub status: String,
    pub revoked: bool,
    pub newly_revoked: bool,
    pub reason_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentHistoryQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentHistoryRowDto {
    pub token: String,
    pub scope: String,
    pub record_ids: Vec<String>,
    pub facility_id: Option<String>,
    pub state: String,
    pub access_count: u64,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_accessed_at: Option<u64>,
    pub ledger_consent_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentHistoryAdapterResponse {
    pub status: String,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub items: Vec<ConsentHistoryRowDto>,
    pub reason_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEventDto {
    pub event_seq: u64,
    pub accessor_id: String,
    pub facility_id: Option<String>,
    pub purpose: String,
    pub timestamp: u64,
    pub ledger_log_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEventsAdapterResponse {
    pub status: String,
    pub events: Vec<AccessEventDto>,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpsertAdapterRequest {
    pub record_id: String,
    pub category: String,
    pub content: Value,
    /// Only staff may write on behalf of another owner.
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpsertAdapterResponse {
    pub status: String,
    pub record_id: String,
    pub content_hash: String,
    pub anchor_state: String,
    pub ledger_ref: Option<String>,
    pub was_new: bool,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityVerifyAdapterRequest {
    pub ledger_ref: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityVerifyAdapterResponse {
    pub status: String,
    pub verification: String,
    pub record_id: Option<String>,
    pub current_hash: Option<String>,
    pub ledger_ref: Option<String>,
    pub reason_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedInsightsAdapterResponse {
    pub status: String,
    pub mode: String,
    pub subject_id: String,
    pub scope: String,
    pub record_count: u32,
    pub categories: BTreeMap<String, u32>,
    pub records: Vec<Value>,
    pub reason_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub ledger: ConnectionStatus,
    pub ledger_can_submit: bool,
    pub audit: LedgerAuditCounters,
    pub reason_code: String,
}

#[derive(Clone)]
pub struct AdapterRuntime {
    store: SharedStore,
    ledger: Arc<dyn LedgerGateway>,
    consent: ConsentTokenManager,
    anchor: DataIntegrityAnchor,
    gate: DualModeAuthGate,
}

impl AdapterRuntime {
    /// Spawns the ledger audit worker, so it must run inside a tokio runtime.
    pub fn new(
        store: SharedStore,
        ledger: Arc<dyn LedgerGateway>,
        verifier: Arc<dyn CredentialVerifier>,
        consent_config: ConsentConfig,
    ) -> Self {
        let (audit, _worker) = spawn_ledger_audit_worker(store.clone(), ledger.clone());
        let consent = ConsentTokenManager::new(consent_config, store.clone(), ledger.clone(), audit);
        let anchor = DataIntegrityAnchor::new(store.clone(), ledger.clone());
        let gate = DualModeAuthGate::new(verifier, consent.clone());
        Self {
            store,
            ledger,
            consent,
            anchor,
            gate,
        }
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let ledger_config = LedgerConfig::from_env();
        let ledger = build_ledger_gateway(&ledger_config)?;
        info!(
            target: "medshare::ledger",
            mode = ledger_config.mode.as_str(),
            can_submit = ledger.can_submit(),
            "ledger gateway configured"
        );
        let verifier: Arc<dyn CredentialVerifier> = match env::var("MEDSHARE_AUTH_HS256_SECRET")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            Some(secret) => Arc::new(Hs256Verifier::new(secret.into_bytes())),
            None => {
                warn!(target: "medshare::auth", "MEDSHARE_AUTH_HS256_SECRET unset; bearer credentials will be rejected");
                Arc::new(DisabledVerifier)
            }
        };
        Ok(Self::new(
            shared_store(CareStore::new_in_memory()),
            ledger,
            verifier,
            ConsentConfig::from_env(),
        ))
    }

    fn require_identity(&self, now: UnixTimeNs, bearer: Option<&str>) -> Result<Identity, AdapterError> {
        match self.gate.resolve(now, bearer, None) {
            AuthResolution::Authenticated(identity) => Ok(identity),
            _ => Err(AdapterError::Unauthenticated),
        }
    }

    pub async fn issue_consent(
        &self,
        now_ns: Option<u64>,
        bearer: Option<&str>,
        request: IssueConsentAdapterRequest,
    ) -> Result<IssueConsentAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let identity = self.require_identity(now, bearer)?;
        let scope = match request.share_type.as_deref() {
            None => DEFAULT_SHARE_TYPE,
            Some(raw) => ConsentScope::parse(raw)
                .ok_or_else(|| AdapterError::Invalid(format!("unknown shareType '{raw}'")))?,
        };
        let record_ids = request
            .record_ids
            .into_iter()
            .map(RecordId::new)
            .collect::<Result<Vec<_>, _>>()?;
        let facility_id = request.facility_id.map(FacilityId::new).transpose()?;

        let issued = self
            .consent
            .issue(
                now,
                &identity.user_id,
                record_ids,
                scope,
                request.expires_in_hours,
                facility_id,
            )
            .await?;
        Ok(IssueConsentAdapterResponse {
            status: "ok".to_string(),
            token: issued.token_id.as_str().to_string(),
            encoded_payload: issued.encoded_payload,
            scope: issued.scope.as_str().to_string(),
            record_count: issued.record_count,
            expires_at: unix_ms(issued.expires_at),
            ledger_consent_ref: issued.ledger_consent_ref.map(String::from),
            reason_code: issued.reason_code.hex(),
        })
    }

    pub fn validate_consent(
        &self,
        now_ns: Option<u64>,
        request: ConsentTokenAdapterRequest,
    ) -> Result<ValidateConsentAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let v = self.consent.validate(now, &request.token)?;
        Ok(ValidateConsentAdapterResponse {
            status: "ok".to_string(),
            valid: v.valid,
            state: v.state.map(|s| s.as_str().to_string()),
            scope_metadata: v.scope_metadata.map(|m| ScopeMetadataDto {
                scope: m.scope.as_str().to_string(),
                permissions: m.permissions.iter().map(|p| p.as_str().to_string()).collect(),
                record_count: m.record_count,
                facility_id: m.facility_id.map(|f| f.as_str().to_string()),
                expires_at: unix_ms(m.expires_at),
            }),
            reason_code: v.reason_code.hex(),
        })
    }

    pub async fn access_consent(
        &self,
        now_ns: Option<u64>,
        request: AccessConsentAdapterRequest,
    ) -> Result<AccessConsentAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let facility_id = request.facility_id.map(FacilityId::new).transpose()?;
        let ctx = AccessContext::v1(request.accessor_id, facility_id, request.purpose)?;
        let out = self.consent.access(now, &request.token, ctx).await?;
        Ok(AccessConsentAdapterResponse {
            status: "ok".to_string(),
            scope: out.scope.as_str().to_string(),
            projected_records: out.projected_records,
            access_count: out.access_count,
            event_seq: out.event_seq,
            reason_code: out.reason_code.hex(),
        })
    }

    pub fn revoke_consent(
        &self,
        now_ns: Option<u64>,
        bearer: Option<&str>,
        request: ConsentTokenAdapterRequest,
    ) -> Result<RevokeConsentAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let identity = self.require_identity(now, bearer)?;
        let out = self.consent.revoke(now, &request.token, &identity)?;
        Ok(RevokeConsentAdapterResponse {
            status: "ok".to_string(),
            revoked: out.revoked,
            newly_revoked: out.newly_revoked,
            reason_code: out.reason_code.hex(),
        })
    }

    pub fn consent_history(
        &self,
        now_ns: Option<u64>,
        bearer: Option<&str>,
        query: ConsentHistoryQuery,
    ) -> Result<ConsentHistoryAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let identity = self.require_identity(now, bearer)?;
        let page = self
            .consent
            .history(now, &identity.user_id, query.page, query.page_size)?;
        Ok(ConsentHistoryAdapterResponse {
            status: "ok".to_string(),
            page: page.page,
            page_size: page.page_size,
            total: page.total,
            items: page
                .items
                .into_iter()
                .map(|t| ConsentHistoryRowDto {
                    token: t.token_id.as_str().to_string(),
                    scope: t.scope.as_str().to_string(),
                    record_ids: t.record_ids.iter().map(|r| r.as_str().to_string()).collect(),
                    facility_id: t.facility_id.map(|f| f.as_str().to_string()),
                    state: t.status.as_str().to_string(),
                    access_count: t.access_count,
                    created_at: unix_ms(t.created_at),
                    expires_at: unix_ms(t.expires_at),
                    last_accessed_at: t.last_accessed_at.map(unix_ms),
                    ledger_consent_ref: t.ledger_consent_ref.map(String::from),
                })
                .collect(),
            reason_code: page.reason_code.hex(),
        })
    }

    pub fn consent_events(
        &self,
        now_ns: Option<u64>,
        bearer: Option<&str>,
        token: &str,
    ) -> Result<AccessEventsAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let identity = self.require_identity(now, bearer)?;
        let events = self.consent.access_log(&identity, token)?;
        Ok(AccessEventsAdapterResponse {
            status: "ok".to_string(),
            events: events.into_iter().map(access_event_dto).collect(),
            reason_code: medshare_os::consent::reason_codes::CONSENT_OK_ACCESS_LOG.hex(),
        })
    }

    pub async fn upsert_record(
        &self,
        now_ns: Option<u64>,
        bearer: Option<&str>,
        request: RecordUpsertAdapterRequest,
    ) -> Result<RecordUpsertAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let identity = self.require_identity(now, bearer)?;
        let owner_id = match request.owner_id {
            Some(raw) => {
                let owner = UserId::new(raw)?;
                if owner != identity.user_id && identity.role == Role::Patient {
                    return Err(AdapterError::Forbidden(
                        "patients may only write their own records".to_string(),
                    ));
                }
                owner
            }
            None => identity.user_id.clone(),
        };
        let record_id = RecordId::new(request.record_id)?;
        let category = RecordCategory::new(request.category)?;
        let report = self
            .anchor
            .record_upsert(now, &owner_id, &record_id, category, request.content)
            .await?;
        Ok(RecordUpsertAdapterResponse {
            status: "ok".to_string(),
            record_id: report.record_id.as_str().to_string(),
            content_hash: report.content_hash.as_str().to_string(),
            anchor_state: report.anchor_state.as_str().to_string(),
            ledger_ref: report.ledger_ref.map(String::from),
            was_new: report.was_new,
            reason_code: report.reason_code.hex(),
        })
    }

    pub async fn verify_record(
        &self,
        now_ns: Option<u64>,
        bearer: Option<&str>,
        record_id: &str,
    ) -> Result<IntegrityVerifyAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let identity = self.require_identity(now, bearer)?;
        let record_id = RecordId::new(record_id)?;
        if identity.role == Role::Patient {
            match self.anchor.record_owner(&record_id) {
                Ok(owner) if owner != identity.user_id => {
                    return Err(AdapterError::Forbidden(
                        "record belongs to another patient".to_string(),
                    ))
                }
                Ok(_) | Err(AnchorError::NotFound(_)) => {}
                Err(other) => return Err(other.into()),
            }
        }
        let v = self.anchor.verify_record(&record_id).await?;
        Ok(IntegrityVerifyAdapterResponse {
            status: "ok".to_string(),
            verification: v.status.as_str().to_string(),
            record_id: Some(v.record_id.as_str().to_string()),
            current_hash: v.current_hash.map(String::from),
            ledger_ref: v.ledger_ref.map(String::from),
            reason_code: verification_reason_code(v.status).hex(),
        })
    }

    pub async fn verify_integrity(
        &self,
        request: IntegrityVerifyAdapterRequest,
    ) -> Result<IntegrityVerifyAdapterResponse, AdapterError> {
        let ledger_ref = LedgerRef::new(request.ledger_ref)?;
        let hash = CanonicalHash::new(request.hash.to_ascii_lowercase())?;
        let status = self.anchor.verify(&ledger_ref, &hash).await;
        Ok(IntegrityVerifyAdapterResponse {
            status: "ok".to_string(),
            verification: status.as_str().to_string(),
            record_id: None,
            current_hash: Some(hash.as_str().to_string()),
            ledger_ref: Some(ledger_ref.as_str().to_string()),
            reason_code: verification_reason_code(status).hex(),
        })
    }

    /// Dual-mode: a bearer caller sees their own records in full; a consent
    /// holder sees the shared records through the token's scope, and that read
    /// is committed as a consent access like any other.
    pub async fn shared_insights(
        &self,
        now_ns: Option<u64>,
        bearer: Option<&str>,
        consent_token: Option<&str>,
    ) -> Result<SharedInsightsAdapterResponse, AdapterError> {
        let now = resolve_now(now_ns);
        let resolution = self.gate.resolve(now, bearer, consent_token);
        let mode = resolution.mode().to_string();
        let (subject, scope, categories, records) = match resolution {
            AuthResolution::Authenticated(identity) => {
                let store = self
                    .store
                    .lock()
                    .map_err(|_| AdapterError::StoreUnavailable)?;
                let rows = store.record_rows_by_owner(&identity.user_id);
                let records = rows
                    .iter()
                    .map(|row| {
                        project_record(
                            ConsentScope::Full,
                            ProjectionSource {
                                record_id: row.record_id.as_str(),
                                patient_id: row.owner_id.as_str(),
                                category: row.category.as_str(),
                                content: &row.content,
                            },
                        )
                    })
                    .collect::<Vec<_>>();
                let categories = category_counts(&rows);
                (identity.user_id, ConsentScope::Full, categories, records)
            }
            AuthResolution::ConsentDerived {
                owner,
                token_id,
                record_ids,
                ..
            } => {
                let ctx = AccessContext::v1(
                    Some(INSIGHTS_ACCESSOR.to_string()),
                    None,
                    Some(INSIGHTS_PURPOSE.to_string()),
                )?;
                let out = self.consent.access(now, token_id.as_str(), ctx).await?;
                let store = self
                    .store
                    .lock()
                    .map_err(|_| AdapterError::StoreUnavailable)?;
                let rows = record_ids
                    .iter()
                    .filter_map(|id| store.record_row(id))
                    .collect::<Vec<_>>();
                let categories = category_counts(&rows);
                (owner.user_id, out.scope, categories, out.projected_records)
            }
            AuthResolution::Unauthenticated => return Err(AdapterError::Unauthenticated),
        };

        Ok(SharedInsightsAdapterResponse {
            status: "ok".to_string(),
            mode,
            subject_id: subject.as_str().to_string(),
            scope: scope.as_str().to_string(),
            record_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
            categories,
            records,
            reason_code: reason_codes::ADAPTER_OK_INSIGHTS.hex(),
        })
    }

    pub async fn health_report(&self) -> AdapterHealthResponse {
        let ledger = self.ledger.check_connection().await;
        let outcome = if ledger.reachable { "HEALTHY" } else { "DEGRADED" };
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            ledger,
            ledger_can_submit: self.ledger.can_submit(),
            audit: self.consent.audit().counters(),
            reason_code: reason_codes::ADAPTER_OK_HEALTH.hex(),
        }
    }

    /// Waits until every queued ledger audit job has been attempted.
    pub async fn flush_ledger_audit(&self) {
        self.consent.audit().flush().await;
    }

    pub fn revocation_ledger_ref(&self, token: &str) -> Result<Option<String>, AdapterError> {
        let token_id = self.consent.resolve_presented(token)?;
        let store = self
            .store
            .lock()
            .map_err(|_| AdapterError::StoreUnavailable)?;
        Ok(store
            .consent_token_row(&token_id)
            .and_then(|t| t.revocation_ledger_ref.clone())
            .map(String::from))
    }
}

fn category_counts(rows: &[&MedicalRecordRow]) -> BTreeMap<String, u32> {
    let mut categories = BTreeMap::new();
    for row in rows {
        *categories
            .entry(row.category.as_str().to_string())
            .or_insert(0u32) += 1;
    }
    categories
}

fn access_event_dto(e: AccessEvent) -> AccessEventDto {
    AccessEventDto {
        event_seq: e.event_seq,
        accessor_id: e.accessor_id,
        facility_id: e.facility_id.map(|f| f.as_str().to_string()),
        purpose: e.purpose,
        timestamp: unix_ms(e.timestamp),
        ledger_log_ref: e.ledger_log_ref.map(String::from),
    }
}

fn unix_ms(t: UnixTimeNs) -> u64 {
    t.0 / 1_000_000
}

fn resolve_now(now_ns: Option<u64>) -> UnixTimeNs {
    UnixTimeNs(now_ns.unwrap_or_else(system_time_now_ns).max(1))
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

/// `Authorization: Bearer <credential>`; anything else is treated as absent.
pub fn bearer_from_authorization(header: Option<&str>) -> Option<&str> {
    let raw = header?.trim();
    let (scheme, credential) = raw.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(credential.trim()).filter(|c| !c.is_empty())
    } else {
        None
    }
}
