#![forbid(unsafe_code)]

use std::sync::Arc;

use medshare_engines::canonical::canonical_hash;
use medshare_engines::ledger::{LedgerError, LedgerGateway};
use medshare_kernel_contracts::identity::UserId;
use medshare_kernel_contracts::integrity::{
    CanonicalHash, IntegrityAnchor, LedgerRef, VerificationStatus,
};
use medshare_kernel_contracts::ledger::{
    AnchorEntry, LedgerEnvelope, LedgerPayload, LedgerPayloadError,
};
use medshare_kernel_contracts::record::{RecordCategory, RecordId};
use medshare_kernel_contracts::{ContractViolation, ReasonCodeId, UnixTimeNs};
use medshare_storage::repo::{IntegrityAnchorsRepo, MedicalRecordsRepo};
use medshare_storage::store::StorageError;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::{lock_store, SharedStore, StoreLockPoisoned};

pub mod reason_codes {
    use medshare_kernel_contracts::ReasonCodeId;

    pub const INTEGRITY_OK_ANCHORED: ReasonCodeId = ReasonCodeId(0x4941_0001);
    pub const INTEGRITY_OK_ANCHOR_PENDING: ReasonCodeId = ReasonCodeId(0x4941_0002);
    pub const INTEGRITY_OK_VERIFIED: ReasonCodeId = ReasonCodeId(0x4941_0003);
    pub const INTEGRITY_REFUSE_TAMPERED: ReasonCodeId = ReasonCodeId(0x4941_00F1);
    pub const INTEGRITY_REFUSE_NOT_FOUND: ReasonCodeId = ReasonCodeId(0x4941_00F2);
    pub const INTEGRITY_REFUSE_UNAVAILABLE: ReasonCodeId = ReasonCodeId(0x4941_00F3);
    pub const INTEGRITY_REFUSE_NOT_ANCHORED: ReasonCodeId = ReasonCodeId(0x4941_00F4);
    pub const INTEGRITY_REFUSE_FORBIDDEN: ReasonCodeId = ReasonCodeId(0x4941_00F5);
    pub const INTEGRITY_REFUSE_INVALID: ReasonCodeId = ReasonCodeId(0x4941_00F6);
    pub const INTEGRITY_INTERNAL_ERROR: ReasonCodeId = ReasonCodeId(0x4941_00FF);
}

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("ledger payload: {0}")]
    Payload(#[from] LedgerPayloadError),
    #[error("invalid input: {0}")]
    Invalid(#[from] ContractViolation),
    #[error("record {0} belongs to another subject")]
    Forbidden(String),
    #[error("record {0} not found")]
    NotFound(String),
    #[error("storage: {0}")]
    Storage(StorageError),
    #[error("care store lock poisoned")]
    StoreUnavailable,
}

impl From<StoreLockPoisoned> for AnchorError {
    fn from(_: StoreLockPoisoned) -> Self {
        AnchorError::StoreUnavailable
    }
}

impl From<StorageError> for AnchorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::OwnerMismatch { key, .. } => AnchorError::Forbidden(key),
            StorageError::ContractViolation(v) => AnchorError::Invalid(v),
            other => AnchorError::Storage(other),
        }
    }
}

impl AnchorError {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            AnchorError::Ledger(_) => reason_codes::INTEGRITY_REFUSE_UNAVAILABLE,
            AnchorError::Invalid(_) | AnchorError::Payload(_) => {
                reason_codes::INTEGRITY_REFUSE_INVALID
            }
            AnchorError::Forbidden(_) => reason_codes::INTEGRITY_REFUSE_FORBIDDEN,
            AnchorError::NotFound(_) => reason_codes::INTEGRITY_REFUSE_NOT_FOUND,
            AnchorError::Storage(_) | AnchorError::StoreUnavailable => {
                reason_codes::INTEGRITY_INTERNAL_ERROR
            }
        }
    }
}

pub fn verification_reason_code(status: VerificationStatus) -> ReasonCodeId {
    match status {
        VerificationStatus::Verified => reason_codes::INTEGRITY_OK_VERIFIED,
        VerificationStatus::Tampered => reason_codes::INTEGRITY_REFUSE_TAMPERED,
        VerificationStatus::NotFound => reason_codes::INTEGRITY_REFUSE_NOT_FOUND,
        VerificationStatus::Unavailable => reason_codes::INTEGRITY_REFUSE_UNAVAILABLE,
        VerificationStatus::NotAnchored => reason_codes::INTEGRITY_REFUSE_NOT_ANCHORED,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorState {
    Anchored,
    /// Persisted, but the ledger write failed; the record has no ledger ref yet.
    AnchorPending,
}

impl AnchorState {
    pub fn as_str(self) -> &'static str {
        match self {
            AnchorState::Anchored => "anchored",
            AnchorState::AnchorPending => "anchor_pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpsertReport {
    pub record_id: RecordId,
    pub content_hash: CanonicalHash,
    pub anchor_state: AnchorState,
    pub ledger_ref: Option<LedgerRef>,
    pub was_new: bool,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVerification {
    pub record_id: RecordId,
    pub status: VerificationStatus,
    pub current_hash: Option<CanonicalHash>,
    pub ledger_ref: Option<LedgerRef>,
}

/// Canonical hashing plus anchoring and verification through the ledger.
#[derive(Clone)]
pub struct DataIntegrityAnchor {
    store: SharedStore,
    ledger: Arc<dyn LedgerGateway>,
}

impl DataIntegrityAnchor {
    pub fn new(store: SharedStore, ledger: Arc<dyn LedgerGateway>) -> Self {
        Self { store, ledger }
    }

    pub fn hash(&self, record: &Value) -> CanonicalHash {
        canonical_hash(record)
    }

    /// Hash of everything stored for a record, so a category-only edit is a
    /// change too.
    pub fn record_hash(&self, category: &RecordCategory, content: &Value) -> CanonicalHash {
        self.hash(&json!({
            "category": category.as_str(),
            "content": content,
        }))
    }

    /// Publishes `hash` and persists the resulting anchor. The caller decides
    /// what a failure means; nothing is retried here.
    pub async fn anchor(
        &self,
        subject_id: &UserId,
        record_id: &RecordId,
        hash: &CanonicalHash,
        now: UnixTimeNs,
    ) -> Result<IntegrityAnchor, AnchorError> {
        let envelope = LedgerEnvelope::v1(LedgerPayload::IntegrityAnchor(AnchorEntry {
            subject_id: subject_id.as_str().to_string(),
            record_id: record_id.as_str().to_string(),
            hash: hash.as_str().to_string(),
            timestamp_ns: now.0,
        }));
        let receipt = self.ledger.submit(&envelope.to_json_bytes()?).await?;
        let anchor = IntegrityAnchor::v1(
            subject_id.clone(),
            record_id.clone(),
            hash.clone(),
            receipt.ledger_ref,
            now,
        )?;
        lock_store(&self.store)?.append_integrity_anchor_row(anchor.clone())?;
        info!(
            target: "medshare::integrity",
            record_id = %record_id.as_str(),
            ledger_ref = %anchor.ledger_ref.as_str(),
            block_height = receipt.block_height,
            "record hash anchored"
        );
        Ok(anchor)
    }

    /// `Unavailable` is reported only when the check itself could not run.
    pub async fn verify(
        &self,
        ledger_ref: &LedgerRef,
        current_hash: &CanonicalHash,
    ) -> VerificationStatus {
        let value = match self.ledger.fetch(ledger_ref).await {
            Ok(v) => v,
            Err(LedgerError::NotFound) => return VerificationStatus::NotFound,
            Err(err) => {
                warn!(target: "medshare::integrity", ledger_ref = %ledger_ref.as_str(), error = %err, "integrity verification could not reach ledger");
                return VerificationStatus::Unavailable;
            }
        };
        match LedgerEnvelope::from_json_value(&value) {
            Ok(LedgerEnvelope {
                payload: LedgerPayload::IntegrityAnchor(entry),
                ..
            }) => {
                if entry.hash == current_hash.as_str() {
                    VerificationStatus::Verified
                } else {
                    warn!(target: "medshare::integrity", ledger_ref = %ledger_ref.as_str(), "anchored hash differs from current content");
                    VerificationStatus::Tampered
                }
            }
            Ok(_) | Err(_) => VerificationStatus::NotFound,
        }
    }

    /// Stores the record, then anchors it best-effort. A ledger failure leaves
    /// the record persisted with `anchor_pending`.
    pub async fn record_upsert(
        &self,
        now: UnixTimeNs,
        owner_id: &UserId,
        record_id: &RecordId,
        category: RecordCategory,
        content: Value,
    ) -> Result<RecordUpsertReport, AnchorError> {
        let content_hash = self.record_hash(&category, &content);
        let outcome = lock_store(&self.store)?.record_upsert_row(
            now,
            owner_id.clone(),
            record_id.clone(),
            category,
            content,
            content_hash.clone(),
        )?;

        if let Some(existing) = outcome.row.ledger_ref.clone() {
            return Ok(RecordUpsertReport {
                record_id: record_id.clone(),
                content_hash,
                anchor_state: AnchorState::Anchored,
                ledger_ref: Some(existing),
                was_new: outcome.was_new,
                reason_code: reason_codes::INTEGRITY_OK_ANCHORED,
            });
        }

        match self.anchor(owner_id, record_id, &content_hash, now).await {
            Ok(anchor) => {
                let attached = lock_store(&self.store)?.record_attach_ledger_ref_row(
                    record_id,
                    &content_hash,
                    anchor.ledger_ref.clone(),
                )?;
                if !attached {
                    info!(target: "medshare::integrity", record_id = %record_id.as_str(), "record changed while anchoring; newer write owns the ref");
                }
                Ok(RecordUpsertReport {
                    record_id: record_id.clone(),
                    content_hash,
                    anchor_state: AnchorState::Anchored,
                    ledger_ref: Some(anchor.ledger_ref),
                    was_new: outcome.was_new,
                    reason_code: reason_codes::INTEGRITY_OK_ANCHORED,
                })
            }
            Err(AnchorError::Ledger(err)) => {
                warn!(target: "medshare::integrity", record_id = %record_id.as_str(), error = %err, "anchoring failed; record stored without ledger ref");
                Ok(RecordUpsertReport {
                    record_id: record_id.clone(),
                    content_hash,
                    anchor_state: AnchorState::AnchorPending,
                    ledger_ref: None,
                    was_new: outcome.was_new,
                    reason_code: reason_codes::INTEGRITY_OK_ANCHOR_PENDING,
                })
            }
            Err(other) => Err(other),
        }
    }

    pub async fn verify_record(
        &self,
        record_id: &RecordId,
    ) -> Result<RecordVerification, AnchorError> {
        let (current_hash, ledger_ref) = {
            let store = lock_store(&self.store)?;
            match store.record_row(record_id) {
                Some(row) => (
                    self.record_hash(&row.category, &row.content),
                    row.ledger_ref.clone(),
                ),
                None => {
                    return Ok(RecordVerification {
                        record_id: record_id.clone(),
                        status: VerificationStatus::NotFound,
                        current_hash: None,
                        ledger_ref: None,
                    })
                }
            }
        };
        let status = match &ledger_ref {
            Some(r) => self.verify(r, &current_hash).await,
            None => VerificationStatus::NotAnchored,
        };
        Ok(RecordVerification {
            record_id: record_id.clone(),
            status,
            current_hash: Some(current_hash),
            ledger_ref,
        })
    }

    pub fn anchors_for_record(
        &self,
        record_id: &RecordId,
    ) -> Result<Vec<IntegrityAnchor>, AnchorError> {
        let store = lock_store(&self.store)?;
        Ok(store
            .integrity_anchor_rows_for_record(record_id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn record_owner(&self, record_id: &RecordId) -> Result<UserId, AnchorError> {
        let store = lock_store(&self.store)?;
        store
            .record_row(record_id)
            .map(|r| r.owner_id.clone())
            .ok_or_else(|| AnchorError::NotFound(record_id.as_str().to_string()))
    }
}
