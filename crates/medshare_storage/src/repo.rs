#![forbid(unsafe_code)]

use medshare_kernel_contracts::consent::{AccessContext, AccessEvent, ConsentToken, TokenId};
use medshare_kernel_contracts::identity::UserId;
use medshare_kernel_contracts::integrity::{CanonicalHash, IntegrityAnchor, LedgerRef};
use medshare_kernel_contracts::record::{RecordCategory, RecordId};
use medshare_kernel_contracts::UnixTimeNs;
use serde_json::Value;

use crate::store::{
    CareStore, ConsentAccessGate, ConsentRevokeOutcome, MedicalRecordRow, RecordUpsertOutcome,
    StorageError,
};

/// Typed repository interface for medical record persistence.
pub trait MedicalRecordsRepo {
    fn record_upsert_row(
        &mut self,
        now: UnixTimeNs,
        owner_id: UserId,
        record_id: RecordId,
        category: RecordCategory,
        content: Value,
        content_hash: CanonicalHash,
    ) -> Result<RecordUpsertOutcome, StorageError>;
    fn record_row(&self, record_id: &RecordId) -> Option<&MedicalRecordRow>;
    fn record_rows_by_owner(&self, owner_id: &UserId) -> Vec<&MedicalRecordRow>;
    fn record_attach_ledger_ref_row(
        &mut self,
        record_id: &RecordId,
        anchored_hash: &CanonicalHash,
        ledger_ref: LedgerRef,
    ) -> Result<bool, StorageError>;
}

/// Typed repository interface for append-only integrity anchors.
pub trait IntegrityAnchorsRepo {
    fn append_integrity_anchor_row(&mut self, anchor: IntegrityAnchor)
        -> Result<u64, StorageError>;
    fn integrity_anchor_rows(&self) -> &[IntegrityAnchor];
    fn integrity_anchor_rows_for_record(&self, record_id: &RecordId) -> Vec<&IntegrityAnchor>;
    fn integrity_anchor_row_by_ref(&self, ledger_ref: &LedgerRef) -> Option<&IntegrityAnchor>;
}

/// Typed repository interface for consent tokens and their access events.
pub trait ConsentTokensRepo {
    fn insert_consent_token_row(&mut self, token: ConsentToken) -> Result<(), StorageError>;
    fn consent_token_row(&self, token_id: &TokenId) -> Option<&ConsentToken>;
    fn consent_token_rows_for_owner(&self, owner_id: &UserId) -> Vec<&ConsentToken>;
    fn consent_access_commit_row(
        &mut self,
        now: UnixTimeNs,
        token_id: &TokenId,
        ctx: AccessContext,
    ) -> Result<ConsentAccessGate, StorageError>;
    fn consent_revoke_commit_row(
        &mut self,
        token_id: &TokenId,
    ) -> Result<ConsentRevokeOutcome, StorageError>;
    fn consent_attach_revocation_ref_row(
        &mut self,
        token_id: &TokenId,
        ledger_ref: LedgerRef,
    ) -> Result<(), StorageError>;
    fn access_event_rows_for_token(&self, token_id: &TokenId) -> Vec<&AccessEvent>;
    fn access_event_attach_ledger_ref_row(
        &mut self,
        token_id: &TokenId,
        event_seq: u64,
        ledger_ref: LedgerRef,
    ) -> Result<(), StorageError>;
}

impl MedicalRecordsRepo for CareStore {
    fn record_upsert_row(
        &mut self,
        now: UnixTimeNs,
        owner_id: UserId,
        record_id: RecordId,
        category: RecordCategory,
        content: Value,
        content_hash: CanonicalHash,
    ) -> Result<RecordUpsertOutcome, StorageError> {
        self.record_upsert(now, owner_id, record_id, category, content, content_hash)
    }

    fn record_row(&self, record_id: &RecordId) -> Option<&MedicalRecordRow> {
        self.record(record_id)
    }

    fn record_rows_by_owner(&self, owner_id: &UserId) -> Vec<&MedicalRecordRow> {
        self.records_by_owner(owner_id)
    }

    fn record_attach_ledger_ref_row(
        &mut self,
        record_id: &RecordId,
        anchored_hash: &CanonicalHash,
        ledger_ref: LedgerRef,
    ) -> Result<bool, StorageError> {
        self.record_attach_ledger_ref(record_id, anchored_hash, ledger_ref)
    }
}

impl IntegrityAnchorsRepo for CareStore {
    fn append_integrity_anchor_row(
        &mut self,
        anchor: IntegrityAnchor,
    ) -> Result<u64, StorageError> {
        self.integrity_anchor_append(anchor)
    }

    fn integrity_anchor_rows(&self) -> &[IntegrityAnchor] {
        self.integrity_anchors()
    }

    fn integrity_anchor_rows_for_record(&self, record_id: &RecordId) -> Vec<&IntegrityAnchor> {
        self.integrity_anchors_for_record(record_id)
    }

    fn integrity_anchor_row_by_ref(&self, ledger_ref: &LedgerRef) -> Option<&IntegrityAnchor> {
        self.integrity_anchor_by_ref(ledger_ref)
    }
}

impl ConsentTokensRepo for CareStore {
    fn insert_consent_token_row(&mut self, token: ConsentToken) -> Result<(), StorageError> {
        self.consent_token_insert(token)
    }

    fn consent_token_row(&self, token_id: &TokenId) -> Option<&ConsentToken> {
        self.consent_token(token_id)
    }

    fn consent_token_rows_for_owner(&self, owner_id: &UserId) -> Vec<&ConsentToken> {
        self.consent_tokens_for_owner(owner_id)
    }

    fn consent_access_commit_row(
        &mut self,
        now: UnixTimeNs,
        token_id: &TokenId,
        ctx: AccessContext,
    ) -> Result<ConsentAccessGate, StorageError> {
        self.consent_access_commit(now, token_id, ctx)
    }

    fn consent_revoke_commit_row(
        &mut self,
        token_id: &TokenId,
    ) -> Result<ConsentRevokeOutcome, StorageError> {
        self.consent_revoke_commit(token_id)
    }

    fn consent_attach_revocation_ref_row(
        &mut self,
        token_id: &TokenId,
        ledger_ref: LedgerRef,
    ) -> Result<(), StorageError> {
        self.consent_attach_revocation_ref(token_id, ledger_ref)
    }

    fn access_event_rows_for_token(&self, token_id: &TokenId) -> Vec<&AccessEvent> {
        self.access_events_for_token(token_id)
    }

    fn access_event_attach_ledger_ref_row(
        &mut self,
        token_id: &TokenId,
        event_seq: u64,
        ledger_ref: LedgerRef,
    ) -> Result<(), StorageError> {
        self.access_event_attach_ledger_ref(token_id, event_seq, ledger_ref)
    }
}
