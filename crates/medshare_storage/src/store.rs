#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use medshare_kernel_contracts::consent::{AccessContext, AccessEvent, ConsentToken, TokenId};
use medshare_kernel_contracts::identity::UserId;
use medshare_kernel_contracts::integrity::{CanonicalHash, IntegrityAnchor, LedgerRef};
use medshare_kernel_contracts::record::{RecordCategory, RecordId};
use medshare_kernel_contracts::{ContractViolation, SchemaVersion, UnixTimeNs, Validate};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ForeignKeyViolation { table: &'static str, key: String },
    DuplicateKey { table: &'static str, key: String },
    AppendOnlyViolation { table: &'static str },
    OwnerMismatch { table: &'static str, key: String },
    ContractViolation(ContractViolation),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignKeyViolation { table, key } => {
                write!(f, "foreign key violation on {table}: {key}")
            }
            Self::DuplicateKey { table, key } => write!(f, "duplicate key on {table}: {key}"),
            Self::AppendOnlyViolation { table } => write!(f, "append-only violation on {table}"),
            Self::OwnerMismatch { table, key } => write!(f, "owner mismatch on {table}: {key}"),
            Self::ContractViolation(v) => write!(f, "contract violation: {v}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

/// A medical record as persisted for this core: owner, content and the
/// reference to its newest integrity anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct MedicalRecordRow {
    pub schema_version: SchemaVersion,
    pub record_id: RecordId,
    pub owner_id: UserId,
    pub category: RecordCategory,
    pub content: Value,
    pub content_hash: CanonicalHash,
    pub ledger_ref: Option<LedgerRef>,
    pub created_at: UnixTimeNs,
    pub updated_at: UnixTimeNs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpsertOutcome {
    pub row: MedicalRecordRow,
    pub was_new: bool,
    pub content_changed: bool,
}

/// Result of the conditional access update; expected refusals are not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsentAccessGate {
    Granted(ConsentAccessGrant),
    NotFound,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsentAccessGrant {
    /// Token state after the increment.
    pub token: ConsentToken,
    pub event: AccessEvent,
    /// Snapshot of the shared records taken in the same critical section.
    pub records: Vec<MedicalRecordRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsentRevokeOutcome {
    pub token: ConsentToken,
    pub newly_revoked: bool,
}

#[derive(Debug, Default)]
pub struct CareStore {
    records: BTreeMap<RecordId, MedicalRecordRow>,
    integrity_anchors: Vec<IntegrityAnchor>,
    consent_tokens: BTreeMap<TokenId, ConsentToken>,
    consent_tokens_by_owner: BTreeMap<UserId, Vec<TokenId>>,
    access_events: Vec<AccessEvent>,
}

impl CareStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // medical_records
    // ------------------------------------------------------------------

    /// Ownership is fixed by the first write. A record hash change clears the
    /// ledger reference until the new record is anchored.
    pub fn record_upsert(
        &mut self,
        now: UnixTimeNs,
        owner_id: UserId,
        record_id: RecordId,
        category: RecordCategory,
        content: Value,
        content_hash: CanonicalHash,
    ) -> Result<RecordUpsertOutcome, StorageError> {
        owner_id.validate()?;
        record_id.validate()?;
        category.validate()?;
        content_hash.validate()?;
        if !content.is_object() {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "medical_records.content",
                    reason: "must be a JSON object",
                },
            ));
        }

        match self.records.get_mut(&record_id) {
            Some(existing) => {
                if existing.owner_id != owner_id {
                    return Err(StorageError::OwnerMismatch {
                        table: "medical_records.owner_id",
                        key: record_id.as_str().to_string(),
                    });
                }
                let content_changed = existing.content_hash != content_hash;
                if content_changed {
                    existing.ledger_ref = None;
                }
                existing.category = category;
                existing.content = content;
                existing.content_hash = content_hash;
                existing.updated_at = now;
                Ok(RecordUpsertOutcome {
                    row: existing.clone(),
                    was_new: false,
                    content_changed,
                })
            }
            None => {
                let row = MedicalRecordRow {
                    schema_version: SchemaVersion(1),
                    record_id: record_id.clone(),
                    owner_id,
                    category,
                    content,
                    content_hash,
                    ledger_ref: None,
                    created_at: now,
                    updated_at: now,
                };
                self.records.insert(record_id, row.clone());
                Ok(RecordUpsertOutcome {
                    row,
                    was_new: true,
                    content_changed: true,
                })
            }
        }
    }

    pub fn record(&self, record_id: &RecordId) -> Option<&MedicalRecordRow> {
        self.records.get(record_id)
    }

    pub fn records_by_owner(&self, owner_id: &UserId) -> Vec<&MedicalRecordRow> {
        self.records
            .values()
            .filter(|r| &r.owner_id == owner_id)
            .collect()
    }

    /// Attaches `ledger_ref` only while the record still holds `anchored_hash`;
    /// returns false when a newer write superseded the anchored content.
    pub fn record_attach_ledger_ref(
        &mut self,
        record_id: &RecordId,
        anchored_hash: &CanonicalHash,
        ledger_ref: LedgerRef,
    ) -> Result<bool, StorageError> {
        let row = self
            .records
            .get_mut(record_id)
            .ok_or(StorageError::ForeignKeyViolation {
                table: "medical_records.record_id",
                key: record_id.as_str().to_string(),
            })?;
        if &row.content_hash != anchored_hash {
            return Ok(false);
        }
        row.ledger_ref = Some(ledger_ref);
        Ok(true)
    }

    pub fn records_owned_check(
        &self,
        owner_id: &UserId,
        record_ids: &[RecordId],
    ) -> Result<(), StorageError> {
        for record_id in record_ids {
            let row = self
                .records
                .get(record_id)
                .ok_or(StorageError::ForeignKeyViolation {
                    table: "medical_records.record_id",
                    key: record_id.as_str().to_string(),
                })?;
            if &row.owner_id != owner_id {
                return Err(StorageError::OwnerMismatch {
                    table: "medical_records.owner_id",
                    key: record_id.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // integrity_anchors (append-only)
    // ------------------------------------------------------------------

    pub fn integrity_anchor_append(&mut self, anchor: IntegrityAnchor) -> Result<u64, StorageError> {
        anchor.validate()?;
        if self
            .integrity_anchors
            .iter()
            .any(|a| a.ledger_ref == anchor.ledger_ref)
        {
            return Err(StorageError::DuplicateKey {
                table: "integrity_anchors.ledger_ref",
                key: anchor.ledger_ref.as_str().to_string(),
            });
        }
        self.integrity_anchors.push(anchor);
        Ok(self.integrity_anchors.len() as u64)
    }

    pub fn integrity_anchors(&self) -> &[IntegrityAnchor] {
        &self.integrity_anchors
    }

    pub fn integrity_anchors_for_record(&self, record_id: &RecordId) -> Vec<&IntegrityAnchor> {
        self.integrity_anchors
            .iter()
            .filter(|a| &a.record_id == record_id)
            .collect()
    }

    pub fn integrity_anchor_by_ref(&self, ledger_ref: &LedgerRef) -> Option<&IntegrityAnchor> {
        self.integrity_anchors
            .iter()
            .find(|a| &a.ledger_ref == ledger_ref)
    }

    pub fn attempt_overwrite_integrity_anchor(
        &mut self,
        _ledger_ref: &LedgerRef,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "integrity_anchors",
        })
    }

    // ------------------------------------------------------------------
    // consent_tokens
    // ------------------------------------------------------------------

    /// Inserts a new token after re-checking, in the same critical section,
    /// that the owner still owns every shared record.
    pub fn consent_token_insert(&mut self, token: ConsentToken) -> Result<(), StorageError> {
        token.validate()?;
        if token.revoked || token.access_count != 0 || token.last_accessed_at.is_some() {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "consent_tokens",
                    reason: "new tokens must start active and unaccessed",
                },
            ));
        }
        if self.consent_tokens.contains_key(&token.token_id) {
            return Err(StorageError::DuplicateKey {
                table: "consent_tokens.token_id",
                key: token.token_id.as_str().to_string(),
            });
        }
        self.records_owned_check(&token.owner_id, &token.record_ids)?;

        self.consent_tokens_by_owner
            .entry(token.owner_id.clone())
            .or_default()
            .push(token.token_id.clone());
        self.consent_tokens.insert(token.token_id.clone(), token);
        Ok(())
    }

    pub fn consent_token(&self, token_id: &TokenId) -> Option<&ConsentToken> {
        self.consent_tokens.get(token_id)
    }

    /// Owner's tokens, newest first.
    pub fn consent_tokens_for_owner(&self, owner_id: &UserId) -> Vec<&ConsentToken> {
        self.consent_tokens_by_owner
            .get(owner_id)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .filter_map(|id| self.consent_tokens.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Conditional update: the active check, the counter increment and the
    /// access-event append happen in one call, so a concurrent revoke either
    /// lands before (access refused) or after (access fully recorded).
    pub fn consent_access_commit(
        &mut self,
        now: UnixTimeNs,
        token_id: &TokenId,
        ctx: AccessContext,
    ) -> Result<ConsentAccessGate, StorageError> {
        ctx.validate()?;
        let Some(token) = self.consent_tokens.get_mut(token_id) else {
            return Ok(ConsentAccessGate::NotFound);
        };
        if token.revoked {
            return Ok(ConsentAccessGate::Revoked);
        }
        if now >= token.expires_at {
            return Ok(ConsentAccessGate::Expired);
        }

        token.access_count = token.access_count.saturating_add(1);
        token.last_accessed_at = Some(match token.last_accessed_at {
            Some(prev) if prev >= now => prev,
            _ => now,
        });
        let event = AccessEvent {
            schema_version: SchemaVersion(1),
            token_id: token_id.clone(),
            event_seq: token.access_count,
            accessor_id: ctx.accessor_id,
            facility_id: ctx.facility_id,
            purpose: ctx.purpose,
            timestamp: now,
            ledger_log_ref: None,
        };
        let token = token.clone();
        self.access_events.push(event.clone());

        let records = token
            .record_ids
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect();

        Ok(ConsentAccessGate::Granted(ConsentAccessGrant {
            token,
            event,
            records,
        }))
    }

    /// Idempotent: revoking twice reports `newly_revoked == false` the second time.
    pub fn consent_revoke_commit(
        &mut self,
        token_id: &TokenId,
    ) -> Result<ConsentRevokeOutcome, StorageError> {
        let token =
            self.consent_tokens
                .get_mut(token_id)
                .ok_or(StorageError::ForeignKeyViolation {
                    table: "consent_tokens.token_id",
                    key: token_id.as_str().to_string(),
                })?;
        let newly_revoked = !token.revoked;
        token.revoked = true;
        Ok(ConsentRevokeOutcome {
            token: token.clone(),
            newly_revoked,
        })
    }

    pub fn consent_attach_revocation_ref(
        &mut self,
        token_id: &TokenId,
        ledger_ref: LedgerRef,
    ) -> Result<(), StorageError> {
        let token =
            self.consent_tokens
                .get_mut(token_id)
                .ok_or(StorageError::ForeignKeyViolation {
                    table: "consent_tokens.token_id",
                    key: token_id.as_str().to_string(),
                })?;
        if token.revocation_ledger_ref.is_some() {
            return Err(StorageError::AppendOnlyViolation {
                table: "consent_tokens.revocation_ledger_ref",
            });
        }
        token.revocation_ledger_ref = Some(ledger_ref);
        Ok(())
    }

    // ------------------------------------------------------------------
    // access_events (append-only; ledger ref is backfilled once)
    // ------------------------------------------------------------------

    pub fn access_events(&self) -> &[AccessEvent] {
        &self.access_events
    }

    pub fn access_events_for_token(&self, token_id: &TokenId) -> Vec<&AccessEvent> {
        self.access_events
            .iter()
            .filter(|e| &e.token_id == token_id)
            .collect()
    }

    pub fn access_event_attach_ledger_ref(
        &mut self,
        token_id: &TokenId,
        event_seq: u64,
        ledger_ref: LedgerRef,
    ) -> Result<(), StorageError> {
        let event = self
            .access_events
            .iter_mut()
            .find(|e| &e.token_id == token_id && e.event_seq == event_seq)
            .ok_or(StorageError::ForeignKeyViolation {
                table: "access_events.event_seq",
                key: format!("{}:{event_seq}", token_id.as_str()),
            })?;
        if event.ledger_log_ref.is_some() {
            return Err(StorageError::AppendOnlyViolation {
                table: "access_events.ledger_log_ref",
            });
        }
        event.ledger_log_ref = Some(ledger_ref);
        Ok(())
    }

    pub fn attempt_overwrite_access_event(
        &mut self,
        _token_id: &TokenId,
        _event_seq: u64,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "access_events",
        })
    }
}
