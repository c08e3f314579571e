#![forbid(unsafe_code)]

use medshare_kernel_contracts::identity::UserId;
use medshare_kernel_contracts::integrity::{CanonicalHash, LedgerRef};
use medshare_kernel_contracts::record::{RecordCategory, RecordId};
use medshare_kernel_contracts::UnixTimeNs;
use medshare_storage::repo::MedicalRecordsRepo;
use medshare_storage::store::{CareStore, StorageError};
use serde_json::json;
use sha2::{Digest, Sha256};

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn rec(id: &str) -> RecordId {
    RecordId::new(id).unwrap()
}

fn hash_of(seed: &str) -> CanonicalHash {
    let mut h = Sha256::new();
    h.update(seed.as_bytes());
    CanonicalHash::new(hex_lower(&h.finalize())).unwrap()
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[test]
fn at_records_db_01_first_write_fixes_owner() {
    let mut s = CareStore::new_in_memory();
    let out = s
        .record_upsert_row(
            UnixTimeNs(10),
            user("patient_1"),
            rec("rec_1"),
            RecordCategory::new("visit").unwrap(),
            json!({"notes": "ok"}),
            hash_of("a"),
        )
        .unwrap();
    assert!(out.was_new);
    assert_eq!(out.row.owner_id, user("patient_1"));

    let other = s.record_upsert_row(
        UnixTimeNs(11),
        user("patient_2"),
        rec("rec_1"),
        RecordCategory::new("visit").unwrap(),
        json!({"notes": "hijack"}),
        hash_of("b"),
    );
    assert!(matches!(other, Err(StorageError::OwnerMismatch { .. })));
    assert_eq!(s.record_row(&rec("rec_1")).unwrap().content, json!({"notes": "ok"}));
}

#[test]
fn at_records_db_02_content_change_clears_ledger_ref() {
    let mut s = CareStore::new_in_memory();
    let category = RecordCategory::new("lab").unwrap();
    s.record_upsert_row(
        UnixTimeNs(10),
        user("patient_1"),
        rec("rec_1"),
        category.clone(),
        json!({"labResults": [1]}),
        hash_of("a"),
    )
    .unwrap();
    assert!(s
        .record_attach_ledger_ref_row(&rec("rec_1"), &hash_of("a"), LedgerRef::new("0x01").unwrap())
        .unwrap());

    let same = s
        .record_upsert_row(
            UnixTimeNs(11),
            user("patient_1"),
            rec("rec_1"),
            category.clone(),
            json!({"labResults": [1]}),
            hash_of("a"),
        )
        .unwrap();
    assert!(!same.content_changed);
    assert_eq!(same.row.ledger_ref, Some(LedgerRef::new("0x01").unwrap()));

    let changed = s
        .record_upsert_row(
            UnixTimeNs(12),
            user("patient_1"),
            rec("rec_1"),
            category,
            json!({"labResults": [2]}),
            hash_of("b"),
        )
        .unwrap();
    assert!(changed.content_changed);
    assert_eq!(changed.row.ledger_ref, None);
    assert_eq!(changed.row.created_at, UnixTimeNs(10));
    assert_eq!(changed.row.updated_at, UnixTimeNs(12));
}

#[test]
fn at_records_db_03_stale_anchor_does_not_attach() {
    let mut s = CareStore::new_in_memory();
    s.record_upsert_row(
        UnixTimeNs(10),
        user("patient_1"),
        rec("rec_1"),
        RecordCategory::new("visit").unwrap(),
        json!({"v": 2}),
        hash_of("new"),
    )
    .unwrap();
    let attached = s
        .record_attach_ledger_ref_row(&rec("rec_1"), &hash_of("old"), LedgerRef::new("0x02").unwrap())
        .unwrap();
    assert!(!attached);
    assert_eq!(s.record_row(&rec("rec_1")).unwrap().ledger_ref, None);

    let missing = s.record_attach_ledger_ref_row(
        &rec("rec_404"),
        &hash_of("new"),
        LedgerRef::new("0x03").unwrap(),
    );
    assert!(matches!(missing, Err(StorageError::ForeignKeyViolation { .. })));
}

#[test]
fn at_records_db_04_content_must_be_object() {
    let mut s = CareStore::new_in_memory();
    let out = s.record_upsert_row(
        UnixTimeNs(10),
        user("patient_1"),
        rec("rec_1"),
        RecordCategory::new("visit").unwrap(),
        json!(["not", "an", "object"]),
        hash_of("a"),
    );
    assert!(matches!(out, Err(StorageError::ContractViolation(_))));
    assert!(s.record_rows_by_owner(&user("patient_1")).is_empty());
}
