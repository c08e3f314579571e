#![forbid(unsafe_code)]

use medshare_kernel_contracts::identity::UserId;
use medshare_kernel_contracts::integrity::{CanonicalHash, IntegrityAnchor, LedgerRef};
use medshare_kernel_contracts::record::RecordId;
use medshare_kernel_contracts::UnixTimeNs;
use medshare_storage::repo::IntegrityAnchorsRepo;
use medshare_storage::store::{CareStore, StorageError};

const HASH_A: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
const HASH_B: &str = "60303ae22b998861bce3b28f33eec1be758a213c86c93c076dbe9f558c11c752";

fn anchor(record_id: &str, hash: &str, ledger_ref: &str, at: u64) -> IntegrityAnchor {
    IntegrityAnchor::v1(
        UserId::new("patient_1").unwrap(),
        RecordId::new(record_id).unwrap(),
        CanonicalHash::new(hash).unwrap(),
        LedgerRef::new(ledger_ref).unwrap(),
        UnixTimeNs(at),
    )
    .unwrap()
}

#[test]
fn at_anchor_db_01_anchors_are_append_only() {
    let mut s = CareStore::new_in_memory();
    assert_eq!(
        s.append_integrity_anchor_row(anchor("rec_1", HASH_A, "0xaa", 1))
            .unwrap(),
        1
    );
    assert_eq!(
        s.append_integrity_anchor_row(anchor("rec_1", HASH_B, "0xbb", 2))
            .unwrap(),
        2
    );

    let dup = s.append_integrity_anchor_row(anchor("rec_2", HASH_A, "0xaa", 3));
    assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));

    let overwrite = s.attempt_overwrite_integrity_anchor(&LedgerRef::new("0xaa").unwrap());
    assert!(matches!(
        overwrite,
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(s.integrity_anchor_rows().len(), 2);
}

#[test]
fn at_anchor_db_02_lookup_by_record_and_ref() {
    let mut s = CareStore::new_in_memory();
    s.append_integrity_anchor_row(anchor("rec_1", HASH_A, "0xaa", 1))
        .unwrap();
    s.append_integrity_anchor_row(anchor("rec_2", HASH_B, "0xbb", 2))
        .unwrap();
    s.append_integrity_anchor_row(anchor("rec_1", HASH_B, "0xcc", 3))
        .unwrap();

    let rows = s.integrity_anchor_rows_for_record(&RecordId::new("rec_1").unwrap());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].ledger_ref.as_str(), "0xaa");
    assert_eq!(rows[1].ledger_ref.as_str(), "0xcc");

    let by_ref = s
        .integrity_anchor_row_by_ref(&LedgerRef::new("0xbb").unwrap())
        .unwrap();
    assert_eq!(by_ref.record_id.as_str(), "rec_2");
    assert!(s
        .integrity_anchor_row_by_ref(&LedgerRef::new("0xdd").unwrap())
        .is_none());
}
