#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use medshare_kernel_contracts::consent::{
    AccessContext, ConsentScope, ConsentToken, TokenId,
};
use medshare_kernel_contracts::identity::{FacilityId, UserId};
use medshare_kernel_contracts::integrity::{CanonicalHash, LedgerRef};
use medshare_kernel_contracts::record::{RecordCategory, RecordId};
use medshare_kernel_contracts::UnixTimeNs;
use medshare_storage::repo::{ConsentTokensRepo, MedicalRecordsRepo};
use medshare_storage::store::{CareStore, ConsentAccessGate, StorageError};
use serde_json::json;

const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn rec(id: &str) -> RecordId {
    RecordId::new(id).unwrap()
}

fn tid(id: &str) -> TokenId {
    TokenId::new(id).unwrap()
}

fn seed_record(s: &mut CareStore, owner: &str, record_id: &str) {
    s.record_upsert_row(
        UnixTimeNs(1),
        user(owner),
        rec(record_id),
        RecordCategory::new("visit").unwrap(),
        json!({"recordId": record_id, "severity": "low"}),
        CanonicalHash::new(HASH).unwrap(),
    )
    .unwrap();
}

fn token(id: &str, owner: &str, records: &[&str], created: u64, expires: u64) -> ConsentToken {
    ConsentToken::v1(
        tid(id),
        user(owner),
        records.iter().map(|r| rec(r)).collect(),
        ConsentScope::Summary,
        None,
        UnixTimeNs(created),
        UnixTimeNs(expires),
        Some(LedgerRef::new("0xgrant").unwrap()),
    )
    .unwrap()
}

fn ctx(accessor: &str) -> AccessContext {
    AccessContext::v1(
        Some(accessor.to_string()),
        Some(FacilityId::new("clinic_1").unwrap()),
        Some("follow-up".to_string()),
    )
    .unwrap()
}

#[test]
fn at_consent_db_01_insert_requires_owned_records_and_unique_id() {
    let mut s = CareStore::new_in_memory();
    seed_record(&mut s, "patient_1", "rec_1");
    seed_record(&mut s, "patient_2", "rec_2");

    s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 100))
        .unwrap();

    let dup =
        s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 100));
    assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));

    let foreign =
        s.insert_consent_token_row(token("ct_bbbbbbbbbbbbbbbb", "patient_1", &["rec_2"], 10, 100));
    assert!(matches!(foreign, Err(StorageError::OwnerMismatch { .. })));

    let missing =
        s.insert_consent_token_row(token("ct_cccccccccccccccc", "patient_1", &["rec_9"], 10, 100));
    assert!(matches!(
        missing,
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_consent_db_02_access_commit_counts_and_appends_event() {
    let mut s = CareStore::new_in_memory();
    seed_record(&mut s, "patient_1", "rec_1");
    s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 100))
        .unwrap();

    for i in 1..=3u64 {
        match s
            .consent_access_commit_row(UnixTimeNs(20 + i), &tid("ct_aaaaaaaaaaaaaaaa"), ctx("dr_1"))
            .unwrap()
        {
            ConsentAccessGate::Granted(g) => {
                assert_eq!(g.token.access_count, i);
                assert_eq!(g.event.event_seq, i);
                assert_eq!(g.records.len(), 1);
            }
            other => panic!("unexpected gate {other:?}"),
        }
    }
    let t = s.consent_token_row(&tid("ct_aaaaaaaaaaaaaaaa")).unwrap();
    assert_eq!(t.access_count, 3);
    assert_eq!(t.last_accessed_at, Some(UnixTimeNs(23)));
    assert_eq!(
        s.access_event_rows_for_token(&tid("ct_aaaaaaaaaaaaaaaa")).len(),
        3
    );
}

#[test]
fn at_consent_db_03_refusals_leave_state_untouched() {
    let mut s = CareStore::new_in_memory();
    seed_record(&mut s, "patient_1", "rec_1");
    s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 100))
        .unwrap();

    assert_eq!(
        s.consent_access_commit_row(UnixTimeNs(100), &tid("ct_aaaaaaaaaaaaaaaa"), ctx("dr_1"))
            .unwrap(),
        ConsentAccessGate::Expired
    );
    assert_eq!(
        s.consent_access_commit_row(UnixTimeNs(50), &tid("ct_zzzzzzzzzzzzzzzz"), ctx("dr_1"))
            .unwrap(),
        ConsentAccessGate::NotFound
    );

    let first = s
        .consent_revoke_commit_row(&tid("ct_aaaaaaaaaaaaaaaa"))
        .unwrap();
    assert!(first.newly_revoked);
    let second = s
        .consent_revoke_commit_row(&tid("ct_aaaaaaaaaaaaaaaa"))
        .unwrap();
    assert!(!second.newly_revoked);

    assert_eq!(
        s.consent_access_commit_row(UnixTimeNs(50), &tid("ct_aaaaaaaaaaaaaaaa"), ctx("dr_1"))
            .unwrap(),
        ConsentAccessGate::Revoked
    );
    let t = s.consent_token_row(&tid("ct_aaaaaaaaaaaaaaaa")).unwrap();
    assert_eq!(t.access_count, 0);
    assert!(s
        .access_event_rows_for_token(&tid("ct_aaaaaaaaaaaaaaaa"))
        .is_empty());
}

#[test]
fn at_consent_db_04_ledger_refs_backfill_once() {
    let mut s = CareStore::new_in_memory();
    seed_record(&mut s, "patient_1", "rec_1");
    s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 100))
        .unwrap();
    s.consent_access_commit_row(UnixTimeNs(20), &tid("ct_aaaaaaaaaaaaaaaa"), ctx("dr_1"))
        .unwrap();

    s.access_event_attach_ledger_ref_row(
        &tid("ct_aaaaaaaaaaaaaaaa"),
        1,
        LedgerRef::new("0xlog1").unwrap(),
    )
    .unwrap();
    let again = s.access_event_attach_ledger_ref_row(
        &tid("ct_aaaaaaaaaaaaaaaa"),
        1,
        LedgerRef::new("0xlog2").unwrap(),
    );
    assert!(matches!(
        again,
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    let unknown = s.access_event_attach_ledger_ref_row(
        &tid("ct_aaaaaaaaaaaaaaaa"),
        2,
        LedgerRef::new("0xlog3").unwrap(),
    );
    assert!(matches!(
        unknown,
        Err(StorageError::ForeignKeyViolation { .. })
    ));

    s.consent_revoke_commit_row(&tid("ct_aaaaaaaaaaaaaaaa"))
        .unwrap();
    s.consent_attach_revocation_ref_row(&tid("ct_aaaaaaaaaaaaaaaa"), LedgerRef::new("0xrev").unwrap())
        .unwrap();
    assert!(s
        .consent_attach_revocation_ref_row(
            &tid("ct_aaaaaaaaaaaaaaaa"),
            LedgerRef::new("0xrev2").unwrap()
        )
        .is_err());
}

#[test]
fn at_consent_db_05_owner_history_is_newest_first() {
    let mut s = CareStore::new_in_memory();
    seed_record(&mut s, "patient_1", "rec_1");
    seed_record(&mut s, "patient_2", "rec_2");
    s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 100))
        .unwrap();
    s.insert_consent_token_row(token("ct_bbbbbbbbbbbbbbbb", "patient_2", &["rec_2"], 11, 100))
        .unwrap();
    s.insert_consent_token_row(token("ct_cccccccccccccccc", "patient_1", &["rec_1"], 12, 100))
        .unwrap();

    let rows = s.consent_token_rows_for_owner(&user("patient_1"));
    let ids: Vec<&str> = rows.iter().map(|t| t.token_id.as_str()).collect();
    assert_eq!(ids, vec!["ct_cccccccccccccccc", "ct_aaaaaaaaaaaaaaaa"]);
    assert!(s.consent_token_rows_for_owner(&user("patient_3")).is_empty());
}

#[test]
fn at_consent_db_06_concurrent_access_commits_are_all_counted() {
    let mut s = CareStore::new_in_memory();
    seed_record(&mut s, "patient_1", "rec_1");
    s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 1_000))
        .unwrap();
    let store = Arc::new(Mutex::new(s));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut guard = store.lock().unwrap();
                guard
                    .consent_access_commit_row(
                        UnixTimeNs(100 + i),
                        &tid("ct_aaaaaaaaaaaaaaaa"),
                        ctx(&format!("dr_{i}")),
                    )
                    .unwrap()
            })
        })
        .collect();
    for h in handles {
        assert!(matches!(h.join().unwrap(), ConsentAccessGate::Granted(_)));
    }

    let guard = store.lock().unwrap();
    let t = guard.consent_token_row(&tid("ct_aaaaaaaaaaaaaaaa")).unwrap();
    assert_eq!(t.access_count, 16);
    let events = guard.access_event_rows_for_token(&tid("ct_aaaaaaaaaaaaaaaa"));
    assert_eq!(events.len(), 16);
    let mut seqs: Vec<u64> = events.iter().map(|e| e.event_seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=16).collect::<Vec<u64>>());
}

#[test]
fn at_consent_db_07_access_racing_revoke_never_leaves_partial_state() {
    const ACCESSORS: u64 = 16;
    let mut s = CareStore::new_in_memory();
    seed_record(&mut s, "patient_1", "rec_1");
    s.insert_consent_token_row(token("ct_aaaaaaaaaaaaaaaa", "patient_1", &["rec_1"], 10, 1_000))
        .unwrap();
    let store = Arc::new(Mutex::new(s));
    let order = Arc::new(AtomicU64::new(0));
    let start = Arc::new(Barrier::new(ACCESSORS as usize + 1));

    let accessors: Vec<_> = (0..ACCESSORS)
        .map(|i| {
            let (store, order, start) = (Arc::clone(&store), Arc::clone(&order), Arc::clone(&start));
            thread::spawn(move || {
                start.wait();
                let mut guard = store.lock().unwrap();
                let gate = guard
                    .consent_access_commit_row(
                        UnixTimeNs(100 + i),
                        &tid("ct_aaaaaaaaaaaaaaaa"),
                        ctx(&format!("dr_{i}")),
                    )
                    .unwrap();
                (order.fetch_add(1, Ordering::SeqCst), gate)
            })
        })
        .collect();
    let revoker = {
        let (store, order, start) = (Arc::clone(&store), Arc::clone(&order), Arc::clone(&start));
        thread::spawn(move || {
            start.wait();
            let mut guard = store.lock().unwrap();
            let out = guard
                .consent_revoke_commit_row(&tid("ct_aaaaaaaaaaaaaaaa"))
                .unwrap();
            assert!(out.newly_revoked);
            order.fetch_add(1, Ordering::SeqCst)
        })
    };

    let results: Vec<_> = accessors.into_iter().map(|h| h.join().unwrap()).collect();
    let revoked_at = revoker.join().unwrap();

    let mut granted_seqs = Vec::new();
    for (at, gate) in &results {
        match gate {
            ConsentAccessGate::Granted(grant) => {
                assert!(*at < revoked_at, "grant committed after revocation");
                granted_seqs.push(grant.event.event_seq);
            }
            ConsentAccessGate::Revoked => assert!(*at > revoked_at),
            other => panic!("unexpected gate: {other:?}"),
        }
    }

    let guard = store.lock().unwrap();
    let t = guard.consent_token_row(&tid("ct_aaaaaaaaaaaaaaaa")).unwrap();
    assert!(t.revoked);
    let events = guard.access_event_rows_for_token(&tid("ct_aaaaaaaaaaaaaaaa"));
    assert_eq!(t.access_count, granted_seqs.len() as u64);
    assert_eq!(events.len(), granted_seqs.len());
    let mut stored_seqs: Vec<u64> = events.iter().map(|e| e.event_seq).collect();
    stored_seqs.sort_unstable();
    granted_seqs.sort_unstable();
    assert_eq!(stored_seqs, granted_seqs);
}
