#![forbid(unsafe_code)]

//! Background ledger writer for access logs and revocation markers.
//!
//! Jobs are processed one at a time in enqueue order from a bounded queue. A
//! full queue drops the job instead of blocking the request path. Failures are
//! counted and reported under `medshare::ledger_audit`.

use std::sync::{Arc, Mutex};

use medshare_engines::ledger::LedgerGateway;
use medshare_kernel_contracts::consent::TokenId;
use medshare_kernel_contracts::integrity::LedgerRef;
use medshare_kernel_contracts::ledger::{
    AccessLogEntry, LedgerEnvelope, LedgerPayload, RevocationEntry,
};
use medshare_storage::repo::ConsentTokensRepo;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{lock_store, SharedStore};

pub const LEDGER_AUDIT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum LedgerAuditJob {
    AccessLog {
        token_id: TokenId,
        entry: AccessLogEntry,
    },
    Revocation {
        token_id: TokenId,
        entry: RevocationEntry,
    },
    /// Completes once every job enqueued before it has been processed.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerAuditCounters {
    pub enqueued: u64,
    pub submitted: u64,
    pub failed: u64,
    pub backfill_failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone)]
pub struct LedgerAuditHandle {
    tx: mpsc::Sender<LedgerAuditJob>,
    counters: Arc<Mutex<LedgerAuditCounters>>,
}

impl LedgerAuditHandle {
    pub fn enqueue(&self, job: LedgerAuditJob) {
        match self.tx.try_send(job) {
            Ok(()) => bump(&self.counters, |c| c.enqueued += 1),
            Err(TrySendError::Full(_)) => {
                warn!(target: "medshare::ledger_audit", "ledger audit queue full; job dropped");
                bump(&self.counters, |c| c.dropped += 1);
            }
            Err(TrySendError::Closed(_)) => {
                warn!(target: "medshare::ledger_audit", "ledger audit worker is gone; job dropped");
                bump(&self.counters, |c| c.dropped += 1);
            }
        }
    }

    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LedgerAuditJob::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn counters(&self) -> LedgerAuditCounters {
        self.counters
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

fn bump(counters: &Mutex<LedgerAuditCounters>, f: impl FnOnce(&mut LedgerAuditCounters)) {
    if let Ok(mut c) = counters.lock() {
        f(&mut c);
    }
}

pub fn spawn_ledger_audit_worker(
    store: SharedStore,
    ledger: Arc<dyn LedgerGateway>,
) -> (LedgerAuditHandle, JoinHandle<()>) {
    spawn_ledger_audit_worker_with_capacity(store, ledger, LEDGER_AUDIT_QUEUE_CAPACITY)
}

pub fn spawn_ledger_audit_worker_with_capacity(
    store: SharedStore,
    ledger: Arc<dyn LedgerGateway>,
    capacity: usize,
) -> (LedgerAuditHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<LedgerAuditJob>(capacity.max(1));
    let counters = Arc::new(Mutex::new(LedgerAuditCounters::default()));
    let worker_counters = Arc::clone(&counters);

    let join = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                LedgerAuditJob::Flush(done) => {
                    let _ = done.send(());
                }
                LedgerAuditJob::AccessLog { token_id, entry } => {
                    let event_seq = entry.event_seq;
                    let fp = entry.token_fingerprint.clone();
                    let Some(ledger_ref) =
                        submit(&*ledger, LedgerPayload::AccessLog(entry), &fp, &worker_counters).await
                    else {
                        continue;
                    };
                    let backfill = lock_store(&store).map(|mut s| {
                        s.access_event_attach_ledger_ref_row(&token_id, event_seq, ledger_ref.clone())
                    });
                    if !matches!(backfill, Ok(Ok(()))) {
                        warn!(target: "medshare::ledger_audit", token_fp = %fp, event_seq, ledger_ref = %ledger_ref.as_str(), "access event ledger ref backfill failed");
                        bump(&worker_counters, |c| c.backfill_failed += 1);
                    }
                }
                LedgerAuditJob::Revocation { token_id, entry } => {
                    let fp = entry.token_fingerprint.clone();
                    let Some(ledger_ref) = submit(
                        &*ledger,
                        LedgerPayload::ConsentRevocation(entry),
                        &fp,
                        &worker_counters,
                    )
                    .await
                    else {
                        continue;
                    };
                    let backfill = lock_store(&store).map(|mut s| {
                        s.consent_attach_revocation_ref_row(&token_id, ledger_ref.clone())
                    });
                    if !matches!(backfill, Ok(Ok(()))) {
                        warn!(target: "medshare::ledger_audit", token_fp = %fp, ledger_ref = %ledger_ref.as_str(), "revocation ledger ref backfill failed");
                        bump(&worker_counters, |c| c.backfill_failed += 1);
                    }
                }
            }
        }
        debug!(target: "medshare::ledger_audit", "ledger audit worker stopped");
    });

    (LedgerAuditHandle { tx, counters }, join)
}

async fn submit(
    ledger: &dyn LedgerGateway,
    payload: LedgerPayload,
    token_fp: &str,
    counters: &Mutex<LedgerAuditCounters>,
) -> Option<LedgerRef> {
    let kind = payload.kind();
    let bytes = match LedgerEnvelope::v1(payload).to_json_bytes() {
        Ok(b) => b,
        Err(err) => {
            warn!(target: "medshare::ledger_audit", kind, token_fp, error = %err, "ledger payload encoding failed");
            bump(counters, |c| c.failed += 1);
            return None;
        }
    };
    match ledger.submit(&bytes).await {
        Ok(receipt) => {
            debug!(target: "medshare::ledger_audit", kind, token_fp, ledger_ref = %receipt.ledger_ref.as_str(), "ledger audit entry written");
            bump(counters, |c| c.submitted += 1);
            Some(receipt.ledger_ref)
        }
        Err(err) => {
            warn!(target: "medshare::ledger_audit", kind, token_fp, error = %err, "ledger audit submission failed");
            bump(counters, |c| c.failed += 1);
            None
        }
    }
}
