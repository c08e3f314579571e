#![forbid(unsafe_code)]

//! Caller resolution for endpoints that accept either a standard bearer
//! credential or a consent token.

use std::sync::Arc;

use medshare_engines::bearer::CredentialVerifier;
use medshare_engines::token_codec::{parse_presented, token_fingerprint};
use medshare_kernel_contracts::consent::{ConsentScope, TokenId};
use medshare_kernel_contracts::identity::Identity;
use medshare_kernel_contracts::record::RecordId;
use medshare_kernel_contracts::{ReasonCodeId, UnixTimeNs};
use tracing::{debug, info};

use crate::consent::ConsentTokenManager;

pub mod reason_codes {
    use medshare_kernel_contracts::ReasonCodeId;

    pub const AUTH_OK_BEARER: ReasonCodeId = ReasonCodeId(0x4155_0001);
    pub const AUTH_OK_CONSENT: ReasonCodeId = ReasonCodeId(0x4155_0002);
    pub const AUTH_REFUSE_UNAUTHENTICATED: ReasonCodeId = ReasonCodeId(0x4155_00F1);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResolution {
    Authenticated(Identity),
    ConsentDerived {
        owner: Identity,
        token_id: TokenId,
        scope: ConsentScope,
        record_ids: Vec<RecordId>,
    },
    Unauthenticated,
}

impl AuthResolution {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            AuthResolution::Authenticated(_) => reason_codes::AUTH_OK_BEARER,
            AuthResolution::ConsentDerived { .. } => reason_codes::AUTH_OK_CONSENT,
            AuthResolution::Unauthenticated => reason_codes::AUTH_REFUSE_UNAUTHENTICATED,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            AuthResolution::Authenticated(_) => "bearer",
            AuthResolution::ConsentDerived { .. } => "consent",
            AuthResolution::Unauthenticated => "none",
        }
    }
}

#[derive(Clone)]
pub struct DualModeAuthGate {
    verifier: Arc<dyn CredentialVerifier>,
    consent: ConsentTokenManager,
}

impl DualModeAuthGate {
    pub fn new(verifier: Arc<dyn CredentialVerifier>, consent: ConsentTokenManager) -> Self {
        Self { verifier, consent }
    }

    /// Bearer first, then consent token. A rejected bearer falls through to
    /// the consent token rather than failing the request.
    pub fn resolve(
        &self,
        now: UnixTimeNs,
        bearer: Option<&str>,
        consent_token: Option<&str>,
    ) -> AuthResolution {
        if let Some(credential) = bearer.map(str::trim).filter(|c| !c.is_empty()) {
            match self.verifier.verify(credential, now) {
                Ok(identity) => {
                    debug!(target: "medshare::auth", user_id = %identity.user_id.as_str(), role = identity.role.as_str(), "bearer credential accepted");
                    return AuthResolution::Authenticated(identity);
                }
                Err(err) => {
                    info!(target: "medshare::auth", error = %err, "bearer credential rejected");
                }
            }
        }

        if let Some(presented) = consent_token.map(str::trim).filter(|c| !c.is_empty()) {
            match self.consent.consent_identity(now, presented) {
                Ok(derived) => {
                    debug!(target: "medshare::auth", token_fp = %token_fingerprint(&derived.token_id), scope = derived.scope.as_str(), "consent token accepted");
                    return AuthResolution::ConsentDerived {
                        owner: derived.owner,
                        token_id: derived.token_id,
                        scope: derived.scope,
                        record_ids: derived.record_ids,
                    };
                }
                Err(err) => {
                    let token_fp = parse_presented(presented)
                        .map(|p| token_fingerprint(p.token_id()))
                        .unwrap_or_default();
                    info!(target: "medshare::auth", token_fp = %token_fp, outcome = err.outcome().unwrap_or("INTERNAL"), "consent token rejected");
                }
            }
        }

        AuthResolution::Unauthenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medshare_engines::bearer::{DisabledVerifier, Hs256Verifier};
    use medshare_engines::canonical::canonical_hash;
    use medshare_engines::ledger_memory::MemoryLedgerGateway;
    use medshare_kernel_contracts::identity::{Role, UserId};
    use medshare_kernel_contracts::record::RecordCategory;
    use medshare_storage::repo::MedicalRecordsRepo;
    use medshare_storage::store::CareStore;
    use serde_json::json;

    use crate::audit_worker::spawn_ledger_audit_worker;
    use crate::consent::ConsentConfig;
    use crate::shared_store;

    const NOW: UnixTimeNs = UnixTimeNs(1_700_000_000_000_000_000);
    const SECRET: &[u8] = b"unit-test-secret-unit-test-secret";

    fn manager() -> ConsentTokenManager {
        let ledger = Arc::new(MemoryLedgerGateway::new());
        let store = shared_store(CareStore::new_in_memory());
        {
            let content = json!({"severity": "low"});
            let hash = canonical_hash(&content);
            store
                .lock()
                .unwrap()
                .record_upsert_row(
                    NOW,
                    UserId::new("patient_1").unwrap(),
                    RecordId::new("rec_1").unwrap(),
                    RecordCategory::new("visit").unwrap(),
                    content,
                    hash,
                )
                .unwrap();
        }
        let (audit, _join) = spawn_ledger_audit_worker(store.clone(), ledger.clone());
        ConsentTokenManager::new(ConsentConfig::mvp_v1(), store, ledger, audit)
    }

    fn doctor_bearer() -> String {
        Hs256Verifier::new(SECRET)
            .sign(
                &Identity::new(UserId::new("dr_1").unwrap(), Role::Doctor),
                NOW.as_unix_secs() + 3600,
            )
            .unwrap()
    }

    async fn issued_token(consent: &ConsentTokenManager) -> TokenId {
        consent
            .issue(
                NOW,
                &UserId::new("patient_1").unwrap(),
                vec![RecordId::new("rec_1").unwrap()],
                ConsentScope::Emergency,
                None,
                None,
            )
            .await
            .unwrap()
            .token_id
    }

    #[tokio::test]
    async fn at_auth_gate_01_bearer_wins_over_consent() {
        let consent = manager();
        let token = issued_token(&consent).await;
        let gate = DualModeAuthGate::new(Arc::new(Hs256Verifier::new(SECRET)), consent);
        let out = gate.resolve(NOW, Some(&doctor_bearer()), Some(token.as_str()));
        match out {
            AuthResolution::Authenticated(id) => assert_eq!(id.role, Role::Doctor),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn at_auth_gate_02_consent_token_derives_owner_identity() {
        let consent = manager();
        let token = issued_token(&consent).await;
        let gate = DualModeAuthGate::new(Arc::new(Hs256Verifier::new(SECRET)), consent);
        let out = gate.resolve(NOW, Some("not.a.jwt"), Some(token.as_str()));
        assert_eq!(
            out,
            AuthResolution::ConsentDerived {
                owner: Identity::new(UserId::new("patient_1").unwrap(), Role::Patient),
                token_id: token,
                scope: ConsentScope::Emergency,
                record_ids: vec![RecordId::new("rec_1").unwrap()],
            }
        );
        assert_eq!(out.mode(), "consent");
    }

    #[tokio::test]
    async fn at_auth_gate_03_revoked_or_missing_credentials_are_unauthenticated() {
        let consent = manager();
        let token = issued_token(&consent).await;
        let owner = Identity::new(UserId::new("patient_1").unwrap(), Role::Patient);
        consent.revoke(NOW, token.as_str(), &owner).unwrap();
        let gate = DualModeAuthGate::new(Arc::new(DisabledVerifier), consent);

        assert_eq!(
            gate.resolve(NOW, Some(&doctor_bearer()), Some(token.as_str())),
            AuthResolution::Unauthenticated
        );
        assert_eq!(gate.resolve(NOW, None, None), AuthResolution::Unauthenticated);
        assert_eq!(
            gate.resolve(NOW, Some("  "), Some("")).reason_code(),
            reason_codes::AUTH_REFUSE_UNAUTHENTICATED
        );
    }

    #[tokio::test]
    async fn at_auth_gate_04_expired_consent_token_is_unauthenticated() {
        let consent = manager();
        let token = issued_token(&consent).await;
        let gate = DualModeAuthGate::new(Arc::new(Hs256Verifier::new(SECRET)), consent);
        let later = NOW.plus_hours(25);
        assert_eq!(
            gate.resolve(later, None, Some(token.as_str())),
            AuthResolution::Unauthenticated
        );
    }
}
