#![forbid(unsafe_code)]

//! Standard bearer credential verification (HS256 JWT).
//!
//! Login and token issuance live outside this core; the verifier only checks
//! signature, expiry and the `sub`/`role` claims.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use medshare_kernel_contracts::identity::{Identity, Role, UserId};
use medshare_kernel_contracts::UnixTimeNs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("bearer verification is not configured")]
    Unconfigured,
    #[error("malformed bearer credential")]
    Malformed,
    #[error("bearer signature mismatch")]
    BadSignature,
    #[error("bearer credential expired")]
    Expired,
    #[error("bearer credential carries an unknown role")]
    UnknownRole,
}

impl From<jsonwebtoken::errors::Error> for CredentialError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => CredentialError::BadSignature,
            ErrorKind::ExpiredSignature => CredentialError::Expired,
            ErrorKind::InvalidKeyFormat => CredentialError::Unconfigured,
            _ => CredentialError::Malformed,
        }
    }
}

pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &str, now: UnixTimeNs) -> Result<Identity, CredentialError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    sub: String,
    role: String,
    exp: u64,
}

pub struct Hs256Verifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for Hs256Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hs256Verifier").finish_non_exhaustive()
    }
}

impl Hs256Verifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        // Expiry is checked against the injected clock in `verify`.
        validation.validate_exp = false;
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mints a credential with the same secret; used by local tooling and tests.
    pub fn sign(&self, identity: &Identity, expires_at_secs: u64) -> Result<String, CredentialError> {
        let claims = JwtClaims {
            sub: identity.user_id.as_str().to_string(),
            role: identity.role.as_str().to_string(),
            exp: expires_at_secs,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding,
        )?)
    }
}

impl CredentialVerifier for Hs256Verifier {
    fn verify(&self, credential: &str, now: UnixTimeNs) -> Result<Identity, CredentialError> {
        let data =
            jsonwebtoken::decode::<JwtClaims>(credential.trim(), &self.decoding, &self.validation)?;
        let claims = data.claims;
        if claims.exp <= now.as_unix_secs() {
            return Err(CredentialError::Expired);
        }
        let role = Role::parse(&claims.role).ok_or(CredentialError::UnknownRole)?;
        let user_id = UserId::new(claims.sub).map_err(|_| CredentialError::Malformed)?;
        Ok(Identity::new(user_id, role))
    }
}

/// Used when no secret is configured: every bearer credential is refused.
#[derive(Debug, Default)]
pub struct DisabledVerifier;

impl CredentialVerifier for DisabledVerifier {
    fn verify(&self, _credential: &str, _now: UnixTimeNs) -> Result<Identity, CredentialError> {
        Err(CredentialError::Unconfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient() -> Identity {
        Identity::new(UserId::new("patient_1").unwrap(), Role::Patient)
    }

    const NOW: UnixTimeNs = UnixTimeNs(1_700_000_000 * UnixTimeNs::NS_PER_SEC);

    #[test]
    fn at_bearer_01_signed_credential_verifies() {
        let v = Hs256Verifier::new("secret");
        let jwt = v.sign(&patient(), 1_700_000_600).unwrap();
        assert_eq!(v.verify(&jwt, NOW).unwrap(), patient());
    }

    #[test]
    fn at_bearer_02_wrong_secret_and_expiry_fail() {
        let jwt = Hs256Verifier::new("secret")
            .sign(&patient(), 1_700_000_600)
            .unwrap();
        assert_eq!(
            Hs256Verifier::new("other").verify(&jwt, NOW),
            Err(CredentialError::BadSignature)
        );
        let stale = Hs256Verifier::new("secret")
            .sign(&patient(), 1_700_000_000)
            .unwrap();
        assert_eq!(
            Hs256Verifier::new("secret").verify(&stale, NOW),
            Err(CredentialError::Expired)
        );
    }

    #[test]
    fn at_bearer_03_malformed_and_disabled() {
        let v = Hs256Verifier::new("secret");
        assert_eq!(v.verify("a.b", NOW), Err(CredentialError::Malformed));
        assert_eq!(v.verify("a.b.c.d", NOW), Err(CredentialError::Malformed));
        assert_eq!(
            DisabledVerifier.verify("anything", NOW),
            Err(CredentialError::Unconfigured)
        );
    }

    #[test]
    fn at_bearer_04_other_algorithms_and_unknown_roles_are_refused() {
        let v = Hs256Verifier::new("secret");
        let hs384 = jsonwebtoken::encode(
            &Header::new(Algorithm::HS384),
            &JwtClaims {
                sub: "patient_1".to_string(),
                role: "patient".to_string(),
                exp: 1_700_000_600,
            },
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert_eq!(v.verify(&hs384, NOW), Err(CredentialError::Malformed));

        let nurse = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &JwtClaims {
                sub: "n_1".to_string(),
                role: "nurse".to_string(),
                exp: 1_700_000_600,
            },
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert_eq!(v.verify(&nurse, NOW), Err(CredentialError::UnknownRole));
    }
}
