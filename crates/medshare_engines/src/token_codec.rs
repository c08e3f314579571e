#![forbid(unsafe_code)]

//! Consent token ids, ledger fingerprints and the external bundle encoding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use medshare_kernel_contracts::consent::{
    ConsentToken, ConsentTokenBundle, TokenId, CONSENT_BUNDLE_TYPE,
};
use medshare_kernel_contracts::identity::UserId;
use medshare_kernel_contracts::record::RecordId;
use medshare_kernel_contracts::{ContractViolation, UnixTimeNs};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::canonical::sha256_hex;

pub const TOKEN_ID_PREFIX: &str = "ct_";
const TOKEN_ENTROPY_BYTES: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenCodecError {
    #[error("presented consent token could not be decoded")]
    Undecodable,
    #[error("consent bundle encoding failed: {0}")]
    Encode(String),
}

pub fn generate_token_id() -> Result<TokenId, ContractViolation> {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    TokenId::new(format!("{TOKEN_ID_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

/// What gets written to the ledger and to logs in place of the bearer token.
pub fn token_fingerprint(token_id: &TokenId) -> String {
    sha256_hex(token_id.as_str().as_bytes())
}

pub fn bundle_checksum(token_id: &TokenId, owner_id: &UserId, record_ids: &[RecordId]) -> String {
    let joined = record_ids
        .iter()
        .map(RecordId::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let mut material = String::with_capacity(
        token_id.as_str().len() + owner_id.as_str().len() + joined.len(),
    );
    material.push_str(token_id.as_str());
    material.push_str(owner_id.as_str());
    material.push_str(&joined);
    sha256_hex(material.as_bytes())
}

pub fn bundle_for(token: &ConsentToken, generated_at: UnixTimeNs) -> ConsentTokenBundle {
    ConsentTokenBundle {
        token: token.token_id.as_str().to_string(),
        type_marker: CONSENT_BUNDLE_TYPE.to_string(),
        scope: token.scope.as_str().to_string(),
        record_count: u32::try_from(token.record_ids.len()).unwrap_or(u32::MAX),
        generated_at_ns: generated_at.0,
        expires_at_ns: token.expires_at.0,
        checksum: bundle_checksum(&token.token_id, &token.owner_id, &token.record_ids),
    }
}

pub fn encode_bundle(bundle: &ConsentTokenBundle) -> Result<String, TokenCodecError> {
    let json = serde_json::to_vec(bundle).map_err(|e| TokenCodecError::Encode(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_bundle(encoded: &str) -> Result<ConsentTokenBundle, TokenCodecError> {
    let raw = URL_SAFE_NO_PAD
        .decode(encoded.trim().trim_end_matches('='))
        .map_err(|_| TokenCodecError::Undecodable)?;
    let bundle: ConsentTokenBundle =
        serde_json::from_slice(&raw).map_err(|_| TokenCodecError::Undecodable)?;
    if bundle.type_marker != CONSENT_BUNDLE_TYPE {
        return Err(TokenCodecError::Undecodable);
    }
    Ok(bundle)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentedToken {
    RawId(TokenId),
    Bundle {
        token_id: TokenId,
        bundle: ConsentTokenBundle,
    },
}

impl PresentedToken {
    pub fn token_id(&self) -> &TokenId {
        match self {
            PresentedToken::RawId(id) => id,
            PresentedToken::Bundle { token_id, .. } => token_id,
        }
    }
}

/// A caller may present either the bare token id or the encoded bundle.
pub fn parse_presented(raw: &str) -> Result<PresentedToken, TokenCodecError> {
    let raw = raw.trim();
    if raw.starts_with(TOKEN_ID_PREFIX) {
        if let Ok(id) = TokenId::new(raw) {
            return Ok(PresentedToken::RawId(id));
        }
    }
    let bundle = decode_bundle(raw)?;
    let token_id = TokenId::new(bundle.token.clone()).map_err(|_| TokenCodecError::Undecodable)?;
    Ok(PresentedToken::Bundle { token_id, bundle })
}

pub fn bundle_matches(bundle: &ConsentTokenBundle, token: &ConsentToken) -> bool {
    bundle.token == token.token_id.as_str()
        && bundle.checksum == bundle_checksum(&token.token_id, &token.owner_id, &token.record_ids)
}
