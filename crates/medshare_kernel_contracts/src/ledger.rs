#![forbid(unsafe_code)]

//! Ledger payload convention and gateway result types.
//!
//! Ledger entries are zero-value self-transactions whose `data` carries UTF-8
//! JSON. There is no registry on chain: the `kind` tag of the envelope is the
//! only thing that distinguishes an anchor from a consent grant, an access log
//! or a revocation marker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::integrity::LedgerRef;

pub const LEDGER_PAYLOAD_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorEntry {
    pub subject_id: String,
    pub record_id: String,
    pub hash: String,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentGrantEntry {
    /// SHA-256 fingerprint of the token; the bearer token itself never leaves the core.
    pub token_fingerprint: String,
    pub scope: String,
    pub record_ids: Vec<String>,
    pub permissions: Vec<String>,
    pub expires_at_ns: u64,
    pub descriptor_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub token_fingerprint: String,
    pub event_seq: u64,
    pub accessor_id: String,
    pub facility_id: Option<String>,
    pub purpose: String,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationEntry {
    pub token_fingerprint: String,
    pub revoked_by: String,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerPayload {
    IntegrityAnchor(AnchorEntry),
    ConsentGrant(ConsentGrantEntry),
    AccessLog(AccessLogEntry),
    ConsentRevocation(RevocationEntry),
}

impl LedgerPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerPayload::IntegrityAnchor(_) => "integrity_anchor",
            LedgerPayload::ConsentGrant(_) => "consent_grant",
            LedgerPayload::AccessLog(_) => "access_log",
            LedgerPayload::ConsentRevocation(_) => "consent_revocation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerPayloadError {
    NotAnObject,
    UnsupportedVersion(u64),
    Malformed(String),
}

impl std::fmt::Display for LedgerPayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "ledger payload is not a JSON object"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported ledger payload version {v}"),
            Self::Malformed(detail) => write!(f, "malformed ledger payload: {detail}"),
        }
    }
}

impl std::error::Error for LedgerPayloadError {}

/// Versioned wrapper written to the ledger: `{"v":1,"kind":...,<entry fields>}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEnvelope {
    pub version: u8,
    pub payload: LedgerPayload,
}

impl LedgerEnvelope {
    pub fn v1(payload: LedgerPayload) -> Self {
        Self {
            version: LEDGER_PAYLOAD_VERSION,
            payload,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, LedgerPayloadError> {
        let mut value = serde_json::to_value(&self.payload)
            .map_err(|e| LedgerPayloadError::Malformed(e.to_string()))?;
        let obj = value
            .as_object_mut()
            .ok_or(LedgerPayloadError::NotAnObject)?;
        obj.insert("v".to_string(), Value::from(self.version));
        serde_json::to_vec(&value).map_err(|e| LedgerPayloadError::Malformed(e.to_string()))
    }

    /// Decodes both versioned envelopes and legacy untagged anchor payloads
    /// (`{"hash": ...}` without `v`), which are reported as version 0.
    pub fn from_json_value(value: &Value) -> Result<Self, LedgerPayloadError> {
        let obj = value.as_object().ok_or(LedgerPayloadError::NotAnObject)?;
        match obj.get("v") {
            None => {
                let legacy: LegacyAnchorPayload = serde_json::from_value(value.clone())
                    .map_err(|e| LedgerPayloadError::Malformed(e.to_string()))?;
                Ok(Self {
                    version: 0,
                    payload: LedgerPayload::IntegrityAnchor(AnchorEntry {
                        subject_id: legacy.subject_id.unwrap_or_default(),
                        record_id: legacy.record_id.unwrap_or_default(),
                        hash: legacy.hash,
                        timestamp_ns: legacy.timestamp.unwrap_or_default(),
                    }),
                })
            }
            Some(v) => {
                let version = v
                    .as_u64()
                    .ok_or_else(|| LedgerPayloadError::Malformed("v must be an integer".into()))?;
                if version != u64::from(LEDGER_PAYLOAD_VERSION) {
                    return Err(LedgerPayloadError::UnsupportedVersion(version));
                }
                let mut body = obj.clone();
                body.remove("v");
                let payload: LedgerPayload = serde_json::from_value(Value::Object(body))
                    .map_err(|e| LedgerPayloadError::Malformed(e.to_string()))?;
                Ok(Self {
                    version: LEDGER_PAYLOAD_VERSION,
                    payload,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyAnchorPayload {
    hash: String,
    subject_id: Option<String>,
    record_id: Option<String>,
    timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub reachable: bool,
    pub chain_id: Option<u64>,
    pub latest_block: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    /// Gas limit: simulated usage plus a 20% buffer, rounded up.
    pub fee_limit: u64,
    /// Price per unit of gas, in the chain's smallest denomination.
    pub fee_rate: u128,
}

impl FeeEstimate {
    pub fn with_buffer(simulated_gas: u64, fee_rate: u128) -> Self {
        let buffered = (u128::from(simulated_gas) * 120).div_ceil(100);
        Self {
            fee_limit: u64::try_from(buffered).unwrap_or(u64::MAX),
            fee_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub ledger_ref: LedgerRef,
    pub block_height: u64,
    pub fee_spent: u128,
}
