#![forbid(unsafe_code)]

use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::rlp;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("signing key is not a valid secp256k1 secret")]
    InvalidKey,
    #[error("signing failed")]
    Signing,
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut h = Keccak256::new();
    h.update(input);
    h.finalize().into()
}

/// Zero-fee-market (pre-1559) transaction signed with EIP-155 replay protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTx {
    fn base_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp::encode_uint(u128::from(self.nonce)),
            rlp::encode_uint(self.gas_price),
            rlp::encode_uint(u128::from(self.gas_limit)),
            rlp::encode_bytes(&self.to),
            rlp::encode_uint(self.value),
            rlp::encode_bytes(&self.data),
        ]
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        let mut fields = self.base_fields();
        fields.push(rlp::encode_uint(u128::from(self.chain_id)));
        fields.push(rlp::encode_uint(0));
        fields.push(rlp::encode_uint(0));
        keccak256(&rlp::encode_list(&fields))
    }
}

pub struct TxSigner {
    key: SigningKey,
    address: [u8; 20],
}

impl std::fmt::Debug for TxSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxSigner")
            .field("address", &self.address_hex())
            .finish_non_exhaustive()
    }
}

impl TxSigner {
    pub fn from_hex(secret_hex: &str) -> Result<Self, SignerError> {
        let raw = hex::decode(secret_hex.trim().trim_start_matches("0x"))
            .map_err(|_| SignerError::InvalidKey)?;
        if raw.len() != 32 {
            return Err(SignerError::InvalidKey);
        }
        let key = SigningKey::from_slice(&raw).map_err(|_| SignerError::InvalidKey)?;
        let address = address_of(&key);
        Ok(Self { key, address })
    }

    pub fn address(&self) -> [u8; 20] {
        self.address
    }

    pub fn address_hex(&self) -> String {
        format!("0x{}", hex::encode(self.address))
    }

    /// Returns the raw signed transaction ready for `eth_sendRawTransaction`.
    pub fn sign_legacy(&self, tx: &LegacyTx) -> Result<Vec<u8>, SignerError> {
        let sighash = tx.signing_hash();
        let (sig, recid): (Signature, RecoveryId) = self
            .key
            .sign_prehash_recoverable(&sighash)
            .map_err(|_| SignerError::Signing)?;
        let v = u128::from(recid.to_byte()) + u128::from(tx.chain_id) * 2 + 35;
        let sig_bytes = sig.to_bytes();
        let (r, s) = sig_bytes.split_at(32);

        let mut fields = tx.base_fields();
        fields.push(rlp::encode_uint(v));
        fields.push(rlp::encode_bytes(strip_leading_zeros(r)));
        fields.push(rlp::encode_bytes(strip_leading_zeros(s)));
        Ok(rlp::encode_list(&fields))
    }
}

fn address_of(key: &SigningKey) -> [u8; 20] {
    let point = key.verifying_key().to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    out
}

fn strip_leading_zeros(b: &[u8]) -> &[u8] {
    let first = b.iter().position(|x| *x != 0).unwrap_or(b.len());
    &b[first..]
}
