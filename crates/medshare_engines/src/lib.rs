#![forbid(unsafe_code)]

pub mod bearer;
pub mod canonical;
pub mod ledger;
pub mod ledger_memory;
pub mod projection;
pub mod rlp;
pub mod token_codec;
pub mod tx_signer;
