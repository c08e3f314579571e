#![forbid(unsafe_code)]

pub mod common;
pub mod consent;
pub mod identity;
pub mod integrity;
pub mod ledger;
pub mod record;

pub use common::{ContractViolation, ReasonCodeId, SchemaVersion, UnixTimeNs, Validate};
