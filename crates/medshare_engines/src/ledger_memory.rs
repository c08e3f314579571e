#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use medshare_kernel_contracts::integrity::LedgerRef;
use medshare_kernel_contracts::ledger::{ConnectionStatus, FeeEstimate, SubmitReceipt};
use serde_json::Value;

use crate::canonical::sha256_hex;
use crate::ledger::{LedgerError, LedgerGateway};

pub const MEMORY_LEDGER_CHAIN_ID: u64 = 31_337;
const MEMORY_LEDGER_FEE_RATE: u128 = 1_000_000_000;
const BASE_TX_GAS: u64 = 21_000;
const CALLDATA_GAS_PER_BYTE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLedgerFault {
    None,
    Unreachable,
    /// Submissions broadcast but never confirm.
    Timeout,
    /// The node refuses every submission.
    Reject,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    entries: BTreeMap<LedgerRef, Vec<u8>>,
    block_height: u64,
}

/// In-process ledger with the same contract as the JSON-RPC gateway.
#[derive(Debug)]
pub struct MemoryLedgerGateway {
    state: Mutex<MemoryLedgerState>,
    fault: Mutex<MemoryLedgerFault>,
    can_submit: bool,
}

impl Default for MemoryLedgerGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryLedgerState::default()),
            fault: Mutex::new(MemoryLedgerFault::None),
            can_submit: true,
        }
    }

    pub fn read_only() -> Self {
        Self {
            can_submit: false,
            ..Self::new()
        }
    }

    pub fn set_fault(&self, fault: MemoryLedgerFault) {
        if let Ok(mut f) = self.fault.lock() {
            *f = fault;
        }
    }

    fn fault(&self) -> MemoryLedgerFault {
        self.fault
            .lock()
            .map(|f| *f)
            .unwrap_or(MemoryLedgerFault::Unreachable)
    }

    fn offline() -> LedgerError {
        LedgerError::LedgerUnavailable("memory ledger offline".to_string())
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Decoded payloads in ledger-ref order.
    pub fn payloads(&self) -> Vec<Value> {
        self.state
            .lock()
            .map(|s| {
                s.entries
                    .values()
                    .filter_map(|b| serde_json::from_slice(b).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrites stored bytes; lets tests model a forged entry.
    pub fn overwrite_entry(&self, ledger_ref: &LedgerRef, payload: &[u8]) -> bool {
        match self.state.lock() {
            Ok(mut s) => match s.entries.get_mut(ledger_ref) {
                Some(slot) => {
                    *slot = payload.to_vec();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

fn simulated_gas(payload: &[u8]) -> u64 {
    BASE_TX_GAS.saturating_add(CALLDATA_GAS_PER_BYTE.saturating_mul(payload.len() as u64))
}

#[async_trait]
impl LedgerGateway for MemoryLedgerGateway {
    async fn check_connection(&self) -> ConnectionStatus {
        if self.fault() == MemoryLedgerFault::Unreachable {
            return ConnectionStatus {
                reachable: false,
                chain_id: None,
                latest_block: None,
            };
        }
        let latest_block = self.state.lock().map(|s| s.block_height).ok();
        ConnectionStatus {
            reachable: true,
            chain_id: Some(MEMORY_LEDGER_CHAIN_ID),
            latest_block,
        }
    }

    async fn estimate_fee(&self, payload: &[u8]) -> Result<FeeEstimate, LedgerError> {
        if self.fault() == MemoryLedgerFault::Unreachable {
            return Err(Self::offline());
        }
        Ok(FeeEstimate::with_buffer(
            simulated_gas(payload),
            MEMORY_LEDGER_FEE_RATE,
        ))
    }

    async fn submit(&self, payload: &[u8]) -> Result<SubmitReceipt, LedgerError> {
        if !self.can_submit {
            return Err(LedgerError::Unconfigured);
        }
        match self.fault() {
            MemoryLedgerFault::None => {}
            MemoryLedgerFault::Unreachable => return Err(Self::offline()),
            MemoryLedgerFault::Timeout => {
                return Err(LedgerError::LedgerTimeout(
                    "memory ledger confirmation withheld".to_string(),
                ))
            }
            MemoryLedgerFault::Reject => {
                return Err(LedgerError::SubmissionFailed(
                    "memory ledger rejected submission".to_string(),
                ))
            }
        }
        let mut state = self.state.lock().map_err(|_| Self::offline())?;
        state.block_height = state.block_height.saturating_add(1);
        let mut material = state.block_height.to_be_bytes().to_vec();
        material.extend_from_slice(payload);
        let ledger_ref = LedgerRef::new(format!("0x{}", sha256_hex(&material)))
            .map_err(|_| LedgerError::SubmissionFailed("invalid ledger ref".to_string()))?;
        state.entries.insert(ledger_ref.clone(), payload.to_vec());
        Ok(SubmitReceipt {
            ledger_ref,
            block_height: state.block_height,
            fee_spent: u128::from(simulated_gas(payload)) * MEMORY_LEDGER_FEE_RATE,
        })
    }

    async fn fetch(&self, ledger_ref: &LedgerRef) -> Result<Value, LedgerError> {
        if self.fault() == MemoryLedgerFault::Unreachable {
            return Err(Self::offline());
        }
        let state = self.state.lock().map_err(|_| Self::offline())?;
        let bytes = state.entries.get(ledger_ref).ok_or(LedgerError::NotFound)?;
        serde_json::from_slice(bytes).map_err(|_| LedgerError::NotFound)
    }

    fn can_submit(&self) -> bool {
        self.can_submit
    }
}
