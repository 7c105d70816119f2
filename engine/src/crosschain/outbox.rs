//! Outbound message ledger.
//!
//! A record is reserved (status `Dispatched`) and persisted before the
//! envelope reaches the transport. Dispatching the same logical request
//! again finds the reservation and returns it instead of sending twice.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bridge::BridgeRoute;
use super::message::{CrossChainMessage, Nonce};
use super::{MessageStatus, SettlementError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub message: CrossChainMessage,
    pub status: MessageStatus,
    pub route: Option<BridgeRoute>,
    /// Assets held back until the transport accepts the message.
    pub escrowed: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outbox {
    records: BTreeMap<Nonce, OutboundRecord>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<OutboundRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.message.nonce, r))
                .collect(),
        }
    }

    pub fn get(&self, nonce: &Nonce) -> Option<&OutboundRecord> {
        self.records.get(nonce)
    }

    pub fn records(&self) -> impl Iterator<Item = &OutboundRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Messages not yet confirmed by the destination.
    pub fn unconfirmed(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status != MessageStatus::Applied)
            .count()
    }

    /// Assets currently held in escrow across all records.
    pub fn escrowed(&self) -> u64 {
        self.records
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.escrowed))
    }

    /// Reserves a record. Returns `false` if the nonce was already known,
    /// in which case nothing changes.
    pub fn reserve(&mut self, message: CrossChainMessage, escrowed: u64, now: u64) -> bool {
        if self.records.contains_key(&message.nonce) {
            return false;
        }
        self.records.insert(
            message.nonce,
            OutboundRecord {
                message,
                status: MessageStatus::Dispatched,
                route: None,
                escrowed,
                attempts: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        true
    }

    /// The transport accepted the envelope. Escrow is released to the
    /// bridge; returns the amount released.
    pub fn mark_sent(&mut self, nonce: &Nonce, route: BridgeRoute, now: u64) -> Result<u64, SettlementError> {
        let record = self.get_mut(nonce)?;
        let next = match record.status {
            MessageStatus::Dispatched => MessageStatus::InFlight,
            MessageStatus::Retried => MessageStatus::Retried,
            from => {
                return Err(SettlementError::InvalidTransition {
                    nonce: *nonce,
                    from,
                    via: "mark_sent",
                })
            }
        };
        record.status = next;
        record.route = Some(route);
        record.attempts += 1;
        record.last_error = None;
        record.updated_at = now;
        Ok(std::mem::take(&mut record.escrowed))
    }

    pub fn mark_failed(&mut self, nonce: &Nonce, reason: String, now: u64) -> Result<(), SettlementError> {
        let record = self.get_mut(nonce)?;
        if record.status == MessageStatus::Applied {
            return Err(SettlementError::InvalidTransition {
                nonce: *nonce,
                from: record.status,
                via: "mark_failed",
            });
        }
        record.status = MessageStatus::Failed;
        record.attempts += 1;
        record.last_error = Some(reason);
        record.updated_at = now;
        Ok(())
    }

    /// `Failed → Retried`; returns the envelope to resend.
    pub fn begin_retry(&mut self, nonce: &Nonce, now: u64) -> Result<CrossChainMessage, SettlementError> {
        let record = self.get_mut(nonce)?;
        if record.status != MessageStatus::Failed {
            return Err(SettlementError::InvalidTransition {
                nonce: *nonce,
                from: record.status,
                via: "retry",
            });
        }
        record.status = MessageStatus::Retried;
        record.updated_at = now;
        Ok(record.message.clone())
    }

    /// The destination applied the message.
    pub fn confirm(&mut self, nonce: &Nonce, now: u64) -> Result<&OutboundRecord, SettlementError> {
        let record = self.get_mut(nonce)?;
        match record.status {
            MessageStatus::InFlight | MessageStatus::Retried => {
                record.status = MessageStatus::Applied;
                record.updated_at = now;
                Ok(record)
            }
            from => Err(SettlementError::InvalidTransition {
                nonce: *nonce,
                from,
                via: "confirm",
            }),
        }
    }

    fn get_mut(&mut self, nonce: &Nonce) -> Result<&mut OutboundRecord, SettlementError> {
        self.records
            .get_mut(nonce)
            .ok_or(SettlementError::UnknownMessage(*nonce))
    }
}
