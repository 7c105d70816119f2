//! Inbound nonce ledger.
//!
//! A nonce moves from absent to `Applied` exactly once. Redelivery of an
//! applied nonce is counted and ignored. A message whose core effect
//! failed is kept as `Failed` so it can be retried, and is never counted
//! as processed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::message::{CrossChainMessage, Nonce};
use super::{MessageStatus, SettlementError};

/// Ledger effect of an applied inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEffect {
    pub shares_minted: u64,
    pub shares_burned: u64,
    /// Assets released to the bridge for the receiver.
    pub assets_released: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRecord {
    pub message: CrossChainMessage,
    pub status: MessageStatus,
    pub effect: InboundEffect,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Failure of a follow-up action (e.g. auto-invest) after the core
    /// effect succeeded.
    pub follow_up_error: Option<String>,
    pub first_seen: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inbox {
    records: BTreeMap<Nonce, InboundRecord>,
    duplicates: u64,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<InboundRecord>, duplicates: u64) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.message.nonce, r))
                .collect(),
            duplicates,
        }
    }

    pub fn get(&self, nonce: &Nonce) -> Option<&InboundRecord> {
        self.records.get(nonce)
    }

    pub fn records(&self) -> impl Iterator<Item = &InboundRecord> {
        self.records.values()
    }

    pub fn is_processed(&self, nonce: &Nonce) -> bool {
        self.records
            .get(nonce)
            .map(|r| r.status == MessageStatus::Applied)
            .unwrap_or(false)
    }

    pub fn processed_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == MessageStatus::Applied)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == MessageStatus::Failed)
            .count()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn note_duplicate(&mut self, nonce: &Nonce) {
        self.duplicates += 1;
        tracing::debug!(%nonce, total = self.duplicates, "duplicate delivery ignored");
    }

    /// Marks the nonce processed. Returns the stored record.
    pub fn record_applied(
        &mut self,
        message: CrossChainMessage,
        effect: InboundEffect,
        follow_up_error: Option<String>,
        now: u64,
    ) -> &InboundRecord {
        let nonce = message.nonce;
        let record = self.records.entry(nonce).or_insert_with(|| InboundRecord {
            message: message.clone(),
            status: MessageStatus::Applied,
            effect,
            attempts: 0,
            last_error: None,
            follow_up_error: None,
            first_seen: now,
            updated_at: now,
        });
        record.message = message;
        record.status = MessageStatus::Applied;
        record.effect = effect;
        record.attempts += 1;
        record.last_error = None;
        record.follow_up_error = follow_up_error;
        record.updated_at = now;
        record
    }

    /// Records a failed core application. The nonce stays unprocessed.
    pub fn record_failed(&mut self, message: CrossChainMessage, reason: String, now: u64) -> &InboundRecord {
        let nonce = message.nonce;
        let record = self.records.entry(nonce).or_insert_with(|| InboundRecord {
            message: message.clone(),
            status: MessageStatus::Failed,
            effect: InboundEffect::default(),
            attempts: 0,
            last_error: None,
            follow_up_error: None,
            first_seen: now,
            updated_at: now,
        });
        record.status = MessageStatus::Failed;
        record.attempts += 1;
        record.last_error = Some(reason);
        record.updated_at = now;
        record
    }

    /// `Failed → Retried`; returns the stored envelope to re-apply.
    pub fn begin_retry(&mut self, nonce: &Nonce, now: u64) -> Result<CrossChainMessage, SettlementError> {
        let record = self
            .records
            .get_mut(nonce)
            .ok_or(SettlementError::UnknownMessage(*nonce))?;
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
}
