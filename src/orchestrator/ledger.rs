//! Per-signature bookkeeping for one session.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::signature::ErrorSignature;

/// What the session knows about one signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerEntry {
    /// Refinement requests issued.
    pub modifications: u32,
    /// Every file a patch for this signature wrote.
    pub touched: BTreeSet<PathBuf>,
    /// Confidences that passed the gate, in order.
    pub accepted: Vec<f64>,
    /// A known fix from the store has been replayed.
    pub replayed: bool,
    pub exhausted: bool,
}

/// Arena of [`LedgerEntry`] keyed by signature.
#[derive(Debug, Clone, Default)]
pub struct SignatureLedger {
    entries: BTreeMap<ErrorSignature, LedgerEntry>,
}

impl SignatureLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, signature: &ErrorSignature) -> Option<&LedgerEntry> {
        self.entries.get(signature)
    }

    fn entry(&mut self, signature: &ErrorSignature) -> &mut LedgerEntry {
        self.entries.entry(signature.clone()).or_default()
    }

    #[must_use]
    pub fn modifications(&self, signature: &ErrorSignature) -> u32 {
        self.get(signature).map_or(0, |e| e.modifications)
    }

    pub fn record_modification(&mut self, signature: &ErrorSignature) {
        self.entry(signature).modifications += 1;
    }

    pub fn touch(&mut self, signature: &ErrorSignature, files: &[PathBuf]) {
        self.entry(signature).touched.extend(files.iter().cloned());
    }

    #[must_use]
    pub fn touched(&self, signature: &ErrorSignature) -> Vec<PathBuf> {
        self.get(signature)
            .map(|e| e.touched.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_accepted(&mut self, signature: &ErrorSignature, confidence: f64) {
        self.entry(signature).accepted.push(confidence);
    }

    #[must_use]
    pub fn accepted(&self, signature: &ErrorSignature) -> &[f64] {
        self.get(signature).map_or(&[], |e| e.accepted.as_slice())
    }

    pub fn mark_replayed(&mut self, signature: &ErrorSignature) {
        self.entry(signature).replayed = true;
    }

    #[must_use]
    pub fn replayed(&self, signature: &ErrorSignature) -> bool {
        self.get(signature).is_some_and(|e| e.replayed)
    }

    pub fn mark_exhausted(&mut self, signature: &ErrorSignature) {
        self.entry(signature).exhausted = true;
    }

    #[must_use]
    pub fn is_exhausted(&self, signature: &ErrorSignature) -> bool {
        self.get(signature).is_some_and(|e| e.exhausted)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
