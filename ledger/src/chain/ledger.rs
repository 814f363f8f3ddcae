//! # HashChain
//!
//! The ordered, append-only block sequence.
//!
//! ## Ownership
//!
//! `HashChain` owns its blocks outright and never lends them out: every
//! read returns an owned [`Block`] cloned from storage. A caller that masks
//! an Aadhaar number in a returned payload is editing its own copy.
//!
//! ## Invariants
//!
//! After any public method returns:
//!
//! - `blocks[i].index == i`
//! - `blocks[i].previous_hash == blocks[i - 1].hash` (genesis links to `"0"`)
//! - every stored hash recomputes from its block and meets the difficulty
//!
//! `append` re-checks the block it just mined against its predecessor before
//! committing it. `load` runs the full validation pass and refuses anything
//! with a diagnostic.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::block::{Block, NonceSpaceExhausted};
use super::state::CurrentState;
use super::validation::{check_block, validate_blocks, Diagnostic, IntegrityError};
use crate::config::GENESIS_PREVIOUS_HASH;

/// Errors from mutating the chain.
///
/// Both variants mean the process is in a state it should never reach.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Mining(#[from] NonceSpaceExhausted),

    #[error("freshly mined block violates chain invariants: {0}")]
    Invariant(#[from] IntegrityError),
}

/// Summary numbers for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub total_blocks: usize,
    pub total_keys: usize,
    pub latest_hash: Option<String>,
    pub difficulty: u32,
}

/// Append-only hash-linked ledger.
#[derive(Debug, Clone)]
pub struct HashChain {
    blocks: Vec<Block>,
    difficulty: u32,
}

impl HashChain {
    /// A new chain holding only a freshly mined genesis block.
    pub fn genesis(difficulty: u32) -> Result<Self, ChainError> {
        let genesis = Block::genesis(difficulty)?;
        debug!(hash = %genesis.hash, nonce = genesis.nonce, "mined genesis block");
        Ok(Self {
            blocks: vec![genesis],
            difficulty,
        })
    }

    /// Replace-by-construction from a decoded block sequence.
    ///
    /// Refuses the whole sequence if any block fails validation. An empty
    /// sequence is a valid, empty chain.
    pub fn load(blocks: Vec<Block>, difficulty: u32) -> Result<Self, IntegrityError> {
        let diagnostics = validate_blocks(&blocks, difficulty);
        if !diagnostics.is_empty() {
            return Err(IntegrityError { diagnostics });
        }
        Ok(Self { blocks, difficulty })
    }

    /// Keep the longest valid prefix of `blocks` and report what was cut.
    ///
    /// An operator action for recovering the readable part of a damaged
    /// snapshot. Restoration never calls this.
    pub fn salvage_prefix(blocks: Vec<Block>, difficulty: u32) -> (Self, Vec<Diagnostic>) {
        let diagnostics = validate_blocks(&blocks, difficulty);
        let keep = diagnostics
            .iter()
            .map(|d| d.index as usize)
            .min()
            .unwrap_or(blocks.len());

        let mut blocks = blocks;
        if keep < blocks.len() {
            warn!(
                kept = keep,
                dropped = blocks.len() - keep,
                "salvage truncated chain at first invalid block"
            );
        }
        blocks.truncate(keep);
        (Self { blocks, difficulty }, diagnostics)
    }

    /// Mine `payload` onto the tip and return a copy of the new block.
    ///
    /// The timestamp is `max(now, tip.timestamp)` so the chain's clock never
    /// runs backwards. On an empty chain the block is mined as index 0 with
    /// the genesis link sentinel.
    pub fn append(&mut self, payload: Value) -> Result<Block, ChainError> {
        let index = self.blocks.len() as u64;
        let previous = self.blocks.last();

        let now = Utc::now();
        let timestamp = match previous {
            Some(prev) if prev.timestamp > now => prev.timestamp,
            _ => now,
        };
        let previous_hash = previous
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string());

        let block = Block::mine(index, timestamp, payload, previous_hash, self.difficulty)?;

        let mut diagnostics = Vec::new();
        check_block(index, &block, previous, self.difficulty, &mut diagnostics);
        if !diagnostics.is_empty() {
            return Err(IntegrityError { diagnostics }.into());
        }

        debug!(index, nonce = block.nonce, hash = %block.hash, "block appended");
        self.blocks.push(block.clone());
        Ok(block)
    }

    /// Copy of the block at `index`.
    pub fn get(&self, index: u64) -> Option<Block> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .cloned()
    }

    /// Copy of the tip.
    pub fn latest(&self) -> Option<Block> {
        self.blocks.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Lazily yield copies of matching blocks, oldest first.
    pub fn history_matching<'a, P>(&'a self, mut predicate: P) -> impl Iterator<Item = Block> + 'a
    where
        P: FnMut(&Block) -> bool + 'a,
    {
        self.blocks
            .iter()
            .filter(move |b| predicate(*b))
            .cloned()
    }

    /// Every block whose record key is `key`, oldest first.
    pub fn history_for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = Block> + 'a {
        self.history_matching(move |b| b.key() == Some(key))
    }

    /// Fold of `key`'s history into its latest view.
    pub fn current_state(&self, key: &str) -> Option<CurrentState> {
        CurrentState::fold(key, self.blocks.iter().filter(|b| b.key() == Some(key)))
    }

    /// Distinct record keys in order of first appearance.
    pub fn keys(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.blocks
            .iter()
            .filter_map(Block::key)
            .filter(|k| seen.insert(*k))
            .map(str::to_string)
            .collect()
    }

    pub fn info(&self) -> ChainInfo {
        ChainInfo {
            total_blocks: self.blocks.len(),
            total_keys: self.keys().len(),
            latest_hash: self.blocks.last().map(|b| b.hash.clone()),
            difficulty: self.difficulty,
        }
    }

    /// Walk every block once and report all violations.
    pub fn validate(&self) -> (bool, Vec<Diagnostic>) {
        let diagnostics = validate_blocks(&self.blocks, self.difficulty);
        (diagnostics.is_empty(), diagnostics)
    }

    /// Copies of every block, for encoding.
    pub fn dump(&self) -> Vec<Block> {
        self.blocks.clone()
    }

    /// Borrow for in-crate encoding without cloning the whole chain.
    pub(crate) fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Drop blocks beyond `len`. Used to roll back an append whose local
    /// write failed.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.blocks.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::validation::DiagnosticKind;
    use serde_json::json;

    const D: u32 = 2;

    fn chain_with(n: usize) -> HashChain {
        let mut chain = HashChain::genesis(D).unwrap();
        for i in 1..=n {
            chain
                .append(json!({"type": "add", "key": format!("PROP-{i}"), "owner": "Asha"}))
                .unwrap();
        }
        chain
    }

    #[test]
    fn fresh_genesis_is_valid() {
        let chain = HashChain::genesis(D).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.validate(), (true, vec![]));
    }

    #[test]
    fn single_append_scenario() {
        let mut chain = HashChain::genesis(D).unwrap();
        chain.append(json!({"type": "add", "key": "PROP-1"})).unwrap();
        assert_eq!(chain.len(), 2);
        let g = chain.get(0).unwrap();
        let b = chain.get(1).unwrap();
        assert_eq!(b.previous_hash, g.hash);
        assert_eq!(chain.validate(), (true, vec![]));
    }

    #[test]
    fn appended_blocks_link_in_order() {
        let chain = chain_with(6);
        let blocks = chain.dump();
        assert_eq!(blocks.len(), 7);
        for (i, pair) in blocks.windows(2).enumerate() {
            assert_eq!(pair[1].index, i as u64 + 1);
            assert_eq!(pair[1].previous_hash, pair[0].hash);
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[test]
    fn returned_views_are_independent() {
        let mut chain = chain_with(1);
        let mut first = chain.get(1).unwrap();
        let second = chain.get(1).unwrap();
        first.payload["owner"] = json!("Mallory");
        first.payload["nested"] = json!({"x": 1});

        let third = chain.get(1).unwrap();
        assert_eq!(second, third);
        assert_eq!(third.payload["owner"], json!("Asha"));
        assert!(chain.validate().0);

        // A mutated history entry does not leak back either.
        let mut history: Vec<_> = chain.history_for_key("PROP-1").collect();
        history[0].payload = Value::Null;
        assert_eq!(history[0].payload, Value::Null);
        assert_eq!(chain.get(1).unwrap(), third);

        chain.append(json!({"type": "add", "key": "PROP-2"})).unwrap();
        assert!(chain.validate().0);
    }

    #[test]
    fn get_out_of_range_is_none() {
        assert!(chain_with(1).get(99).is_none());
        assert!(chain_with(1).get(u64::MAX).is_none());
    }

    #[test]
    fn history_and_state_for_key() {
        let mut chain = chain_with(2);
        chain
            .append(json!({"type": "transfer", "property_key": "PROP-1", "new_owner": "Bala"}))
            .unwrap();

        let history: Vec<_> = chain.history_for_key("PROP-1").collect();
        assert_eq!(history.iter().map(|b| b.index).collect::<Vec<_>>(), vec![1, 3]);

        let state = chain.current_state("PROP-1").unwrap();
        assert_eq!(state.get("owner"), Some(&json!("Bala")));
        assert_eq!(state.total_transfers, 1);
        assert!(chain.current_state("PROP-404").is_none());
    }

    #[test]
    fn keys_in_first_appearance_order() {
        let mut chain = chain_with(2);
        chain
            .append(json!({"type": "transfer", "property_key": "PROP-1", "new_owner": "Bala"}))
            .unwrap();
        assert_eq!(chain.keys(), vec!["PROP-1", "PROP-2"]);
        let info = chain.info();
        assert_eq!(info.total_blocks, 4);
        assert_eq!(info.total_keys, 2);
        assert_eq!(info.latest_hash, chain.latest().map(|b| b.hash));
    }

    #[test]
    fn load_accepts_valid_and_empty() {
        let chain = chain_with(3);
        let loaded = HashChain::load(chain.dump(), D).unwrap();
        assert_eq!(loaded.dump(), chain.dump());
        assert!(HashChain::load(vec![], D).unwrap().is_empty());
    }

    #[test]
    fn load_refuses_tampered_chain() {
        let mut blocks = chain_with(3).dump();
        blocks[2].payload["owner"] = json!("Mallory");
        let err = HashChain::load(blocks, D).unwrap_err();
        assert!(err
            .diagnostics
            .iter()
            .any(|d| d.index == 2 && d.kind == DiagnosticKind::HashMismatch));
    }

    #[test]
    fn every_single_field_mutation_is_detected() {
        let original = chain_with(3).dump();
        let mutations: Vec<Box<dyn Fn(&mut Block)>> = vec![
            Box::new(|b: &mut Block| b.payload["owner"] = json!("x")),
            Box::new(|b: &mut Block| b.previous_hash = "1".repeat(64)),
            Box::new(|b: &mut Block| b.timestamp = b.timestamp + chrono::Duration::nanoseconds(1)),
            Box::new(|b: &mut Block| b.nonce = b.nonce.wrapping_add(1)),
        ];
        for target in 0..original.len() {
            for mutate in &mutations {
                let mut blocks = original.clone();
                mutate(&mut blocks[target]);
                let diags = validate_blocks(&blocks, D);
                assert!(
                    diags.iter().any(|d| d.index == target as u64),
                    "mutation of block {target} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn append_onto_empty_chain_starts_at_zero() {
        let mut chain = HashChain::load(vec![], D).unwrap();
        let block = chain.append(json!({"type": "add", "key": "K"})).unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.previous_hash, "0");
        assert!(chain.validate().0);
    }

    #[test]
    fn salvage_keeps_valid_prefix() {
        let mut blocks = chain_with(4).dump();
        blocks[3].payload["owner"] = json!("Mallory");
        let (salvaged, diags) = HashChain::salvage_prefix(blocks, D);
        assert_eq!(salvaged.len(), 3);
        assert!(salvaged.validate().0);
        assert!(!diags.is_empty());
    }

    #[test]
    fn salvage_of_valid_chain_keeps_everything() {
        let chain = chain_with(2);
        let (salvaged, diags) = HashChain::salvage_prefix(chain.dump(), D);
        assert_eq!(salvaged.len(), 3);
        assert!(diags.is_empty());
    }
}
