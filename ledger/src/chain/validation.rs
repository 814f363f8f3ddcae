//! # Chain Validation
//!
//! One pass over the blocks, collecting every violation instead of stopping
//! at the first one. An operator looking at a damaged snapshot wants the
//! full picture: "block 4 was edited" reads very differently from "block 4
//! was edited and everything after it was re-linked by hand".
//!
//! Validation never repairs anything. The only recovery path is restoring a
//! different snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::block::Block;
use crate::config::GENESIS_PREVIOUS_HASH;
use crate::crypto::hash::meets_difficulty;

/// What kind of rule a block broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// `blocks[i].index != i`.
    IndexGap,
    /// The stored hash does not recompute from the block's fields.
    HashMismatch,
    /// `previous_hash` does not equal the predecessor's hash.
    BrokenLink,
    /// The genesis block's `previous_hash` is not the `"0"` sentinel.
    BadGenesisLink,
    /// The stored hash lacks the required leading zeros.
    PowNotSatisfied,
    /// The timestamp is earlier than the predecessor's.
    TimestampRegression,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IndexGap => "index gap",
            Self::HashMismatch => "hash mismatch",
            Self::BrokenLink => "broken link",
            Self::BadGenesisLink => "bad genesis link",
            Self::PowNotSatisfied => "proof-of-work not satisfied",
            Self::TimestampRegression => "timestamp regression",
        };
        f.write_str(s)
    }
}

/// One violation, tagged with the position of the offending block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub index: u64,
    pub kind: DiagnosticKind,
    pub detail: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}: {} ({})", self.index, self.kind, self.detail)
    }
}

/// A chain failed validation. Surfaced to the operator, never auto-repaired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chain integrity check failed with {} violation(s){}", .diagnostics.len(), first_violation(.diagnostics))]
pub struct IntegrityError {
    pub diagnostics: Vec<Diagnostic>,
}

fn first_violation(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .first()
        .map(|d| format!(", first: {d}"))
        .unwrap_or_default()
}

/// Validate a whole block sequence against `difficulty`.
pub fn validate_blocks(blocks: &[Block], difficulty: u32) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (position, block) in blocks.iter().enumerate() {
        let previous = position.checked_sub(1).map(|p| &blocks[p]);
        check_block(position as u64, block, previous, difficulty, &mut diagnostics);
    }
    diagnostics
}

/// Check one block in place at `position`, given its predecessor.
pub fn check_block(
    position: u64,
    block: &Block,
    previous: Option<&Block>,
    difficulty: u32,
    out: &mut Vec<Diagnostic>,
) {
    let mut push = |kind, detail: String| {
        out.push(Diagnostic {
            index: position,
            kind,
            detail,
        })
    };

    if block.index != position {
        push(
            DiagnosticKind::IndexGap,
            format!("stored index {} at position {}", block.index, position),
        );
    }

    let recomputed = block.compute_hash();
    if recomputed != block.hash {
        push(
            DiagnosticKind::HashMismatch,
            format!("stored={} computed={}", block.hash, recomputed),
        );
    }

    if !meets_difficulty(&block.hash, difficulty) {
        push(
            DiagnosticKind::PowNotSatisfied,
            format!("hash {} needs {} leading zeros", block.hash, difficulty),
        );
    }

    match previous {
        None => {
            if block.previous_hash != GENESIS_PREVIOUS_HASH {
                push(
                    DiagnosticKind::BadGenesisLink,
                    format!("genesis previous_hash is {:?}", block.previous_hash),
                );
            }
        }
        Some(prev) => {
            if block.previous_hash != prev.hash {
                push(
                    DiagnosticKind::BrokenLink,
                    format!(
                        "previous_hash={} but block {} hash={}",
                        block.previous_hash,
                        position - 1,
                        prev.hash
                    ),
                );
            }
            if block.timestamp < prev.timestamp {
                push(
                    DiagnosticKind::TimestampRegression,
                    format!("{} is before {}", block.timestamp, prev.timestamp),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    const D: u32 = 1;

    fn chain_of(n: usize) -> Vec<Block> {
        let mut blocks = vec![Block::genesis(D).unwrap()];
        for i in 1..n {
            let prev = &blocks[i - 1];
            let block = Block::mine(
                i as u64,
                prev.timestamp + Duration::seconds(1),
                json!({"type": "add", "key": format!("PROP-{i}")}),
                prev.hash.clone(),
                D,
            )
            .unwrap();
            blocks.push(block);
        }
        blocks
    }

    fn kinds_at(diags: &[Diagnostic], index: u64) -> Vec<DiagnosticKind> {
        diags.iter().filter(|d| d.index == index).map(|d| d.kind).collect()
    }

    #[test]
    fn valid_chain_has_no_diagnostics() {
        assert!(validate_blocks(&chain_of(5), D).is_empty());
    }

    #[test]
    fn empty_sequence_is_valid() {
        assert!(validate_blocks(&[], D).is_empty());
    }

    #[test]
    fn payload_edit_is_a_hash_mismatch() {
        let mut blocks = chain_of(4);
        blocks[2].payload["key"] = json!("PROP-X");
        let diags = validate_blocks(&blocks, D);
        assert!(kinds_at(&diags, 2).contains(&DiagnosticKind::HashMismatch));
    }

    #[test]
    fn rehashed_edit_breaks_successor_link() {
        let mut blocks = chain_of(4);
        blocks[1].payload["key"] = json!("PROP-X");
        // Self-consistent hash, but block 2 still links to the old one.
        blocks[1].hash = blocks[1].compute_hash();
        let diags = validate_blocks(&blocks, D);
        assert!(kinds_at(&diags, 2).contains(&DiagnosticKind::BrokenLink));
        assert!(!kinds_at(&diags, 1).contains(&DiagnosticKind::HashMismatch));
    }

    #[test]
    fn all_violations_are_collected() {
        let mut blocks = chain_of(5);
        blocks[1].nonce += 1;
        blocks[3].previous_hash = "f".repeat(64);
        let diags = validate_blocks(&blocks, D);
        assert!(!kinds_at(&diags, 1).is_empty());
        assert!(kinds_at(&diags, 3).contains(&DiagnosticKind::BrokenLink));
    }

    #[test]
    fn index_gap_detected() {
        let mut blocks = chain_of(4);
        blocks.remove(2);
        let diags = validate_blocks(&blocks, D);
        assert!(kinds_at(&diags, 2).contains(&DiagnosticKind::IndexGap));
    }

    #[test]
    fn timestamp_regression_detected() {
        let mut blocks = chain_of(3);
        blocks[2].timestamp = Utc::now() - Duration::days(365);
        let diags = validate_blocks(&blocks, D);
        let kinds = kinds_at(&diags, 2);
        assert!(kinds.contains(&DiagnosticKind::TimestampRegression));
        assert!(kinds.contains(&DiagnosticKind::HashMismatch));
    }

    #[test]
    fn genesis_sentinel_enforced() {
        let mut blocks = chain_of(1);
        blocks[0].previous_hash = "1".into();
        let diags = validate_blocks(&blocks, D);
        assert!(kinds_at(&diags, 0).contains(&DiagnosticKind::BadGenesisLink));
    }

    #[test]
    fn stricter_difficulty_fails_pow() {
        let blocks = chain_of(3);
        let diags = validate_blocks(&blocks, 12);
        assert!(diags.iter().any(|d| d.kind == DiagnosticKind::PowNotSatisfied));
    }

    #[test]
    fn integrity_error_display_names_first_violation() {
        let err = IntegrityError {
            diagnostics: vec![Diagnostic {
                index: 3,
                kind: DiagnosticKind::BrokenLink,
                detail: "x".into(),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 violation"));
        assert!(msg.contains("block 3: broken link"));
    }
}
