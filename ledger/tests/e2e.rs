//! End-to-end tests for the deedchain ledger.
//!
//! These drive the public API the way the node does: restore, append, read,
//! shut down, restart. Every test owns its own temporary data directory, its
//! own sled database and its own content store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use deedchain::config::PRE_RESTORE_SNAPSHOT_PREFIX;
use deedchain::pointer::{LocalFileSink, PointerRegistry, PointerSink};
use deedchain::tiers::{
    ContentAddressedStore, ContentId, ContentTier, DirectoryContentStore, LocalStore,
    PointerMetadata, RelationalBackupStore,
};
use deedchain::{
    HashChain, LedgerState, Orchestrator, OrchestratorConfig, RestoreSource, SnapshotCodec, Tiers,
};

const D: u32 = 1;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// One node's worth of storage under a temp dir.
struct Node {
    _dir: tempfile::TempDir,
    data: PathBuf,
    local: LocalStore,
    relational: Arc<RelationalBackupStore>,
    content: Arc<DirectoryContentStore>,
}

impl Node {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().to_path_buf();
        Self {
            local: LocalStore::in_dir(&data),
            relational: Arc::new(
                RelationalBackupStore::open(data.join("backups.db"), 10).expect("sled"),
            ),
            content: Arc::new(DirectoryContentStore::new(data.join("blobs"))),
            data,
            _dir: dir,
        }
    }

    fn pointer_file(&self) -> LocalFileSink {
        LocalFileSink::in_dir(&self.data)
    }

    fn orchestrator(&self) -> Orchestrator {
        let content: Arc<dyn ContentAddressedStore> = self.content.clone();
        Orchestrator::new(
            OrchestratorConfig {
                difficulty: D,
                replication_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(5),
            },
            codec(),
            Tiers {
                local: self.local.clone(),
                relational: Some(self.relational.clone()),
                content: Some(Arc::new(ContentTier::new(content))),
            },
            PointerRegistry::new(
                vec![Arc::new(self.pointer_file()) as Arc<dyn PointerSink>],
                Duration::from_secs(5),
            ),
        )
    }
}

fn codec() -> SnapshotCodec {
    SnapshotCodec::from_secret(b"end-to-end secret")
}

/// A genesis chain plus `extra` add records.
fn chain_of(extra: usize, tag: &str) -> HashChain {
    let mut chain = HashChain::genesis(D).unwrap();
    for i in 0..extra {
        chain
            .append(json!({"type": "add", "key": format!("{tag}-{i}")}))
            .unwrap();
    }
    chain
}

fn metadata(chain: &HashChain) -> PointerMetadata {
    PointerMetadata {
        blocks: chain.len(),
        latest_hash: chain.latest().map(|b| b.hash),
        recorded_at: Utc::now(),
    }
}

/// Which tiers get a seeded snapshot.
struct Seed {
    pointer: bool,
    local: bool,
    relational: bool,
}

/// Seed the three tiers with three different chains: 2 blocks behind the
/// pointer, 3 in the local file, 4 in the relational table.
async fn seed(node: &Node, seed: Seed) {
    let codec = codec();

    let remote = chain_of(1, "CAS");
    let cid = node.content.put(&codec.encode(&remote).unwrap()).await.unwrap();
    if seed.pointer {
        node.pointer_file().record(&cid, &metadata(&remote)).await.unwrap();
    }
    if seed.local {
        node.local.write(&codec.encode(&chain_of(2, "LOCAL")).unwrap()).unwrap();
    }
    if seed.relational {
        node.relational
            .insert("seeded", &codec.encode(&chain_of(3, "DB")).unwrap())
            .unwrap();
    }
}

fn first_key(orch: &Orchestrator) -> String {
    orch.keys().unwrap().into_iter().next().unwrap()
}

// ---------------------------------------------------------------------------
// 1. Restoration Priority
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restore_prefers_pointer_resolved_content() {
    let node = Node::new();
    seed(&node, Seed { pointer: true, local: true, relational: true }).await;

    let orch = node.orchestrator();
    let outcome = orch.restore().await.unwrap();
    assert!(matches!(outcome.source, RestoreSource::ContentAddressed { .. }));
    assert_eq!(outcome.blocks, 2);
    assert_eq!(first_key(&orch), "CAS-0");

    // The longer local chain it displaced is kept next to the snapshot.
    let kept: Vec<_> = std::fs::read_dir(&node.data)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(PRE_RESTORE_SNAPSHOT_PREFIX))
        })
        .collect();
    assert_eq!(kept.len(), 1);
    let kept = codec().decode(&std::fs::read(&kept[0]).unwrap()).unwrap();
    assert_eq!(kept.len(), 3);
    assert_eq!(kept.keys(), vec!["LOCAL-0".to_string(), "LOCAL-1".to_string()]);
}

#[tokio::test]
async fn restore_without_pointer_uses_local() {
    let node = Node::new();
    seed(&node, Seed { pointer: false, local: true, relational: true }).await;

    let orch = node.orchestrator();
    let outcome = orch.restore().await.unwrap();
    assert_eq!(outcome.source, RestoreSource::Local);
    assert_eq!(outcome.blocks, 3);
    assert_eq!(first_key(&orch), "LOCAL-0");
}

#[tokio::test]
async fn restore_without_local_uses_most_recent_backup() {
    let node = Node::new();
    seed(&node, Seed { pointer: false, local: false, relational: true }).await;

    let orch = node.orchestrator();
    let outcome = orch.restore().await.unwrap();
    assert!(matches!(outcome.source, RestoreSource::Relational { .. }));
    assert_eq!(outcome.blocks, 4);
    assert_eq!(first_key(&orch), "DB-0");

    // A non-local restore repopulates the local file.
    let local = codec().decode(&node.local.read().unwrap().unwrap()).unwrap();
    assert_eq!(local.len(), 4);
}

#[tokio::test]
async fn restore_with_nothing_starts_genesis() {
    let node = Node::new();
    seed(&node, Seed { pointer: false, local: false, relational: false }).await;

    let orch = node.orchestrator();
    let outcome = orch.restore().await.unwrap();
    assert_eq!(outcome.source, RestoreSource::Genesis);
    assert_eq!(outcome.blocks, 1);
    assert_eq!(outcome.attempts.len(), 3);
    assert!(orch.keys().unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_under_another_secret_is_skipped() {
    let node = Node::new();
    let foreign = SnapshotCodec::from_secret(b"someone else");
    node.local.write(&foreign.encode(&chain_of(5, "X")).unwrap()).unwrap();
    node.relational
        .insert("ours", &codec().encode(&chain_of(1, "OURS")).unwrap())
        .unwrap();

    let orch = node.orchestrator();
    let outcome = orch.restore().await.unwrap();
    assert!(matches!(outcome.source, RestoreSource::Relational { .. }));
    let local_attempt = outcome.attempts.iter().find(|a| a.source == "local").unwrap();
    assert!(local_attempt.reason.contains("decryption"));
}

// ---------------------------------------------------------------------------
// 2. Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_then_restart_keeps_every_block() {
    let node = Node::new();
    let orch = node.orchestrator();
    orch.restore().await.unwrap();
    for i in 0..3 {
        orch
            .append(json!({"type": "add", "key": format!("PROP-{i}")}))
            .await
            .unwrap();
    }
    let report = orch.shutdown().await.unwrap();
    assert_eq!(orch.state(), LedgerState::Terminated);
    assert!(report.tiers.iter().all(|t| t.is_stored()));
    assert!(node.data.join("latest_cid.txt").exists());

    let restarted = node.orchestrator();
    let outcome = restarted.restore().await.unwrap();
    assert!(matches!(outcome.source, RestoreSource::ContentAddressed { .. }));
    assert_eq!(outcome.blocks, 4);
    assert!(restarted.validate().unwrap().0);
}

#[tokio::test]
async fn current_state_follows_transfers() {
    let node = Node::new();
    let orch = node.orchestrator();
    orch.restore().await.unwrap();

    orch.append(json!({"type": "add", "key": "PROP-9", "owner": "Asha", "value": 100}))
        .await
        .unwrap();
    orch.append(json!({
        "type": "transfer",
        "property_key": "PROP-9",
        "new_owner": "Ravi",
        "new_property_value": 150
    }))
    .await
    .unwrap();

    let state = orch.current_state("PROP-9").unwrap().unwrap();
    assert_eq!(state.get("owner"), Some(&json!("Ravi")));
    assert_eq!(state.get("value"), Some(&json!(150)));
    assert_eq!(state.event_count, 2);
    assert_eq!(state.total_transfers, 1);
    assert_eq!(orch.history_for_key("PROP-9").unwrap().len(), 2);
    assert!(orch.current_state("PROP-404").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// 3. Chain Properties Through the Orchestrator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_record_to_fresh_chain() {
    let node = Node::new();
    let orch = node.orchestrator();
    orch.restore().await.unwrap();

    orch.append(json!({"type": "add", "key": "PROP-1"})).await.unwrap();

    let genesis = orch.get(0).unwrap().unwrap();
    let block = orch.get(1).unwrap().unwrap();
    assert_eq!(orch.info().unwrap().total_blocks, 2);
    assert_eq!(block.previous_hash, genesis.hash);
    assert_eq!(orch.validate().unwrap(), (true, vec![]));
}

#[tokio::test]
async fn sequential_appends_are_linked_in_order() {
    let node = Node::new();
    let orch = node.orchestrator();
    orch.restore().await.unwrap();

    const K: u64 = 6;
    for i in 0..K {
        orch.append(json!({"type": "add", "key": format!("P{i}")})).await.unwrap();
    }

    let blocks: Vec<_> = (0..=K).map(|i| orch.get(i).unwrap().unwrap()).collect();
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.index, i as u64);
        if i > 0 {
            assert_eq!(block.previous_hash, blocks[i - 1].hash);
        }
    }
    assert!(orch.get(K + 1).unwrap().is_none());
}

#[tokio::test]
async fn returned_blocks_are_independent_copies() {
    let node = Node::new();
    let orch = node.orchestrator();
    orch.restore().await.unwrap();
    orch.append(json!({"type": "add", "key": "PROP-1", "aadhar_no": "1234-5678-9012"}))
        .await
        .unwrap();

    let mut masked = orch.get(1).unwrap().unwrap();
    let untouched = orch.get(1).unwrap().unwrap();
    masked.payload["aadhar_no"] = json!("XXXX-XXXX-9012");
    masked.nonce += 1;

    let mut history = orch.history_for_key("PROP-1").unwrap();
    history[0].payload = json!(null);

    let third = orch.get(1).unwrap().unwrap();
    assert_eq!(third, untouched);
    assert_eq!(third.payload["aadhar_no"], json!("1234-5678-9012"));
    assert!(orch.validate().unwrap().0);
}

#[tokio::test]
async fn concurrent_appends_never_interleave() {
    let node = Node::new();
    let orch = node.orchestrator();
    orch.restore().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let orch = orch.clone();
        tasks.push(tokio::spawn(async move {
            orch.append(json!({"type": "add", "key": format!("C{i}")})).await
        }));
    }
    let mut indices: Vec<u64> = Vec::new();
    for task in tasks {
        indices.push(task.await.unwrap().unwrap().index);
    }
    indices.sort_unstable();
    assert_eq!(indices, (1..=8).collect::<Vec<_>>());
    assert!(orch.validate().unwrap().0);

    orch.flush_replication().await;
    let local = codec().decode(&node.local.read().unwrap().unwrap()).unwrap();
    assert_eq!(local.len(), 9);
}

// ---------------------------------------------------------------------------
// 4. Codec Round Trip
// ---------------------------------------------------------------------------

#[test]
fn snapshot_round_trip_preserves_hashes() {
    let codec = codec();
    for n in 0..5 {
        let chain = if n == 0 {
            HashChain::load(Vec::new(), D).unwrap()
        } else {
            chain_of(n - 1, "RT")
        };
        let restored = codec.decode(&codec.encode(&chain).unwrap()).unwrap();
        assert_eq!(restored.len(), n);
        assert_eq!(restored.dump(), chain.dump());
    }
}

#[tokio::test]
async fn content_ids_are_content_derived() {
    let node = Node::new();
    let a = node.content.put(b"same bytes").await.unwrap();
    let b = node.content.put(b"same bytes").await.unwrap();
    let c = node.content.put(b"other bytes").await.unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a, ContentId::for_bytes(b"same bytes"));
}
