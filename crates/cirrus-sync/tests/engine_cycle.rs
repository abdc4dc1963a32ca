//! End-to-end reconciliation cycles through the engine façade

mod common;

use cirrus_core::domain::{Resolution, SyncState};
use cirrus_core::ports::IStateStore;
use common::{mpath, Harness};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_new_local_file_is_uploaded() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"draft one");

    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    assert_eq!(h.gateway.data_at("notes.txt").await.unwrap(), b"draft one");

    let item = h.store.get_by_path(&mpath("notes.txt")).await.unwrap().unwrap();
    assert_eq!(item.sync_state(), SyncState::Synced);
    assert!(item.remote_id().is_some());

    let status = engine.status().await.unwrap();
    assert_eq!(status.pending_operations, 0);
    assert_eq!(status.unresolved_conflicts, 0);
}

#[tokio::test]
async fn test_new_remote_file_is_downloaded() {
    let h = Harness::new().await;
    h.gateway.seed_file("docs/report.txt", b"quarterly numbers").await;

    h.engine().run_cycle_now().await.unwrap();

    assert_eq!(h.read_local("docs/report.txt"), b"quarterly numbers");
    let item = h.store.get_by_path(&mpath("docs/report.txt")).await.unwrap().unwrap();
    assert_eq!(item.sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn test_repeated_cycles_are_idempotent() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"draft one");
    h.gateway.seed_file("readme.md", b"hello").await;

    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();
    let uploads = h.gateway.upload_calls.load(Ordering::SeqCst);
    let downloads = h.gateway.download_calls.load(Ordering::SeqCst)
        + h.gateway.range_calls.load(Ordering::SeqCst);

    engine.run_cycle_now().await.unwrap();
    engine.run_cycle_now().await.unwrap();

    assert_eq!(h.gateway.upload_calls.load(Ordering::SeqCst), uploads);
    assert_eq!(
        h.gateway.download_calls.load(Ordering::SeqCst)
            + h.gateway.range_calls.load(Ordering::SeqCst),
        downloads
    );
    let status = engine.status().await.unwrap();
    assert_eq!(status.pending_operations, 0);
}

#[tokio::test]
async fn test_local_edit_propagates() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"draft one");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    h.write_local("notes.txt", b"draft two");
    engine.run_cycle_now().await.unwrap();

    assert_eq!(h.gateway.data_at("notes.txt").await.unwrap(), b"draft two");
    let item = h.store.get_by_path(&mpath("notes.txt")).await.unwrap().unwrap();
    assert_eq!(item.sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn test_remote_edit_propagates() {
    let h = Harness::new().await;
    h.gateway.seed_file("notes.txt", b"v1").await;
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    h.gateway.seed_file("notes.txt", b"v2").await;
    engine.run_cycle_now().await.unwrap();

    assert_eq!(h.read_local("notes.txt"), b"v2");
}

#[tokio::test]
async fn test_local_delete_propagates() {
    let h = Harness::new().await;
    h.write_local("old.txt", b"obsolete");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();
    assert!(h.gateway.data_at("old.txt").await.is_some());

    h.delete_local("old.txt");
    engine.run_cycle_now().await.unwrap();

    assert!(h.gateway.data_at("old.txt").await.is_none());
    assert!(h.store.get_by_path(&mpath("old.txt")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_delete_propagates() {
    let h = Harness::new().await;
    h.gateway.seed_file("old.txt", b"obsolete").await;
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();
    assert!(h.local_exists("old.txt"));

    h.gateway.delete_path("old.txt").await;
    engine.run_cycle_now().await.unwrap();

    assert!(!h.local_exists("old.txt"));
    assert!(h.store.get_by_path(&mpath("old.txt")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_edits_conflict_without_overwrite() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"base");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();
    let uploads_before = h.gateway.upload_calls.load(Ordering::SeqCst);

    // Both sides diverge from the shared baseline.
    h.write_local("notes.txt", b"local edit");
    h.gateway.seed_file("notes.txt", b"remote edit").await;
    engine.run_cycle_now().await.unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(status.unresolved_conflicts, 1);

    // Neither side was clobbered.
    assert_eq!(h.read_local("notes.txt"), b"local edit");
    assert_eq!(h.gateway.data_at("notes.txt").await.unwrap(), b"remote edit");
    assert_eq!(h.gateway.upload_calls.load(Ordering::SeqCst), uploads_before);

    let item = h.store.get_by_path(&mpath("notes.txt")).await.unwrap().unwrap();
    assert_eq!(item.sync_state(), SyncState::Conflicted);

    // The conflict stays put across further cycles until resolved.
    engine.run_cycle_now().await.unwrap();
    let status = engine.status().await.unwrap();
    assert_eq!(status.unresolved_conflicts, 1);
    assert_eq!(h.read_local("notes.txt"), b"local edit");
}

#[tokio::test]
async fn test_edit_delete_conflict_preserves_content() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"base");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    h.write_local("notes.txt", b"local edit");
    h.gateway.delete_path("notes.txt").await;
    engine.run_cycle_now().await.unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(status.unresolved_conflicts, 1);
    assert_eq!(h.read_local("notes.txt"), b"local edit");
}

#[tokio::test]
async fn test_resolve_keep_local_pushes_local_version() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"base");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    h.write_local("notes.txt", b"local edit");
    h.gateway.seed_file("notes.txt", b"remote edit").await;
    engine.run_cycle_now().await.unwrap();

    let item = h.store.get_by_path(&mpath("notes.txt")).await.unwrap().unwrap();
    engine.resolve_conflict(&item.key(), Resolution::KeepLocal).await.unwrap();

    assert_eq!(h.gateway.data_at("notes.txt").await.unwrap(), b"local edit");
    assert_eq!(h.read_local("notes.txt"), b"local edit");

    let status = engine.status().await.unwrap();
    assert_eq!(status.unresolved_conflicts, 0);
    let item = h.store.get_by_path(&mpath("notes.txt")).await.unwrap().unwrap();
    assert_eq!(item.sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn test_resolve_keep_remote_pulls_remote_version() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"base");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    h.write_local("notes.txt", b"local edit");
    h.gateway.seed_file("notes.txt", b"remote edit").await;
    engine.run_cycle_now().await.unwrap();

    let item = h.store.get_by_path(&mpath("notes.txt")).await.unwrap().unwrap();
    engine.resolve_conflict(&item.key(), Resolution::KeepRemote).await.unwrap();

    assert_eq!(h.read_local("notes.txt"), b"remote edit");
    assert_eq!(h.gateway.data_at("notes.txt").await.unwrap(), b"remote edit");

    let status = engine.status().await.unwrap();
    assert_eq!(status.unresolved_conflicts, 0);
}

#[tokio::test]
async fn test_resolve_keep_both_preserves_both_versions() {
    let h = Harness::new().await;
    h.write_local("notes.txt", b"base");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    h.write_local("notes.txt", b"local edit");
    h.gateway.seed_file("notes.txt", b"remote edit").await;
    engine.run_cycle_now().await.unwrap();

    let item = h.store.get_by_path(&mpath("notes.txt")).await.unwrap().unwrap();
    engine
        .resolve_conflict(&item.key(), Resolution::KeepBothRenamed)
        .await
        .unwrap();

    // Original path carries the remote version.
    assert_eq!(h.read_local("notes.txt"), b"remote edit");

    // The local version survives under a conflicted-copy name.
    let names = h.local_names();
    let copy = names
        .iter()
        .find(|n| n.contains("conflicted copy"))
        .expect("conflicted copy file missing");
    assert_eq!(h.read_local(copy), b"local edit");

    // And it was uploaded as a new remote file.
    let remote_paths = h.gateway.live_paths().await;
    assert!(remote_paths.iter().any(|p| p.contains("conflicted copy")));

    let status = engine.status().await.unwrap();
    assert_eq!(status.unresolved_conflicts, 0);
    assert_eq!(status.pending_operations, 0);
}

#[tokio::test]
async fn test_stale_cursor_recovers_with_full_enumeration() {
    let h = Harness::new().await;
    h.gateway.seed_file("a.txt", b"aaa").await;
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    h.gateway.seed_file("b.txt", b"bbb").await;
    h.gateway.stale_cursor_once.store(true, Ordering::SeqCst);
    engine.run_cycle_now().await.unwrap();

    // The fallback enumeration still converges.
    assert!(h.local_exists("a.txt"));
    assert!(h.local_exists("b.txt"));

    // And the next poll is incremental again.
    h.gateway.seed_file("c.txt", b"ccc").await;
    engine.run_cycle_now().await.unwrap();
    assert!(h.local_exists("c.txt"));
}

#[tokio::test]
async fn test_offline_rename_detected() {
    let h = Harness::new().await;
    h.write_local("report.txt", b"annual report");
    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();
    let uploads_before = h.gateway.upload_calls.load(Ordering::SeqCst);

    std::fs::rename(
        h.config.sync.root.join("report.txt"),
        h.config.sync.root.join("report-final.txt"),
    )
    .unwrap();
    engine.run_cycle_now().await.unwrap();

    // Rename propagated without re-transferring content.
    assert_eq!(h.gateway.upload_calls.load(Ordering::SeqCst), uploads_before);
    assert_eq!(
        h.gateway.data_at("report-final.txt").await.unwrap(),
        b"annual report"
    );
    assert!(h.gateway.data_at("report.txt").await.is_none());
}

#[tokio::test]
async fn test_matching_content_adopted_without_transfer() {
    let h = Harness::new().await;
    h.write_local("shared.txt", b"identical bytes");
    h.gateway.seed_file("shared.txt", b"identical bytes").await;

    let engine = h.engine();
    engine.run_cycle_now().await.unwrap();

    assert_eq!(h.gateway.upload_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.gateway.download_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.gateway.range_calls.load(Ordering::SeqCst), 0);

    let item = h.store.get_by_path(&mpath("shared.txt")).await.unwrap().unwrap();
    assert_eq!(item.sync_state(), SyncState::Synced);
    assert!(item.remote_id().is_some());
}
