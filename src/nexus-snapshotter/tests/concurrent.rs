//! Concurrency behavior: parallel image pulls fan out per-layer work, so
//! snapshot operations must hold up without a process-wide lock.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use nexus_snapshotter::{MountTracker, WalkFilter};

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_prepares_all_succeed() {
    init();
    let root = tempfile::tempdir().unwrap();
    let s = Arc::new(block_snapshotter(root.path()));

    const GOROUTINES: u64 = 10;
    let mut handles = Vec::new();
    for i in 0..GOROUTINES {
        let s = Arc::clone(&s);
        handles.push(tokio::spawn(async move {
            s.prepare(&extract_key(i), "", no_labels()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("prepare failed");
    }

    let mut count = 0;
    s.walk(&WalkFilter::default(), |_| {
        count += 1;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(count, GOROUTINES);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_prepares_against_one_parent() {
    init();
    let root = tempfile::tempdir().unwrap();
    let s = Arc::new(block_snapshotter(root.path()));

    commit_fake_layer(root.path(), &s, &extract_key(0), "shared-base", "").await;

    const CHILDREN: u64 = 20;
    let mut handles = Vec::new();
    for i in 1..=CHILDREN {
        let s = Arc::clone(&s);
        handles.push(tokio::spawn(async move {
            s.prepare(&extract_key(i), "shared-base", no_labels()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("child prepare failed");
    }

    let mut count = 0;
    s.walk(&WalkFilter::default(), |_| {
        count += 1;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(count, 1 + CHILDREN);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_removes_all_succeed() {
    init();
    let root = tempfile::tempdir().unwrap();
    let s = Arc::new(block_snapshotter(root.path()));

    const SNAPSHOTS: u64 = 10;
    for i in 0..SNAPSHOTS {
        s.prepare(&extract_key(i), "", no_labels()).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..SNAPSHOTS {
        let s = Arc::clone(&s);
        handles.push(tokio::spawn(async move { s.remove(&extract_key(i)).await }));
    }
    for handle in handles {
        handle.await.unwrap().expect("remove failed");
    }

    let mut remaining = 0;
    s.walk(&WalkFilter::default(), |_| {
        remaining += 1;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(remaining, 0);
}

/// Simulates the runtime's parallel layer unpack: each layer's task retries
/// prepare until its parent is committed, distinguishing retryable errors
/// (parent missing or not committed yet) from real failures.
#[tokio::test(flavor = "multi_thread")]
async fn parallel_unpack_simulation() {
    init();
    let root = tempfile::tempdir().unwrap();
    let s = Arc::new(block_snapshotter(root.path()));

    const LAYERS: usize = 5;
    let committed: Arc<Vec<AtomicBool>> =
        Arc::new((0..LAYERS).map(|_| AtomicBool::new(false)).collect());

    let mut handles = Vec::new();
    for layer in 0..LAYERS {
        let s = Arc::clone(&s);
        let committed = Arc::clone(&committed);
        let root = root.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let prepare_key = format!("default/{layer}/extract-{layer}");
            let commit_name = format!("layer-{layer}");
            let parent = if layer > 0 {
                format!("layer-{}", layer - 1)
            } else {
                String::new()
            };

            const MAX_RETRIES: usize = 200;
            for _ in 0..MAX_RETRIES {
                if layer > 0 && !committed[layer - 1].load(Ordering::Acquire) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }

                match s.prepare(&prepare_key, &parent, HashMap::new()).await {
                    Ok(_) => {}
                    // Parent not ready yet; the runtime retries on both.
                    Err(err) if err.is_not_found() || err.is_invalid_argument() => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        continue;
                    }
                    Err(err) => return Err(format!("layer {layer} prepare: {err}")),
                }

                fabricate_blob(&root, &s, &prepare_key).await;
                if let Err(err) = s.commit(&commit_name, &prepare_key, HashMap::new()).await {
                    return Err(format!("layer {layer} commit: {err}"));
                }
                committed[layer].store(true, Ordering::Release);
                return Ok(());
            }
            Err(format!("layer {layer} exhausted retries"))
        }));
    }

    for handle in handles {
        handle.await.unwrap().expect("unpack task failed");
    }

    // The chain is fully linked.
    for layer in 0..LAYERS {
        let info = s.stat(&format!("layer-{layer}")).await.unwrap();
        let expected_parent = if layer > 0 {
            format!("layer-{}", layer - 1)
        } else {
            String::new()
        };
        assert_eq!(info.parent, expected_parent, "layer {layer}");
    }
}

/// Concurrent claims on the fsmeta placeholder: exclusive create picks
/// exactly one winner.
#[test]
fn fsmeta_placeholder_race_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = Arc::new(dir.path().join("fsmeta.erofs"));

    const THREADS: usize = 20;
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let path = Arc::clone(&path);
        handles.push(std::thread::spawn(move || {
            std::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(path.as_path())
                .is_ok()
        }));
    }

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn mount_tracker_is_thread_safe() {
    let tracker = Arc::new(MountTracker::new());

    const THREADS: usize = 100;
    let mut handles = Vec::new();
    for i in 0..THREADS {
        let tracker = Arc::clone(&tracker);
        handles.push(std::thread::spawn(move || {
            let id = format!("snap-{i}");
            tracker.set_mounted(&id);
            let _ = tracker.is_mounted(&id);
            tracker.set_unmounted(&id);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    tracker.clear();
    for i in 0..THREADS {
        assert!(!tracker.is_mounted(&format!("snap-{i}")));
    }
}
