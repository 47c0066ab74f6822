use super::*;

use std::collections::HashMap;

use tempfile::TempDir;

use crate::event::NodeEvent;

async fn local_storage(dir: &TempDir, id: &str, weight: i32) -> Arc<Storage> {
    let backend = LocalBackend::new(LocalStorageConfig {
        path: dir.path().join(id),
    })
    .await
    .unwrap();

    Arc::new(Storage::new(id.to_string(), weight, false, 4, Box::new(backend)))
}

fn count_picks(manager: &StorageManager, rounds: usize) -> HashMap<String, usize> {
    let mut picks = HashMap::new();
    for _ in 0..rounds {
        let storage = manager.get_weight_storage().unwrap();
        *picks.entry(storage.id().to_string()).or_default() += 1;
    }
    picks
}

#[tokio::test]
async fn test_local_upload_and_list() {
    let dir = TempDir::new().unwrap();
    let storage = local_storage(&dir, "local", 1).await;

    let source = dir.path().join("source");
    tokio::fs::write(&source, b"abcd").await.unwrap();

    let hash = "aa".repeat(16);
    storage
        .upload(&download_path(&hash), &source, 4)
        .await
        .unwrap();

    // Wrong size is rejected and leaves nothing behind
    let other = "bb".repeat(16);
    assert!(storage
        .upload(&download_path(&other), &source, 5)
        .await
        .is_err());

    let files = storage.list_download_files().await.unwrap();
    assert_eq!(1, files.len());

    let info = &files[&hash];
    assert_eq!(4, info.size);
    assert_eq!(format!("download/aa/{}", hash), info.path);

    match storage.get_response_file(&hash).await.unwrap() {
        ResponseFile::LocalPath(path, size) => {
            assert_eq!(4, size);
            assert_eq!(b"abcd".to_vec(), tokio::fs::read(path).await.unwrap());
        }
        other => panic!("unexpected response {:?}", other),
    }

    assert_eq!(
        ResponseFile::NotFound,
        storage.get_response_file(&other).await.unwrap()
    );
}

#[tokio::test]
async fn test_readonly_rejects_upload() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(LocalStorageConfig {
        path: dir.path().join("ro"),
    })
    .await
    .unwrap();
    let storage = Storage::new("ro".to_string(), 1, true, 4, Box::new(backend));

    let source = dir.path().join("source");
    tokio::fs::write(&source, b"x").await.unwrap();

    assert!(matches!(
        storage.upload("download/aa/aa", &source, 1).await,
        Err(NodeError::StorageWriteError(_))
    ));
}

#[tokio::test]
async fn test_measure() {
    let dir = TempDir::new().unwrap();
    let storage = local_storage(&dir, "local", 1).await;

    assert!(!storage.check_measure(1).await.unwrap());
    storage.write_measure(1).await.unwrap();
    assert!(storage.check_measure(1).await.unwrap());

    // A truncated measure file does not count
    storage
        .backend()
        .put_bytes(&measure_path(2), Bytes::from_static(b"short"))
        .await
        .unwrap();
    assert!(!storage.check_measure(2).await.unwrap());
}

#[tokio::test]
async fn test_health_events() {
    let dir = TempDir::new().unwrap();
    let storage = local_storage(&dir, "local", 1).await;
    let events = EventBus::new();
    let mut rx = events.subscribe();

    assert!(storage.check_health(&events).await);
    assert_eq!(
        NodeEvent::StorageStatus {
            id: "local".to_string(),
            online: true,
        },
        rx.recv().await.unwrap()
    );

    // No transition, no event
    assert!(storage.check_health(&events).await);
    assert!(rx.try_recv().is_err());

    // The probe file is removed again
    assert!(!dir.path().join("local").join(PROBE_FILE).exists());
}

#[tokio::test]
async fn test_selector_fairness() {
    let dir = TempDir::new().unwrap();
    let a = local_storage(&dir, "a", 3).await;
    let b = local_storage(&dir, "b", 1).await;
    let c = local_storage(&dir, "c", 6).await;
    for storage in [&a, &b, &c] {
        storage.set_online(true);
    }

    let manager = StorageManager::new(vec![a, b, c], EventBus::new());
    let picks = count_picks(&manager, 1000);

    // 3 : 1 : 6 over 1000 picks
    let within = |id: &str, expected: usize| {
        let actual = picks[id];
        assert!(
            actual.abs_diff(expected) <= 10,
            "{} was picked {} times, expected about {}",
            id,
            actual,
            expected
        );
    };
    within("a", 300);
    within("b", 100);
    within("c", 600);
}

#[tokio::test]
async fn test_selector_flap() {
    let dir = TempDir::new().unwrap();
    let a = local_storage(&dir, "a", 10).await;
    let b = local_storage(&dir, "b", 0).await;
    a.set_online(true);
    b.set_online(true);

    let manager = StorageManager::new(vec![a.clone(), b], EventBus::new());

    a.set_online(false);
    let picks = count_picks(&manager, 50);
    assert_eq!(Some(&50), picks.get("b"));
    assert_eq!(None, picks.get("a"));

    a.set_online(true);
    let picks = count_picks(&manager, 55);
    assert!(picks["a"] >= 45, "a was picked {} times", picks["a"]);
}

#[tokio::test]
async fn test_selector_negative_fallback() {
    let dir = TempDir::new().unwrap();
    let primary = local_storage(&dir, "primary", 1).await;
    let backup = local_storage(&dir, "backup", -1).await;
    primary.set_online(true);
    backup.set_online(true);

    let manager = StorageManager::new(vec![primary.clone(), backup], EventBus::new());
    assert_eq!(Some(&20), count_picks(&manager, 20).get("primary"));

    primary.set_online(false);
    assert_eq!(Some(&20), count_picks(&manager, 20).get("backup"));

    for storage in manager.storages() {
        storage.set_online(false);
    }
    assert!(matches!(
        manager.get_weight_storage(),
        Err(NodeError::NoOnlineStorage)
    ));
}

#[tokio::test]
async fn test_online_gate() {
    let dir = TempDir::new().unwrap();
    let a = local_storage(&dir, "a", 1).await;
    let events = EventBus::new();
    let mut rx = events.subscribe();

    let manager = StorageManager::new(vec![a.clone()], events);

    a.set_online(true);
    manager.refresh();
    assert_eq!(NodeEvent::StorageEnable, rx.recv().await.unwrap());
    manager.wait_online().await;

    a.set_online(false);
    manager.refresh();
    assert_eq!(NodeEvent::StorageDisable, rx.recv().await.unwrap());
    assert_eq!(0, manager.online_storages().len());

    // Repeated refreshes do not repeat the event
    manager.refresh();
    assert!(rx.try_recv().is_err());
}
