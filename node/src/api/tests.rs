use super::*;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::redirect::Policy;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

use crate::cluster::CounterSnapshot;
use crate::config::load_config_from_str;
use crate::event::EventBus;
use crate::storage::{FileInfo, LocalBackend, LocalStorageConfig, Storage, StorageBackend, StorageKind, MIB};
use bmcl::file::download_path;
use bmcl::hash::HashAlgorithm;

const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// A backend with fixed answers.
#[derive(Debug, Default)]
struct FixedBackend {
    files: HashMap<String, ResponseFile>,
    lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl StorageBackend for FixedBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Webdav
    }

    async fn list_files(&self, _shard: u8) -> NodeResult<Vec<FileInfo>> {
        Ok(Vec::new())
    }

    async fn upload(&self, _path: &str, _source: &Path, _size: u64) -> NodeResult<()> {
        Ok(())
    }

    async fn put_bytes(&self, _path: &str, _data: Bytes) -> NodeResult<()> {
        Ok(())
    }

    async fn delete(&self, _path: &str) -> NodeResult<()> {
        Ok(())
    }

    async fn get_file(&self, path: &str) -> NodeResult<ResponseFile> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .files
            .get(path)
            .cloned()
            .unwrap_or(ResponseFile::NotFound))
    }

    async fn get_size(&self, _path: &str) -> NodeResult<Option<u64>> {
        Ok(None)
    }
}

struct Node {
    dir: TempDir,
    addr: SocketAddr,
    keys: Vec<SigningKey>,
    storages: Arc<StorageManager>,
}

async fn local_storage(dir: &TempDir) -> Arc<Storage> {
    let backend = LocalBackend::new(LocalStorageConfig {
        path: dir.path().join("local"),
    })
    .await
    .unwrap();

    Arc::new(Storage::new("local".to_string(), 1, false, 4, Box::new(backend)))
}

fn keys() -> Vec<SigningKey> {
    ["c1", "c2"]
        .into_iter()
        .map(|id| SigningKey {
            cluster_id: id.to_string(),
            secret: format!("{}-secret", id),
            counters: Arc::new(Counters::new()),
        })
        .collect()
}

async fn serve(storages: Vec<Arc<Storage>>, skip_sign: bool, dir: TempDir) -> Node {
    for storage in &storages {
        storage.set_online(true);
    }
    let storages = Arc::new(StorageManager::new(storages, EventBus::new()));

    let config = load_config_from_str(
        r#"
[[clusters]]
id = "c1"
secret = "c1-secret"

[[storages]]
type = "local"
path = "/data"
"#,
    )
    .unwrap();
    let sync = Arc::new(SyncEngine::new(Arc::new(config), Vec::new(), storages.clone()));

    let keys = keys();
    let state = ApiState::new(
        keys.clone(),
        storages.clone(),
        sync,
        Arc::new(FileCache::new(MIB, Duration::from_secs(60))),
        skip_sign,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, get_router(state)).await.unwrap();
    });

    Node {
        dir,
        addr,
        keys,
        storages,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .unwrap()
}

fn expires_in(offset_ms: i64) -> u64 {
    (Utc::now().timestamp_millis() + offset_ms) as u64
}

fn signed(node: &Node, path: &str, subject: &str, cluster: usize) -> String {
    let signature = signing::sign(&node.keys[cluster].secret, subject, expires_in(60_000));
    format!("http://{}{}?{}", node.addr, path, signature.to_query())
}

fn download_url(node: &Node, hash: &str) -> String {
    signed(node, &format!("/download/{}", hash), hash, 0)
}

async fn put_local(node: &Node, content: &[u8]) -> String {
    let hash = HashAlgorithm::Sha1.hash_bytes(content);
    let source = node.dir.path().join("source");
    tokio::fs::write(&source, content).await.unwrap();

    node.storages
        .get("local")
        .unwrap()
        .upload(&download_path(&hash), &source, content.len() as u64)
        .await
        .unwrap();

    hash
}

#[tokio::test]
async fn test_download_local() {
    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let node = serve(vec![local], false, dir).await;
    let hash = put_local(&node, b"hello world").await;

    let res = client().get(download_url(&node, &hash)).send().await.unwrap();
    assert_eq!(reqwest::StatusCode::OK, res.status());
    assert_eq!(hash, res.headers()["x-bmclapi-hash"]);
    assert_eq!("11", res.headers()["content-length"]);
    assert_eq!(b"hello world".as_slice(), res.bytes().await.unwrap().as_ref());

    assert_eq!(
        CounterSnapshot { hits: 1, bytes: 11 },
        node.keys[0].counters.snapshot()
    );
    assert!(node.keys[1].counters.snapshot().is_empty());
}

#[tokio::test]
async fn test_signature() {
    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let node = serve(vec![local], false, dir).await;
    let hash = put_local(&node, b"signed content").await;
    let path = format!("/download/{}", hash);

    let status = |url: String| async move { client().get(url).send().await.unwrap().status() };

    // No signature
    assert_eq!(
        reqwest::StatusCode::FORBIDDEN,
        status(format!("http://{}{}", node.addr, path)).await
    );

    // Signed for another file
    assert_eq!(
        reqwest::StatusCode::FORBIDDEN,
        status(signed(&node, &path, "0123abcd", 0)).await
    );

    // Signed with an unknown secret
    let forged = signing::sign("nope", &hash, expires_in(60_000));
    assert_eq!(
        reqwest::StatusCode::FORBIDDEN,
        status(format!("http://{}{}?{}", node.addr, path, forged.to_query())).await
    );

    // Expired a moment ago
    let expired = signing::sign(&node.keys[0].secret, &hash, expires_in(-1));
    assert_eq!(
        reqwest::StatusCode::FORBIDDEN,
        status(format!("http://{}{}?{}", node.addr, path, expired.to_query())).await
    );

    // Signed by the second cluster, which gets the credit
    assert_eq!(
        reqwest::StatusCode::OK,
        status(signed(&node, &path, &hash, 1)).await
    );
    assert!(node.keys[0].counters.snapshot().is_empty());
    assert_eq!(
        CounterSnapshot { hits: 1, bytes: 14 },
        node.keys[1].counters.snapshot()
    );
}

#[tokio::test]
async fn test_skip_sign() {
    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let node = serve(vec![local], true, dir).await;
    let hash = put_local(&node, b"open").await;

    let res = client()
        .get(format!("http://{}/download/{}", node.addr, hash))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::OK, res.status());
    assert_eq!(1, node.keys[0].counters.snapshot().hits);
}

#[tokio::test]
async fn test_zero_byte_file() {
    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let node = serve(vec![local], false, dir).await;

    let res = client()
        .get(download_url(&node, EMPTY_MD5))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::OK, res.status());
    assert!(res.bytes().await.unwrap().is_empty());
    assert_eq!(
        CounterSnapshot { hits: 1, bytes: 0 },
        node.keys[0].counters.snapshot()
    );
}

#[tokio::test]
async fn test_not_found() {
    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let node = serve(vec![local], false, dir).await;

    let res = client()
        .get(download_url(&node, &"ab".repeat(20)))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::NOT_FOUND, res.status());
    let body: Value = res.json().await.unwrap();
    assert_eq!(404, body["code"]);

    // Not a hash
    let res = client().get(download_url(&node, "zz")).send().await.unwrap();
    assert_eq!(reqwest::StatusCode::NOT_FOUND, res.status());

    let res = client()
        .get(format!("http://{}/nowhere", node.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::NOT_FOUND, res.status());

    assert!(node.keys[0].counters.snapshot().is_empty());
}

#[tokio::test]
async fn test_remote_and_fallback() {
    let redirected = "aa".repeat(20);
    let proxied = "bb".repeat(20);

    let remote = FixedBackend {
        files: [
            (
                download_path(&redirected),
                ResponseFile::RemoteRedirect("https://cdn.example.com/aa".to_string(), 1000),
            ),
            (
                download_path(&proxied),
                ResponseFile::Memory(Bytes::from_static(b"proxied")),
            ),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let lookups = remote.lookups.clone();

    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let remote_storage = Arc::new(Storage::new(
        "remote".to_string(),
        1,
        false,
        4,
        Box::new(remote),
    ));
    let node = serve(vec![remote_storage, local], false, dir).await;
    let local_hash = put_local(&node, b"only local").await;

    let res = client()
        .get(download_url(&node, &redirected))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::FOUND, res.status());
    assert_eq!("https://cdn.example.com/aa", res.headers()["location"]);
    assert_eq!(redirected.as_str(), res.headers()["x-bmclapi-hash"]);

    // Found whichever storage is picked first
    for _ in 0..2 {
        let res = client()
            .get(download_url(&node, &local_hash))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::OK, res.status());
    }

    let res = client().get(download_url(&node, &proxied)).send().await.unwrap();
    assert_eq!(reqwest::StatusCode::OK, res.status());
    assert_eq!(b"proxied".as_slice(), res.bytes().await.unwrap().as_ref());

    // The second request is served from memory
    let before = lookups.load(Ordering::SeqCst);
    let res = client().get(download_url(&node, &proxied)).send().await.unwrap();
    assert_eq!(b"proxied".as_slice(), res.bytes().await.unwrap().as_ref());
    assert_eq!(before, lookups.load(Ordering::SeqCst));

    assert_eq!(
        CounterSnapshot {
            hits: 5,
            bytes: 1000 + 2 * 10 + 2 * 7
        },
        node.keys[0].counters.snapshot()
    );
}

#[tokio::test]
async fn test_no_online_storage() {
    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let node = serve(vec![local.clone()], false, dir).await;
    local.set_online(false);

    let res = client()
        .get(download_url(&node, &"ab".repeat(20)))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::SERVICE_UNAVAILABLE, res.status());
}

#[tokio::test]
async fn test_measure() {
    let dir = TempDir::new().unwrap();
    let local = local_storage(&dir).await;
    let node = serve(vec![local], false, dir).await;

    let res = client()
        .get(signed(&node, "/measure/1", "/measure/1", 0))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::OK, res.status());
    let body = res.bytes().await.unwrap();
    assert_eq!(MIB as usize, body.len());
    assert!(body.iter().all(|b| *b == 0));

    // The signature covers the size
    let res = client()
        .get(signed(&node, "/measure/2", "/measure/1", 0))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::FORBIDDEN, res.status());

    let res = client()
        .get(signed(&node, "/measure/0", "/measure/0", 0))
        .send()
        .await
        .unwrap();
    assert_eq!(reqwest::StatusCode::NOT_FOUND, res.status());

    // Measurements are not served requests
    assert!(node.keys[0].counters.snapshot().is_empty());
}
