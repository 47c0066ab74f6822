//! Certificates and the serving listener.
//!
//! The listener serves plain HTTP until certificate material is
//! available. Material comes either from the configuration (bring your
//! own certificate) or from the control plane, which issues a pair per
//! cluster. Issued pairs are written to `{cert.dir}/{cluster_id}.pem`
//! and `{cert.dir}/{cluster_id}.key`.
//!
//! When new material is published, a TLS listener reloads it in place and
//! a plain listener is restarted with TLS.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::fs;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, NodeResult};
use crate::task::TaskGroup;

/// How long in-flight requests may finish after the listener stops.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

/// Locations of a certificate and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Publishes certificate material to the listener.
#[derive(Debug, Clone)]
pub struct CertStore {
    current: watch::Sender<Option<CertPaths>>,
}

impl CertPaths {
    /// Returns the paths of the pair issued to a cluster.
    pub fn for_cluster(dir: &Path, cluster_id: &str) -> Self {
        Self {
            cert: dir.join(format!("{}.pem", cluster_id)),
            key: dir.join(format!("{}.key", cluster_id)),
        }
    }

    /// Returns whether both files exist.
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.cert).await.is_ok() && fs::metadata(&self.key).await.is_ok()
    }
}

impl CertStore {
    pub fn new(initial: Option<CertPaths>) -> Self {
        Self {
            current: watch::Sender::new(initial),
        }
    }

    pub fn current(&self) -> Option<CertPaths> {
        self.current.borrow().clone()
    }

    /// Publishes new material.
    pub fn publish(&self, paths: CertPaths) {
        tracing::info!(cert = %paths.cert.display(), "Publishing certificate");
        self.current.send_replace(Some(paths));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CertPaths>> {
        self.current.subscribe()
    }
}

/// Writes an issued certificate pair.
///
/// Each file is written next to its destination and renamed into place,
/// so readers never see a partial file.
pub async fn write_cert_pair(
    dir: &Path,
    cluster_id: &str,
    cert: &str,
    key: &str,
) -> NodeResult<CertPaths> {
    fs::create_dir_all(dir)
        .await
        .map_err(NodeError::storage_write_error)?;

    let paths = CertPaths::for_cluster(dir, cluster_id);
    write_atomic(&paths.cert, cert.as_bytes()).await?;
    write_atomic(&paths.key, key.as_bytes()).await?;

    Ok(paths)
}

async fn write_atomic(path: &Path, content: &[u8]) -> NodeResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    fs::write(&temp, content)
        .await
        .map_err(NodeError::storage_write_error)?;

    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(NodeError::storage_write_error(e));
    }

    Ok(())
}

/// Serves the router until the group shuts down.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    certs: CertStore,
    group: TaskGroup,
) -> Result<()> {
    let mut updates = certs.subscribe();

    loop {
        let handle = Handle::new();
        let reloader = CancellationToken::new();
        let current = updates.borrow_and_update().clone();

        let tls = match &current {
            Some(paths) => match load_rustls(paths).await {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::error!("Failed to load certificate, serving plain HTTP: {}", e);
                    None
                }
            },
            None => None,
        };
        let upgrade = tls.is_none();

        let mut server = match tls {
            Some(config) => {
                tracing::info!("Listening on https://{}", addr);
                watch_reload(config.clone(), updates.clone(), reloader.clone());

                let server = axum_server::bind_rustls(addr, config)
                    .handle(handle.clone())
                    .serve(app.clone().into_make_service());
                tokio::spawn(server)
            }
            None => {
                tracing::info!("Listening on http://{}", addr);

                let server = axum_server::bind(addr)
                    .handle(handle.clone())
                    .serve(app.clone().into_make_service());
                tokio::spawn(server)
            }
        };

        let restart = tokio::select! {
            _ = group.cancelled() => false,
            changed = updates.changed(), if upgrade => {
                if changed.is_err() {
                    return Err(anyhow!("Certificate store dropped"));
                }
                tracing::info!("Certificate available, restarting listener");
                true
            }
            result = &mut server => {
                reloader.cancel();
                result??;
                return Err(anyhow!("Listener stopped unexpectedly"));
            }
        };

        reloader.cancel();
        handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
        server.await??;

        if !restart {
            return Ok(());
        }
    }
}

/// Reloads a TLS listener whenever new material is published.
fn watch_reload(
    config: RustlsConfig,
    mut updates: watch::Receiver<Option<CertPaths>>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let Some(paths) = updates.borrow_and_update().clone() else {
                continue;
            };

            match config.reload_from_pem_file(&paths.cert, &paths.key).await {
                Ok(()) => tracing::info!("Reloaded certificate {}", paths.cert.display()),
                Err(e) => tracing::error!("Failed to reload certificate: {}", e),
            }
        }
    });
}

async fn load_rustls(paths: &CertPaths) -> Result<RustlsConfig> {
    match RustlsConfig::from_pem_file(&paths.cert, &paths.key).await {
        Ok(config) => Ok(config),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(anyhow!("{} or {} is missing", paths.cert.display(), paths.key.display()))
        }
        Err(e) => Err(e.into()),
    }
}
