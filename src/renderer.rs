//! ManifestRenderer client: wraps the external
//! deployment-platform repository service. The wire proto itself belongs
//! to the out-of-scope deployment-platform client, so the streaming
//! mechanics here are modeled against a `ManifestTransport` seam instead of
//! a generated `tonic` stub — a real deployment plugs a generated client in
//! behind it.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::types::Source;

const CHUNK_SIZE: usize = 1024;

/// The request frame sent before the bundle: source descriptor, effective
/// multi-source list, cluster facts, permitted Helm repos, tracking
/// config, enabled source types, and the resolved ref-source map.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub app_name: String,
    pub sources: Vec<Source>,
    pub kubernetes_version: String,
    pub api_versions: Vec<String>,
    pub helm_repositories: Vec<String>,
    pub ref_source_map: std::collections::HashMap<String, String>,
}

/// A fresh connection per call is intentional (see module doc): the
/// transport trait's `open` is expected to dial anew every time.
#[async_trait]
pub trait ManifestTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ManifestStream>>;
}

#[async_trait]
pub trait ManifestStream: Send {
    async fn send_request(&mut self, req: &RenderRequest) -> Result<()>;
    async fn send_checksum(&mut self, checksum: &str) -> Result<()>;
    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    async fn close_send(&mut self) -> Result<()>;
    async fn recv_manifests(&mut self) -> Result<Vec<String>>;
}

pub struct ManifestRenderer<T: ManifestTransport> {
    transport: T,
}

impl<T: ManifestTransport> ManifestRenderer<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Opens a fresh stream, sends request + checksum frames, streams
    /// the bundle in ≤1024-byte chunks (checking `cancel` between each),
    /// close the send side, and read the rendered manifests.
    #[instrument(skip(self, bundle, cancel))]
    pub async fn render(
        &self,
        req: &RenderRequest,
        bundle: &[u8],
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<String>> {
        let mut stream = self.transport.open().await?;
        stream.send_request(req).await?;

        let checksum = checksum_hex(bundle);
        stream.send_checksum(&checksum).await?;

        for chunk in bundle.chunks(CHUNK_SIZE) {
            if cancel.is_cancelled() {
                return Err(Error::Internal("render cancelled mid-stream".into()));
            }
            stream.send_chunk(chunk).await?;
        }

        stream.close_send().await?;
        stream.recv_manifests().await
    }
}

fn checksum_hex(bundle: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bundle);
    format!("{:x}", hasher.finalize())
}

/// Object-safe seam so `CheckScheduler` can hold a renderer without
/// carrying the concrete `ManifestTransport` as a generic parameter —
/// the transport itself is the out-of-scope deployment-platform client.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        req: &RenderRequest,
        bundle: &[u8],
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<String>>;
}

#[async_trait]
impl<T: ManifestTransport> Renderer for ManifestRenderer<T> {
    async fn render(
        &self,
        req: &RenderRequest,
        bundle: &[u8],
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<String>> {
        ManifestRenderer::render(self, req, bundle, cancel).await
    }
}
