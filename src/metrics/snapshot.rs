use crate::error::AppError;
use crate::metrics::mock::MockSnapshotSource;
use crate::metrics::types::{SnapshotEntry, SnapshotEntryWire};
use reqwest::Client;
use std::future::Future;

/// Anything that can produce a full set of current metric values on demand.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch_snapshot(&self) -> impl Future<Output = Result<Vec<SnapshotEntry>, AppError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: Client,
    endpoint: String,
}

impl HttpSnapshotSource {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotEntry>, AppError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?;
        let payload = response.json::<Vec<SnapshotEntryWire>>().await?;
        decode_snapshot_entries(payload)
    }
}

pub fn decode_snapshot_entries(
    payload: Vec<SnapshotEntryWire>,
) -> Result<Vec<SnapshotEntry>, AppError> {
    let mut entries = Vec::with_capacity(payload.len());
    for wire in payload {
        entries.push(wire.try_into()?);
    }
    Ok(entries)
}

pub enum SnapshotBackend {
    Http(HttpSnapshotSource),
    Mock(MockSnapshotSource),
}

impl SnapshotSource for SnapshotBackend {
    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotEntry>, AppError> {
        match self {
            Self::Http(source) => source.fetch_snapshot().await,
            Self::Mock(source) => source.fetch_snapshot().await,
        }
    }
}
