use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::{Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{flag, required, PARAM_LOCATION, PARAM_NOPROXY, PARAM_URL};
use crate::error::{MeshError, Result};
use crate::http::HttpClientProvider;
use crate::storage::FileStore;

pub const DOWNLOADING_EXT: &str = ".downloading";

pub struct DownloadClient {
    http: Arc<HttpClientProvider>,
}

impl DownloadClient {
    pub fn new(http: Arc<HttpClientProvider>) -> Self {
        Self { http }
    }

    /// GET `url` into `destination`. The body lands in a `.downloading`
    /// sibling first and only replaces the destination once complete.
    pub async fn fetch(&self, url: &str, destination: &Path, no_proxy: bool) -> Result<u64> {
        let response = self.http.execute(Method::GET, url, no_proxy).await?;
        if response.status() != StatusCode::OK {
            return Err(MeshError::protocol_status(response.status()));
        }

        let partial = downloading_path(destination);
        let result = match write_body(response, &partial).await {
            Ok(written) => tokio::fs::rename(&partial, destination)
                .await
                .map(|_| written)
                .map_err(MeshError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        let written = result?;
        debug!(url, path=%destination.display(), bytes = written, "file saved");
        Ok(written)
    }
}

fn downloading_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(DOWNLOADING_EXT);
    PathBuf::from(name)
}

async fn write_body(mut response: reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

pub(super) async fn execute(
    client: &DownloadClient,
    store: &FileStore,
    params: &BTreeMap<String, String>,
) -> Result<Option<String>> {
    let url = required(params, PARAM_URL)?;
    let location = required(params, PARAM_LOCATION)?;
    let destination = store.target_file(location)?;
    let bytes = client.fetch(url, &destination, flag(params, PARAM_NOPROXY)).await?;
    Ok(Some(format!("{bytes} bytes saved to {location}")))
}
