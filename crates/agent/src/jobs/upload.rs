use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{flag, required, PARAM_LOCATION, PARAM_NOPROXY, PARAM_URL};
use crate::error::{MeshError, Result};
use crate::http::HttpClientProvider;
use crate::storage::FileStore;

/// Multipart form field carrying the file.
pub const FILE_FIELD: &str = "file";

pub struct UploadClient {
    http: Arc<HttpClientProvider>,
}

impl UploadClient {
    pub fn new(http: Arc<HttpClientProvider>) -> Self {
        Self { http }
    }

    /// POST `source` as the `file` part of a multipart form. The file is
    /// streamed from disk.
    pub async fn send(&self, source: &Path, url: &str, no_proxy: bool) -> Result<u64> {
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| FILE_FIELD.to_string());
        let mime = mime_guess::from_path(source).first_or_octet_stream();
        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, length)
            .file_name(file_name)
            .mime_str(mime.as_ref())?;
        let form = Form::new().part(FILE_FIELD, part);

        let response = self
            .http
            .request(Method::POST, url, no_proxy)?
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MeshError::protocol_status(response.status()));
        }
        debug!(url, path=%source.display(), bytes = length, "file uploaded");
        Ok(length)
    }
}

pub(super) async fn execute(
    client: &UploadClient,
    store: &FileStore,
    params: &BTreeMap<String, String>,
) -> Result<Option<String>> {
    let url = required(params, PARAM_URL)?;
    let location = required(params, PARAM_LOCATION)?;
    let source = store
        .file_by_location(location)
        .ok_or_else(|| MeshError::Validation(format!("{location} is not found")))?;
    let bytes = client.send(&source, url, flag(params, PARAM_NOPROXY)).await?;
    Ok(Some(format!("{bytes} bytes uploaded from {location}")))
}
