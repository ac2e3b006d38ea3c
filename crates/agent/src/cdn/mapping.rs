use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MeshError, Result};

/// One upstream resource: keys starting with `url_prefix` can be fetched
/// from `provider_url` plus the remainder of the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdnResource {
    pub url_prefix: String,
    pub provider_url: String,
}

impl CdnResource {
    /// Origin URL for `key`, which must start with this resource's prefix.
    pub fn origin_url(&self, key: &str) -> Option<String> {
        let key = key.trim_start_matches('/');
        let rest = key.strip_prefix(self.url_prefix.trim_start_matches('/'))?;
        let base = self.provider_url.trim_end_matches('/');
        let rest = rest.trim_start_matches('/');
        Some(if rest.is_empty() { base.to_string() } else { format!("{base}/{rest}") })
    }
}

/// Local knowledge of which resource keys this mesh serves.
pub trait ResourceIndex: Send + Sync {
    fn lookup(&self, key: &str) -> Option<CdnResource>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdnResourceMapping {
    #[serde(default)]
    resources: Vec<CdnResource>,
}

impl CdnResourceMapping {
    pub fn new(resources: Vec<CdnResource>) -> Self {
        Self { resources }
    }

    /// A missing file is an empty mapping; a malformed one is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path=%path.display(), "no cdn mapping file, serving no resources");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Configuration(format!("reading {}: {e}", path.display())))?;
        let mapping: Self = serde_json::from_str(&text)
            .map_err(|e| MeshError::Configuration(format!("{}: {e}", path.display())))?;
        info!(path=%path.display(), resources = mapping.resources.len(), "loaded cdn mapping");
        Ok(mapping)
    }

    #[cfg(test)]
    pub fn resources(&self) -> &[CdnResource] {
        &self.resources
    }
}

impl ResourceIndex for CdnResourceMapping {
    fn lookup(&self, key: &str) -> Option<CdnResource> {
        let key = key.trim_start_matches('/');
        self.resources
            .iter()
            .find(|r| key.starts_with(r.url_prefix.trim_start_matches('/')))
            .cloned()
    }
}
