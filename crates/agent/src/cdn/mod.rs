mod mapping;
mod network;

pub use mapping::{CdnResource, CdnResourceMapping, ResourceIndex};
pub use network::CdnNetwork;
