use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    /// Connection failure or timeout while talking to a peer.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// Peer answered, but not with something we can use.
    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0} is not supported")]
    UnsupportedJobClass(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for MeshError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            MeshError::Transport(e)
        } else if e.is_decode() {
            MeshError::Protocol(format!("unparsable response body: {e}"))
        } else {
            MeshError::Transport(e)
        }
    }
}

impl From<common::ParseError> for MeshError {
    fn from(e: common::ParseError) -> Self {
        match e {
            common::ParseError::JobClass(tag) => MeshError::UnsupportedJobClass(tag),
            other => MeshError::Validation(other.to_string()),
        }
    }
}

impl MeshError {
    pub fn protocol_status(status: reqwest::StatusCode) -> Self {
        MeshError::Protocol(format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        ).trim_end().to_string())
    }

    /// Message of the innermost error in the source chain.
    pub fn root_message(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current.to_string()
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_message_of_leaf_error_is_its_own() {
        let e = MeshError::Validation("url is missing".into());
        assert_eq!(e.root_message(), "url is missing");
    }

    #[test]
    fn root_message_walks_the_chain() {
        let e = MeshError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"));
        assert_eq!(e.to_string(), "I/O error: no such file");
        // io::Error with a custom payload exposes no further source
        assert_eq!(e.root_message(), "no such file");
    }

    #[test]
    fn unknown_job_class_maps_to_unsupported() {
        let e: MeshError = common::ParseError::JobClass("twitter".into()).into();
        assert!(matches!(e, MeshError::UnsupportedJobClass(ref t) if t == "twitter"));
        assert_eq!(e.to_string(), "twitter is not supported");
    }

    #[test]
    fn protocol_status_message() {
        let e = MeshError::protocol_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.to_string(), "500 Internal Server Error");
    }
}
