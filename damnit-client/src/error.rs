use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("graphql error: {}", .0.join("; "))]
    GraphQl(Vec<String>),
    #[error("proposal not found: {0}")]
    NotFound(String),
    #[error("unexpected payload: {0}")]
    Decode(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("request gate closed")]
    Closed,
}

impl ClientError {
    /// The requested identity does not resolve on the server.
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound(_) => true,
            ClientError::GraphQl(messages) => messages
                .iter()
                .any(|m| m.to_ascii_lowercase().contains("not found")),
            _ => false,
        }
    }

    /// Network-level failures that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(err) => {
                !err.is_builder() && !err.status().is_some_and(|s| s.is_client_error())
            }
            ClientError::Closed | ClientError::Subscription(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_detected_in_graphql_messages() {
        let err = ClientError::GraphQl(vec!["Proposal 1234 not found".into()]);
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert!(ClientError::NotFound("2956".into()).is_not_found());
        assert!(!ClientError::Decode("x".into()).is_not_found());
    }

    #[test]
    fn graphql_messages_are_joined() {
        let err = ClientError::GraphQl(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "graphql error: a; b");
    }
}
