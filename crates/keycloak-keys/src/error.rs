//! Descriptor fetch errors.

/// Errors raised while fetching or decoding a key descriptor.
///
/// Lookups never return these: the locator logs them and keeps its
/// previous snapshot.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Request could not be sent or the connection failed.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Non-success HTTP status.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// Body is not a valid key descriptor.
    #[error("Failed to parse key descriptor: {0}")]
    ParseError(String),

    /// Only HTTPS is allowed unless plain HTTP was enabled.
    #[error("Invalid descriptor URL scheme '{0}': must be https")]
    InvalidScheme(String),

    #[error("Descriptor response too large (max {max_size} bytes)")]
    ResponseTooLarge { max_size: usize },

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    ClientError(String),

    #[error("Invalid descriptor URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl FetchError {
    /// Whether a later attempt may succeed without a configuration change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_) | Self::HttpError(_) | Self::ParseError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        assert_eq!(
            FetchError::HttpError(503).to_string(),
            "HTTP error: status 503"
        );
        assert_eq!(
            FetchError::ResponseTooLarge { max_size: 1024 }.to_string(),
            "Descriptor response too large (max 1024 bytes)"
        );
        assert!(FetchError::NetworkError("refused".into()).is_transient());
        assert!(!FetchError::InvalidScheme("ftp".into()).is_transient());
    }
}
