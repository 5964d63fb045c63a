//! Where key descriptors come from.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use keycloak_config::KeyLocatorConfig;
use url::Url;

use crate::descriptor::KeyDescriptor;
use crate::error::FetchError;

/// A fetchable key descriptor.
#[async_trait]
pub trait DescriptorSource: Send + Sync + fmt::Debug {
    /// Human-readable location, used in logs.
    fn location(&self) -> String;

    async fn fetch(&self) -> Result<KeyDescriptor, FetchError>;
}

/// Fetches the descriptor with an HTTP GET.
///
/// - Only HTTPS URLs are accepted unless `allow_http` is set
/// - Requests are bounded by `request_timeout`
/// - Bodies larger than `max_response_size` are rejected
pub struct HttpDescriptorSource {
    http_client: reqwest::Client,
    url: Url,
    max_response_size: usize,
    allow_http: bool,
}

impl HttpDescriptorSource {
    pub fn new(url: Url, config: &KeyLocatorConfig) -> Result<Self, FetchError> {
        validate_scheme(&url, config.allow_http)?;
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::ClientError(e.to_string()))?;

        Ok(Self {
            http_client,
            url,
            max_response_size: config.max_response_size,
            allow_http: config.allow_http,
        })
    }

    /// Source for `key_locator.descriptor_url`, if configured.
    pub fn from_config(config: &KeyLocatorConfig) -> Result<Option<Self>, FetchError> {
        config
            .descriptor_url
            .as_deref()
            .map(|raw| Self::new(Url::parse(raw)?, config))
            .transpose()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn validate_scheme(url: &Url, allow_http: bool) -> Result<(), FetchError> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if allow_http => Ok(()),
        other => Err(FetchError::InvalidScheme(other.to_string())),
    }
}

#[async_trait]
impl DescriptorSource for HttpDescriptorSource {
    fn location(&self) -> String {
        self.url.to_string()
    }

    async fn fetch(&self) -> Result<KeyDescriptor, FetchError> {
        validate_scheme(&self.url, self.allow_http)?;

        tracing::debug!(url = %self.url, "Fetching key descriptor");

        let response = self
            .http_client
            .get(self.url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(url = %self.url, error = %e, "Failed to fetch key descriptor");
                FetchError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(FetchError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.max_response_size
        {
            return Err(FetchError::ResponseTooLarge {
                max_size: self.max_response_size,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::NetworkError(e.to_string()))?;
        if body.len() > self.max_response_size {
            return Err(FetchError::ResponseTooLarge {
                max_size: self.max_response_size,
            });
        }

        serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!(url = %self.url, error = %e, "Failed to parse key descriptor");
            FetchError::ParseError(e.to_string())
        })
    }
}

impl fmt::Debug for HttpDescriptorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDescriptorSource")
            .field("url", &self.url.as_str())
            .field("max_response_size", &self.max_response_size)
            .finish_non_exhaustive()
    }
}

enum StaticState {
    Serve(KeyDescriptor),
    Fail(String),
}

/// In-process descriptor, swappable at runtime. Counts fetches.
pub struct StaticDescriptorSource {
    state: ArcSwap<StaticState>,
    fetches: AtomicUsize,
    delay: Option<Duration>,
}

impl StaticDescriptorSource {
    pub fn new(descriptor: KeyDescriptor) -> Self {
        Self {
            state: ArcSwap::from_pointee(StaticState::Serve(descriptor)),
            fetches: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn shared(descriptor: KeyDescriptor) -> Arc<Self> {
        Arc::new(Self::new(descriptor))
    }

    /// Makes every fetch take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_descriptor(&self, descriptor: KeyDescriptor) {
        self.state.store(Arc::new(StaticState::Serve(descriptor)));
    }

    /// Makes subsequent fetches fail with a network error.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.state.store(Arc::new(StaticState::Fail(message.into())));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DescriptorSource for StaticDescriptorSource {
    fn location(&self) -> String {
        "static".to_string()
    }

    async fn fetch(&self) -> Result<KeyDescriptor, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.state.load().as_ref() {
            StaticState::Serve(descriptor) => Ok(descriptor.clone()),
            StaticState::Fail(message) => Err(FetchError::NetworkError(message.clone())),
        }
    }
}

impl fmt::Debug for StaticDescriptorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticDescriptorSource")
            .field("fetches", &self.fetch_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_scheme() {
        let https = Url::parse("https://idp.example.com/descriptor").unwrap();
        let http = Url::parse("http://localhost:8080/descriptor").unwrap();
        let ftp = Url::parse("ftp://idp.example.com/descriptor").unwrap();

        assert!(validate_scheme(&https, false).is_ok());
        assert!(matches!(
            validate_scheme(&http, false),
            Err(FetchError::InvalidScheme(s)) if s == "http"
        ));
        assert!(validate_scheme(&http, true).is_ok());
        assert!(validate_scheme(&ftp, true).is_err());
    }

    #[test]
    fn test_from_config_without_url() {
        let config = KeyLocatorConfig::default();
        assert!(HttpDescriptorSource::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_source_counts_and_fails() {
        let source = StaticDescriptorSource::new(KeyDescriptor::new());
        assert!(source.fetch().await.is_ok());
        source.fail_with("connection reset");
        let err = source.fetch().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(source.fetch_count(), 2);
    }
}
