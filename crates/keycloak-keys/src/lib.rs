//! # keycloak-keys
//!
//! Signing keys published by a remote party, cached locally:
//!
//! - [`descriptor`]: the published key descriptor and key material
//! - [`source`]: descriptor sources (HTTP, static)
//! - [`locator`]: [`RemoteKeyLocator`] with TTL housekeeping and miss throttling

pub mod descriptor;
pub mod error;
pub mod locator;
pub mod source;

pub use descriptor::{CertificateInfo, KeyDescriptor, KeyHash, KeyInfo, PublicKey};
pub use error::FetchError;
pub use locator::{
    DEFAULT_MIN_TIME_BETWEEN_REQUESTS_SECS, KeyLocator, RemoteKeyLocator, duration_secs,
};
pub use source::{DescriptorSource, HttpDescriptorSource, StaticDescriptorSource};
