//! Signing-key locator backed by a remote descriptor.
//!
//! # Refresh policy
//!
//! Times are wall-clock seconds of the last fetch *attempt*:
//!
//! | condition                         | behaviour                              |
//! |-----------------------------------|----------------------------------------|
//! | `now > last + ttl`                | housekeeping refresh, then lookup       |
//! | key cached                        | served from the snapshot               |
//! | miss and `now > last + min`       | throttled refresh, then lookup         |
//! | miss within `min`                 | `None` without I/O                     |
//!
//! Both lookup maps live in one snapshot that is swapped atomically, so a
//! reader never sees the name map and the hash map from different fetches.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use keycloak_config::KeyLocatorConfig;
use keycloak_core::SharedClock;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::descriptor::{KeyHash, KeyInfo, PublicKey};
use crate::error::FetchError;
use crate::source::{DescriptorSource, HttpDescriptorSource};

/// Used when the configured minimum interval is not positive.
pub const DEFAULT_MIN_TIME_BETWEEN_REQUESTS_SECS: i64 = 20;

/// Lookup and enumeration of public keys.
#[async_trait]
pub trait KeyLocator: Send + Sync + fmt::Display {
    async fn get_key_by_id(&self, kid: &str) -> Option<PublicKey>;

    async fn get_key_by_material(&self, key: &PublicKey) -> Option<PublicKey>;

    /// Drops every cached key and fetches again.
    async fn force_refresh(&self);

    /// Snapshot of all cached keys.
    async fn iter_keys(&self) -> std::vec::IntoIter<PublicKey>;
}

#[derive(Debug, Default)]
struct KeySnapshot {
    by_name: HashMap<String, PublicKey>,
    by_hash: HashMap<KeyHash, PublicKey>,
}

impl KeySnapshot {
    fn build(entries: &[KeyInfo], now: OffsetDateTime) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            let Some(certificate) = &entry.certificate else {
                trace!(name = ?entry.key_name, "Skipping entry without certificate");
                continue;
            };
            if !certificate.is_valid_at(now) {
                debug!(
                    name = ?entry.key_name,
                    serial = %certificate.serial_number,
                    "Skipping certificate outside its validity period"
                );
                continue;
            }

            let key = certificate.public_key.clone();
            let name = match &entry.key_name {
                Some(name) => {
                    trace!(name = %name, "Registering signing certificate");
                    name.clone()
                }
                None => {
                    let name = certificate.synthetic_name();
                    trace!(name = %name, "Adding certificate without a specific key name");
                    name
                }
            };
            snapshot.by_hash.insert(key.hash(), key.clone());
            snapshot.by_name.insert(name, key);
        }
        snapshot
    }
}

#[derive(Clone, Copy)]
enum Lookup<'a> {
    Name(&'a str),
    Hash(KeyHash),
}

impl fmt::Display for Lookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name:{name}"),
            Self::Hash(hash) => write!(f, "hash:{hash}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    /// TTL elapsed.
    Housekeeping,
    /// Cache miss after the minimum interval.
    Throttled,
    /// Explicit cache bust.
    Forced,
}

/// Whole seconds of `duration`, saturating at `i64::MAX`.
pub fn duration_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Whether `interval` seconds have passed since `last`.
fn elapsed(now: i64, last: i64, interval: i64) -> bool {
    now > last.saturating_add(interval)
}

/// Remote key locator with negative-result throttling.
pub struct RemoteKeyLocator {
    source: Option<Arc<dyn DescriptorSource>>,
    snapshot: ArcSwap<KeySnapshot>,
    refresh_lock: Mutex<()>,
    last_request_time: AtomicI64,
    min_interval_secs: i64,
    ttl_secs: i64,
    clock: SharedClock,
}

impl RemoteKeyLocator {
    /// Creates a locator. `min_interval_secs <= 0` falls back to
    /// [`DEFAULT_MIN_TIME_BETWEEN_REQUESTS_SECS`].
    pub fn new(
        source: Option<Arc<dyn DescriptorSource>>,
        min_interval_secs: i64,
        ttl_secs: i64,
        clock: SharedClock,
    ) -> Self {
        Self {
            source,
            snapshot: ArcSwap::from_pointee(KeySnapshot::default()),
            refresh_lock: Mutex::new(()),
            last_request_time: AtomicI64::new(0),
            min_interval_secs: if min_interval_secs <= 0 {
                DEFAULT_MIN_TIME_BETWEEN_REQUESTS_SECS
            } else {
                min_interval_secs
            },
            ttl_secs,
            clock,
        }
    }

    /// Locator for `key_locator.*`, fetching over HTTP when a URL is set.
    pub fn from_config(config: &KeyLocatorConfig, clock: SharedClock) -> Result<Self, FetchError> {
        let source = HttpDescriptorSource::from_config(config)?
            .map(|s| Arc::new(s) as Arc<dyn DescriptorSource>);
        Ok(Self::new(
            source,
            duration_secs(config.min_time_between_requests),
            duration_secs(config.cache_ttl),
            clock,
        ))
    }

    pub fn min_interval_secs(&self) -> i64 {
        self.min_interval_secs
    }

    /// Time of the last fetch attempt, in seconds since the epoch.
    pub fn last_request_time(&self) -> i64 {
        self.last_request_time.load(Ordering::Acquire)
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names the cached keys are registered under.
    pub fn key_names(&self) -> Vec<String> {
        self.snapshot.load().by_name.keys().cloned().collect()
    }

    pub async fn get_key_by_id(&self, kid: &str) -> Option<PublicKey> {
        if kid.is_empty() {
            debug!("Invalid key id: empty");
            return None;
        }
        self.get_key(Lookup::Name(kid)).await
    }

    pub async fn get_key_by_material(&self, key: &PublicKey) -> Option<PublicKey> {
        self.get_key(Lookup::Hash(key.hash())).await
    }

    pub async fn force_refresh(&self) {
        info!(source = %self.location(), "Forcing key cache cleanup and refresh");
        self.refresh(RefreshMode::Forced).await;
    }

    pub async fn iter_keys(&self) -> std::vec::IntoIter<PublicKey> {
        let now = self.clock.now_secs();
        if elapsed(now, self.last_request_time(), self.ttl_secs) {
            debug!("Performing regular cache cleanup");
            self.refresh(RefreshMode::Housekeeping).await;
        }
        self.snapshot
            .load()
            .by_hash
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    async fn get_key(&self, lookup: Lookup<'_>) -> Option<PublicKey> {
        trace!(key = %lookup, "Requested key");

        let now = self.clock.now_secs();
        let last = self.last_request_time();

        if elapsed(now, last, self.ttl_secs) {
            debug!("Performing regular cache cleanup");
            self.refresh(RefreshMode::Housekeeping).await;
            return self.cached(lookup);
        }

        if let Some(key) = self.cached(lookup) {
            debug!(key = %lookup, "Key cache hit");
            return Some(key);
        }

        if elapsed(now, last, self.min_interval_secs) {
            self.refresh(RefreshMode::Throttled).await;
            self.cached(lookup)
        } else {
            debug!(
                key = %lookup,
                last_request_time = last,
                "Won't request the key descriptor, minimum interval not expired"
            );
            None
        }
    }

    fn cached(&self, lookup: Lookup<'_>) -> Option<PublicKey> {
        let snapshot = self.snapshot.load();
        match lookup {
            Lookup::Name(name) => snapshot.by_name.get(name).cloned(),
            Lookup::Hash(hash) => snapshot.by_hash.get(&hash).cloned(),
        }
    }

    /// Runs one refresh inside the critical section. Returns whether a new
    /// snapshot was installed.
    async fn refresh(&self, mode: RefreshMode) -> bool {
        let _guard = self.refresh_lock.lock().await;

        if mode == RefreshMode::Forced {
            self.snapshot.store(Arc::new(KeySnapshot::default()));
        }

        let Some(source) = &self.source else {
            return false;
        };

        // Another caller may have refreshed while we waited for the lock
        let now = self.clock.now_secs();
        let last = self.last_request_time();
        let due = match mode {
            RefreshMode::Forced => true,
            RefreshMode::Housekeeping => elapsed(now, last, self.ttl_secs),
            RefreshMode::Throttled => elapsed(now, last, self.min_interval_secs),
        };
        if !due {
            trace!(?mode, "Refresh already performed by a concurrent caller");
            return false;
        }

        self.last_request_time.store(now, Ordering::Release);
        debug!(source = %source.location(), ?mode, "Refreshing public key cache");

        let descriptor = match source.fetch().await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(source = %source.location(), error = %e, "Could not refresh certificates from the server");
                return false;
            }
        };

        let Some(signing) = descriptor.signing_keys() else {
            debug!(source = %source.location(), "Descriptor publishes no signing keys");
            return false;
        };

        let snapshot = KeySnapshot::build(signing, self.clock.now_utc());
        debug!(
            keys = snapshot.by_hash.len(),
            names = snapshot.by_name.len(),
            "Certificates retrieved from server, filling public key cache"
        );
        self.snapshot.store(Arc::new(snapshot));
        true
    }

    fn location(&self) -> String {
        self.source
            .as_ref()
            .map_or_else(|| "<none>".to_string(), |s| s.location())
    }
}

#[async_trait]
impl KeyLocator for RemoteKeyLocator {
    async fn get_key_by_id(&self, kid: &str) -> Option<PublicKey> {
        RemoteKeyLocator::get_key_by_id(self, kid).await
    }

    async fn get_key_by_material(&self, key: &PublicKey) -> Option<PublicKey> {
        RemoteKeyLocator::get_key_by_material(self, key).await
    }

    async fn force_refresh(&self) {
        RemoteKeyLocator::force_refresh(self).await;
    }

    async fn iter_keys(&self) -> std::vec::IntoIter<PublicKey> {
        RemoteKeyLocator::iter_keys(self).await
    }
}

impl fmt::Display for RemoteKeyLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keys retrieved from descriptor at {}", self.location())
    }
}

impl fmt::Debug for RemoteKeyLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteKeyLocator")
            .field("source", &self.source)
            .field("min_interval_secs", &self.min_interval_secs)
            .field("ttl_secs", &self.ttl_secs)
            .field("last_request_time", &self.last_request_time())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{CertificateInfo, KeyDescriptor};
    use crate::source::StaticDescriptorSource;
    use keycloak_core::ManualClock;
    use time::macros::datetime;

    const START: i64 = 1_750_000_000;

    fn cert(serial: &str, bytes: &[u8]) -> CertificateInfo {
        CertificateInfo {
            subject: Some("CN=idp".into()),
            serial_number: serial.into(),
            not_before: datetime!(2020-01-01 0:00 UTC),
            not_after: datetime!(2040-01-01 0:00 UTC),
            public_key: PublicKey::new("RSA", bytes.to_vec()),
        }
    }

    fn locator(
        descriptor: KeyDescriptor,
    ) -> (Arc<ManualClock>, Arc<StaticDescriptorSource>, RemoteKeyLocator) {
        let clock = ManualClock::shared(START);
        let source = StaticDescriptorSource::shared(descriptor);
        let locator = RemoteKeyLocator::new(
            Some(source.clone() as Arc<dyn DescriptorSource>),
            20,
            3600,
            clock.clone(),
        );
        (clock, source, locator)
    }

    #[tokio::test]
    async fn test_named_key_by_id_and_material() {
        let descriptor =
            KeyDescriptor::new().with_signing_key(KeyInfo::named("sig-key-1", cert("1", b"k1")));
        let (_, source, locator) = locator(descriptor);

        let key = locator.get_key_by_id("sig-key-1").await.unwrap();
        assert_eq!(key.encoded, b"k1");
        let same = locator
            .get_key_by_material(&PublicKey::new("RSA", b"k1".to_vec()))
            .await
            .unwrap();
        assert_eq!(same, key);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_is_throttled() {
        let (clock, source, locator) = locator(KeyDescriptor::new().with_signing_key(KeyInfo::named(
            "sig-key-1",
            cert("1", b"k1"),
        )));

        assert!(locator.get_key_by_id("other").await.is_none());
        assert_eq!(source.fetch_count(), 1);

        clock.advance(Duration::from_secs(5));
        assert!(locator.get_key_by_id("other").await.is_none());
        assert_eq!(source.fetch_count(), 1);

        clock.advance(Duration::from_secs(16));
        assert!(locator.get_key_by_id("other").await.is_none());
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_ttl_forces_fetch_even_on_hit() {
        let (clock, source, locator) = locator(KeyDescriptor::new().with_signing_key(KeyInfo::named(
            "sig-key-1",
            cert("1", b"k1"),
        )));
        locator.get_key_by_id("sig-key-1").await.unwrap();
        clock.advance(Duration::from_secs(3000));
        locator.get_key_by_id("sig-key-1").await.unwrap();
        assert_eq!(source.fetch_count(), 1);

        clock.advance(Duration::from_secs(601));
        locator.get_key_by_id("sig-key-1").await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_snapshot() {
        let (clock, source, locator) = locator(KeyDescriptor::new().with_signing_key(KeyInfo::named(
            "sig-key-1",
            cert("1", b"k1"),
        )));
        locator.get_key_by_id("sig-key-1").await.unwrap();

        source.fail_with("connection refused");
        clock.advance(Duration::from_secs(3601));
        let key = locator.get_key_by_id("sig-key-1").await;
        assert_eq!(source.fetch_count(), 2);
        assert!(key.is_some());
        assert_eq!(locator.last_request_time(), START + 3601);
    }

    #[tokio::test]
    async fn test_invalid_certificates_are_skipped() {
        let mut expired = cert("2", b"old");
        expired.not_after = datetime!(2021-01-01 0:00 UTC);
        let descriptor = KeyDescriptor::new()
            .with_signing_key(KeyInfo::named("current", cert("1", b"k1")))
            .with_signing_key(KeyInfo::named("expired", expired))
            .with_signing_key(KeyInfo {
                key_name: Some("broken".into()),
                certificate: None,
            })
            .with_key("encryption", KeyInfo::named("enc", cert("3", b"enc")));
        let (_, _, locator) = locator(descriptor);

        assert!(locator.get_key_by_id("current").await.is_some());
        assert!(locator.get_key_by_id("expired").await.is_none());
        assert!(locator.get_key_by_id("enc").await.is_none());
        assert_eq!(locator.len(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_certificate_gets_synthetic_name() {
        let descriptor = KeyDescriptor::new().with_signing_key(KeyInfo::anonymous(cert("42", b"anon")));
        let (_, _, locator) = locator(descriptor);

        let key = locator
            .get_key_by_material(&PublicKey::new("RSA", b"anon".to_vec()))
            .await
            .unwrap();
        let names = locator.key_names();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("CN=idp@42$"));
        assert_eq!(locator.get_key_by_id(&names[0]).await, Some(key));
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_throttle() {
        let (_, source, locator) = locator(KeyDescriptor::new().with_signing_key(KeyInfo::named(
            "sig-key-1",
            cert("1", b"k1"),
        )));
        locator.get_key_by_id("sig-key-1").await.unwrap();

        source.set_descriptor(
            KeyDescriptor::new().with_signing_key(KeyInfo::named("sig-key-2", cert("2", b"k2"))),
        );
        locator.force_refresh().await;
        assert_eq!(source.fetch_count(), 2);
        assert!(locator.get_key_by_id("sig-key-1").await.is_none());
        assert!(locator.get_key_by_id("sig-key-2").await.is_some());
    }

    #[tokio::test]
    async fn test_refetch_of_unchanged_descriptor_is_equivalent() {
        let descriptor = KeyDescriptor::new()
            .with_signing_key(KeyInfo::named("a", cert("1", b"k1")))
            .with_signing_key(KeyInfo::named("b", cert("2", b"k2")));
        let (_, _, locator) = locator(descriptor);

        let mut before: Vec<_> = locator.iter_keys().await.map(|k| k.hash()).collect();
        locator.force_refresh().await;
        let mut after: Vec<_> = locator.iter_keys().await.map(|k| k.hash()).collect();
        before.sort_by_key(|h| h.to_string());
        after.sort_by_key(|h| h.to_string());
        assert_eq!(before, after);
        let mut names = locator.key_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_wrap() {
        assert_eq!(duration_secs(Duration::MAX), i64::MAX);

        let clock = ManualClock::shared(START);
        let source = StaticDescriptorSource::shared(
            KeyDescriptor::new().with_signing_key(KeyInfo::named("k", cert("1", b"k1"))),
        );
        let locator = RemoteKeyLocator::new(
            Some(source.clone() as Arc<dyn DescriptorSource>),
            duration_secs(Duration::from_secs(20)),
            duration_secs(Duration::MAX),
            clock.clone(),
        );

        // first lookup: nothing fetched yet, so the miss path fetches once
        assert!(locator.get_key_by_id("k").await.is_some());
        clock.advance(Duration::from_secs(5));
        assert!(locator.get_key_by_id("k").await.is_some());
        assert!(locator.get_key_by_id("missing").await.is_none());
        assert_eq!(locator.iter_keys().await.count(), 1);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_no_source_never_fetches() {
        let locator = RemoteKeyLocator::new(None, 0, 3600, ManualClock::shared(START));
        assert_eq!(locator.min_interval_secs(), DEFAULT_MIN_TIME_BETWEEN_REQUESTS_SECS);
        assert!(locator.get_key_by_id("anything").await.is_none());
        locator.force_refresh().await;
        assert!(locator.iter_keys().await.next().is_none());
        assert_eq!(locator.to_string(), "Keys retrieved from descriptor at <none>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_readers_never_see_mixed_generations() {
        let generation_a =
            KeyDescriptor::new().with_signing_key(KeyInfo::named("k", cert("1", b"gen-a")));
        let generation_b = KeyDescriptor::new()
            .with_signing_key(KeyInfo::named("k", cert("2", b"gen-b")))
            .with_signing_key(KeyInfo::named("extra", cert("3", b"gen-b-extra")));
        let source = Arc::new(
            StaticDescriptorSource::new(generation_a).with_delay(Duration::from_millis(50)),
        );
        let locator = Arc::new(RemoteKeyLocator::new(
            Some(source.clone() as Arc<dyn DescriptorSource>),
            20,
            3600,
            ManualClock::shared(START),
        ));
        assert!(locator.get_key_by_id("k").await.is_some());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let locator = locator.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for _ in 0..40 {
                        {
                            let snapshot = locator.snapshot.load();
                            assert_eq!(snapshot.by_name.len(), snapshot.by_hash.len());
                            for key in snapshot.by_name.values() {
                                assert_eq!(snapshot.by_hash.get(&key.hash()), Some(key));
                            }
                            if let Some(key) = snapshot.by_name.get("k") {
                                seen.push(key.encoded.clone());
                            }
                        }
                        if let Some(key) = locator.get_key_by_id("k").await {
                            let by_material = locator.get_key_by_material(&key).await;
                            assert!(by_material.is_none() || by_material == Some(key));
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    seen
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        source.set_descriptor(generation_b);
        locator.force_refresh().await;

        let mut observed = Vec::new();
        for reader in readers {
            observed.extend(reader.await.unwrap());
        }
        assert!(observed.contains(&b"gen-a".to_vec()));
        assert!(observed.contains(&b"gen-b".to_vec()));
        assert_eq!(source.fetch_count(), 2);
        assert!(
            locator
                .get_key_by_material(&PublicKey::new("RSA", b"gen-a".to_vec()))
                .await
                .is_none()
        );
        assert_eq!(locator.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_fetch_once() {
        let clock = ManualClock::shared(START);
        let source = Arc::new(
            StaticDescriptorSource::new(
                KeyDescriptor::new().with_signing_key(KeyInfo::named("k", cert("1", b"k1"))),
            )
            .with_delay(Duration::from_millis(200)),
        );
        let locator = Arc::new(RemoteKeyLocator::new(
            Some(source.clone() as Arc<dyn DescriptorSource>),
            20,
            3600,
            clock,
        ));

        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let locator = locator.clone();
                tokio::spawn(async move { locator.get_key_by_id("k").await })
            })
            .collect();
        for lookup in lookups {
            assert!(lookup.await.unwrap().is_some());
        }
        assert_eq!(source.fetch_count(), 1);
    }
}
