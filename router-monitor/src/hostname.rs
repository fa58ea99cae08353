use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

pub const DEFAULT_HOSTNAME_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Reverse (PTR) lookup of an address.
pub trait ReverseResolver: Send + Sync + 'static {
    fn lookup(&self, ip: IpAddr) -> io::Result<Vec<String>>;
}

/// Resolver backed by the system's `getnameinfo`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl ReverseResolver for SystemResolver {
    fn lookup(&self, ip: IpAddr) -> io::Result<Vec<String>> {
        let name = dns_lookup::lookup_addr(&ip)?;
        // getnameinfo falls back to the numeric form when there is no PTR record.
        if name.is_empty() || name == ip.to_string() {
            return Ok(Vec::new());
        }
        Ok(vec![name])
    }
}

#[derive(Clone, Debug)]
struct HostCacheEntry {
    hostname: String,
    expires_at: Instant,
}

/// IP -> hostname cache with lazy refresh.
///
/// The lock covers the freshness check and the write-back only; the lookup
/// itself runs unlocked, so two scrapes missing on the same address may both
/// resolve it. Both write the same answer.
pub struct HostnameCache {
    resolver: Arc<dyn ReverseResolver>,
    strip_suffix: String,
    ttl: Duration,
    lookup_timeout: Duration,
    entries: Mutex<HashMap<IpAddr, HostCacheEntry>>,
}

impl HostnameCache {
    pub fn new(
        resolver: Arc<dyn ReverseResolver>,
        strip_suffix: impl Into<String>,
        ttl: Duration,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            strip_suffix: strip_suffix.into(),
            ttl,
            lookup_timeout: lookup_timeout.max(Duration::from_millis(1)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, ip: IpAddr) -> String {
        if let Some(hostname) = self.cached(ip, Instant::now()) {
            return hostname;
        }

        let hostname = match self.lookup_bounded(ip).await {
            Ok(names) => match names.into_iter().next() {
                Some(name) => self.strip(&name),
                None => "unknown".to_string(),
            },
            Err(err) => {
                debug!(ip = %ip, error = %err, "reverse lookup failed");
                format!("unknown:{}", ip)
            }
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            ip,
            HostCacheEntry {
                hostname: hostname.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        hostname
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn cached(&self, ip: IpAddr, now: Instant) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&ip)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.hostname.clone())
    }

    async fn lookup_bounded(&self, ip: IpAddr) -> io::Result<Vec<String>> {
        let resolver = Arc::clone(&self.resolver);
        let lookup = tokio::task::spawn_blocking(move || resolver.lookup(ip));
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(io::Error::new(io::ErrorKind::Other, join_err)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("reverse lookup exceeded {:?}", self.lookup_timeout),
            )),
        }
    }

    fn strip(&self, name: &str) -> String {
        let name = name.strip_suffix('.').unwrap_or(name);
        if self.strip_suffix.is_empty() {
            return name.to_string();
        }
        let suffix = self
            .strip_suffix
            .strip_suffix('.')
            .unwrap_or(&self.strip_suffix);
        name.strip_suffix(suffix).unwrap_or(name).to_string()
    }
}
