//! Self-host detection.
//!
//! Commands addressed to the machine running the orchestrator are run as
//! plain local processes instead of going through ssh. A host counts as
//! "self" when it is a loopback address, or when its name/address set
//! intersects the local machine's. Name resolution goes through
//! [hickory-resolver](https://crates.io/crates/hickory-resolver), which
//! also consults the hosts file.
//!
//! Results are cached per host for the life of the resolver.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use tokio::sync::{OnceCell, RwLock};

use crate::error::{DeployError, Result};

#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Whether `host` refers to the machine this process runs on.
    async fn is_self(&self, host: &str) -> Result<bool>;
}

/// Names and addresses that identify one machine.
#[derive(Debug, Default, Clone)]
struct Aliases {
    names: HashSet<String>,
    ips: HashSet<IpAddr>,
}

impl Aliases {
    fn intersects(&self, other: &Aliases) -> bool {
        !self.ips.is_disjoint(&other.ips) || !self.names.is_disjoint(&other.names)
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

pub struct SystemResolver {
    resolver: TokioAsyncResolver,
    local: OnceCell<Aliases>,
    cache: RwLock<HashMap<String, bool>>,
}

impl SystemResolver {
    pub fn from_system_conf() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!(
                "Failed to load system resolv.conf: {}. Falling back to default upstreams.",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self {
            resolver,
            local: OnceCell::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn local_aliases(&self) -> Result<&Aliases> {
        self.local
            .get_or_try_init(|| async {
                let hostname = local_hostname()?;
                let mut aliases = Aliases::default();
                aliases.names.insert(normalize(&hostname));
                aliases.names.insert("localhost".into());
                aliases.ips.extend(self.forward(&hostname).await?);
                debug!("local aliases: {:?}", aliases);
                Ok(aliases)
            })
            .await
    }

    async fn forward(&self, name: &str) -> Result<HashSet<IpAddr>> {
        let lookup = self
            .resolver
            .lookup_ip(name)
            .await
            .map_err(|e| DeployError::Resolve {
                host: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(lookup.iter().collect())
    }

    /// PTR names for an address. A missing PTR record is not an error.
    async fn reverse(&self, ip: IpAddr) -> Result<HashSet<String>> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => Ok(lookup.iter().map(|n| normalize(&n.to_string())).collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(HashSet::new()),
                _ => Err(DeployError::Resolve {
                    host: ip.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }

    async fn candidate_aliases(&self, host: &str) -> Result<Aliases> {
        let mut aliases = Aliases::default();
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                aliases.ips.insert(ip);
                aliases.names.extend(self.reverse(ip).await?);
            }
            Err(_) => {
                aliases.names.insert(normalize(host));
                aliases.ips.extend(self.forward(host).await?);
            }
        }
        Ok(aliases)
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn is_self(&self, host: &str) -> Result<bool> {
        if let Some(hit) = self.cache.read().await.get(host).copied() {
            return Ok(hit);
        }

        let is_self = match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => true,
            _ => {
                let local = self.local_aliases().await?;
                let candidate = self.candidate_aliases(host).await?;
                candidate.ips.iter().any(|ip| ip.is_loopback()) || local.intersects(&candidate)
            }
        };

        debug!("is_self({}) = {}", host, is_self);
        self.cache.write().await.insert(host.to_string(), is_self);
        Ok(is_self)
    }
}

/// Fixed answer set, for hosts whose identity is known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    local: HashSet<String>,
}

impl StaticResolver {
    pub fn new<I, S>(local: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local: local.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn is_self(&self, host: &str) -> Result<bool> {
        Ok(self.local.contains(host))
    }
}

fn local_hostname() -> Result<String> {
    Ok(hostname::get()?.to_string_lossy().into_owned())
}
