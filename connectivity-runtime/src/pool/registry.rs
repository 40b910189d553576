// Copyright 2020 Palantir Technologies, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use crate::clock::SystemClock;
use crate::config::PoolCache;
use crate::endpoint::EndpointDescriptor;
use crate::errors::PoolManagerConstructionError;
use crate::isolation::IsolationScope;
use crate::pool::{PoolManager, PoolSettings};
use crate::tls::TlsContextProvider;
use crate::ttl_cache::TtlCache;
use conjure_error::Error;
use std::fmt;
use std::sync::Arc;
use witchcraft_log::debug;
use witchcraft_metrics::{MetricId, MetricRegistry};

type KeyExtractor =
    dyn Fn(&IsolationScope, Option<&EndpointDescriptor>) -> Option<String> + Sync + Send;

/// The strategy used to share pool managers between clients.
#[derive(Clone, Default)]
pub enum PoolCacheStrategy {
    /// Every call builds a new pool manager.
    #[default]
    NoCache,
    /// All calls share one pool manager.
    Global,
    /// Calls share a pool manager per tenant. Calls without a tenant share one pool manager.
    ByTenant,
    /// Calls share a pool manager per endpoint name. Calls for unnamed endpoints share one pool manager, as do calls
    /// without an endpoint.
    ByEndpointName,
    /// Calls share a pool manager per endpoint. It is additionally split by tenant if one of the endpoint's header
    /// providers acts on behalf of the current tenant.
    ByIndicatedOnBehalfOf,
    /// Calls share a pool manager per key returned by the function. Calls for which it returns `None` build a new
    /// pool manager.
    Custom(Arc<KeyExtractor>),
}

impl PoolCacheStrategy {
    /// Creates a strategy keyed by a custom function.
    pub fn custom<F>(extractor: F) -> PoolCacheStrategy
    where
        F: Fn(&IsolationScope, Option<&EndpointDescriptor>) -> Option<String>
            + Sync
            + Send
            + 'static,
    {
        PoolCacheStrategy::Custom(Arc::new(extractor))
    }

    /// Creates a strategy from its configured form.
    pub fn from_config(config: PoolCache) -> PoolCacheStrategy {
        match config {
            PoolCache::Global => PoolCacheStrategy::Global,
            PoolCache::ByTenant => PoolCacheStrategy::ByTenant,
            PoolCache::ByEndpointName => PoolCacheStrategy::ByEndpointName,
            PoolCache::ByIndicatedOnBehalfOf => PoolCacheStrategy::ByIndicatedOnBehalfOf,
            _ => PoolCacheStrategy::NoCache,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PoolCacheStrategy::NoCache => "no-cache",
            PoolCacheStrategy::Global => "global",
            PoolCacheStrategy::ByTenant => "by-tenant",
            PoolCacheStrategy::ByEndpointName => "by-endpoint-name",
            PoolCacheStrategy::ByIndicatedOnBehalfOf => "by-indicated-on-behalf-of",
            PoolCacheStrategy::Custom(_) => "custom",
        }
    }

    fn key(
        &self,
        scope: &IsolationScope,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Option<PoolManagerKey> {
        match self {
            PoolCacheStrategy::NoCache => None,
            PoolCacheStrategy::Global => Some(PoolManagerKey::Global),
            PoolCacheStrategy::ByTenant => Some(match scope.tenant_id() {
                Some(tenant) => PoolManagerKey::Tenant(tenant.to_string()),
                None => PoolManagerKey::NoTenant,
            }),
            PoolCacheStrategy::ByEndpointName => Some(match endpoint {
                Some(endpoint) => match endpoint.name() {
                    Some(name) => PoolManagerKey::EndpointName(name.to_string()),
                    None => PoolManagerKey::Unnamed,
                },
                None => PoolManagerKey::NoEndpoint,
            }),
            PoolCacheStrategy::ByIndicatedOnBehalfOf => Some(match endpoint {
                Some(endpoint) => {
                    let current_tenant = endpoint
                        .header_providers()
                        .iter()
                        .filter_map(|p| p.on_behalf_of())
                        .any(|o| o.is_current_tenant());
                    if current_tenant {
                        PoolManagerKey::TenantEndpoint(
                            scope.tenant_id().map(str::to_string),
                            endpoint.clone(),
                        )
                    } else {
                        PoolManagerKey::Endpoint(endpoint.clone())
                    }
                }
                None => PoolManagerKey::NoEndpoint,
            }),
            PoolCacheStrategy::Custom(extractor) => {
                extractor(scope, endpoint).map(PoolManagerKey::Custom)
            }
        }
    }
}

impl fmt::Debug for PoolCacheStrategy {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum PoolManagerKey {
    Global,
    NoTenant,
    Tenant(String),
    NoEndpoint,
    Unnamed,
    EndpointName(String),
    Endpoint(EndpointDescriptor),
    TenantEndpoint(Option<String>, EndpointDescriptor),
    Custom(String),
}

/// A registry of pool managers.
///
/// Pool managers hold no credentials, so the registry is independent of tenant and principal invalidation. Cached
/// managers live until the registry is [reset](Self::reset) or dropped.
pub struct PoolManagerRegistry {
    strategy: PoolCacheStrategy,
    tls: Arc<TlsContextProvider>,
    cache: TtlCache<PoolManagerKey, Arc<PoolManager>>,
    metrics: Option<Arc<MetricRegistry>>,
}

impl PoolManagerRegistry {
    /// Creates a new registry.
    pub fn new(strategy: PoolCacheStrategy, tls: Arc<TlsContextProvider>) -> PoolManagerRegistry {
        PoolManagerRegistry {
            strategy,
            tls,
            cache: TtlCache::new(None, Arc::new(SystemClock)),
            metrics: None,
        }
    }

    /// Sets the metric registry used to record pool manager construction.
    pub fn metrics(mut self, metrics: Arc<MetricRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the registry's caching strategy.
    pub fn strategy(&self) -> &PoolCacheStrategy {
        &self.strategy
    }

    /// Returns the TLS context provider used by the registry.
    pub fn tls_provider(&self) -> &Arc<TlsContextProvider> {
        &self.tls
    }

    /// Returns a pool manager for calls made in `scope` to `endpoint`.
    ///
    /// The manager is built with `settings` if the strategy does not yield a cached one. Endpoints reached over TLS
    /// get a TLS context for their trust and key material.
    pub fn get(
        &self,
        settings: &PoolSettings,
        scope: &IsolationScope,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<Arc<PoolManager>, Error> {
        match self.strategy.key(scope, endpoint) {
            Some(key) => self
                .cache
                .get(key, || self.build(settings, endpoint))
                .map(|f| f.value),
            None => self.build(settings, endpoint),
        }
    }

    /// Drops all cached pool managers, returning the number removed.
    ///
    /// Clients already holding a manager keep using it.
    pub fn reset(&self) -> usize {
        self.cache.clear()
    }

    fn build(
        &self,
        settings: &PoolSettings,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<Arc<PoolManager>, Error> {
        let tls = match endpoint {
            Some(endpoint) if endpoint.is_tls() => {
                self.tls.context_for(endpoint).map_err(|e| {
                    Error::internal_safe(PoolManagerConstructionError::caused_by(
                        "unable to build TLS context",
                        &e,
                    ))
                    .with_safe_param("endpoint", endpoint.name())
                })?
            }
            _ => self.tls.default_context().clone(),
        };

        debug!(
            "creating connection pool manager",
            safe: {
                strategy: self.strategy.name(),
                endpoint: endpoint.and_then(|e| e.name())
            },
        );
        if let Some(metrics) = &self.metrics {
            metrics
                .meter(
                    MetricId::new("connectivity.pool-manager.created")
                        .with_tag("strategy", self.strategy.name()),
                )
                .mark(1);
        }

        Ok(Arc::new(PoolManager::new(*settings, tls)))
    }
}
