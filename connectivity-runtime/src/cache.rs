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
use crate::client::Client;
use crate::clock::{Clock, SystemClock};
use crate::config::ConnectivityConfig;
use crate::endpoint::EndpointDescriptor;
use crate::errors::ContextConsistencyError;
use crate::factory::{BuildClient, ClientFactory};
use crate::isolation::{ContextAccessor, IsolationScope};
use crate::ttl_cache::TtlCache;
use conjure_error::Error;
use std::sync::Arc;
use std::time::Duration;
use witchcraft_log::debug;
use witchcraft_metrics::{MetricId, MetricRegistry};

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// The key a client is cached under.
///
/// Clients without an endpoint and clients for endpoints whose authentication acts as the calling principal are
/// isolated by tenant and principal. All other endpoint clients are isolated by tenant only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientCacheKey {
    /// A client without an endpoint.
    NoEndpoint(IsolationScope),
    /// A client bound to an endpoint.
    ForEndpoint(IsolationScope, EndpointDescriptor),
}

impl ClientCacheKey {
    /// Computes the key for a call made in `scope` to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a `ContextConsistencyError` if the endpoint requires principal isolation and the scope lacks a
    /// principal or a tenant.
    pub fn new(
        scope: &IsolationScope,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<ClientCacheKey, Error> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => return Ok(ClientCacheKey::NoEndpoint(scope.clone())),
        };

        if !endpoint.authentication().requires_principal_isolation() {
            return Ok(ClientCacheKey::ForEndpoint(
                scope.without_principal(),
                endpoint.clone(),
            ));
        }

        if scope.principal_id().is_none() {
            return Err(Error::internal_safe(ContextConsistencyError::new(
                "endpoint requires principal isolation but no principal is available",
            ))
            .with_safe_param("endpoint", endpoint.name())
            .with_safe_param("authentication", format!("{:?}", endpoint.authentication())));
        }
        if scope.tenant_id().is_none() {
            return Err(Error::internal_safe(ContextConsistencyError::new(
                "principal is available but no tenant is",
            ))
            .with_safe_param("endpoint", endpoint.name()));
        }

        Ok(ClientCacheKey::ForEndpoint(scope.clone(), endpoint.clone()))
    }

    /// Returns the isolation scope of the key.
    pub fn scope(&self) -> &IsolationScope {
        match self {
            ClientCacheKey::NoEndpoint(scope) => scope,
            ClientCacheKey::ForEndpoint(scope, _) => scope,
        }
    }

    /// Returns the endpoint of the key, if any.
    pub fn endpoint(&self) -> Option<&EndpointDescriptor> {
        match self {
            ClientCacheKey::NoEndpoint(_) => None,
            ClientCacheKey::ForEndpoint(_, endpoint) => Some(endpoint),
        }
    }
}

/// Hooks to evict cached entries, for use by an external cache registry.
pub trait CacheInvalidation: Sync + Send {
    /// Removes all entries of a tenant, returning the number removed.
    fn invalidate_tenant(&self, tenant: &str) -> usize;

    /// Removes all entries of a principal of a tenant, returning the number removed.
    fn invalidate_principal(&self, tenant: &str, principal: &str) -> usize;

    /// Removes all entries, returning the number removed.
    fn invalidate_all(&self) -> usize;
}

/// A builder for [`ClientCache`]s.
pub struct ClientCacheBuilder<F> {
    factory: F,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<MetricRegistry>>,
}

impl<F> ClientCacheBuilder<F>
where
    F: BuildClient,
{
    /// Sets the sliding expiry of cached clients, measured from their last access.
    ///
    /// Defaults to 1 hour.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the clock used to track access times.
    ///
    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the metric registry used to record cache activity.
    ///
    /// Defaults to no registry.
    pub fn metrics(mut self, metrics: Arc<MetricRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Creates the cache.
    pub fn build(self) -> ClientCache<F> {
        ClientCache {
            factory: self.factory,
            cache: TtlCache::new(Some(self.ttl), self.clock),
            metrics: self.metrics,
        }
    }
}

/// A cache of clients isolated by tenant and principal.
///
/// Entries expire once unused for the cache's TTL. Construction of an entry happens at most once at a time per key;
/// concurrent callers for the same key wait for it and share its result.
pub struct ClientCache<F = ClientFactory> {
    factory: F,
    cache: TtlCache<ClientCacheKey, Client>,
    metrics: Option<Arc<MetricRegistry>>,
}

impl ClientCache {
    /// Creates a cache, along with its client factory, from configuration.
    pub fn from_config(config: &ConnectivityConfig) -> ClientCache {
        ClientCache::builder(ClientFactory::from_config(config))
            .ttl(config.client_cache_ttl().unwrap_or(DEFAULT_TTL))
            .build()
    }
}

impl<F> ClientCache<F>
where
    F: BuildClient,
{
    /// Creates a cache with default settings.
    pub fn new(factory: F) -> ClientCache<F> {
        ClientCache::builder(factory).build()
    }

    /// Returns a builder for a cache.
    pub fn builder(factory: F) -> ClientCacheBuilder<F> {
        ClientCacheBuilder {
            factory,
            ttl: DEFAULT_TTL,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Returns the factory used to build clients.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns a client for calls made in `scope` to `endpoint`.
    ///
    /// A cached endpoint client is rebound to `endpoint`, so its header providers are always the ones most recently
    /// supplied.
    ///
    /// # Errors
    ///
    /// Returns a `ContextConsistencyError` if `scope` does not satisfy the endpoint's isolation requirements, and any
    /// error raised while building a new client.
    pub fn get(
        &self,
        scope: &IsolationScope,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<Client, Error> {
        let key = ClientCacheKey::new(scope, endpoint)?;
        let isolation = key.scope().clone();

        let fetched = self
            .cache
            .get(key, || self.factory.build(&isolation, endpoint))?;
        if fetched.constructed {
            debug!(
                "cached new client",
                safe: {
                    endpoint: endpoint.and_then(|e| e.name())
                },
            );
            self.mark("connectivity.client-cache.miss");
        } else {
            self.mark("connectivity.client-cache.hit");
        }

        match (fetched.value, endpoint) {
            (Client::Endpoint(client), Some(endpoint)) => {
                Ok(Client::Endpoint(client.rebind(endpoint)))
            }
            (client, _) => Ok(client),
        }
    }

    /// Returns a client for calls made in the accessor's current context to `endpoint`.
    pub fn get_current<A>(
        &self,
        accessor: &A,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<Client, Error>
    where
        A: ?Sized + ContextAccessor,
    {
        let scope = IsolationScope::from_accessor(accessor)?;
        self.get(&scope, endpoint)
    }

    /// Removes all entries of a tenant, returning the number removed.
    pub fn invalidate_tenant(&self, tenant: &str) -> usize {
        let removed = self
            .cache
            .invalidate_if(|key| key.scope().tenant_id() == Some(tenant));
        self.invalidated(removed)
    }

    /// Removes all entries of a principal of a tenant, returning the number removed.
    pub fn invalidate_principal(&self, tenant: &str, principal: &str) -> usize {
        let removed = self.cache.invalidate_if(|key| {
            let scope = key.scope();
            scope.tenant_id() == Some(tenant) && scope.principal_id() == Some(principal)
        });
        self.invalidated(removed)
    }

    /// Removes all entries, returning the number removed.
    pub fn invalidate_all(&self) -> usize {
        let removed = self.cache.clear();
        self.invalidated(removed)
    }

    fn mark(&self, name: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.meter(MetricId::new(name)).mark(1);
        }
    }

    fn invalidated(&self, removed: usize) -> usize {
        if let Some(metrics) = &self.metrics {
            metrics
                .counter(MetricId::new("connectivity.client-cache.invalidated"))
                .add(removed as i64);
        }
        removed
    }
}

impl<F> CacheInvalidation for ClientCache<F>
where
    F: BuildClient,
{
    fn invalidate_tenant(&self, tenant: &str) -> usize {
        ClientCache::invalidate_tenant(self, tenant)
    }

    fn invalidate_principal(&self, tenant: &str, principal: &str) -> usize {
        ClientCache::invalidate_principal(self, tenant, principal)
    }

    fn invalidate_all(&self) -> usize {
        ClientCache::invalidate_all(self)
    }
}
