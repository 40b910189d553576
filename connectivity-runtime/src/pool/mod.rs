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
//! Connection pool managers and their registry.
use crate::config::ConnectivityConfig;
use crate::connect::{
    ProxyConnector, ProxyConnectorLayer, ProxyRoute, TimeoutConnector, TimeoutLayer,
};
use crate::errors::LeaseTimeoutError;
use crate::tls::TlsContext;
use conjure_error::Error;
use http::Uri;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tower_layer::Layer;

pub use registry::{PoolCacheStrategy, PoolManagerRegistry};

mod registry;

// This is pretty arbitrary - I just grabbed it from some Cloudflare blog post.
const TCP_KEEPALIVE: Duration = Duration::from_secs(3 * 60);
// Most servers time out idle connections after 60 seconds, so we'll set the client timeout a bit below that.
const HTTP_KEEPALIVE: Duration = Duration::from_secs(55);

type Connector = HttpsConnector<ProxyConnector<TimeoutConnector<HttpConnector>>>;

pub(crate) type Transport = hyper::Client<Connector, Body>;

/// Settings of a connection pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PoolSettings {
    connect_timeout: Duration,
    socket_timeout: Duration,
    connection_lease_timeout: Duration,
    max_connections_total: usize,
    max_connections_per_route: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings::new()
    }
}

impl PoolSettings {
    /// Creates settings with default values.
    pub fn new() -> PoolSettings {
        PoolSettings {
            connect_timeout: Duration::from_secs(2 * 60),
            socket_timeout: Duration::from_secs(2 * 60),
            connection_lease_timeout: Duration::from_secs(2 * 60),
            max_connections_total: 200,
            max_connections_per_route: 100,
        }
    }

    /// Creates settings from configuration, using defaults for unset values.
    pub fn from_config(config: &ConnectivityConfig) -> PoolSettings {
        let mut settings = PoolSettings::new();
        if let Some(connect_timeout) = config.connect_timeout() {
            settings.connect_timeout(connect_timeout);
        }
        if let Some(socket_timeout) = config.socket_timeout() {
            settings.socket_timeout(socket_timeout);
        }
        if let Some(connection_lease_timeout) = config.connection_lease_timeout() {
            settings.connection_lease_timeout(connection_lease_timeout);
        }
        if let Some(max_connections_total) = config.max_connections_total() {
            settings.max_connections_total(max_connections_total);
        }
        if let Some(max_connections_per_route) = config.max_connections_per_route() {
            settings.max_connections_per_route(max_connections_per_route);
        }
        settings
    }

    /// Sets the TCP connect timeout.
    ///
    /// Defaults to 2 minutes.
    pub fn connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns the TCP connect timeout.
    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Sets the timeout applied to individual socket reads and writes.
    ///
    /// Defaults to 2 minutes.
    pub fn socket_timeout(&mut self, socket_timeout: Duration) -> &mut Self {
        self.socket_timeout = socket_timeout;
        self
    }

    /// Returns the socket timeout.
    pub fn get_socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    /// Sets the maximum time a request waits for a connection from the pool.
    ///
    /// Defaults to 2 minutes.
    pub fn connection_lease_timeout(&mut self, connection_lease_timeout: Duration) -> &mut Self {
        self.connection_lease_timeout = connection_lease_timeout;
        self
    }

    /// Returns the connection lease timeout.
    pub fn get_connection_lease_timeout(&self) -> Duration {
        self.connection_lease_timeout
    }

    /// Sets the maximum number of connections in the pool.
    ///
    /// Defaults to 200.
    pub fn max_connections_total(&mut self, max_connections_total: usize) -> &mut Self {
        self.max_connections_total = max_connections_total;
        self
    }

    /// Returns the maximum number of connections in the pool.
    pub fn get_max_connections_total(&self) -> usize {
        self.max_connections_total
    }

    /// Sets the maximum number of connections to a single target.
    ///
    /// Defaults to 100.
    pub fn max_connections_per_route(&mut self, max_connections_per_route: usize) -> &mut Self {
        self.max_connections_per_route = max_connections_per_route;
        self
    }

    /// Returns the maximum number of connections to a single target.
    pub fn get_max_connections_per_route(&self) -> usize {
        self.max_connections_per_route
    }
}

/// A permit to use a pooled connection.
///
/// It is stored in the extensions of responses returned by clients and releases its slot in the pool when dropped.
pub struct ConnectionLease {
    _route: OwnedSemaphorePermit,
    _total: OwnedSemaphorePermit,
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ConnectionLease").finish_non_exhaustive()
    }
}

/// A manager of pooled connections.
///
/// Managers are expensive and are shared between clients according to the [`PoolManagerRegistry`]'s strategy.
pub struct PoolManager {
    settings: PoolSettings,
    tls: TlsContext,
    total: Arc<Semaphore>,
    // entries live as long as a lease or client holds them
    routes: Mutex<HashMap<String, Weak<Semaphore>>>,
    transports: Mutex<HashMap<Option<ProxyRoute>, Weak<Transport>>>,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("PoolManager")
            .field("settings", &self.settings)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Creates a new manager.
    pub fn new(settings: PoolSettings, tls: TlsContext) -> PoolManager {
        PoolManager {
            total: Arc::new(Semaphore::new(settings.max_connections_total.max(1))),
            settings,
            tls,
            routes: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the manager's settings.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Returns the TLS context used for secure connections.
    pub fn tls_context(&self) -> &TlsContext {
        &self.tls
    }

    pub(crate) fn transport(&self, proxy: Option<&ProxyRoute>) -> Arc<Transport> {
        let mut transports = self.transports.lock();
        transports.retain(|_, t| t.strong_count() > 0);

        let key = proxy.cloned();
        if let Some(transport) = transports.get(&key).and_then(Weak::upgrade) {
            return transport;
        }

        let transport = Arc::new(self.build_transport(proxy));
        transports.insert(key, Arc::downgrade(&transport));
        transport
    }

    fn build_transport(&self, proxy: Option<&ProxyRoute>) -> Transport {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_nodelay(true);
        connector.set_keepalive(Some(TCP_KEEPALIVE));
        connector.set_connect_timeout(Some(self.settings.connect_timeout));

        let connector = TimeoutLayer::new(self.settings.socket_timeout).layer(connector);
        let connector = ProxyConnectorLayer::new(proxy).layer(connector);

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(self.tls.client_config())
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);

        hyper::Client::builder()
            .pool_idle_timeout(HTTP_KEEPALIVE)
            .pool_max_idle_per_host(self.settings.max_connections_per_route)
            .build(connector)
    }

    fn route_limit(&self, uri: &Uri) -> Arc<Semaphore> {
        let scheme = uri.scheme_str().unwrap_or("http");
        let host = uri.host().unwrap_or("");
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let route = format!("{}://{}:{}", scheme, host, port);

        let mut routes = self.routes.lock();
        routes.retain(|_, s| s.strong_count() > 0);

        if let Some(limit) = routes.get(&route).and_then(Weak::upgrade) {
            return limit;
        }

        // a route without outstanding leases starts over with a full set of permits
        let limit = Arc::new(Semaphore::new(
            self.settings.max_connections_per_route.max(1),
        ));
        routes.insert(route, Arc::downgrade(&limit));
        limit
    }

    /// Waits for a free connection slot to the target of `uri`.
    pub(crate) async fn lease(&self, uri: &Uri) -> Result<ConnectionLease, Error> {
        let route = self.route_limit(uri);
        let total = self.total.clone();

        let acquire = async move {
            let route = route.acquire_owned().await?;
            let total = total.acquire_owned().await?;
            Ok::<_, AcquireError>(ConnectionLease {
                _route: route,
                _total: total,
            })
        };

        match time::timeout(self.settings.connection_lease_timeout, acquire).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(e)) => Err(Error::internal_safe(LeaseTimeoutError::with_source(
                "connection pool closed",
                e,
            ))),
            Err(_) => Err(Error::internal_safe(LeaseTimeoutError::new(
                "timed out waiting for a pooled connection",
            ))
            .with_safe_param(
                "timeout",
                format!("{:?}", self.settings.connection_lease_timeout),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{BearerCredentials, ProxyConfig, ProxyCredentials};
    use crate::errors::find_cause;

    fn manager(total: usize, per_route: usize) -> PoolManager {
        let mut settings = PoolSettings::new();
        settings
            .max_connections_total(total)
            .max_connections_per_route(per_route)
            .connection_lease_timeout(Duration::from_millis(100));
        PoolManager::new(settings, TlsContext::default_context())
    }

    #[test]
    fn defaults() {
        let settings = PoolSettings::new();
        assert_eq!(settings.get_connect_timeout(), Duration::from_secs(120));
        assert_eq!(settings.get_socket_timeout(), Duration::from_secs(120));
        assert_eq!(
            settings.get_connection_lease_timeout(),
            Duration::from_secs(120)
        );
        assert_eq!(settings.get_max_connections_total(), 200);
        assert_eq!(settings.get_max_connections_per_route(), 100);
    }

    #[test]
    fn from_config() {
        let config = ConnectivityConfig::builder()
            .connect_timeout(Duration::from_secs(5))
            .max_connections_per_route(7usize)
            .build();
        let settings = PoolSettings::from_config(&config);
        assert_eq!(settings.get_connect_timeout(), Duration::from_secs(5));
        assert_eq!(settings.get_max_connections_per_route(), 7);
        assert_eq!(settings.get_max_connections_total(), 200);
    }

    #[tokio::test]
    async fn total_limit() {
        time::pause();
        let manager = manager(1, 10);

        let lease = manager
            .lease(&"http://a.com/foo".parse().unwrap())
            .await
            .unwrap();
        let error = manager
            .lease(&"http://b.com/foo".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(find_cause::<LeaseTimeoutError>(&error).is_some());

        drop(lease);
        manager
            .lease(&"http://b.com/foo".parse().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn route_limit() {
        time::pause();
        let manager = manager(10, 1);

        let _a = manager
            .lease(&"https://a.com/foo".parse().unwrap())
            .await
            .unwrap();
        let _b = manager
            .lease(&"https://b.com/foo".parse().unwrap())
            .await
            .unwrap();
        // the same route with an explicit default port
        let error = manager
            .lease(&"https://a.com:443/bar".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(find_cause::<LeaseTimeoutError>(&error).is_some());
        manager
            .lease(&"http://a.com/bar".parse().unwrap())
            .await
            .unwrap();
    }

    fn bearer_route(token: &str) -> ProxyRoute {
        let config = ProxyConfig::builder()
            .uri("http://proxy:3128".parse().unwrap())
            .credentials(ProxyCredentials::Bearer(BearerCredentials::new(token)))
            .build();
        ProxyRoute::from_config(&config).unwrap()
    }

    #[test]
    fn transports_are_shared_per_proxy() {
        let manager = manager(10, 10);
        let a = manager.transport(None);
        let b = manager.transport(None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.transports.lock().len(), 1);
    }

    #[test]
    fn unused_transports_are_released() {
        let manager = manager(10, 10);
        let direct = manager.transport(None);

        let rotated = (0..100)
            .map(|i| manager.transport(Some(&bearer_route(&i.to_string()))))
            .collect::<Vec<_>>();
        assert_eq!(manager.transports.lock().len(), 101);

        drop(rotated);
        let again = manager.transport(None);
        assert!(Arc::ptr_eq(&direct, &again));
        assert_eq!(manager.transports.lock().len(), 1);
    }

    #[tokio::test]
    async fn unused_route_limits_are_released() {
        let manager = manager(10, 1);

        let lease = manager
            .lease(&"http://a.com/foo".parse().unwrap())
            .await
            .unwrap();
        for i in 0..10 {
            let uri = format!("http://host-{}.com/", i).parse().unwrap();
            drop(manager.lease(&uri).await.unwrap());
        }

        let _other = manager
            .lease(&"http://b.com/foo".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(manager.routes.lock().len(), 2);

        // the held lease still counts against its route
        time::pause();
        let error = manager
            .lease(&"http://a.com/bar".parse().unwrap())
            .await
            .err()
            .unwrap();
        assert!(find_cause::<LeaseTimeoutError>(&error).is_some());
        drop(lease);
    }
}
