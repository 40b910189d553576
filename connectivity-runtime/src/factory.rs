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
use crate::adapter::EndpointClient;
use crate::client::{Client, HttpClient};
use crate::config::{ConnectivityConfig, Reachability, TlsUpgrade};
use crate::connect::ProxyRoute;
use crate::endpoint::EndpointDescriptor;
use crate::errors::ConfigurationError;
use crate::isolation::IsolationScope;
use crate::pool::{PoolCacheStrategy, PoolManagerRegistry, PoolSettings};
use crate::tls::{PlatformIdentity, TlsContextProvider};
use conjure_error::Error;
use std::sync::Arc;
use witchcraft_log::{debug, error};

/// A type which builds clients for the [`ClientCache`](crate::ClientCache).
pub trait BuildClient: Sync + Send {
    /// Builds a client for calls made in `scope` to `endpoint`, or a bare client if no endpoint is given.
    fn build(
        &self,
        scope: &IsolationScope,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<Client, Error>;
}

/// A factory of HTTP clients.
#[derive(Clone)]
pub struct ClientFactory {
    settings: PoolSettings,
    tls_upgrade: TlsUpgrade,
    registry: Arc<PoolManagerRegistry>,
}

impl Default for ClientFactory {
    fn default() -> Self {
        ClientFactory::new(Arc::new(PoolManagerRegistry::new(
            PoolCacheStrategy::NoCache,
            Arc::new(TlsContextProvider::default()),
        )))
    }
}

impl ClientFactory {
    /// Creates a factory obtaining pool managers from the provided registry.
    pub fn new(registry: Arc<PoolManagerRegistry>) -> ClientFactory {
        ClientFactory {
            settings: PoolSettings::new(),
            tls_upgrade: TlsUpgrade::Automatic,
            registry,
        }
    }

    /// Creates a factory, along with its pool manager registry, from configuration.
    pub fn from_config(config: &ConnectivityConfig) -> ClientFactory {
        let platform = match config.platform_identity() {
            Some(platform) => PlatformIdentity::from_config(platform),
            None => PlatformIdentity::new(),
        };
        let registry = PoolManagerRegistry::new(
            PoolCacheStrategy::from_config(config.pool_cache()),
            Arc::new(TlsContextProvider::new(platform)),
        );

        let mut factory = ClientFactory::new(Arc::new(registry));
        factory
            .settings(PoolSettings::from_config(config))
            .tls_upgrade(config.tls_upgrade());
        factory
    }

    /// Sets the settings of pool managers created for clients.
    ///
    /// Defaults to `PoolSettings::new()`.
    pub fn settings(&mut self, settings: PoolSettings) -> &mut Self {
        self.settings = settings;
        self
    }

    /// Returns the configured pool settings.
    pub fn get_settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Sets clients' protocol upgrade behavior.
    ///
    /// Defaults to `TlsUpgrade::Automatic`.
    pub fn tls_upgrade(&mut self, tls_upgrade: TlsUpgrade) -> &mut Self {
        self.tls_upgrade = tls_upgrade;
        self
    }

    /// Returns the configured protocol upgrade behavior.
    pub fn get_tls_upgrade(&self) -> TlsUpgrade {
        self.tls_upgrade
    }

    /// Returns the registry pool managers are obtained from.
    pub fn registry(&self) -> &Arc<PoolManagerRegistry> {
        &self.registry
    }

    /// Creates a client for calls made in `scope` to `endpoint`.
    ///
    /// Without an endpoint a bare client is returned.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if an on-premise endpoint lacks a usable proxy, and a
    /// `PoolManagerConstructionError` if a pool manager cannot be built.
    pub fn create(
        &self,
        scope: &IsolationScope,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<Client, Error> {
        let proxy = match endpoint {
            Some(endpoint) => proxy_route(endpoint)?,
            None => None,
        };
        let protocol_upgrade = protocol_upgrade(self.tls_upgrade, endpoint);

        let pool = self.registry.get(&self.settings, scope, endpoint)?;

        debug!(
            "creating client",
            safe: {
                endpoint: endpoint.and_then(|e| e.name()),
                proxied: proxy.is_some(),
                protocolUpgrade: protocol_upgrade
            },
        );
        let client = HttpClient::new(pool, proxy, protocol_upgrade);

        match endpoint {
            Some(endpoint) => Ok(Client::Endpoint(EndpointClient::new(
                client,
                endpoint.clone(),
            ))),
            None => Ok(Client::Bare(client)),
        }
    }
}

impl BuildClient for ClientFactory {
    fn build(
        &self,
        scope: &IsolationScope,
        endpoint: Option<&EndpointDescriptor>,
    ) -> Result<Client, Error> {
        self.create(scope, endpoint)
    }
}

fn proxy_route(endpoint: &EndpointDescriptor) -> Result<Option<ProxyRoute>, Error> {
    let on_premise = endpoint.reachability() == Reachability::OnPremise;

    let config = match endpoint.proxy() {
        Some(config) => config,
        None if on_premise => {
            return Err(Error::internal_safe(ConfigurationError::new(
                "on-premise endpoint has no proxy configuration",
            ))
            .with_safe_param("endpoint", endpoint.name()));
        }
        None => return Ok(None),
    };

    match ProxyRoute::from_config(config) {
        Ok(route) => Ok(Some(route)),
        Err(e) if on_premise => Err(e.with_safe_param("endpoint", endpoint.name())),
        Err(e) => {
            error!(
                "ignoring unusable proxy configuration",
                safe: { endpoint: endpoint.name() },
                error: e,
            );
            Ok(None)
        }
    }
}

/// Determines if clients signal a plaintext-to-TLS upgrade.
///
/// In automatic mode, endpoints reached through an on-premise proxy or pinned to a TLS version never do.
pub(crate) fn protocol_upgrade(mode: TlsUpgrade, endpoint: Option<&EndpointDescriptor>) -> bool {
    match mode {
        TlsUpgrade::Enabled => true,
        TlsUpgrade::Disabled => false,
        TlsUpgrade::Automatic => match endpoint {
            Some(endpoint) => {
                endpoint.tls_version().is_none()
                    && endpoint.reachability() != Reachability::OnPremise
            }
            None => true,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PoolCache, ProxyConfig};
    use crate::errors::{find_cause, ConfigurationError};
    use std::time::Duration;

    fn direct() -> EndpointDescriptor {
        EndpointDescriptor::builder("https://foo.com".parse().unwrap()).build()
    }

    fn on_premise() -> EndpointDescriptor {
        EndpointDescriptor::builder("http://virtual-host:443".parse().unwrap())
            .reachability(Reachability::OnPremise)
            .proxy(
                ProxyConfig::builder()
                    .uri("http://connectivity-proxy:20003".parse().unwrap())
                    .build(),
            )
            .build()
    }

    fn pinned() -> EndpointDescriptor {
        EndpointDescriptor::builder("https://foo.com".parse().unwrap())
            .tls_version("TLSv1.2")
            .build()
    }

    #[test]
    fn upgrade_enabled() {
        for endpoint in [None, Some(direct()), Some(on_premise()), Some(pinned())] {
            assert!(protocol_upgrade(TlsUpgrade::Enabled, endpoint.as_ref()));
        }
    }

    #[test]
    fn upgrade_disabled() {
        for endpoint in [None, Some(direct()), Some(on_premise()), Some(pinned())] {
            assert!(!protocol_upgrade(TlsUpgrade::Disabled, endpoint.as_ref()));
        }
    }

    #[test]
    fn upgrade_automatic() {
        assert!(protocol_upgrade(TlsUpgrade::Automatic, None));
        assert!(protocol_upgrade(TlsUpgrade::Automatic, Some(&direct())));
        assert!(!protocol_upgrade(
            TlsUpgrade::Automatic,
            Some(&on_premise())
        ));
        assert!(!protocol_upgrade(TlsUpgrade::Automatic, Some(&pinned())));
    }

    #[test]
    fn bare_client() {
        let factory = ClientFactory::default();
        let client = factory.create(&IsolationScope::none(), None).unwrap();
        assert!(client.endpoint().is_none());
        assert!(client.http_client().protocol_upgrade());
        assert!(client.http_client().proxy().is_none());
    }

    #[test]
    fn endpoint_client() {
        let mut factory = ClientFactory::default();
        factory.tls_upgrade(TlsUpgrade::Disabled);

        let endpoint = direct();
        let client = factory
            .create(&IsolationScope::tenant("t1"), Some(&endpoint))
            .unwrap();
        assert!(client.endpoint().unwrap().ptr_eq(&endpoint));
        assert!(!client.http_client().protocol_upgrade());
    }

    #[test]
    fn on_premise_proxy() {
        let factory = ClientFactory::default();
        let client = factory
            .create(&IsolationScope::none(), Some(&on_premise()))
            .unwrap();
        let proxy = client.http_client().proxy().unwrap();
        assert_eq!(proxy.uri(), "http://connectivity-proxy:20003/");
        assert!(!client.http_client().protocol_upgrade());
    }

    #[test]
    fn on_premise_without_proxy() {
        let endpoint = EndpointDescriptor::builder("http://virtual-host".parse().unwrap())
            .name("erp")
            .reachability(Reachability::OnPremise)
            .build();

        let error = ClientFactory::default()
            .create(&IsolationScope::none(), Some(&endpoint))
            .err()
            .unwrap();
        assert!(find_cause::<ConfigurationError>(&error).is_some());
    }

    #[test]
    fn on_premise_with_unusable_proxy() {
        let endpoint = EndpointDescriptor::builder("http://virtual-host".parse().unwrap())
            .reachability(Reachability::OnPremise)
            .proxy(
                ProxyConfig::builder()
                    .uri("socks5://proxy".parse().unwrap())
                    .build(),
            )
            .build();

        let error = ClientFactory::default()
            .create(&IsolationScope::none(), Some(&endpoint))
            .err()
            .unwrap();
        assert!(find_cause::<ConfigurationError>(&error).is_some());
    }

    #[test]
    fn internet_with_unusable_proxy() {
        let endpoint = EndpointDescriptor::builder("https://foo.com".parse().unwrap())
            .proxy(
                ProxyConfig::builder()
                    .uri("socks5://proxy".parse().unwrap())
                    .build(),
            )
            .build();

        let client = ClientFactory::default()
            .create(&IsolationScope::none(), Some(&endpoint))
            .unwrap();
        assert!(client.http_client().proxy().is_none());
    }

    #[test]
    fn from_config() {
        let config = ConnectivityConfig::builder()
            .connect_timeout(Duration::from_secs(5))
            .max_connections_total(10usize)
            .tls_upgrade(TlsUpgrade::Disabled)
            .pool_cache(PoolCache::Global)
            .build();

        let factory = ClientFactory::from_config(&config);
        assert_eq!(
            factory.get_settings().get_connect_timeout(),
            Duration::from_secs(5)
        );
        assert_eq!(factory.get_settings().get_max_connections_total(), 10);
        assert_eq!(factory.get_tls_upgrade(), TlsUpgrade::Disabled);

        let a = factory.create(&IsolationScope::tenant("a"), None).unwrap();
        let b = factory.create(&IsolationScope::tenant("b"), None).unwrap();
        assert!(!a.http_client().ptr_eq(b.http_client()));
        assert!(Arc::ptr_eq(
            a.http_client().pool_manager(),
            b.http_client().pool_manager()
        ));
    }
}
