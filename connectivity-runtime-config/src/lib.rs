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
//! Deserializable configuration types for `connectivity_runtime` clients.
#![warn(missing_docs, clippy::all)]
// reserve the right to add non-eq config in the future
#![allow(clippy::derive_partial_eq_without_eq)]

use serde::de::Deserializer;
use serde::Deserialize;
use staged_builder::staged_builder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;


/// Configuration for the client cache, its connection pools, and a collection of named endpoints.
///
/// This type can be constructed programmatically via the `ConnectivityConfigBuilder` API or deserialized from e.g. a
/// configuration file. Every setting is optional; the runtime applies its defaults to unset values.
///
/// # Examples
///
/// ```yaml
/// connect-timeout: 30 seconds
/// max-connections-total: 50
/// tls-upgrade: disabled
/// pool-cache: by-tenant
/// client-cache-ttl: 30 minutes
/// endpoints:
///   inventory:
///     uri: https://inventory.my-network.com/api
///     authentication: oauth2-user-token-exchange
///   erp:
///     uri: http://erp.internal:44300/sap/opu
///     reachability: on-premise
///     proxy:
///       uri: http://connectivity-proxy:20003
///       credentials:
///         type: bearer
///         token: eyJhbGciOi...
/// ```
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[staged_builder]
#[builder(update)]
pub struct ConnectivityConfig {
    #[builder(map(key(type = String, into), value(type = EndpointConfig)))]
    endpoints: HashMap<String, EndpointConfig>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    connect_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    socket_timeout: Option<Duration>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    connection_lease_timeout: Option<Duration>,
    #[builder(default, into)]
    max_connections_total: Option<usize>,
    #[builder(default, into)]
    max_connections_per_route: Option<usize>,
    #[builder(default)]
    tls_upgrade: TlsUpgrade,
    #[builder(default)]
    pool_cache: PoolCache,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    client_cache_ttl: Option<Duration>,
    #[builder(default, into)]
    platform_identity: Option<PlatformIdentityConfig>,
}

impl ConnectivityConfig {
    /// Returns the configuration of the named endpoint.
    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.get(name)
    }

    /// Returns all configured endpoints.
    pub fn endpoints(&self) -> &HashMap<String, EndpointConfig> {
        &self.endpoints
    }

    /// Returns the TCP connect timeout.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Returns the timeout applied to individual socket reads and writes.
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    /// Returns the maximum time a request waits for a connection from the pool.
    pub fn connection_lease_timeout(&self) -> Option<Duration> {
        self.connection_lease_timeout
    }

    /// Returns the maximum number of connections held by a single pool.
    pub fn max_connections_total(&self) -> Option<usize> {
        self.max_connections_total
    }

    /// Returns the maximum number of connections a single pool holds to one target.
    pub fn max_connections_per_route(&self) -> Option<usize> {
        self.max_connections_per_route
    }

    /// Returns the protocol upgrade behavior.
    pub fn tls_upgrade(&self) -> TlsUpgrade {
        self.tls_upgrade
    }

    /// Returns the connection pool caching strategy.
    pub fn pool_cache(&self) -> PoolCache {
        self.pool_cache
    }

    /// Returns the sliding expiry of cached clients.
    pub fn client_cache_ttl(&self) -> Option<Duration> {
        self.client_cache_ttl
    }

    /// Returns the platform identity configuration.
    pub fn platform_identity(&self) -> Option<&PlatformIdentityConfig> {
        self.platform_identity.as_ref()
    }
}

/// Whether clients signal a plaintext-to-TLS protocol upgrade on their requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsUpgrade {
    /// Always request the upgrade.
    Enabled,
    /// Never request the upgrade.
    Disabled,
    /// Request the upgrade unless the endpoint pins a TLS version or is reached through an on-premise proxy.
    #[default]
    Automatic,
}

/// The strategy used to share connection pool managers between clients.
///
/// A custom key extractor can only be configured programmatically.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum PoolCache {
    /// Every client receives its own pool manager.
    #[default]
    NoCache,
    /// All clients share one pool manager.
    Global,
    /// Clients share a pool manager per tenant.
    ByTenant,
    /// Clients share a pool manager per endpoint name.
    ByEndpointName,
    /// Clients share a pool manager per endpoint, additionally split by tenant when the endpoint's header providers
    /// act on behalf of the current tenant.
    ByIndicatedOnBehalfOf,
}

/// Configuration of the identity supplied by the hosting platform.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[staged_builder]
#[builder(update)]
pub struct PlatformIdentityConfig {
    #[builder(default, into)]
    certificate_env: Option<String>,
    #[builder(default, into)]
    key_env: Option<String>,
    #[builder(default, into)]
    #[serde(deserialize_with = "de_opt_duration")]
    default_context_ttl: Option<Duration>,
}

impl PlatformIdentityConfig {
    /// The environment variable naming the PEM-encoded certificate chain file.
    pub fn certificate_env(&self) -> Option<&str> {
        self.certificate_env.as_deref()
    }

    /// The environment variable naming the PEM-encoded private key file.
    pub fn key_env(&self) -> Option<&str> {
        self.key_env.as_deref()
    }

    /// How long a fallback to the default TLS context is reused before the environment is consulted again.
    pub fn default_context_ttl(&self) -> Option<Duration> {
        self.default_context_ttl
    }
}

/// The configuration of an individual endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[staged_builder]
#[builder(update)]
pub struct EndpointConfig {
    uri: Url,
    #[builder(default)]
    #[serde(default)]
    reachability: Reachability,
    #[builder(default, into)]
    #[serde(default)]
    proxy: Option<ProxyConfig>,
    #[builder(default, into)]
    #[serde(default)]
    tls_version: Option<String>,
    #[builder(default)]
    #[serde(default)]
    trust_all_certificates: bool,
    #[builder(default)]
    #[serde(default)]
    authentication: AuthenticationType,
    #[builder(default, into)]
    #[serde(default)]
    security: Option<SecurityConfig>,
    #[builder(map(key(type = String, into), value(type = String, into)))]
    #[serde(default)]
    query_parameters: HashMap<String, String>,
}

impl EndpointConfig {
    /// The base URI of the endpoint.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// How the endpoint is reached.
    pub fn reachability(&self) -> Reachability {
        self.reachability
    }

    /// The proxy used to reach the endpoint.
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// The TLS protocol version the endpoint is pinned to, e.g. `TLSv1.2`.
    pub fn tls_version(&self) -> Option<&str> {
        self.tls_version.as_deref()
    }

    /// Whether the endpoint's server certificate is accepted without verification.
    pub fn trust_all_certificates(&self) -> bool {
        self.trust_all_certificates
    }

    /// The authentication scheme used with the endpoint.
    pub fn authentication(&self) -> AuthenticationType {
        self.authentication
    }

    /// The key and trust material used with the endpoint.
    pub fn security(&self) -> Option<&SecurityConfig> {
        self.security.as_ref()
    }

    /// Query parameters appended to every request sent to the endpoint.
    pub fn query_parameters(&self) -> &HashMap<String, String> {
        &self.query_parameters
    }
}

/// How an endpoint is reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Reachability {
    /// The endpoint is reached directly or over the internet.
    #[default]
    Internet,
    /// The endpoint is only reachable through a proxy tunnel into an on-premise network.
    OnPremise,
}

/// The authentication scheme used with an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum AuthenticationType {
    /// No authentication.
    #[default]
    None,
    /// HTTP basic authentication.
    BasicAuthentication,
    /// Mutual TLS with the endpoint's key store.
    ClientCertificate,
    /// Mutual TLS with the identity supplied by the hosting platform.
    PlatformCertificate,
    /// An OAuth2 client credentials token.
    Oauth2ClientCredentials,
    /// An OAuth2 token exchanged for the current user's token.
    Oauth2UserTokenExchange,
    /// An OAuth2 JWT bearer grant.
    Oauth2JwtBearer,
    /// The current user's identity forwarded through the proxy.
    PrincipalPropagation,
}

impl AuthenticationType {
    /// Returns `true` if credentials for this scheme are bound to an individual principal, so clients must not be
    /// shared between principals of a tenant.
    pub fn requires_principal_isolation(self) -> bool {
        matches!(
            self,
            AuthenticationType::Oauth2UserTokenExchange | AuthenticationType::PrincipalPropagation
        )
    }
}

/// Key and trust material used to communicate with an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[staged_builder]
#[builder(update)]
pub struct SecurityConfig {
    #[builder(default, into)]
    ca_file: Option<PathBuf>,
    #[builder(default, into)]
    key_file: Option<PathBuf>,
    #[builder(default, into)]
    cert_file: Option<PathBuf>,
}

impl SecurityConfig {
    /// The path to a file containing PEM-formatted root certificates trusted to identify the endpoint.
    ///
    /// These certificates are used in addition to the bundled root CA list.
    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    /// The path to a file containing a PEM-formatted private key used for client certificate authentication.
    ///
    /// This key is expected to match the leaf certificate in [`Self::cert_file`].
    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    /// The path to a file containing PEM-formatted certificates used for client certificate authentication.
    ///
    /// The file should start with the leaf certificate corresponding to the key in [`Self::key_file`], and the contain
    /// the remainder of the certificate chain to a trusted root.
    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }
}

/// Proxy configuration used to reach an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[staged_builder]
#[builder(update)]
pub struct ProxyConfig {
    uri: Url,
    #[builder(default, into)]
    #[serde(default)]
    credentials: Option<ProxyCredentials>,
}

impl ProxyConfig {
    /// The URI of the proxy server.
    ///
    /// Only its host and port are used.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// The credentials used to authenticate with the proxy.
    pub fn credentials(&self) -> Option<&ProxyCredentials> {
        self.credentials.as_ref()
    }
}

/// Credentials used to authenticate with a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
#[non_exhaustive]
pub enum ProxyCredentials {
    /// HTTP basic credentials.
    Basic(BasicCredentials),
    /// A bearer token.
    Bearer(BearerCredentials),
}

/// Credentials used to authenticate with an HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct BasicCredentials {
    username: String,
    password: String,
}

impl BasicCredentials {
    /// Creates a new `BasicCredentials`.
    pub fn new(username: &str, password: &str) -> BasicCredentials {
        BasicCredentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

/// A bearer token used to authenticate with a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct BearerCredentials {
    token: String,
}

impl BearerCredentials {
    /// Creates a new `BearerCredentials`.
    pub fn new(token: &str) -> BearerCredentials {
        BearerCredentials {
            token: token.to_string(),
        }
    }

    /// Returns the token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

fn de_opt_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    humantime_serde::Serde::deserialize(d).map(humantime_serde::Serde::into_inner)
}
