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
//! Descriptions of outbound call targets.
use crate::config::{AuthenticationType, EndpointConfig, ProxyConfig, Reachability};
use crate::errors::ConfigurationError;
use crate::tls::{self, KeyStore};
use conjure_error::Error;
use http::header::{HeaderName, HeaderValue};
use http::Uri;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use url::Url;

/// Produces headers for requests sent to an endpoint.
///
/// Providers are invoked with the final request URI after it has been merged with the endpoint's base URI.
pub trait HeaderProvider: Sync + Send {
    /// Returns the headers to append to a request to `uri`.
    fn headers(&self, uri: &Uri) -> Vec<(HeaderName, HeaderValue)>;

    /// Returns on whose behalf the provided headers authenticate the request, if known.
    fn on_behalf_of(&self) -> Option<OnBehalfOf> {
        None
    }
}

impl<F> HeaderProvider for F
where
    F: Fn(&Uri) -> Vec<(HeaderName, HeaderValue)> + Sync + Send,
{
    fn headers(&self, uri: &Uri) -> Vec<(HeaderName, HeaderValue)> {
        self(uri)
    }
}

/// The identity on whose behalf a header provider authenticates requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OnBehalfOf {
    /// A technical user of the provider account, shared by all tenants.
    TechnicalUserProvider,
    /// A technical user of the current tenant.
    TechnicalUserCurrentTenant,
    /// The named user of the current tenant.
    NamedUserCurrentTenant,
}

impl OnBehalfOf {
    /// Returns `true` if the identity belongs to the current tenant.
    pub fn is_current_tenant(self) -> bool {
        matches!(
            self,
            OnBehalfOf::TechnicalUserCurrentTenant | OnBehalfOf::NamedUserCurrentTenant
        )
    }
}

/// A [`HeaderProvider`] wrapping a function along with the identity its headers act for.
pub struct IndicatedHeaderProvider<F> {
    on_behalf_of: OnBehalfOf,
    f: F,
}

impl<F> IndicatedHeaderProvider<F>
where
    F: Fn(&Uri) -> Vec<(HeaderName, HeaderValue)> + Sync + Send,
{
    /// Creates a new provider.
    pub fn new(on_behalf_of: OnBehalfOf, f: F) -> IndicatedHeaderProvider<F> {
        IndicatedHeaderProvider { on_behalf_of, f }
    }
}

impl<F> HeaderProvider for IndicatedHeaderProvider<F>
where
    F: Fn(&Uri) -> Vec<(HeaderName, HeaderValue)> + Sync + Send,
{
    fn headers(&self, uri: &Uri) -> Vec<(HeaderName, HeaderValue)> {
        (self.f)(uri)
    }

    fn on_behalf_of(&self) -> Option<OnBehalfOf> {
        Some(self.on_behalf_of)
    }
}

#[derive(PartialEq, Eq, Hash)]
struct Identity {
    name: Option<String>,
    uri: Url,
    reachability: Reachability,
    proxy: Option<ProxyConfig>,
    tls_version: Option<String>,
    trust_all_certificates: bool,
    authentication: AuthenticationType,
    key_store: Option<KeyStore>,
    trust_store: Vec<Vec<u8>>,
    // sorted, so declaration order does not affect equality
    query_parameters: Vec<(String, String)>,
}

struct Inner {
    identity: Identity,
    query_parameters: Vec<(String, String)>,
    header_providers: Vec<Arc<dyn HeaderProvider>>,
}

/// An immutable description of an outbound call target.
///
/// Descriptors are cheap to clone. Equality and hashing are structural over everything but the header providers, so
/// two descriptors for the same target with freshly created providers are equal. Use [`Self::ptr_eq`] to check if
/// two descriptors are the same instance.
#[derive(Clone)]
pub struct EndpointDescriptor(Arc<Inner>);

impl EndpointDescriptor {
    /// Returns a builder for a descriptor targeting `uri`.
    pub fn builder(uri: Url) -> EndpointBuilder {
        EndpointBuilder {
            identity: Identity {
                name: None,
                uri,
                reachability: Reachability::Internet,
                proxy: None,
                tls_version: None,
                trust_all_certificates: false,
                authentication: AuthenticationType::None,
                key_store: None,
                trust_store: vec![],
                query_parameters: vec![],
            },
            query_parameters: vec![],
            header_providers: vec![],
        }
    }

    /// Creates a descriptor from configuration, loading any key material it references.
    pub fn from_config(name: &str, config: &EndpointConfig) -> Result<EndpointDescriptor, Error> {
        let mut builder = EndpointDescriptor::builder(config.uri().clone())
            .name(name)
            .reachability(config.reachability())
            .trust_all_certificates(config.trust_all_certificates())
            .authentication(config.authentication());

        if let Some(proxy) = config.proxy() {
            builder = builder.proxy(proxy.clone());
        }
        if let Some(tls_version) = config.tls_version() {
            builder = builder.tls_version(tls_version);
        }
        let mut query_parameters = config.query_parameters().iter().collect::<Vec<_>>();
        query_parameters.sort();
        for (key, value) in query_parameters {
            builder = builder.query_parameter(key, value);
        }

        if let Some(security) = config.security() {
            if let Some(ca_file) = security.ca_file() {
                builder = builder.trust_store(tls::load_certs_file(ca_file)?);
            }

            match (security.cert_file(), security.key_file()) {
                (Some(cert_file), Some(key_file)) => {
                    builder = builder.key_store(KeyStore::from_files(cert_file, key_file)?);
                }
                (None, None) => {}
                _ => {
                    return Err(Error::internal_safe(ConfigurationError::new(
                        "neither or both of key-file and cert-file must be set",
                    ))
                    .with_safe_param("endpoint", name));
                }
            }
        }

        Ok(builder.build())
    }

    /// Returns `true` if both descriptors are the same instance.
    #[inline]
    pub fn ptr_eq(&self, other: &EndpointDescriptor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns the human-readable name of the endpoint.
    pub fn name(&self) -> Option<&str> {
        self.0.identity.name.as_deref()
    }

    /// Returns the base URI of the endpoint.
    pub fn uri(&self) -> &Url {
        &self.0.identity.uri
    }

    /// Returns how the endpoint is reached.
    pub fn reachability(&self) -> Reachability {
        self.0.identity.reachability
    }

    /// Returns the proxy used to reach the endpoint.
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.0.identity.proxy.as_ref()
    }

    /// Returns the TLS version the endpoint is pinned to.
    pub fn tls_version(&self) -> Option<&str> {
        self.0.identity.tls_version.as_deref()
    }

    /// Returns `true` if the endpoint's server certificate is accepted without verification.
    pub fn trust_all_certificates(&self) -> bool {
        self.0.identity.trust_all_certificates
    }

    /// Returns the authentication scheme used with the endpoint.
    pub fn authentication(&self) -> AuthenticationType {
        self.0.identity.authentication
    }

    /// Returns the client identity presented to the endpoint.
    pub fn key_store(&self) -> Option<&KeyStore> {
        self.0.identity.key_store.as_ref()
    }

    /// Returns the DER-encoded certificates trusted in addition to the bundled roots.
    pub fn trust_store(&self) -> &[Vec<u8>] {
        &self.0.identity.trust_store
    }

    /// Returns the query parameters appended to every request, in the order they were added.
    pub fn query_parameters(&self) -> &[(String, String)] {
        &self.0.query_parameters
    }

    /// Returns the endpoint's header providers in registration order.
    pub fn header_providers(&self) -> &[Arc<dyn HeaderProvider>] {
        &self.0.header_providers
    }

    /// Returns `true` if the endpoint is reached over TLS.
    pub fn is_tls(&self) -> bool {
        self.uri().scheme() == "https"
    }
}

impl PartialEq for EndpointDescriptor {
    fn eq(&self, other: &EndpointDescriptor) -> bool {
        self.ptr_eq(other) || self.0.identity == other.0.identity
    }
}

impl Eq for EndpointDescriptor {}

impl Hash for EndpointDescriptor {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.0.identity.hash(state)
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = &self.0.identity;
        fmt.debug_struct("EndpointDescriptor")
            .field("name", &identity.name)
            .field("uri", &identity.uri.as_str())
            .field("reachability", &identity.reachability)
            .field("proxy", &identity.proxy.as_ref().map(|p| p.uri().as_str()))
            .field("tls_version", &identity.tls_version)
            .field("trust_all_certificates", &identity.trust_all_certificates)
            .field("authentication", &identity.authentication)
            .field("key_store", &identity.key_store)
            .field("header_providers", &self.0.header_providers.len())
            .finish()
    }
}

/// A builder for [`EndpointDescriptor`]s.
pub struct EndpointBuilder {
    identity: Identity,
    query_parameters: Vec<(String, String)>,
    header_providers: Vec<Arc<dyn HeaderProvider>>,
}

impl EndpointBuilder {
    /// Sets the human-readable name of the endpoint.
    #[inline]
    pub fn name(mut self, name: &str) -> Self {
        self.identity.name = Some(name.to_string());
        self
    }

    /// Sets how the endpoint is reached.
    ///
    /// Defaults to [`Reachability::Internet`].
    #[inline]
    pub fn reachability(mut self, reachability: Reachability) -> Self {
        self.identity.reachability = reachability;
        self
    }

    /// Sets the proxy used to reach the endpoint.
    #[inline]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.identity.proxy = Some(proxy);
        self
    }

    /// Pins the TLS protocol version, e.g. `TLSv1.2`.
    #[inline]
    pub fn tls_version(mut self, tls_version: &str) -> Self {
        self.identity.tls_version = Some(tls_version.to_string());
        self
    }

    /// Accepts the endpoint's server certificate without verification.
    ///
    /// Defaults to `false`.
    #[inline]
    pub fn trust_all_certificates(mut self, trust_all_certificates: bool) -> Self {
        self.identity.trust_all_certificates = trust_all_certificates;
        self
    }

    /// Sets the authentication scheme.
    ///
    /// Defaults to [`AuthenticationType::None`].
    #[inline]
    pub fn authentication(mut self, authentication: AuthenticationType) -> Self {
        self.identity.authentication = authentication;
        self
    }

    /// Sets the client identity presented to the endpoint.
    #[inline]
    pub fn key_store(mut self, key_store: KeyStore) -> Self {
        self.identity.key_store = Some(key_store);
        self
    }

    /// Sets DER-encoded certificates trusted in addition to the bundled roots.
    #[inline]
    pub fn trust_store(mut self, certificates: Vec<Vec<u8>>) -> Self {
        self.identity.trust_store = certificates;
        self
    }

    /// Adds a query parameter appended to every request.
    #[inline]
    pub fn query_parameter(mut self, key: &str, value: &str) -> Self {
        self.query_parameters
            .push((key.to_string(), value.to_string()));
        self
    }

    /// Adds a header provider.
    #[inline]
    pub fn header_provider<P>(mut self, provider: P) -> Self
    where
        P: HeaderProvider + 'static,
    {
        self.header_providers.push(Arc::new(provider));
        self
    }

    /// Creates the descriptor.
    pub fn build(mut self) -> EndpointDescriptor {
        let mut sorted = self.query_parameters.clone();
        sorted.sort();
        self.identity.query_parameters = sorted;

        EndpointDescriptor(Arc::new(Inner {
            identity: self.identity,
            query_parameters: self.query_parameters,
            header_providers: self.header_providers,
        }))
    }
}
