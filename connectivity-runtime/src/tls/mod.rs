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
//! TLS context provisioning.
use crate::config::AuthenticationType;
use crate::endpoint::EndpointDescriptor;
use crate::errors::{ConfigurationError, IdentityLoadError};
use conjure_error::Error;
use rustls::client::{ServerCertVerified, ServerCertVerifier, WantsTransparencyPolicyOrClientCert};
use rustls::{
    Certificate, ClientConfig, ConfigBuilder, OwnedTrustAnchor, RootCertStore, ServerName,
    SupportedProtocolVersion,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use webpki_roots::TLS_SERVER_ROOTS;

pub use key_store::{KeyStore, DEFAULT_ALIAS, DEFAULT_PASSWORD};
pub use platform::PlatformIdentity;

mod key_store;
mod platform;

/// A TLS client configuration.
///
/// Contexts are cheap to clone and compare by identity.
#[derive(Clone)]
pub struct TlsContext(Arc<ClientConfig>);

impl TlsContext {
    /// Returns a context trusting the bundled web PKI roots and presenting no client certificate.
    pub fn default_context() -> TlsContext {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store(&[]))
            .with_no_client_auth();
        TlsContext(Arc::new(config))
    }

    pub(crate) fn with_client_identity(key_store: &KeyStore) -> Result<TlsContext, Error> {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store(&[]));
        let config = client_auth(config, Some(key_store))?;
        Ok(TlsContext(Arc::new(config)))
    }

    /// Returns `true` if both contexts are the same instance.
    #[inline]
    pub fn ptr_eq(&self, other: &TlsContext) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns `true` if the context presents a client certificate.
    pub fn has_client_identity(&self) -> bool {
        self.0.client_auth_cert_resolver.has_certs()
    }

    pub(crate) fn client_config(&self) -> ClientConfig {
        (*self.0).clone()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TlsContext")
            .field("client_identity", &self.has_client_identity())
            .finish()
    }
}

/// Builds TLS contexts from PEM material, endpoint descriptors, and the platform identity.
pub struct TlsContextProvider {
    default: TlsContext,
    platform: PlatformIdentity,
}

impl Default for TlsContextProvider {
    fn default() -> Self {
        TlsContextProvider::new(PlatformIdentity::new())
    }
}

impl TlsContextProvider {
    /// Creates a new provider using the given platform identity.
    pub fn new(platform: PlatformIdentity) -> TlsContextProvider {
        TlsContextProvider {
            default: TlsContext::default_context(),
            platform,
        }
    }

    /// Returns the platform identity.
    pub fn platform_identity(&self) -> &PlatformIdentity {
        &self.platform
    }

    /// Returns the context used when no client identity is needed.
    pub fn default_context(&self) -> &TlsContext {
        &self.default
    }

    /// Builds a context presenting the PEM-encoded certificate chain and private key as client identity.
    pub fn build_context(
        &self,
        certificate_pem: &[u8],
        private_key_pem: &[u8],
    ) -> Result<TlsContext, Error> {
        let key_store = KeyStore::from_pem(certificate_pem, private_key_pem)?;
        TlsContext::with_client_identity(&key_store)
    }

    /// Returns a context presenting the platform identity, or the default context if the platform supplies none.
    ///
    /// The context is reused as long as the platform's certificate file is unchanged.
    pub fn platform_context(&self) -> Result<TlsContext, Error> {
        self.platform.load(&self.default).map(|i| i.context)
    }

    /// Builds the context used to communicate with an endpoint.
    pub fn context_for(&self, endpoint: &EndpointDescriptor) -> Result<TlsContext, Error> {
        let versions = protocol_versions(endpoint.tls_version())?;
        let config = ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(versions)
            .map_err(|e| {
                Error::internal_safe(ConfigurationError::with_source("invalid TLS version", e))
            })?
            .with_root_certificates(root_store(endpoint.trust_store()));

        let mut config = match endpoint.authentication() {
            AuthenticationType::ClientCertificate => {
                let key_store = endpoint.key_store().ok_or_else(|| {
                    Error::internal_safe(ConfigurationError::new(
                        "client certificate authentication requires a key store",
                    ))
                })?;
                client_auth(config, Some(key_store))?
            }
            AuthenticationType::PlatformCertificate => {
                let identity = self.platform.load(&self.default)?;
                client_auth(config, identity.key_store.as_ref())?
            }
            _ => client_auth(config, endpoint.key_store())?,
        };

        if endpoint.trust_all_certificates() {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(TrustAllVerifier));
        }

        Ok(TlsContext(Arc::new(config)))
    }
}

fn root_store(extra: &[Vec<u8>]) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    roots.add_parsable_certificates(extra);
    roots
}

fn client_auth(
    config: ConfigBuilder<ClientConfig, WantsTransparencyPolicyOrClientCert>,
    key_store: Option<&KeyStore>,
) -> Result<ClientConfig, Error> {
    match key_store {
        Some(key_store) => config
            .with_client_auth_cert(key_store.rustls_chain(), key_store.rustls_key())
            .map_err(|e| {
                Error::internal_safe(IdentityLoadError::with_source(
                    "unable to build key store",
                    e,
                ))
            }),
        None => Ok(config.with_no_client_auth()),
    }
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(
    tls_version: Option<&str>,
) -> Result<&'static [&'static SupportedProtocolVersion], Error> {
    match tls_version {
        None => Ok(rustls::DEFAULT_VERSIONS),
        Some("TLSv1.2") => Ok(TLS12_ONLY),
        Some("TLSv1.3") => Ok(TLS13_ONLY),
        Some(other) => Err(
            Error::internal_safe(ConfigurationError::new("unsupported TLS version"))
                .with_safe_param("tlsVersion", other),
        ),
    }
}

pub(crate) fn load_certs_file(path: &Path) -> Result<Vec<Vec<u8>>, Error> {
    let pem = key_store::read(path)?;
    key_store::parse_certs(&pem)
}

struct TrustAllVerifier;

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _: &Certificate,
        _: &[Certificate],
        _: &ServerName,
        _: &mut dyn Iterator<Item = &[u8]>,
        _: &[u8],
        _: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
