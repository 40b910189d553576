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
use crate::connect::ProxyRoute;
use crate::endpoint::EndpointDescriptor;
use crate::errors::ConfigurationError;
use crate::pool::{PoolManager, Transport};
use conjure_error::Error;
use http::header::{HeaderValue, CONNECTION, PROXY_AUTHORIZATION, UPGRADE};
use http::uri::Scheme;
use hyper::{Body, Request, Response};
use std::fmt;
use std::sync::Arc;

struct Inner {
    pool: Arc<PoolManager>,
    proxy: Option<ProxyRoute>,
    protocol_upgrade: bool,
    transport: Arc<Transport>,
}

/// An HTTP client bound to a connection pool manager.
///
/// Clients are cheap to clone; clones share the same transport.
#[derive(Clone)]
pub struct HttpClient(Arc<Inner>);

impl HttpClient {
    pub(crate) fn new(
        pool: Arc<PoolManager>,
        proxy: Option<ProxyRoute>,
        protocol_upgrade: bool,
    ) -> HttpClient {
        let transport = pool.transport(proxy.as_ref());
        HttpClient(Arc::new(Inner {
            pool,
            proxy,
            protocol_upgrade,
            transport,
        }))
    }

    /// Returns the pool manager the client's connections come from.
    pub fn pool_manager(&self) -> &Arc<PoolManager> {
        &self.0.pool
    }

    /// Returns the proxy requests are routed through, if any.
    pub fn proxy(&self) -> Option<&ProxyRoute> {
        self.0.proxy.as_ref()
    }

    /// Returns `true` if plaintext requests signal a protocol upgrade.
    pub fn protocol_upgrade(&self) -> bool {
        self.0.protocol_upgrade
    }

    /// Returns `true` if both clients share the same transport.
    #[inline]
    pub fn ptr_eq(&self, other: &HttpClient) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Sends a request.
    ///
    /// The request URI must be absolute. The returned response holds a [`ConnectionLease`] in its extensions until it
    /// is dropped.
    ///
    /// [`ConnectionLease`]: crate::pool::ConnectionLease
    pub async fn execute(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let request = self.prepare(request)?;
        let lease = self.0.pool.lease(request.uri()).await?;

        let mut response = self
            .0
            .transport
            .request(request)
            .await
            .map_err(Error::internal_safe)?;
        response.extensions_mut().insert(lease);

        Ok(response)
    }

    pub(crate) fn prepare(&self, mut request: Request<Body>) -> Result<Request<Body>, Error> {
        let uri = request.uri();
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(Error::internal_safe(ConfigurationError::new(
                "request URI must be absolute",
            )));
        }

        if uri.scheme() != Some(&Scheme::HTTP) {
            return Ok(request);
        }

        let headers = request.headers_mut();
        if let Some(authorization) = self.0.proxy.as_ref().and_then(|p| p.authorization()) {
            if !headers.contains_key(PROXY_AUTHORIZATION) {
                headers.insert(PROXY_AUTHORIZATION, authorization.clone());
            }
        }

        if self.0.protocol_upgrade && !headers.contains_key(UPGRADE) {
            headers.insert(UPGRADE, HeaderValue::from_static("TLS/1.2"));
            if !headers.contains_key(CONNECTION) {
                headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
            }
        }

        Ok(request)
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("HttpClient")
            .field("pool", &self.0.pool)
            .field("proxy", &self.0.proxy)
            .field("protocol_upgrade", &self.0.protocol_upgrade)
            .finish()
    }
}

/// A client handed out by the [`ClientCache`](crate::ClientCache).
#[derive(Debug, Clone)]
pub enum Client {
    /// A client without an endpoint. Requests must carry absolute URIs.
    Bare(HttpClient),
    /// A client bound to an endpoint. Requests carry URIs relative to the endpoint's base URI.
    Endpoint(EndpointClient),
}

impl Client {
    /// Returns the underlying HTTP client.
    pub fn http_client(&self) -> &HttpClient {
        match self {
            Client::Bare(client) => client,
            Client::Endpoint(client) => client.client(),
        }
    }

    /// Returns the endpoint the client is bound to, if any.
    pub fn endpoint(&self) -> Option<&EndpointDescriptor> {
        match self {
            Client::Bare(_) => None,
            Client::Endpoint(client) => Some(client.endpoint()),
        }
    }

    /// Sends a request.
    pub async fn execute(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        match self {
            Client::Bare(client) => client.execute(request).await,
            Client::Endpoint(client) => client.execute(request).await,
        }
    }
}
