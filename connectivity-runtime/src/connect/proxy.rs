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
use crate::config::{ProxyConfig, ProxyCredentials};
use crate::errors::ConfigurationError;
use base64::display::Base64Display;
use base64::engine::general_purpose::STANDARD;
use conjure_error::Error;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::uri::Scheme;
use http::{HeaderValue, Method, Request, StatusCode, Uri, Version};
use hyper::client::conn;
use hyper::client::connect::{Connected, Connection};
use hyper::Body;
use std::error;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower_layer::Layer;
use tower_service::Service;

/// The proxy server requests to an endpoint are routed through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyRoute {
    uri: Uri,
    authorization: Option<HeaderValue>,
}

impl ProxyRoute {
    /// Parses a proxy route from its configuration.
    ///
    /// Only the host and port of the proxy URI are used. A port is required unless the scheme has a well-known default,
    /// since URIs like `http://proxy:80` and `http://proxy` cannot be told apart once parsed.
    pub fn from_config(config: &ProxyConfig) -> Result<ProxyRoute, Error> {
        let host = config.uri().host_str().ok_or_else(|| {
            Error::internal_safe(ConfigurationError::new("proxy URI is missing a host"))
        })?;
        let port = config.uri().port_or_known_default().ok_or_else(|| {
            Error::internal_safe(ConfigurationError::new("proxy URI is missing a port"))
        })?;

        let uri = format!("http://{}:{}", host, port)
            .parse::<Uri>()
            .map_err(|e| {
                Error::internal_safe(ConfigurationError::with_source("invalid proxy URI", e))
            })?;

        let authorization = match config.credentials() {
            Some(ProxyCredentials::Basic(c)) => {
                let auth = format!("{}:{}", c.username(), c.password());
                Some(format!(
                    "Basic {}",
                    Base64Display::new(auth.as_bytes(), &STANDARD)
                ))
            }
            Some(ProxyCredentials::Bearer(c)) => Some(format!("Bearer {}", c.token())),
            Some(_) => {
                return Err(Error::internal_safe(ConfigurationError::new(
                    "unsupported proxy credentials",
                )))
            }
            None => None,
        };
        let authorization = authorization
            .map(|a| {
                let mut value = HeaderValue::try_from(a).map_err(|_| {
                    Error::internal_safe(ConfigurationError::new(
                        "proxy credentials are not a valid header value",
                    ))
                })?;
                value.set_sensitive(true);
                Ok::<_, Error>(value)
            })
            .transpose()?;

        Ok(ProxyRoute { uri, authorization })
    }

    /// Returns the URI of the proxy server.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Returns the `Proxy-Authorization` header value sent to the proxy.
    pub fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }
}

/// A connector layer which handles socket-level setup for HTTP proxies.
///
/// For http requests, we just connect to the proxy server and tell hyper that the connection is proxied so it can
/// send the request in absolute form. For https requests, we create a tunnel through the proxy server to the target
/// via a CONNECT request that is then used upstream for the TLS handshake.
pub struct ProxyConnectorLayer {
    route: Option<ProxyRoute>,
}

impl ProxyConnectorLayer {
    pub fn new(route: Option<&ProxyRoute>) -> ProxyConnectorLayer {
        ProxyConnectorLayer {
            route: route.cloned(),
        }
    }
}

impl<S> Layer<S> for ProxyConnectorLayer {
    type Service = ProxyConnector<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProxyConnector {
            inner,
            route: self.route.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ProxyConnector<S> {
    inner: S,
    route: Option<ProxyRoute>,
}

impl<S> Service<Uri> for ProxyConnector<S>
where
    S: Service<Uri> + Send,
    S::Error: Into<Box<dyn error::Error + Sync + Send>>,
    S::Future: Send + 'static,
    S::Response: AsyncRead + AsyncWrite + Unpin + 'static + Send,
{
    type Response = ProxyConnection<S::Response>;
    type Error = Box<dyn error::Error + Sync + Send>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        let route = match &self.route {
            Some(route) => route.clone(),
            None => {
                let connect = self.inner.call(req);
                return Box::pin(async move {
                    let stream = connect.await.map_err(Into::into)?;
                    Ok(ProxyConnection {
                        stream,
                        proxy: false,
                    })
                });
            }
        };

        let connect = self.inner.call(route.uri.clone());
        Box::pin(async move {
            let stream = connect.await.map_err(Into::into)?;

            if req.scheme() == Some(&Scheme::HTTP) {
                Ok(ProxyConnection {
                    stream,
                    proxy: true,
                })
            } else {
                let stream = connect_https(stream, req, route).await?;
                Ok(ProxyConnection {
                    stream,
                    proxy: false,
                })
            }
        })
    }
}

async fn connect_https<T>(
    stream: T,
    uri: Uri,
    route: ProxyRoute,
) -> Result<T, Box<dyn error::Error + Sync + Send>>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, mut conn) = conn::handshake(stream).await?;

    let host = uri.host().ok_or("host missing from URI")?;
    let authority = format!("{}:{}", host, uri.port_u16().unwrap_or(443));
    let authority_uri = Uri::try_from(authority.clone())?;
    let host = HeaderValue::try_from(authority)?;

    let mut request = Request::new(Body::empty());
    *request.method_mut() = Method::CONNECT;
    *request.uri_mut() = authority_uri;
    *request.version_mut() = Version::HTTP_11;
    request.headers_mut().insert(HOST, host);
    if let Some(authorization) = route.authorization {
        request
            .headers_mut()
            .insert(PROXY_AUTHORIZATION, authorization);
    }

    let mut response = sender.send_request(request);
    let response = future::poll_fn(|cx| {
        let _ = conn.poll_without_shutdown(cx)?;
        response.poll_unpin(cx)
    })
    .await?;

    if !response.status().is_success() {
        return Err(ProxyTunnelError {
            status: response.status(),
        }
        .into());
    }

    Ok(conn.into_parts().io)
}

#[derive(Debug)]
pub struct ProxyConnection<T> {
    stream: T,
    proxy: bool,
}

impl<T> AsyncRead for ProxyConnection<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for ProxyConnection<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.stream.connected().proxy(self.proxy)
    }
}

#[derive(Debug)]
struct ProxyTunnelError {
    status: StatusCode,
}

impl fmt::Display for ProxyTunnelError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "got status {} from HTTPS proxy", self.status)
    }
}

impl error::Error for ProxyTunnelError {}
