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
use futures::ready;
use hyper::client::connect::{Connected, Connection};
use pin_project::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_io_timeout::TimeoutStream;
use tower_layer::Layer;
use tower_service::Service;

/// A connector layer which applies the socket timeout to reads and writes of every connection.
pub struct TimeoutLayer {
    socket_timeout: Duration,
}

impl TimeoutLayer {
    pub fn new(socket_timeout: Duration) -> TimeoutLayer {
        TimeoutLayer { socket_timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutConnector<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutConnector {
            inner,
            socket_timeout: self.socket_timeout,
        }
    }
}

#[derive(Clone)]
pub struct TimeoutConnector<S> {
    inner: S,
    socket_timeout: Duration,
}

impl<S, R> Service<R> for TimeoutConnector<S>
where
    S: Service<R>,
    S::Response: AsyncRead + AsyncWrite,
{
    type Response = TimeoutConnection<S::Response>;
    type Error = S::Error;
    type Future = TimeoutFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        TimeoutFuture {
            future: self.inner.call(req),
            socket_timeout: self.socket_timeout,
        }
    }
}

#[pin_project]
pub struct TimeoutFuture<F> {
    #[pin]
    future: F,
    socket_timeout: Duration,
}

impl<F, S, E> Future for TimeoutFuture<F>
where
    F: Future<Output = Result<S, E>>,
    S: AsyncRead + AsyncWrite,
{
    type Output = Result<TimeoutConnection<S>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let stream = ready!(this.future.poll(cx))?;
        let mut stream = TimeoutStream::new(stream);
        stream.set_read_timeout(Some(*this.socket_timeout));
        stream.set_write_timeout(Some(*this.socket_timeout));

        Poll::Ready(Ok(TimeoutConnection {
            stream: Box::pin(stream),
        }))
    }
}

#[derive(Debug)]
pub struct TimeoutConnection<S> {
    stream: Pin<Box<TimeoutStream<S>>>,
}

impl<S> AsyncRead for TimeoutConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for TimeoutConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.stream.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_shutdown(cx)
    }
}

impl<S> Connection for TimeoutConnection<S>
where
    S: AsyncRead + AsyncWrite + Connection,
{
    fn connected(&self) -> Connected {
        self.stream.get_ref().connected()
    }
}
