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
//! Tenant-aware outbound HTTP clients for configured endpoints.
//!
//! A [`ClientCache`] hands out ready-to-use clients, either bare or bound to an [`EndpointDescriptor`]. Clients are
//! cached per [`IsolationScope`]: endpoints whose authentication acts as the calling user get a client per tenant
//! and principal, all others a client per tenant. Cached clients expire after an hour without use, and can be
//! evicted early through [`CacheInvalidation`] when credentials rotate.
//!
//! Clients are built by a [`ClientFactory`]. It obtains connection pools from a [`PoolManagerRegistry`], which
//! shares them between clients according to a [`PoolCacheStrategy`], routes endpoints through their proxies, and
//! decides whether plaintext requests signal a protocol upgrade.
//!
//! # Configuration
//!
//! Everything can be configured through the deserializable [`ConnectivityConfig`](config::ConnectivityConfig):
//!
//! ```yaml
//! socket-timeout: 30s
//! pool-cache: by-tenant
//! endpoints:
//!   inventory:
//!     uri: https://inventory.my-network.com/api
//!     authentication: oauth2-user-token-exchange
//!   erp:
//!     uri: http://erp.internal:44300/sap/opu
//!     reachability: on-premise
//!     proxy:
//!       uri: http://connectivity-proxy:20003
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use connectivity_runtime::config::ConnectivityConfig;
//! use connectivity_runtime::{ClientCache, EndpointDescriptor, IsolationScope};
//! use conjure_error::Error;
//! use hyper::{Body, Request};
//!
//! # async fn run(config: ConnectivityConfig) -> Result<(), Error> {
//! let cache = ClientCache::from_config(&config);
//!
//! let endpoint = EndpointDescriptor::from_config(
//!     "inventory",
//!     config.endpoint("inventory").expect("inventory endpoint"),
//! )?;
//! let client = cache.get(&IsolationScope::principal("tenant-a", "alice"), Some(&endpoint))?;
//!
//! let request = Request::get("/items?limit=10").body(Body::empty()).unwrap();
//! let response = client.execute(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs, clippy::all)]

pub use crate::adapter::*;
pub use crate::cache::*;
pub use crate::client::*;
pub use crate::clock::{Clock, SystemClock};
pub use crate::connect::ProxyRoute;
pub use crate::endpoint::*;
pub use crate::factory::*;
pub use crate::isolation::*;
pub use crate::pool::{PoolCacheStrategy, PoolManagerRegistry, PoolSettings};

mod adapter;
mod cache;
mod client;
mod clock;
mod connect;
mod endpoint;
pub mod errors;
mod factory;
mod isolation;
pub mod pool;
pub mod tls;
mod ttl_cache;

/// Client configuration.
///
/// This is just a reexport of the `connectivity_runtime_config` crate for convenience.
pub mod config {
    #[doc(inline)]
    pub use connectivity_runtime_config::*;
}
