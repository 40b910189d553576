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
//! Error types.
//!
//! Every fallible operation in this crate returns a [`conjure_error::Error`]. Its cause is one of the types in this
//! module, which can be recovered with [`find_cause`].
use std::error::Error;
use std::fmt;
use std::sync::Arc;

type Source = Arc<dyn Error + Sync + Send>;

macro_rules! cause {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            message: String,
            source: Option<Source>,
        }

        #[allow(dead_code)]
        impl $name {
            pub(crate) fn new(message: impl Into<String>) -> $name {
                $name {
                    message: message.into(),
                    source: None,
                }
            }

            pub(crate) fn with_source<E>(message: impl Into<String>, source: E) -> $name
            where
                E: Into<Box<dyn Error + Sync + Send>>,
            {
                $name {
                    message: message.into(),
                    source: Some(Arc::from(source.into())),
                }
            }

            pub(crate) fn caused_by(message: impl Into<String>, error: &conjure_error::Error) -> $name {
                $name {
                    message: message.into(),
                    source: Some(source_of(error)),
                }
            }

            /// Returns a description of the failure.
            pub fn message(&self) -> &str {
                &self.message
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(fmt, "{}: {}", $prefix, self.message)
            }
        }

        impl Error for $name {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                self.source.as_ref().map(|s| &**s as _)
            }
        }
    };
}

cause!(
    /// Endpoint or settings are unusable, for example an on-premise endpoint without a proxy.
    ConfigurationError,
    "invalid configuration"
);

cause!(
    /// Key material could not be loaded or parsed.
    IdentityLoadError,
    "unable to load identity"
);

cause!(
    /// The isolation scope does not carry the tenant or principal the endpoint's authentication requires.
    ContextConsistencyError,
    "inconsistent request context"
);

cause!(
    /// A connection pool manager could not be constructed.
    PoolManagerConstructionError,
    "unable to construct connection pool manager"
);

cause!(
    /// A connection could not be leased from a pool within the configured timeout.
    LeaseTimeoutError,
    "connection lease timed out"
);

/// Returns the first error of type `T` in the cause chain of `error`.
pub fn find_cause<T>(error: &conjure_error::Error) -> Option<&T>
where
    T: Error + 'static,
{
    let root: &(dyn Error + 'static) = error.cause();
    let mut cause = Some(root);
    while let Some(e) = cause {
        if let Some(e) = e.downcast_ref::<T>() {
            return Some(e);
        }
        cause = e.source();
    }

    None
}

macro_rules! known_causes {
    ($cause:expr, |$e:ident| $body:expr) => {{
        let cause = $cause;
        if let Some($e) = cause.downcast_ref::<ConfigurationError>() {
            Some($body)
        } else if let Some($e) = cause.downcast_ref::<IdentityLoadError>() {
            Some($body)
        } else if let Some($e) = cause.downcast_ref::<ContextConsistencyError>() {
            Some($body)
        } else if let Some($e) = cause.downcast_ref::<PoolManagerConstructionError>() {
            Some($body)
        } else if let Some($e) = cause.downcast_ref::<LeaseTimeoutError>() {
            Some($body)
        } else {
            None
        }
    }};
}

fn source_of(error: &conjure_error::Error) -> Source {
    known_causes!(error.cause(), |e| Arc::new(e.clone()) as Source)
        .unwrap_or_else(|| {
            Arc::from(Box::<dyn Error + Sync + Send>::from(
                error.cause().to_string(),
            ))
        })
}

/// Creates an independent copy of `error` for callers that waited on someone else's failed construction.
pub(crate) fn share(error: &conjure_error::Error) -> conjure_error::Error {
    known_causes!(error.cause(), |e| conjure_error::Error::internal_safe(e.clone())).unwrap_or_else(
        || {
            conjure_error::Error::internal_safe(PoolManagerConstructionError::new(
                error.cause().to_string(),
            ))
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    #[test]
    fn find_direct_cause() {
        let error = conjure_error::Error::internal_safe(ConfigurationError::new("no proxy"));
        let cause = find_cause::<ConfigurationError>(&error).unwrap();
        assert_eq!(cause.message(), "no proxy");
        assert!(find_cause::<IdentityLoadError>(&error).is_none());
    }

    #[test]
    fn find_nested_cause() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "missing");
        let error = conjure_error::Error::internal_safe(PoolManagerConstructionError::with_source(
            "tls",
            IdentityLoadError::with_source("key.pem", inner),
        ));
        assert!(find_cause::<PoolManagerConstructionError>(&error).is_some());
        assert_eq!(
            find_cause::<IdentityLoadError>(&error).unwrap().message(),
            "key.pem"
        );
        assert!(find_cause::<io::Error>(&error).is_some());
    }

    #[test]
    fn share_preserves_cause_type() {
        let error = conjure_error::Error::internal_safe(IdentityLoadError::new("bad key"));
        let shared = share(&error);
        assert_eq!(
            find_cause::<IdentityLoadError>(&shared).unwrap().message(),
            "bad key"
        );
    }

    #[test]
    fn caused_by_keeps_cause_discoverable() {
        let inner = conjure_error::Error::internal_safe(ConfigurationError::new("bad TLS version"));
        let error = conjure_error::Error::internal_safe(PoolManagerConstructionError::caused_by(
            "unable to build TLS context",
            &inner,
        ));
        assert_eq!(
            find_cause::<ConfigurationError>(&error).unwrap().message(),
            "bad TLS version"
        );
    }

    #[test]
    fn share_unknown_cause() {
        let error = conjure_error::Error::internal_safe(io::Error::new(io::ErrorKind::Other, "boom"));
        let shared = share(&error);
        let cause = find_cause::<PoolManagerConstructionError>(&shared).unwrap();
        assert_eq!(cause.message(), "boom");
    }
}
