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
use crate::clock::{Clock, SystemClock};
use crate::config::PlatformIdentityConfig;
use crate::errors::IdentityLoadError;
use crate::tls::key_store::{self, KeyStore};
use crate::tls::TlsContext;
use conjure_error::Error;
use parking_lot::Mutex;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use witchcraft_log::{debug, warn};

const DEFAULT_CERTIFICATE_ENV: &str = "CF_INSTANCE_CERT";
const DEFAULT_KEY_ENV: &str = "CF_INSTANCE_KEY";
const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(5 * 60);

type EnvLookup = dyn Fn(&str) -> Option<String> + Sync + Send;

#[derive(Clone)]
pub(crate) struct LoadedIdentity {
    pub(crate) key_store: Option<KeyStore>,
    pub(crate) context: TlsContext,
}

struct CachedIdentity {
    modified: Option<SystemTime>,
    loaded_at: Instant,
    identity: LoadedIdentity,
}

/// The client identity supplied by the hosting platform through files named in environment variables.
///
/// The most recently loaded identity is cached. It is reloaded only when the certificate file's modification time
/// changes. When the environment variables are unset the default TLS context is used instead, and that decision is
/// revisited after a configurable delay.
pub struct PlatformIdentity {
    certificate_env: String,
    key_env: String,
    default_context_ttl: Duration,
    env: Arc<EnvLookup>,
    clock: Arc<dyn Clock>,
    use_default: AtomicBool,
    cached: Mutex<Option<CachedIdentity>>,
}

impl Default for PlatformIdentity {
    fn default() -> Self {
        PlatformIdentity::new()
    }
}

impl PlatformIdentity {
    /// Creates a platform identity reading `CF_INSTANCE_CERT` and `CF_INSTANCE_KEY`.
    pub fn new() -> PlatformIdentity {
        PlatformIdentity {
            certificate_env: DEFAULT_CERTIFICATE_ENV.to_string(),
            key_env: DEFAULT_KEY_ENV.to_string(),
            default_context_ttl: DEFAULT_CONTEXT_TTL,
            env: Arc::new(|name: &str| env::var(name).ok()),
            clock: Arc::new(SystemClock),
            use_default: AtomicBool::new(false),
            cached: Mutex::new(None),
        }
    }

    /// Creates a platform identity from configuration.
    pub fn from_config(config: &PlatformIdentityConfig) -> PlatformIdentity {
        let mut identity = PlatformIdentity::new();
        if let Some(certificate_env) = config.certificate_env() {
            identity.certificate_env = certificate_env.to_string();
        }
        if let Some(key_env) = config.key_env() {
            identity.key_env = key_env.to_string();
        }
        if let Some(ttl) = config.default_context_ttl() {
            identity.default_context_ttl = ttl;
        }
        identity
    }

    /// Sets the function used to look up environment variables.
    ///
    /// Defaults to the process environment.
    pub fn env_lookup<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Sync + Send + 'static,
    {
        self.env = Arc::new(env);
        self
    }

    /// Sets the clock used to expire a cached fallback to the default context.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Forces use of the default TLS context, for environments where the process itself provides delegated identity.
    pub fn set_use_default_context(&self, use_default: bool) {
        self.use_default.store(use_default, Ordering::Relaxed);
    }

    pub(crate) fn load(&self, default: &TlsContext) -> Result<LoadedIdentity, Error> {
        let mut cached = self.cached.lock();

        if self.use_default.load(Ordering::Relaxed) {
            return Ok(LoadedIdentity {
                key_store: None,
                context: default.clone(),
            });
        }

        // a fallback to the default context is reused until it expires
        let now = self.clock.now();
        if let Some(c) = &*cached {
            if c.modified.is_none()
                && now.saturating_duration_since(c.loaded_at) < self.default_context_ttl
            {
                return Ok(c.identity.clone());
            }
        }

        let (certificate_file, key_file) =
            match ((self.env)(&self.certificate_env), (self.env)(&self.key_env)) {
                (Some(certificate_file), Some(key_file)) => {
                    (PathBuf::from(certificate_file), PathBuf::from(key_file))
                }
                _ => {
                    warn!(
                        "platform identity environment variables are not set, using the default TLS context",
                        safe: { certificateEnv: self.certificate_env, keyEnv: self.key_env },
                    );
                    let identity = LoadedIdentity {
                        key_store: None,
                        context: default.clone(),
                    };
                    *cached = Some(CachedIdentity {
                        modified: None,
                        loaded_at: now,
                        identity: identity.clone(),
                    });
                    return Ok(identity);
                }
            };

        check_exists(&certificate_file)?;
        check_exists(&key_file)?;

        let modified = fs::metadata(&certificate_file)
            .and_then(|m| m.modified())
            .map_err(|e| {
                Error::internal_safe(IdentityLoadError::with_source(
                    "unable to read identity file metadata",
                    e,
                ))
                .with_safe_param("file", certificate_file.display().to_string())
            })?;

        if let Some(c) = &*cached {
            if c.modified == Some(modified) {
                return Ok(c.identity.clone());
            }
        }

        let key_store = KeyStore::from_pem(
            &key_store::read(&certificate_file)?,
            &key_store::read(&key_file)?,
        )?;
        let context = TlsContext::with_client_identity(&key_store)?;
        debug!(
            "loaded platform identity",
            safe: { file: certificate_file.display().to_string() },
        );

        let identity = LoadedIdentity {
            key_store: Some(key_store),
            context,
        };
        *cached = Some(CachedIdentity {
            modified: Some(modified),
            loaded_at: self.clock.now(),
            identity: identity.clone(),
        });

        Ok(identity)
    }
}

fn check_exists(path: &Path) -> Result<(), Error> {
    if path.exists() {
        Ok(())
    } else {
        Err(
            Error::internal_safe(IdentityLoadError::new("missing identity file"))
                .with_safe_param("file", path.display().to_string()),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::find_cause;
    use std::collections::HashMap;
    use std::fs::File;
    use tempfile::TempDir;

    fn fixture(name: &str) -> Vec<u8> {
        fs::read(Path::new(env!("CARGO_MANIFEST_DIR")).join("../test").join(name)).unwrap()
    }

    fn env(vars: &[(&str, PathBuf)]) -> impl Fn(&str) -> Option<String> + Sync + Send + 'static {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.display().to_string()))
            .collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    struct Files {
        dir: TempDir,
    }

    impl Files {
        fn new() -> Files {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("cert.pem"), fixture("cert.cer")).unwrap();
            fs::write(dir.path().join("key.pem"), fixture("key.pem")).unwrap();
            Files { dir }
        }

        fn cert(&self) -> PathBuf {
            self.dir.path().join("cert.pem")
        }

        fn key(&self) -> PathBuf {
            self.dir.path().join("key.pem")
        }

        fn identity(&self) -> PlatformIdentity {
            PlatformIdentity::new().env_lookup(env(&[
                (DEFAULT_CERTIFICATE_ENV, self.cert()),
                (DEFAULT_KEY_ENV, self.key()),
            ]))
        }

        fn touch(&self, modified: SystemTime) {
            File::options()
                .write(true)
                .open(self.cert())
                .unwrap()
                .set_modified(modified)
                .unwrap();
        }
    }

    #[test]
    fn unchanged_file_reuses_context() {
        let default = TlsContext::default_context();
        let files = Files::new();
        let identity = files.identity();

        let first = identity.load(&default).unwrap();
        assert!(first.key_store.is_some());
        assert!(!first.context.ptr_eq(&default));

        let second = identity.load(&default).unwrap();
        assert!(first.context.ptr_eq(&second.context));
    }

    #[test]
    fn touched_file_builds_new_context() {
        let default = TlsContext::default_context();
        let files = Files::new();
        let identity = files.identity();

        files.touch(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000));
        let first = identity.load(&default).unwrap();

        files.touch(SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000));
        let second = identity.load(&default).unwrap();
        assert!(!first.context.ptr_eq(&second.context));
    }

    #[test]
    fn parse_error_does_not_reuse_cache() {
        let default = TlsContext::default_context();
        let files = Files::new();
        let identity = files.identity();

        identity.load(&default).unwrap();

        fs::write(files.cert(), b"garbage").unwrap();
        files.touch(SystemTime::UNIX_EPOCH + Duration::from_secs(3_000_000));
        let error = identity.load(&default).err().unwrap();
        assert!(find_cause::<IdentityLoadError>(&error).is_some());
    }

    #[test]
    fn missing_file() {
        let default = TlsContext::default_context();
        let files = Files::new();
        let identity = PlatformIdentity::new().env_lookup(env(&[
            (DEFAULT_CERTIFICATE_ENV, files.dir.path().join("missing.pem")),
            (DEFAULT_KEY_ENV, files.key()),
        ]));

        let error = identity.load(&default).err().unwrap();
        assert_eq!(
            find_cause::<IdentityLoadError>(&error).unwrap().message(),
            "missing identity file"
        );
    }

    #[test]
    fn unset_env_falls_back_to_default_for_a_while() {
        let default = TlsContext::default_context();
        let files = Files::new();
        let clock = Arc::new(ManualClock::new());
        let set = Arc::new(AtomicBool::new(false));
        let lookup = {
            let set = set.clone();
            let cert = files.cert().display().to_string();
            let key = files.key().display().to_string();
            move |name: &str| {
                if !set.load(Ordering::SeqCst) {
                    return None;
                }
                match name {
                    DEFAULT_CERTIFICATE_ENV => Some(cert.clone()),
                    DEFAULT_KEY_ENV => Some(key.clone()),
                    _ => None,
                }
            }
        };
        let identity = PlatformIdentity::new()
            .env_lookup(lookup)
            .clock(clock.clone());

        let loaded = identity.load(&default).unwrap();
        assert!(loaded.key_store.is_none());
        assert!(loaded.context.ptr_eq(&default));

        // the fallback is cached until it expires
        set.store(true, Ordering::SeqCst);
        clock.advance(DEFAULT_CONTEXT_TTL - Duration::from_secs(1));
        let loaded = identity.load(&default).unwrap();
        assert!(loaded.key_store.is_none());

        clock.advance(Duration::from_secs(1));
        let loaded = identity.load(&default).unwrap();
        assert!(loaded.key_store.is_some());
    }

    #[test]
    fn forced_default() {
        let default = TlsContext::default_context();
        let files = Files::new();
        let identity = files.identity();
        identity.set_use_default_context(true);

        let loaded = identity.load(&default).unwrap();
        assert!(loaded.key_store.is_none());
        assert!(loaded.context.ptr_eq(&default));
    }

    #[test]
    fn configured_env_names() {
        let default = TlsContext::default_context();
        let files = Files::new();
        let config = PlatformIdentityConfig::builder()
            .certificate_env("MY_CERT".to_string())
            .key_env("MY_KEY".to_string())
            .build();
        let identity = PlatformIdentity::from_config(&config)
            .env_lookup(env(&[("MY_CERT", files.cert()), ("MY_KEY", files.key())]));

        assert!(identity.load(&default).unwrap().key_store.is_some());
    }
}
