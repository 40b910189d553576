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
use crate::errors::IdentityLoadError;
use conjure_error::Error;
use rustls::{Certificate, PrivateKey};
use rustls_pemfile::Item;
use std::fmt;
use std::fs;
use std::path::Path;

/// The alias under which client identities built from PEM material are stored.
pub const DEFAULT_ALIAS: &str = "1";

/// The password of key stores built from PEM material.
pub const DEFAULT_PASSWORD: &str = "";

/// An in-memory client identity: a certificate chain and its private key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyStore {
    alias: String,
    password: String,
    certificate_chain: Vec<Vec<u8>>,
    private_key: Vec<u8>,
}

impl KeyStore {
    /// Creates a key store from DER-encoded material.
    ///
    /// The chain starts with the leaf certificate matching `private_key`.
    pub fn new(alias: &str, certificate_chain: Vec<Vec<u8>>, private_key: Vec<u8>) -> KeyStore {
        KeyStore {
            alias: alias.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            certificate_chain,
            private_key,
        }
    }

    /// Parses a PEM-encoded certificate chain and private key.
    ///
    /// The key may be in PKCS#1, PKCS#8, or Sec1 format.
    pub fn from_pem(certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<KeyStore, Error> {
        let certificate_chain = parse_certs(certificate_pem)?;
        if certificate_chain.is_empty() {
            return Err(Error::internal_safe(IdentityLoadError::new(
                "no certificates found in certificate PEM",
            )));
        }
        let private_key = parse_private_key(private_key_pem)?;

        Ok(KeyStore::new(DEFAULT_ALIAS, certificate_chain, private_key))
    }

    /// Loads a PEM-encoded certificate chain and private key from files.
    pub fn from_files(certificate_file: &Path, private_key_file: &Path) -> Result<KeyStore, Error> {
        let certificate_pem = read(certificate_file)?;
        let private_key_pem = read(private_key_file)?;
        KeyStore::from_pem(&certificate_pem, &private_key_pem)
    }

    /// Sets the password protecting the key store.
    ///
    /// The key material is held decoded, so the password only distinguishes otherwise identical key stores.
    pub fn with_password(mut self, password: &str) -> KeyStore {
        self.password = password.to_string();
        self
    }

    /// Returns the password protecting the key store.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Returns the alias of the identity.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Returns the DER-encoded certificate chain.
    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.certificate_chain
    }

    pub(crate) fn rustls_chain(&self) -> Vec<Certificate> {
        self.certificate_chain
            .iter()
            .cloned()
            .map(Certificate)
            .collect()
    }

    pub(crate) fn rustls_key(&self) -> PrivateKey {
        PrivateKey(self.private_key.clone())
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("KeyStore")
            .field("alias", &self.alias)
            .field("password", &"<redacted>")
            .field("certificates", &self.certificate_chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

pub(crate) fn read(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| {
        Error::internal_safe(IdentityLoadError::with_source("unable to read file", e))
            .with_safe_param("file", path.display().to_string())
    })
}

pub(crate) fn parse_certs(mut pem: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    rustls_pemfile::certs(&mut pem).map_err(|e| {
        Error::internal_safe(IdentityLoadError::with_source(
            "unable to parse certificate PEM",
            e,
        ))
    })
}

fn parse_private_key(mut pem: &[u8]) -> Result<Vec<u8>, Error> {
    let mut items = rustls_pemfile::read_all(&mut pem).map_err(|e| {
        Error::internal_safe(IdentityLoadError::with_source(
            "unable to parse private key PEM",
            e,
        ))
    })?;

    let item = match items.pop() {
        Some(item) if items.is_empty() => item,
        _ => {
            return Err(Error::internal_safe(IdentityLoadError::new(
                "expected exactly one private key in key PEM",
            )))
        }
    };

    match item {
        Item::RSAKey(buf) | Item::PKCS8Key(buf) | Item::ECKey(buf) => Ok(buf),
        _ => Err(Error::internal_safe(IdentityLoadError::new(
            "expected a PKCS#1, PKCS#8, or Sec1 private key",
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::find_cause;
    use std::path::PathBuf;

    fn test_file(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../test").join(name)
    }

    #[test]
    fn from_files() {
        let key_store = KeyStore::from_files(&test_file("cert.cer"), &test_file("key.pem")).unwrap();
        assert_eq!(key_store.alias(), DEFAULT_ALIAS);
        assert_eq!(key_store.password(), DEFAULT_PASSWORD);
        assert_eq!(key_store.certificate_chain().len(), 1);
        assert!(!format!("{:?}", key_store).contains(&format!("{:?}", key_store.private_key)));
    }

    #[test]
    fn password() {
        let key_store = KeyStore::from_files(&test_file("cert.cer"), &test_file("key.pem")).unwrap();
        let protected = key_store.clone().with_password("hunter2");

        assert_eq!(protected.password(), "hunter2");
        assert_ne!(key_store, protected);
        assert!(!format!("{:?}", protected).contains("hunter2"));
    }

    #[test]
    fn key_in_certificate_position() {
        let key = fs::read(test_file("key.pem")).unwrap();
        let error = KeyStore::from_pem(&key, &key).err().unwrap();
        assert!(find_cause::<IdentityLoadError>(&error).is_some());
    }

    #[test]
    fn certificate_in_key_position() {
        let cert = fs::read(test_file("cert.cer")).unwrap();
        let error = KeyStore::from_pem(&cert, &cert).err().unwrap();
        assert_eq!(
            find_cause::<IdentityLoadError>(&error).unwrap().message(),
            "expected a PKCS#1, PKCS#8, or Sec1 private key"
        );
    }

    #[test]
    fn missing_file() {
        let error = KeyStore::from_files(&test_file("missing.cer"), &test_file("key.pem"))
            .err()
            .unwrap();
        assert!(find_cause::<std::io::Error>(&error).is_some());
    }
}
