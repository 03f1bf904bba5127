// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TLS termination for the byte-stream front
//!
//! The relay core never sees TLS; this module only builds the rustls server
//! config the listener terminates with. Certificates are selected by SNI;
//! the entry named `default` answers handshakes no other name matches.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::server::{
    ClientHello, NoServerSessionStorage, ResolvesServerCert, ResolvesServerCertUsingSni,
    ServerSessionMemoryCache,
};
use tokio_rustls::rustls::sign::{any_supported_type, CertifiedKey};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};

/// Error building the TLS context from configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("{}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("{}: no certificate in file", .path.display())]
    NoCert { path: PathBuf },
    #[error("{}: no pkcs8 private key in file", .path.display())]
    NoKey { path: PathBuf },
    #[error("{}: unsupported private key", .path.display())]
    UnsupportedKey { path: PathBuf },
    #[error("certificate for {name}: {source}")]
    Sni {
        name: String,
        source: tokio_rustls::rustls::Error,
    },
}

impl From<TlsError> for io::Error {
    fn from(e: TlsError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

#[derive(serde::Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    servers: HashMap<String, CertEntry>,

    #[serde(default)]
    prefer_server_cipher: bool,
    #[serde(default)]
    session_cache_size: usize,
    #[serde(default)]
    alpn: Vec<String>,
    #[serde(default)]
    max_fragment_size: Option<usize>,
}

impl TlsConfig {
    pub fn build(self) -> Result<Arc<ServerConfig>, TlsError> {
        let resolver = CertResolver::new(self.servers)?;

        let mut ctx = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));

        ctx.alpn_protocols = self.alpn.into_iter().map(String::into_bytes).collect();
        ctx.ignore_client_order = self.prefer_server_cipher;
        ctx.max_fragment_size = self.max_fragment_size;
        ctx.session_storage = match self.session_cache_size {
            0 => Arc::new(NoServerSessionStorage {}),
            n => ServerSessionMemoryCache::new(n),
        };

        Ok(Arc::new(ctx))
    }
}

#[derive(serde::Deserialize)]
struct CertEntry {
    cert_chain: PathBuf,
    priv_key: PathBuf,
}

impl CertEntry {
    fn load(&self) -> Result<CertifiedKey, TlsError> {
        let cert: Vec<Certificate> = load_pem(&self.cert_chain, rustls_pemfile::certs)?
            .into_iter()
            .map(Certificate)
            .collect();
        if cert.is_empty() {
            return Err(TlsError::NoCert {
                path: self.cert_chain.clone(),
            });
        }

        let key = load_pem(&self.priv_key, rustls_pemfile::pkcs8_private_keys)?
            .pop()
            .ok_or_else(|| TlsError::NoKey {
                path: self.priv_key.clone(),
            })?;
        let key = any_supported_type(&PrivateKey(key)).map_err(|_| TlsError::UnsupportedKey {
            path: self.priv_key.clone(),
        })?;

        Ok(CertifiedKey {
            cert,
            key,
            ocsp: None,
            sct_list: None,
        })
    }
}

fn load_pem<T>(
    path: &Path,
    parse: fn(&mut dyn io::BufRead) -> io::Result<Vec<T>>,
) -> Result<Vec<T>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Read {
        path: path.to_owned(),
        source: e,
    })?;
    parse(&mut BufReader::new(file)).map_err(|e| TlsError::Read {
        path: path.to_owned(),
        source: e,
    })
}

struct CertResolver {
    sni: ResolvesServerCertUsingSni,
    default: Option<Arc<CertifiedKey>>,
}

impl CertResolver {
    fn new(mut servers: HashMap<String, CertEntry>) -> Result<CertResolver, TlsError> {
        let default = match servers.remove("default") {
            Some(entry) => Some(Arc::new(entry.load()?)),
            None => None,
        };

        let mut sni = ResolvesServerCertUsingSni::new();
        for (name, entry) in servers {
            let certified = entry.load()?;
            sni.add(&name, certified)
                .map_err(|source| TlsError::Sni { name, source })?;
        }

        Ok(CertResolver { sni, default })
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.sni
            .resolve(client_hello)
            .or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_no_servers() {
        let cfg: TlsConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.build().is_ok());
    }

    #[test]
    fn missing_cert_file_names_the_path() {
        let cfg: TlsConfig = serde_json::from_str(
            r#"{"servers": {"default": {
                "cert_chain": "/nonexistent/cert.pem",
                "priv_key": "/nonexistent/key.pem"
            }}}"#,
        )
        .unwrap();

        let err = match cfg.build() {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }
}
