use std::{
    fs,
    io::{BufReader, Cursor},
    sync::Arc,
};

use rustls::{Certificate as RustlsCert, ClientConnection, PrivateKey, ServerName};

use crate::{
    config::TlsConfig,
    error::{Error, ResultCode, Result},
};

/// Shared rustls client state for every TLS connection of a cluster.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Builds the client configuration from PEM material. Roots come from
    /// `ca_file` and `ca_pem`; a client certificate is presented only when
    /// both `cert_file` and `key_file` are set.
    pub fn new(tls: &TlsConfig) -> Result<Self> {
        let mut root_certs = rustls::RootCertStore::empty();
        let mut pems = Vec::new();
        if let Some(path) = &tls.ca_file {
            pems.push(read_file(path)?);
        }
        if let Some(pem) = &tls.ca_pem {
            pems.push(pem.clone());
        }
        for pem in pems {
            for der in read_certs(&pem)? {
                root_certs
                    .add(&RustlsCert(der))
                    .map_err(|e| tls_error(format!("Invalid CA certificate: {}", e)))?;
            }
        }

        let builder = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_certs);

        let config = match (&tls.cert_file, &tls.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let certs = read_certs(&read_file(cert_file)?)?
                    .into_iter()
                    .map(RustlsCert)
                    .collect();
                let key = {
                    let pem = read_file(key_file)?;
                    let mut keys =
                        rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(Cursor::new(pem)))
                            .map_err(|e| tls_error(format!("Invalid private key: {}", e)))?;
                    if keys.len() != 1 {
                        Err(tls_error("Expected exactly one private key"))?
                    }
                    keys.remove(0)
                };
                builder.with_client_auth_cert(certs, PrivateKey(key))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => Err(tls_error("cert_file and key_file must be set together"))?,
        };

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Starts a client session validated against `tls_name`.
    pub fn connection(&self, tls_name: &str) -> Result<ClientConnection> {
        let name = ServerName::try_from(tls_name)
            .map_err(|_| tls_error(format!("Invalid TLS name {}", tls_name)))?;
        Ok(ClientConnection::new(self.config.clone(), name)?)
    }
}

fn read_file(path: &std::path::Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| tls_error(format!("Failed to read {}: {}", path.display(), e)))
}

fn read_certs(pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    rustls_pemfile::certs(&mut BufReader::new(Cursor::new(pem)))
        .map_err(|e| tls_error(format!("Invalid certificate: {}", e)))
}

#[track_caller]
fn tls_error(message: impl Into<String>) -> Error {
    Error::new(ResultCode::TlsError, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_configured_client_auth_is_rejected() {
        let tls = TlsConfig::builder().cert_file("/nonexistent.pem").build();
        let err = TlsContext::new(&tls).unwrap_err();
        assert_eq!(err.code, ResultCode::TlsError);
    }

    #[test]
    fn empty_roots_build_a_context() {
        let ctx = TlsContext::new(&TlsConfig::default()).unwrap();
        assert!(ctx.connection("node-a.example").is_ok());
    }
}
