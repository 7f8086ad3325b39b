use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::Config;

/// TLS acceptor for the configured certificate pair, or `None` when TLS is off.
pub fn acceptor_from_config(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => load_tls_acceptor(cert, key).map(Some),
        _ => Ok(None),
    }
}

pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("no private key found in {}", key_path.display()),
            )
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_disabled_without_paths() {
        assert!(acceptor_from_config(&Config::default()).unwrap().is_none());
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let config = Config {
            tls_cert: Some("/nonexistent/leasehold-cert.pem".into()),
            tls_key: Some("/nonexistent/leasehold-key.pem".into()),
            ..Config::default()
        };
        let err = acceptor_from_config(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
