use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::config::TlsPaths;

/// Build a TLS acceptor from PEM files, or `None` when TLS is off.
pub fn load_tls_acceptor(paths: Option<&TlsPaths>) -> io::Result<Option<TlsAcceptor>> {
    let Some(paths) = paths else { return Ok(None) };

    let certs: Vec<_> = rustls_pemfile::certs(&mut open_pem(&paths.cert)?)
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", paths.cert.display()),
        ));
    }

    let key = rustls_pemfile::private_key(&mut open_pem(&paths.key)?)?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key in {}", paths.key.display()),
        )
    })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open_pem(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn no_paths_means_plaintext() {
        assert!(load_tls_acceptor(None).unwrap().is_none());
    }

    #[test]
    fn missing_files_are_reported() {
        let paths = TlsPaths {
            cert: PathBuf::from("/nonexistent/autobook.crt"),
            key: PathBuf::from("/nonexistent/autobook.key"),
        };
        let err = load_tls_acceptor(Some(&paths)).err().unwrap();
        assert!(err.to_string().contains("autobook.crt"));
    }

    #[test]
    fn empty_cert_file_rejected() {
        let dir = std::env::temp_dir().join("autobook_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.crt");
        std::fs::write(&cert, "").unwrap();
        let paths = TlsPaths {
            cert,
            key: dir.join("empty.key"),
        };
        let err = load_tls_acceptor(Some(&paths)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
