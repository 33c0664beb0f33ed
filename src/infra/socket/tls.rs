//! TLS context loading and the non-blocking adapter used to pump rustls.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::TcpStream;

use crate::config::TlsConfig;
use crate::core::KernelError;

/// Build a server context from the PEM files named in `config`.
///
/// # Errors
///
/// `KernelError::InvalidConfig` for unreadable or malformed PEM input, and
/// `KernelError::Tls` when rustls rejects the certificate/key pair.
pub fn load_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>, KernelError> {
    let certs = CertificateDer::pem_file_iter(&config.cert_path)
        .and_then(Iterator::collect::<Result<Vec<_>, _>>)
        .map_err(|e| {
            KernelError::InvalidConfig(format!("certificate `{}`: {e}", config.cert_path.display()))
        })?;
    if certs.is_empty() {
        return Err(KernelError::InvalidConfig(format!(
            "certificate `{}` contains no certificates",
            config.cert_path.display()
        )));
    }
    let key = PrivateKeyDer::from_pem_file(&config.key_path).map_err(|e| {
        KernelError::InvalidConfig(format!("private key `{}`: {e}", config.key_path.display()))
    })?;

    let server = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(Arc::new(server))
}

/// `Read`/`Write` over a tokio stream that never blocks.
///
/// Would-block surfaces as `io::ErrorKind::WouldBlock`, which rustls passes
/// back to the connection driver untouched.
pub(crate) struct NonBlocking<'a>(pub &'a TcpStream);

impl Read for NonBlocking<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for NonBlocking<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
