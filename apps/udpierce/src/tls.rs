//! TLS credential loading and configuration

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path)
            .with_context(|| format!("can't open certificate file {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("can't parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("can't open key file {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("can't parse key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn load_roots(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).context("failed to load CA certificates")?;
    }
    Ok(roots)
}

/// Server-side TLS: our certificate, plus optional client certificate
/// verification against the given CAs. Clients without a certificate still
/// complete the handshake; the request handler enforces the requirement.
pub fn make_server_config(
    cert: &Path,
    key: &Path,
    cafile: Option<&Path>,
) -> anyhow::Result<ServerConfig> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let builder = match cafile {
        Some(cafile) => {
            let roots = load_roots(cafile)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .context("can't build client certificate verifier")?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };
    builder
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")
}

/// Client-side TLS: default or custom roots, optional client certificate,
/// and an optional hostname-check bypass that still verifies the chain.
pub fn make_client_config(
    cert: Option<&Path>,
    key: Option<&Path>,
    cafile: Option<&Path>,
    hostname_check: bool,
) -> anyhow::Result<ClientConfig> {
    if !hostname_check && cafile.is_none() {
        bail!("hostname check should not be disabled in absence of custom CA file");
    }
    let roots = match cafile {
        Some(cafile) => load_roots(cafile)?,
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            roots
        }
    };

    let builder = if hostname_check {
        ClientConfig::builder().with_root_certificates(roots)
    } else {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .context("can't build server certificate verifier")?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoHostnameVerification { inner }))
    };

    match (cert, key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .context("invalid client certificate/key pair"),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => bail!("certificate file and key file must be specified only together"),
    }
}

/// Host portion of a `host:port` address, for the TLS server name
pub fn host_part(addr: &str) -> anyhow::Result<String> {
    if let Some(stripped) = addr.strip_prefix('[') {
        if let Some((host, _)) = stripped.split_once(']') {
            return Ok(host.to_string());
        }
    }
    addr.rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .ok_or_else(|| anyhow!("destination address must be host:port"))
}

/// Delegates full chain verification to webpki and skips only the
/// hostname check.
#[derive(Debug)]
struct NoHostnameVerification {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for NoHostnameVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            res => res,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("example.com:443").unwrap(), "example.com");
        assert_eq!(host_part("127.0.0.1:8911").unwrap(), "127.0.0.1");
        assert_eq!(host_part("[::1]:8911").unwrap(), "::1");
        assert!(host_part("noport").is_err());
    }

    #[test]
    fn test_no_hostname_check_requires_cafile() {
        assert!(make_client_config(None, None, None, false).is_err());
    }

    #[test]
    fn test_client_cert_and_key_go_together() {
        let missing = Path::new("/does/not/exist.pem");
        assert!(make_client_config(Some(missing), None, None, true).is_err());
        assert!(make_client_config(None, Some(missing), None, true).is_err());
    }
}
