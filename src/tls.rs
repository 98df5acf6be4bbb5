//! TLS contexts and peer verification.
//!
//! The listener requires a client certificate and checks the peer subject
//! against the configured DN allow-list; hostname verification is disabled
//! on outbound connections because orchestrators are identified by DN, not
//! by name. The peer address is additionally checked against the set of
//! addresses resolved from `allowed_orchestrator_hosts` at startup.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, Error as TlsError,
    RootCertStore, ServerConfig, ServerConnection, SignatureScheme,
};
use tracing::{debug, info, warn};

use crate::config::Config;

pub struct TlsContext {
    pub server: Arc<ServerConfig>,
    pub client: Arc<ClientConfig>,
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open certificate {}", path.display()))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("cannot parse certificate {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open key {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("cannot parse key {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn load_roots(config: &Config) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match &config.truststore {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .with_context(|| format!("bad CA certificate in {}", path.display()))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                debug!("skipping a system CA certificate: {e}");
            }
            for cert in native.certs {
                let _ = roots.add(cert);
            }
        }
    }
    if roots.is_empty() {
        bail!("no CA certificates available for peer verification");
    }
    Ok(roots)
}

/// Builds the TLS server and client contexts, or None when no keystore is
/// configured (plain TCP mode).
pub fn build(config: &Config) -> Result<Option<TlsContext>> {
    if !config.tls_enabled() {
        info!("SSL enabled: false");
        return Ok(None);
    }
    info!("SSL enabled: true");
    if config.keystore_password.is_some() {
        warn!("encrypted private keys are not supported, reading the keystore unencrypted");
    }
    let key_path = config.keystore.as_ref().unwrap();
    let cert_path = config
        .certificate
        .as_ref()
        .ok_or_else(|| anyhow!("'certificate' must be set when 'keystore' is set"))?;

    let certs = load_certs(cert_path)?;
    let roots = Arc::new(load_roots(config)?);

    let client_verifier = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .map_err(|e| anyhow!("cannot build client verifier: {e}"))?;
    let server = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs.clone(), load_key(key_path)?)
        .context("invalid server TLS configuration")?;

    let server_verifier = Arc::new(NoHostnameVerification::new(roots)?);
    let client = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(server_verifier)
        .with_client_auth_cert(certs, load_key(key_path)?)
        .context("invalid client TLS configuration")?;

    Ok(Some(TlsContext {
        server: Arc::new(server),
        client: Arc::new(client),
    }))
}

/// Chain verification without the hostname check. Peers present
/// orchestrator certificates whose subjects rarely match an address, so
/// only the not-valid-for-name error is tolerated.
#[derive(Debug)]
struct NoHostnameVerification {
    inner: Arc<WebPkiServerVerifier>,
}

impl NoHostnameVerification {
    fn new(roots: Arc<RootCertStore>) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| anyhow!("cannot build server verifier: {e}"))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for NoHostnameVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForNameContext {
                ..
            })) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn oid_to_attr(oid: &str) -> Option<&'static str> {
    Some(match oid {
        "2.5.4.3" => "CN",
        "2.5.4.6" => "C",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "2.5.4.4" => "SN",
        "2.5.4.5" => "SERIALNUMBER",
        "1.2.840.113549.1.9.1" => "EMAILADDRESS",
        "0.9.2342.19200300.100.1.25" => "DC",
        "0.9.2342.19200300.100.1.1" => "UID",
        _ => return None,
    })
}

/// Extracts the subject of the peer's end-entity certificate as attr=value
/// pairs. Attributes with no common abbreviation are reported by their
/// dotted OID.
pub fn peer_subject(certs: &[CertificateDer<'_>]) -> Result<Vec<(String, String)>> {
    let end_entity = certs.first().ok_or_else(|| anyhow!("peer sent no certificate"))?;
    let (_, cert) = x509_parser::parse_x509_certificate(end_entity.as_ref())
        .map_err(|e| anyhow!("cannot parse peer certificate: {e}"))?;
    let mut subject = Vec::new();
    for attr in cert.subject().iter_attributes() {
        let oid = attr.attr_type().to_id_string();
        let name = oid_to_attr(&oid).map(String::from).unwrap_or(oid);
        let value = attr
            .as_str()
            .map(String::from)
            .unwrap_or_else(|_| {
                String::from_utf8_lossy(attr.attr_value().data.as_ref()).into_owned()
            });
        subject.push((name, value));
    }
    Ok(subject)
}

/// Verifies an accepted peer's certificate subject against the DN
/// allow-list. An empty list accepts any verified peer (with a startup
/// warning, see `Config::production_readiness_check`).
pub fn verify_peer_dn(config: &Config, conn: &ServerConnection) -> Result<()> {
    if config.allowed_dns.is_empty() {
        return Ok(());
    }
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| anyhow!("peer sent no certificate"))?;
    let subject = peer_subject(certs)?;
    debug!("verify peer certificate with subject {subject:?}");
    if config.allowed_dns.iter().any(|dn| dn.matches(&subject)) {
        Ok(())
    } else {
        Err(anyhow!("connection not allowed by DN ACL"))
    }
}

/// Verifies the peer address against the resolved allow-list. A missing
/// list logs a warning at startup and permits the connection.
pub fn verify_peer_ip(config: &Config, peer: IpAddr) -> Result<()> {
    if config.allowed_ips.is_empty() {
        return Ok(());
    }
    // a dual-stack listener reports v4 peers as mapped v6 addresses
    let peer = match peer {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    if config.allowed_ips.contains(&peer) {
        Ok(())
    } else {
        Err(anyhow!("connecting address {peer} not in list of allowed addresses"))
    }
}

/// Opens an outbound TLS session on an established connection.
pub fn client_connection(ctx: &TlsContext, peer: IpAddr) -> Result<ClientConnection> {
    let name = ServerName::IpAddress(peer.into());
    ClientConnection::new(ctx.client.clone(), name).context("cannot start TLS session")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_allow_list_permits_when_unset() {
        let config = Config::default();
        assert!(verify_peer_ip(&config, "192.0.2.7".parse().unwrap()).is_ok());
    }

    #[test]
    fn ip_allow_list_rejects_unknown_peers() {
        let mut config = Config::default();
        config.allowed_ips = vec!["192.0.2.1".parse().unwrap()];
        assert!(verify_peer_ip(&config, "192.0.2.1".parse().unwrap()).is_ok());
        assert!(verify_peer_ip(&config, "192.0.2.7".parse().unwrap()).is_err());
    }

    #[test]
    fn mapped_v6_peers_match_v4_entries() {
        let mut config = Config::default();
        config.allowed_ips = vec!["192.0.2.1".parse().unwrap()];
        assert!(verify_peer_ip(&config, "::ffff:192.0.2.1".parse().unwrap()).is_ok());
    }

    #[test]
    fn known_oids_have_short_names() {
        assert_eq!(oid_to_attr("2.5.4.3"), Some("CN"));
        assert_eq!(oid_to_attr("2.5.4.10"), Some("O"));
        assert_eq!(oid_to_attr("1.2.3.4"), None);
    }
}
