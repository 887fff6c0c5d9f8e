//! TLS setup for the webhook servers.

use std::path::{Path, PathBuf};

use axum_server::tls_openssl::OpenSSLConfig;
use openssl::{
    ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode},
    x509::X509,
};

use crate::prelude::*;

/// Acceptor builds the server-side TLS configuration from a PEM cert+key pair.
///
/// When `client_ca` names any files, clients must present a certificate signed by one of the
/// CAs in them.
pub fn acceptor(certfile: &Path, keyfile: &Path, client_ca: &[PathBuf]) -> Result<OpenSSLConfig> {
    if client_ca.is_empty() {
        return OpenSSLConfig::from_pem_file(certfile, keyfile)
            .map_err(|err| std::io::Error::other(err).into());
    }
    let mut b = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    b.set_certificate_chain_file(certfile)?;
    b.set_private_key_file(keyfile, SslFiletype::PEM)?;
    b.check_private_key()?;
    let mut n = 0usize;
    for path in client_ca {
        let pem = std::fs::read(path)?;
        for cert in X509::stack_from_pem(&pem)? {
            b.add_client_ca(&cert)?;
            b.cert_store_mut().add_cert(cert)?;
            n = n.saturating_add(1);
        }
    }
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "client CA files contain no certificates",
        )
        .into());
    }
    debug!(certificates = n, "client certificate verification enabled");
    b.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    OpenSSLConfig::try_from(b).map_err(|err| std::io::Error::other(err).into())
}

#[cfg(test)]
mod tests {
    use openssl::{
        asn1::Asn1Time,
        hash::MessageDigest,
        pkey::{PKey, Private},
        rsa::Rsa,
        x509::{X509Builder, X509NameBuilder},
    };

    use super::*;
    use crate::testing::test;

    fn self_signed(cn: &str) -> (PKey<Private>, X509) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();
        let mut b = X509Builder::new().unwrap();
        b.set_version(2).unwrap();
        b.set_subject_name(&name).unwrap();
        b.set_issuer_name(&name).unwrap();
        b.set_pubkey(&key).unwrap();
        b.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        b.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        b.sign(&key, MessageDigest::sha256()).unwrap();
        (key, b.build())
    }

    fn write_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let (key, cert) = self_signed("hook-operator-validating.default.svc");
        let certfile = dir.join("tls.crt");
        let keyfile = dir.join("tls.key");
        std::fs::write(&certfile, cert.to_pem().unwrap()).unwrap();
        std::fs::write(&keyfile, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        (certfile, keyfile)
    }

    #[test]
    fn server_only() {
        let dir = tempfile::tempdir().unwrap();
        let (certfile, keyfile) = write_pair(dir.path());
        acceptor(&certfile, &keyfile, &[]).expect("plain TLS config");
    }

    #[test]
    fn client_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (certfile, keyfile) = write_pair(dir.path());
        let (_, a) = self_signed("client-ca-a");
        let (_, b) = self_signed("client-ca-b");
        let bundle = dir.path().join("clients.crt");
        let mut pem = a.to_pem().unwrap();
        pem.extend(b.to_pem().unwrap());
        std::fs::write(&bundle, pem).unwrap();
        acceptor(&certfile, &keyfile, &[bundle]).expect("mutual TLS config");
    }

    #[test]
    fn client_ca_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (certfile, keyfile) = write_pair(dir.path());

        let missing = dir.path().join("missing.crt");
        assert!(matches!(
            acceptor(&certfile, &keyfile, &[missing]),
            Err(Error::Io(_))
        ));

        let empty = dir.path().join("empty.crt");
        std::fs::write(&empty, b"").unwrap();
        assert!(acceptor(&certfile, &keyfile, &[empty]).is_err());
    }
}
