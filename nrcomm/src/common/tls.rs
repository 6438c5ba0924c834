// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Optional TLS for broker connections.
//!
//! Brokers serve a certificate advertised in discovery replies; endpoints pin
//! that exact certificate instead of validating a chain of trust. When the
//! broker is given a certificate authority, endpoints must present a client
//! certificate issued by it.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::SystemTime,
};

use rustls::{
  client::{ServerCertVerified, ServerCertVerifier},
  server::{AllowAnyAuthenticatedClient, ClientCertVerifier},
  Certificate, CertificateError, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName,
};

#[derive(thiserror::Error, Debug)]
pub enum TlsSetupError {
  #[error("Failed reading {path:?}")]
  Io {
    path: PathBuf,
    #[source]
    error: std::io::Error,
  },
  #[error("Malformed PEM content")]
  Pem(#[source] std::io::Error),
  #[error("No certificates were found in the supplied PEM content")]
  NoCertificates,
  #[error("No private key was found in the supplied PEM content")]
  NoPrivateKey,
  #[error("None of the supplied authority certificates could be used")]
  NoUsableAuthorities,
  #[error("TLS configuration rejected: {0}")]
  Rustls(#[from] rustls::Error),
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsSetupError> {
  std::fs::read(path).map_err(|error| TlsSetupError::Io {
    path: path.to_path_buf(),
    error,
  })
}

/// A certificate chain with its private key
#[derive(Clone)]
pub struct TlsIdentity {
  chain: Vec<Certificate>,
  key: PrivateKey,
}

impl std::fmt::Debug for TlsIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsIdentity")
      .field("chain_length", &self.chain.len())
      .finish_non_exhaustive()
  }
}

impl TlsIdentity {
  pub fn from_pem(certificate_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsSetupError> {
    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut &certificate_pem[..])
      .map_err(TlsSetupError::Pem)?
      .into_iter()
      .map(Certificate)
      .collect();
    if chain.is_empty() {
      return Err(TlsSetupError::NoCertificates);
    }
    let key = rustls_pemfile::read_all(&mut &key_pem[..])
      .map_err(TlsSetupError::Pem)?
      .into_iter()
      .find_map(|item| match item {
        rustls_pemfile::Item::PKCS8Key(key)
        | rustls_pemfile::Item::RSAKey(key)
        | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
        _ => None,
      })
      .ok_or(TlsSetupError::NoPrivateKey)?;
    Ok(Self { chain, key })
  }

  pub fn from_pem_files(certificate: &Path, key: &Path) -> Result<Self, TlsSetupError> {
    Self::from_pem(&read_file(certificate)?, &read_file(key)?)
  }

  /// DER encoding of the leaf certificate, as advertised to endpoints
  pub fn certificate_der(&self) -> &[u8] {
    // from_pem guarantees at least one certificate
    &self.chain[0].0
  }
}

/// Roots used to authenticate endpoint client certificates
#[derive(Clone)]
pub struct ClientAuthority {
  roots: RootCertStore,
}

impl ClientAuthority {
  pub fn from_pem(pem: &[u8]) -> Result<Self, TlsSetupError> {
    let ders = rustls_pemfile::certs(&mut &pem[..]).map_err(TlsSetupError::Pem)?;
    if ders.is_empty() {
      return Err(TlsSetupError::NoCertificates);
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&ders);
    if ignored > 0 {
      tracing::warn!(added, ignored, "Some authority certificates could not be parsed");
    }
    if added == 0 {
      return Err(TlsSetupError::NoUsableAuthorities);
    }
    Ok(Self { roots })
  }

  pub fn from_pem_file(path: &Path) -> Result<Self, TlsSetupError> {
    Self::from_pem(&read_file(path)?)
  }

  fn verifier(&self) -> Arc<dyn ClientCertVerifier> {
    AllowAnyAuthenticatedClient::new(self.roots.clone()).boxed()
  }

  /// Checks that `identity` itself would pass client authentication against this authority
  pub fn validate(&self, identity: &TlsIdentity) -> Result<(), rustls::Error> {
    let (leaf, intermediates) = identity
      .chain
      .split_first()
      .ok_or(rustls::Error::NoCertificatesPresented)?;
    self
      .verifier()
      .verify_client_cert(leaf, intermediates, SystemTime::now())
      .map(|_| ())
  }
}

pub fn server_config(
  identity: &TlsIdentity,
  authority: Option<&ClientAuthority>,
) -> Result<Arc<ServerConfig>, TlsSetupError> {
  let builder = ServerConfig::builder().with_safe_defaults();
  let builder = match authority {
    Some(authority) => builder.with_client_cert_verifier(authority.verifier()),
    None => builder.with_no_client_auth(),
  };
  let config = builder.with_single_cert(identity.chain.clone(), identity.key.clone())?;
  Ok(Arc::new(config))
}

/// Accepts exactly one server certificate, byte for byte
struct PinnedCertificate {
  der: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertificate {
  fn verify_server_cert(
    &self,
    end_entity: &Certificate,
    _intermediates: &[Certificate],
    _server_name: &ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: SystemTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    if end_entity.0 == self.der {
      Ok(ServerCertVerified::assertion())
    } else {
      tracing::warn!("Broker presented a certificate other than the one it advertised");
      Err(rustls::Error::InvalidCertificate(
        CertificateError::ApplicationVerificationFailure,
      ))
    }
  }
}

pub fn pinned_client_config(
  pinned_der: &[u8],
  identity: Option<&TlsIdentity>,
) -> Result<Arc<ClientConfig>, TlsSetupError> {
  let builder = ClientConfig::builder()
    .with_safe_defaults()
    .with_custom_certificate_verifier(Arc::new(PinnedCertificate {
      der: pinned_der.to_vec(),
    }));
  let config = match identity {
    Some(identity) => builder.with_client_auth_cert(identity.chain.clone(), identity.key.clone())?,
    None => builder.with_no_client_auth(),
  };
  Ok(Arc::new(config))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn generate_identity() -> TlsIdentity {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
      .expect("Certificate generation must succeed");
    TlsIdentity::from_pem(
      cert.serialize_pem().unwrap().as_bytes(),
      cert.serialize_private_key_pem().as_bytes(),
    )
    .expect("Generated PEM must parse")
  }

  fn named_params(san: &str, common_name: &str) -> rcgen::CertificateParams {
    let mut params = rcgen::CertificateParams::new(vec![san.to_string()]);
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
      .distinguished_name
      .push(rcgen::DnType::CommonName, common_name);
    params
  }

  /// A fresh certificate authority, both as the broker loads it and as a signer
  pub(crate) fn generate_authority() -> (ClientAuthority, rcgen::Certificate) {
    let mut params = named_params("ca.nrcomm.test", "nrcomm test authority");
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let issuer =
      rcgen::Certificate::from_params(params).expect("Authority generation must succeed");
    let authority = ClientAuthority::from_pem(issuer.serialize_pem().unwrap().as_bytes())
      .expect("Authority PEM must parse");
    (authority, issuer)
  }

  /// A client identity signed by `issuer`
  pub(crate) fn issue_identity(issuer: &rcgen::Certificate) -> TlsIdentity {
    let cert = rcgen::Certificate::from_params(named_params("client.nrcomm.test", "nrcomm test client"))
      .expect("Certificate generation must succeed");
    TlsIdentity::from_pem(
      cert.serialize_pem_with_signer(issuer).unwrap().as_bytes(),
      cert.serialize_private_key_pem().as_bytes(),
    )
    .expect("Issued PEM must parse")
  }

  #[test]
  fn identity_parsing() {
    let identity = generate_identity();
    assert!(!identity.certificate_der().is_empty());
    assert!(matches!(
      TlsIdentity::from_pem(b"", b""),
      Err(TlsSetupError::NoCertificates)
    ));
    assert!(matches!(
      ClientAuthority::from_pem(b"not pem"),
      Err(TlsSetupError::NoCertificates)
    ));
  }

  #[test]
  fn configs_build() {
    let identity = generate_identity();
    server_config(&identity, None).expect("Server config must build");
    pinned_client_config(identity.certificate_der(), None).expect("Client config must build");

    let (authority, issuer) = generate_authority();
    let client = issue_identity(&issuer);
    server_config(&identity, Some(&authority)).expect("Authenticating server config must build");
    pinned_client_config(identity.certificate_der(), Some(&client))
      .expect("Client config with an identity must build");
  }

  #[test]
  fn authority_accepts_only_what_it_issued() {
    let (authority, issuer) = generate_authority();
    authority
      .validate(&issue_identity(&issuer))
      .expect("Issued identity must validate");
    assert!(authority.validate(&generate_identity()).is_err());

    let (_, stranger) = generate_authority();
    assert!(authority.validate(&issue_identity(&stranger)).is_err());
  }
}
