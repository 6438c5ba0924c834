// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{fs, path::PathBuf};
use tracing::instrument;

/// Writes `<path>.pub.pem` and `<path>.priv.pem`, usable as the broker's `--cert` and `--key`
#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let base_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .context("Output path must end in a UTF-8 file name")?
    .to_string();
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  let public_path = path.with_file_name(format!("{}.pub.pem", base_name));
  let private_path = path.with_file_name(format!("{}.priv.pem", base_name));
  fs::write(&public_path, &public_pem).context("Failed writing public key")?;
  fs::write(&private_path, &private_pem).context("Failed writing private key")?;
  tracing::info!(public = ?public_path, private = ?private_path, "Certificates written");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::certgen_main;
  use nrcomm::common::tls::TlsIdentity;

  #[tokio::test]
  async fn generated_pair_loads_as_identity() {
    let dir = std::env::temp_dir().join(format!("nrcomm-certgen-{}", std::process::id()));
    let base = dir.join("broker");
    certgen_main(base.to_string_lossy().into_owned(), "localhost".into())
      .await
      .unwrap();
    let identity = TlsIdentity::from_pem_files(
      &dir.join("broker.pub.pem"),
      &dir.join("broker.priv.pem"),
    )
    .unwrap();
    assert!(!identity.certificate_der().is_empty());
    std::fs::remove_dir_all(&dir).unwrap();
  }
}
