// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use nrcomm::{
  common::tls::{ClientAuthority, TlsIdentity},
  server::{
    bind_discovery, bind_tcp,
    config::{BrokerConfig, TlsFiles},
    tcp_connection_source, Broker, BrokerTls,
  },
};
use std::{net::SocketAddr, path::Path};
use tokio_util::sync::CancellationToken;

const BANNER: &str = "********************************************************************";

fn loud_warning(message: &str) {
  tracing::warn!("{}", BANNER);
  tracing::warn!("{}", message);
  tracing::warn!("{}", BANNER);
}

/// Run a broker answering discovery over UDP and relaying circuits over TCP
#[tracing::instrument(
skip(config),
fields(
ip=?config.bind_ip,
tcp=config.tcp_port,
udp=config.udp_port,
),
err
)]
pub async fn broker_main(config: BrokerConfig) -> Result<()> {
  if config.default {
    loud_warning("RUNNING WITH THE DEFAULT CONFIGURATION; SUPPLY --config FOR ANY REAL DEPLOYMENT");
  }
  let tls = match &config.tls {
    Some(files) => Some(load_tls(files, config.ca.as_deref())?),
    None => {
      loud_warning("TLS IS DISABLED; ALL RELAYED TRAFFIC TRAVELS IN PLAIN TEXT");
      None
    }
  };

  let broker = Broker::new(tls, config.max_frame_length);
  let listener = bind_tcp(SocketAddr::new(config.bind_ip, config.resolve_tcp_port())).await?;
  let tcp_address = listener
    .local_addr()
    .context("Bound listener must have an address")?;
  broker.set_advertised_port(tcp_address.port());
  let discovery_address = SocketAddr::new(config.bind_ip, config.udp_port);
  let discovery = bind_discovery(discovery_address).await?;
  tracing::info!(%tcp_address, %discovery_address, tls = broker.uses_tls(), "Broker listening");

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let result = futures::future::try_join(
    broker
      .clone()
      .run(tcp_connection_source(listener), shutdown.clone()),
    broker.clone().run_discovery(discovery, shutdown.clone()),
  )
  .await;
  shutdown.cancel();

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  result?;
  Ok(())
}

fn load_tls(files: &TlsFiles, ca: Option<&Path>) -> Result<BrokerTls> {
  let identity = TlsIdentity::from_pem_files(&files.cert, &files.key)
    .context("Failed loading broker certificate and key")?;
  let authority = match ca {
    Some(path) => {
      let authority =
        ClientAuthority::from_pem_file(path).context("Failed loading client authority")?;
      if let Err(error) = authority.validate(&identity) {
        tracing::warn!(%error, "Broker certificate does not validate against the configured authority");
      }
      Some(authority)
    }
    None => {
      loud_warning("NO CLIENT AUTHORITY CONFIGURED; CLIENT IDENTITIES ARE NOT VERIFIED");
      None
    }
  };
  BrokerTls::new(&identity, authority.as_ref()).context("Failed building TLS configuration")
}
