// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use nrcomm::client::{discover, CircuitStream, EndpointConfig, EntryPoint, Session};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

#[derive(Clone, Debug)]
pub enum ConnectorMode {
  /// Publish the app and bridge every accepted circuit to a local service
  Serve { target: SocketAddr },
  /// Bridge every local connection to some published instance of the app
  Listen { bind: SocketAddr },
}

#[derive(Clone, Debug)]
pub struct ConnectorArgs {
  pub app: String,
  pub mode: ConnectorMode,
  /// Skips discovery when set
  pub broker: Option<SocketAddr>,
  pub endpoint: EndpointConfig,
}

pub async fn connector_main(args: ConnectorArgs) -> Result<()> {
  let entry = match args.broker {
    Some(address) => EntryPoint::plain(address),
    None => discover(&args.endpoint)
      .await
      .context("Broker discovery failed")?
      .into_iter()
      .next()
      .context("No broker answered discovery")?,
  };
  let session = entry
    .connect(&args.endpoint)
    .await
    .with_context(|| format!("Failed connecting to broker at {}", entry))?;

  let shutdown = CancellationToken::new();
  let sigint_handler_task = {
    let shutdown_trigger = shutdown.clone();
    tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    })
  };

  let bridging = async {
    match &args.mode {
      ConnectorMode::Serve { target } => serve(&session, &args.app, *target).await,
      ConnectorMode::Listen { bind } => listen(&session, &args.app, *bind).await,
    }
  };
  let result = tokio::select! {
    result = bridging => result,
    _ = shutdown.cancelled() => Ok(()),
    _ = session.closed() => Err(anyhow::Error::msg("Broker connection lost")),
  };
  session.close();

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  result
}

async fn serve(session: &Session, app: &str, target: SocketAddr) -> Result<()> {
  let mut publication = session.publish(app).await.context("Publishing failed")?;
  tracing::info!(
    app,
    instance_id = %publication.instance_id(),
    %target,
    "Serving app"
  );
  while let Some(offer) = publication.next_circuit().await {
    let span = tracing::info_span!("circuit", socket_id = %offer.socket_id());
    tokio::task::spawn(
      async move {
        let local = match TcpStream::connect(target).await {
          Ok(local) => local,
          Err(error) => {
            tracing::warn!(?error, "Local service unreachable; refusing circuit");
            if let Err(error) = offer.refuse().await {
              tracing::debug!(%error, "Refusal failed");
            }
            return;
          }
        };
        match offer.accept().await {
          Ok(circuit) => bridge(local, circuit).await,
          Err(error) => tracing::warn!(%error, "Accepting circuit failed"),
        }
      }
      .instrument(span),
    );
  }
  Ok(())
}

async fn listen(session: &Session, app: &str, bind: SocketAddr) -> Result<()> {
  let listener = TcpListener::bind(bind)
    .await
    .with_context(|| format!("Failed binding local listener on {}", bind))?;
  tracing::info!(app, %bind, "Listening for local connections");
  loop {
    let (local, peer) = listener.accept().await.context("Local accept failed")?;
    let session = session.clone();
    let app = app.to_owned();
    tokio::task::spawn(
      async move {
        let instances = match session.discover_app_instances(&app).await {
          Ok(instances) => instances,
          Err(error) => {
            tracing::warn!(%error, "Instance discovery failed");
            return;
          }
        };
        let instance_id = instances.choose(&mut rand::thread_rng()).copied();
        let instance_id = match instance_id {
          Some(instance_id) => instance_id,
          None => {
            tracing::warn!("No published instance of the app");
            return;
          }
        };
        match session.connect(instance_id).await {
          Ok(circuit) => bridge(local, circuit).await,
          Err(error) => tracing::warn!(%instance_id, %error, "Circuit failed to open"),
        }
      }
      .instrument(tracing::info_span!("local", %peer)),
    );
  }
}

async fn bridge(mut local: TcpStream, mut circuit: CircuitStream) {
  if let Err(error) = local.set_nodelay(true) {
    tracing::debug!(?error, "Failed setting nodelay");
  }
  match tokio::io::copy_bidirectional(&mut local, &mut circuit).await {
    Ok((sent, received)) => tracing::info!(sent, received, "Bridge finished"),
    Err(error) => tracing::debug!(?error, "Bridge ended with an error"),
  }
}
