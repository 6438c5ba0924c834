// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgGroup, ArgMatches, Command};
use nrcomm::{
  client::EndpointConfig,
  common::tls::TlsIdentity,
  server::config::{BrokerConfig, TlsFiles},
  util::validators::{
    parse_ipaddr, parse_port, parse_socketaddr, validate_existing_file, validate_ipaddr,
    validate_log_level, validate_port, validate_socketaddr,
  },
};
use std::path::{Path, PathBuf};

mod broker;
mod certgen;
mod connector;

enum CliCommand {
  Broker(BrokerConfig),
  Connector(connector::ConnectorArgs),
  Cert { path: String, san: String },
}

fn main() {
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("log-level")
        .help("Minimum log level when RUST_LOG is unset")
        .long("log-level")
        .global(true)
        .validator(validate_log_level)
        .takes_value(true),
    )
    .subcommand(
      Command::new("broker")
        .about("Run an entry point broker that relays circuits between endpoints")
        .arg(
          Arg::new("config")
            .long("config")
            .short('f')
            .validator(validate_existing_file)
            .takes_value(true),
        )
        .arg(
          Arg::new("bind-ip")
            .long("bind-ip")
            .short('i')
            .validator(validate_ipaddr)
            .takes_value(true),
        )
        .arg(
          Arg::new("tcp-port")
            .help("Port for endpoint connections; 0 picks one at random")
            .long("tcp-port")
            .short('t')
            .validator(validate_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("udp-port")
            .help("Port answering discovery broadcasts")
            .long("udp-port")
            .short('u')
            .validator(validate_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .requires("key")
            .takes_value(true),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .requires("cert")
            .takes_value(true),
        )
        .arg(
          Arg::new("ca")
            .help("Authority that client certificates must chain to")
            .long("ca")
            .validator(validate_existing_file)
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("connector")
        .about("Bridge local TCP traffic over a broker circuit")
        .arg(
          Arg::new("app")
            .help("App description to publish or connect to")
            .long("app")
            .short('a')
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("serve")
            .help("Publish the app and bridge each circuit to this local service")
            .long("serve")
            .short('s')
            .validator(validate_socketaddr)
            .takes_value(true),
        )
        .arg(
          Arg::new("listen")
            .help("Accept local connections here and bridge each to an instance of the app")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .takes_value(true),
        )
        .group(
          ArgGroup::new("mode")
            .args(&["serve", "listen"])
            .required(true),
        )
        .arg(
          Arg::new("broker")
            .help("Connect to this broker over plain TCP instead of discovering one")
            .long("broker")
            .short('b')
            .validator(validate_socketaddr)
            .takes_value(true),
        )
        .arg(
          Arg::new("discovery")
            .help("Where discovery requests are sent")
            .long("discovery")
            .short('d')
            .validator(validate_socketaddr)
            .default_value("255.255.255.255:2888")
            .takes_value(true),
        )
        .arg(
          Arg::new("client-cert")
            .long("client-cert")
            .validator(validate_existing_file)
            .requires("client-key")
            .takes_value(true),
        )
        .arg(
          Arg::new("client-key")
            .long("client-key")
            .validator(validate_existing_file)
            .requires("client-cert")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");

  let (command, log_level) = match command_arg_handling(&matches) {
    Ok(parsed) => parsed,
    Err(err) => {
      eprintln!("Invalid arguments for {}: {:#}", mode, err);
      std::process::exit(2);
    }
  };
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");

  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(run_command(command)) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

/// Parses the chosen subcommand along with the log level it should run at
fn command_arg_handling(matches: &ArgMatches) -> Result<(CliCommand, String)> {
  let (command, opts) = matches
    .subcommand()
    .ok_or_else(|| anyhow::Error::msg("A subcommand is required"))?;
  let log_level = opts.value_of("log-level").map(String::from);
  Ok(match command {
    "broker" => {
      let config = broker_arg_handling(opts)?;
      let log_level = log_level.unwrap_or_else(|| config.min_log_level.clone());
      (CliCommand::Broker(config), log_level)
    }
    "connector" => (
      CliCommand::Connector(connector_arg_handling(opts)?),
      log_level.unwrap_or_else(|| "info".into()),
    ),
    "cert" => (
      CliCommand::Cert {
        path: required(opts, "path")?.into(),
        san: required(opts, "san")?.into(),
      },
      log_level.unwrap_or_else(|| "info".into()),
    ),
    other => anyhow::bail!("Unknown subcommand {}", other),
  })
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .ok_or_else(|| anyhow::anyhow!("Argument {} is required", name))
}

/// Loads the configuration file, if any, and applies command line overrides to it
pub fn broker_arg_handling(args: &'_ ArgMatches) -> Result<BrokerConfig> {
  let mut config = match args.value_of("config") {
    Some(path) => BrokerConfig::from_json_file(Path::new(path))?,
    None => BrokerConfig::builtin(),
  };
  let mut overridden = false;
  if let Some(ip) = args.value_of("bind-ip") {
    config.bind_ip = parse_ipaddr(ip)?;
    overridden = true;
  }
  if let Some(port) = args.value_of("tcp-port") {
    config.tcp_port = parse_port(port)?;
    overridden = true;
  }
  if let Some(port) = args.value_of("udp-port") {
    config.udp_port = parse_port(port)?;
    overridden = true;
  }
  if let (Some(cert), Some(key)) = (args.value_of("cert"), args.value_of("key")) {
    config.tls = Some(TlsFiles {
      cert: PathBuf::from(cert),
      key: PathBuf::from(key),
    });
    overridden = true;
  }
  if let Some(ca) = args.value_of("ca") {
    config.ca = Some(PathBuf::from(ca));
    overridden = true;
  }
  if let Some(level) = args.value_of("log-level") {
    config.min_log_level = level.into();
  }
  if overridden {
    config.default = false;
  }
  Ok(config)
}

pub fn connector_arg_handling(args: &'_ ArgMatches) -> Result<connector::ConnectorArgs> {
  let mode = match (args.value_of("serve"), args.value_of("listen")) {
    (Some(target), _) => connector::ConnectorMode::Serve {
      target: parse_socketaddr(target)?,
    },
    (None, Some(bind)) => connector::ConnectorMode::Listen {
      bind: parse_socketaddr(bind)?,
    },
    (None, None) => anyhow::bail!("Either --serve or --listen is required"),
  };
  let client_identity = match (args.value_of("client-cert"), args.value_of("client-key")) {
    (Some(cert), Some(key)) => Some(TlsIdentity::from_pem_files(
      Path::new(cert),
      Path::new(key),
    )?),
    _ => None,
  };
  Ok(connector::ConnectorArgs {
    app: required(args, "app")?.into(),
    mode,
    broker: args.value_of("broker").map(parse_socketaddr).transpose()?,
    endpoint: EndpointConfig {
      discovery_target: parse_socketaddr(required(args, "discovery")?)?,
      client_identity,
      ..Default::default()
    },
  })
}

async fn run_command(command: CliCommand) -> Result<()> {
  match command {
    CliCommand::Broker(config) => {
      tracing::info!("Running as broker with config {:#?}", config);
      broker::broker_main(config).await
    }
    CliCommand::Connector(args) => {
      tracing::info!("Running as connector with config {:#?}", args);
      connector::connector_main(args).await
    }
    CliCommand::Cert { path, san } => {
      tracing::info!("Generating certs...");
      certgen::certgen_main(path, san).await
    }
  }
}

#[cfg(test)]
mod tests {
  use super::broker_arg_handling;
  use clap::{Arg, Command};

  fn broker_command() -> Command<'static> {
    Command::new("broker")
      .arg(Arg::new("config").long("config").takes_value(true))
      .arg(Arg::new("bind-ip").long("bind-ip").takes_value(true))
      .arg(Arg::new("tcp-port").long("tcp-port").takes_value(true))
      .arg(Arg::new("udp-port").long("udp-port").takes_value(true))
      .arg(Arg::new("cert").long("cert").takes_value(true))
      .arg(Arg::new("key").long("key").takes_value(true))
      .arg(Arg::new("ca").long("ca").takes_value(true))
      .arg(Arg::new("log-level").long("log-level").takes_value(true))
  }

  #[test]
  fn flags_override_builtin_config() {
    let matches = broker_command().get_matches_from(["broker"]);
    let config = broker_arg_handling(&matches).unwrap();
    assert!(config.default);

    let matches = broker_command().get_matches_from([
      "broker",
      "--tcp-port",
      "6500",
      "--udp-port",
      "3000",
      "--log-level",
      "debug",
    ]);
    let config = broker_arg_handling(&matches).unwrap();
    assert!(!config.default);
    assert_eq!(config.tcp_port, 6500);
    assert_eq!(config.udp_port, 3000);
    assert_eq!(config.min_log_level, "debug");
  }
}
