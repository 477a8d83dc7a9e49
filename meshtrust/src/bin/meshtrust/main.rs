// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use meshtrust::config::{load_config, Config};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

mod cli;
mod commands;

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "meshtrust/meshtrust.toml";

fn main() -> anyhow::Result<()> {
    let opts = cli::Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "MESHTRUST_LOG contains an invalid log directive; refer to \
        https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
        filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .context("Programming error: set_global_default should only be called once.")?;

    let config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        cli::Command::Config {} => {
            println!("# This is the current configuration\n\n{config}\n# This concludes the configuration.\n");
            _ = config.read_identity_secret().inspect_err(|error| {
                eprintln!("The configuration format is valid, but the identity key isn't usable: {error:?}");
            });
        }
        cli::Command::Init {} => commands::init(config)?,
        cli::Command::Fingerprint { certificate } => commands::fingerprint(&certificate)?,
        cli::Command::ClientCert(command) => commands::client_cert(command, config)?,
        cli::Command::Revoke(command) => commands::revoke(command, &config)?,
        cli::Command::Trust(command) => commands::trust(command, &config)?,
        cli::Command::CheckRenewal {} => commands::check_renewal(config)?,
    };

    Ok(())
}
