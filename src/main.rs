// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use serde::Serialize;
use vmm::config::VmmConfig;
use vmm::partition::BarSizing;
use vmm::{Vmm, VmmSummary};

#[derive(Serialize)]
struct SizingReport {
    partition: u16,
    #[serde(flatten)]
    bar: BarSizing,
}

#[derive(Serialize)]
struct LaunchReport {
    version: &'static str,
    #[serde(flatten)]
    vmm: VmmSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    bars: Option<Vec<SizingReport>>,
}

fn create_app() -> Command {
    Command::new("stshmem-hv")
        // 'BUILD_VERSION' is set by the build script 'build.rs' at
        // compile time
        .version(env!("BUILD_VERSION"))
        .about("Boot partitions sharing synchronized-time memory devices.")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to the JSON host configuration")
                .num_args(1)
                .value_parser(clap::value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of debugging output"),
        )
        .arg(
            Arg::new("size-bars")
                .long("size-bars")
                .action(ArgAction::SetTrue)
                .help("Size the shared memory BAR of every device, as a guest would"),
        )
}

fn log_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn start(cmd_arguments: &ArgMatches) -> anyhow::Result<LaunchReport> {
    let config_path = cmd_arguments
        .get_one::<PathBuf>("config")
        .context("Missing --config")?;
    let config = VmmConfig::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let mut vmm = Vmm::new(config).context("Failed to set up the host")?;
    vmm.boot().context("Failed to boot partitions")?;

    let bars = if cmd_arguments.get_flag("size-bars") {
        let bars = vmm.size_all_bars().context("Failed to size device BARs")?;
        Some(
            bars
                .into_iter()
                .map(|(partition, bar)| SizingReport { partition, bar })
                .collect(),
        )
    } else {
        None
    };

    let report = LaunchReport {
        version: env!("BUILD_VERSION"),
        vmm: vmm.summary(),
        bars,
    };

    vmm.shutdown().context("Failed to shut partitions down")?;
    Ok(report)
}

fn main() {
    let cmd_arguments = create_app().get_matches();

    let verbosity = cmd_arguments.get_count("v");
    env_logger::Builder::new()
        .filter_level(log_level(verbosity))
        .parse_default_env()
        .init();

    let exit_code = match start(&cmd_arguments) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(output) => {
                println!("{output}");
                0
            }
            Err(e) => {
                error!("Failed to serialize the summary: {e}");
                1
            }
        },
        Err(top_error) => {
            error!("{top_error:?}");
            eprintln!("Error: {top_error:#}");
            1
        }
    };

    process::exit(exit_code);
}
