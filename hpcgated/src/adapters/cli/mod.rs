// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "hpcgated",
    version,
    about = "Pooled SSH execution, scheduler adapters and health probing for HPC clusters",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < HPCGATE_CONFIG_PATH < command-line flags.\n\
If --config is omitted, hpcgated tries HPCGATE_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, hpcgated uses HPCGATE_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "Upper bound for any remote command. Overrides `command_timeout_ceiling_secs` from the config file."
    )]
    pub command_timeout_ceiling_secs: Option<u64>,
    #[arg(
        long,
        value_name = "SECS",
        help = "How long a caller waits for a pooled connection. Overrides `acquire_timeout_secs` from the config file."
    )]
    pub acquire_timeout_secs: Option<u64>,
    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Run one health probe cycle, print the results as JSON and exit."
    )]
    pub once: bool,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

fn parsed_from(matches: &clap::ArgMatches) -> Result<ParsedOpts, clap::Error> {
    let verbose_override = matches.get_flag("verbose").then_some(true);
    let opts = Opts::from_arg_matches(matches)?;
    Ok(ParsedOpts {
        opts,
        verbose_override,
    })
}

pub fn parse_opts() -> ParsedOpts {
    let matches = Opts::command().get_matches();
    parsed_from(&matches).unwrap_or_else(|err| err.exit())
}
