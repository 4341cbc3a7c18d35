// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

mod builder;
mod cli;
mod config;
mod exit_codes;
mod logging;

use std::{process, sync::Arc};

use clap::Parser;
use log::*;
use sable_shutdown::Shutdown;

use crate::{
    cli::Cli,
    config::ApplicationConfig,
    exit_codes::{ExitCode, ExitError},
};

const LOG_TARGET: &str = "sable::node::app";

fn main() {
    if let Err(err) = main_inner() {
        eprintln!("{}", err);
        if let Some(hint) = err.code.hint() {
            eprintln!();
            eprintln!("{}", hint);
        }
        error!(target: LOG_TARGET, "Exiting with code {}: {}", err.code, err.details);
        process::exit(err.code as i32);
    }
}

fn main_inner() -> Result<(), ExitError> {
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.base_path)
        .map_err(|e| ExitError::new(ExitCode::ConfigError, format!("cannot create the base path: {}", e)))?;
    logging::initialize(&cli.base_path.join("log").join("sable_node.log"))?;

    info!(
        target: LOG_TARGET,
        "Starting Sable node v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = ApplicationConfig::load_from(&cli.config_path())?;
    cli.apply_overrides(&mut config);
    debug!(target: LOG_TARGET, "Using configuration: {:?}", config);

    let shutdown = Arc::new(Shutdown::new());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ExitError::new(ExitCode::FatalRuntimeError, e))?;
    runtime.block_on(builder::run_node(config, shutdown))?;

    info!(target: LOG_TARGET, "Sable node shut down cleanly");
    Ok(())
}
