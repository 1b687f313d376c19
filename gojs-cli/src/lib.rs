//! Runs Go programs compiled with `GOOS=js GOARCH=wasm` outside a browser.

pub mod fileloader;

use std::path::PathBuf;

use gojs_host::{
    BridgeError, Config, ExitRecord, HostState, log,
    runtime::{stdio::ProcessSink, wasm::engine},
};
use thiserror::Error;

#[derive(clap::Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Module to run
    #[clap(value_parser)]
    pub file: PathBuf,

    /// Arguments passed on to the Go program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Set a variable in the program's environment (KEY=VALUE). May be repeated.
    #[arg(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env: Vec<(String, String)>,

    /// Start from the environment of this process. Variables given with --env
    /// take precedence.
    #[arg(long, default_value_t = false)]
    pub inherit_env: bool,

    /// Program name reported as os.Args[0]
    #[arg(long, default_value = "js")]
    pub argv0: String,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] fileloader::Error),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Execution options derived from CLI arguments.
pub struct RunOptions {
    pub config: Config,
}

impl RunOptions {
    /// Convert parsed command line arguments into [`RunOptions`].
    pub fn from_args(args: &Args) -> Self {
        let mut config = Config {
            argv: vec![args.argv0.clone()],
            ..Default::default()
        }
        .with_args(args.args.iter().cloned());
        if args.inherit_env {
            config.env.extend(std::env::vars());
        }
        for (k, v) in &args.env {
            config = config.with_env(k, v);
        }
        Self { config }
    }
}

/// Run `module` to completion, forwarding its output to this process.
pub fn run_module(options: RunOptions, module: &[u8]) -> Result<ExitRecord, BridgeError> {
    let host = HostState::new(options.config).with_sink(ProcessSink);
    let exit = engine::run_bytes(module, host)?;
    log::debug!("guest finished with {}", exit.code);
    Ok(exit)
}

/// Load and run the module at `file`.
pub fn run_file(options: RunOptions, file: &str) -> Result<ExitRecord, Error> {
    let fullpath = fileloader::get_canonical_path(".", file)?;
    let module = fileloader::load_module(&fullpath.to_string_lossy())?;
    Ok(run_module(options, &module)?)
}
