//! `gojs`: run a Go program compiled to `js/wasm` and exit with its status.

use clap::Parser;
use gojs_cli::{Args, RunOptions, run_file};
use gojs_host::log;

#[cfg(not(target_arch = "wasm32"))]
use mimalloc::MiMalloc;
#[cfg(not(target_arch = "wasm32"))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if cfg!(debug_assertions) | cfg!(test) {
        colog::default_builder()
            .filter_level(log::LevelFilter::Trace)
            .init();
    } else {
        colog::default_builder().init();
    }

    let args = Args::parse();
    let file = args.file.to_string_lossy().into_owned();
    let options = RunOptions::from_args(&args);
    let exit = run_file(options, &file).map_err(|e| format!("Failed to run {file}: {e}"))?;
    if !exit.success() {
        std::process::exit(exit.code);
    }
    Ok(())
}
