// SPDX-License-Identifier: Apache-2.0

//! `fnmeshd`: boots the processor root from a declarative config and runs
//! until `SIGINT`/`SIGTERM`, then drains triggers and sinks before exit.

use clap::Parser;
use fnmesh_config::ProcessorConfig;
use fnmesh_processor::ProcessorRoot;
use fnmesh_trigger::TriggerRegistry;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fnmeshd", about = "Serverless function processor daemon", version)]
struct Args {
    /// Path to the primary processor configuration document.
    #[arg(long, default_value = "/etc/fnmesh/processor.yaml")]
    config: PathBuf,

    /// Optional overlay merged on top of `--config` before parsing.
    #[arg(long)]
    platform_config: Option<PathBuf>,

    /// Print the sorted list of registered handler runtime kinds and exit.
    #[arg(long)]
    list_runtimes: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if args.list_runtimes {
        for kind in ProcessorRoot::list_runtime_kinds() {
            println!("{kind}");
        }
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            print_error_stack(&e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error_stack(e.as_ref());
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ProcessorConfig::load_with_platform_overlay(&args.config, args.platform_config.as_deref())?;

    let mut trigger_registry = TriggerRegistry::new();
    fnmesh_triggers::register_all(&mut trigger_registry);
    let mut sink_registry = fnmesh_sink::SinkRegistry::new();
    fnmesh_sinks::register_all(&mut sink_registry);

    let processor = ProcessorRoot::boot(config, Arc::new(trigger_registry), Arc::new(sink_registry)).await?;

    tracing::info!("fnmeshd started");
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    processor.shutdown(false).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Prints up to 5 frames of `error` and its `source()` chain to stderr, per
/// the CLI's documented exit behavior.
fn print_error_stack(error: &(dyn std::error::Error + 'static)) {
    eprintln!("error: {error}");
    let mut source = error.source();
    let mut frames = 0;
    while let Some(cause) = source {
        frames += 1;
        if frames >= 5 {
            break;
        }
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}
