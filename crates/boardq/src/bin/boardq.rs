use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use boardq::common::config::OrchestratorConfig;
use boardq::common::setup::setup_logging;
use boardq::machine::{HardwareHandle, MachineManager, create_machine_manager};

#[derive(Parser)]
#[command(author, version, about = "Board queue hardware tool")]
struct RootOptions {
    /// Path to the orchestrator configuration
    #[arg(
        long,
        global = true,
        env = "BOARDQ_CONFIG",
        default_value = "boardq.toml",
        value_hint = clap::ValueHint::FilePath
    )]
    config: PathBuf,

    /// Enables debug logging
    #[arg(long, global = true, env = "BOARDQ_DEBUG")]
    debug: bool,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// List the hardware known to the machine manager
    Machines,
    /// Allocate a machine and hold it until interrupted
    Allocate(AllocateOpts),
    /// Allocate a machine and print the physical location of a chip
    WhereIs(WhereIsOpts),
    /// Validate the configuration file
    CheckConfig,
}

#[derive(Parser)]
struct AllocateOpts {
    /// Minimal number of boards
    #[arg(long, default_value_t = 1)]
    boards: u32,
}

#[derive(Parser)]
struct WhereIsOpts {
    #[arg(long, default_value_t = 1)]
    boards: u32,
    /// Chip X coordinate
    #[arg(long)]
    x: u32,
    /// Chip Y coordinate
    #[arg(long)]
    y: u32,
}

fn print_machine(machine: &HardwareHandle) {
    println!(
        "{} (version {}): {}x{} chips, {} board(s){}",
        machine.name,
        machine.version,
        machine.width,
        machine.height,
        machine.boards,
        machine
            .bmp
            .as_ref()
            .map(|bmp| format!(", BMP {bmp}"))
            .unwrap_or_default()
    );
}

async fn command_machines(manager: &Arc<dyn MachineManager>) -> anyhow::Result<()> {
    let machines = manager.get_machines().await?;
    if machines.is_empty() {
        println!("No machines");
    }
    for machine in &machines {
        print_machine(machine);
    }
    Ok(())
}

async fn command_allocate(
    manager: &Arc<dyn MachineManager>,
    opts: AllocateOpts,
) -> anyhow::Result<()> {
    let machine = manager.get_next_available_machine(opts.boards).await?;
    print_machine(&machine);
    log::info!("Holding {machine}, press Ctrl-C to release it");

    let mut changed = false;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Cannot listen for Ctrl-C")?;
                break;
            }
            lost = manager.wait_for_machine_state_change(&machine, std::time::Duration::from_secs(60)) => {
                if lost && !manager.is_machine_available(&machine) {
                    log::warn!("Machine {machine} was taken away");
                    changed = true;
                    break;
                }
            }
        }
    }
    if !changed {
        manager.release_machine(&machine).await;
        log::info!("Released {machine}");
    }
    Ok(())
}

async fn command_where_is(
    manager: &Arc<dyn MachineManager>,
    opts: WhereIsOpts,
) -> anyhow::Result<()> {
    let machine = manager.get_next_available_machine(opts.boards).await?;
    let result = manager
        .get_chip_coordinates(&machine, opts.x, opts.y)
        .await;
    manager.release_machine(&machine).await;
    let location = result?;
    println!(
        "Chip ({}, {}) of {} is on cabinet {}, frame {}, board {}",
        opts.x, opts.y, machine.name, location.cabinet, location.frame, location.board
    );
    Ok(())
}

fn load_config(opts: &RootOptions) -> anyhow::Result<OrchestratorConfig> {
    OrchestratorConfig::load(&opts.config)
        .with_context(|| format!("Invalid configuration {}", opts.config.display()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.debug);

    let config = load_config(&opts)?;
    if let SubCommand::CheckConfig = opts.subcmd {
        println!("Configuration {} is valid", opts.config.display());
        return Ok(());
    }

    let manager = create_machine_manager(&config.machines)?;
    let result = match opts.subcmd {
        SubCommand::Machines => command_machines(&manager).await,
        SubCommand::Allocate(allocate) => command_allocate(&manager, allocate).await,
        SubCommand::WhereIs(where_is) => command_where_is(&manager, where_is).await,
        SubCommand::CheckConfig => Ok(()),
    };
    manager.close().await;

    if let Err(e) = result {
        log::error!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
