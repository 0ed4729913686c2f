use std::{env, path::PathBuf, process, thread};

use clap::{Args, Parser, Subcommand};
use driverd::{
    config::DriverdConfig,
    context::AppContext,
    hook::HookManager,
    logger::init_tracing,
    vmm::VirtualMachineManager,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "driverd",
    about = "Runs driver processes and dispatches their messages",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the managers and their drivers until Ctrl-C
    Run(RunArgs),

    /// Load and validate a configuration file
    Check(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Configuration file. Defaults to $DRIVERD_CONFIG or ./driverd.yaml
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn resolve_config(args: &ConfigArgs) -> PathBuf {
    match &args.config {
        Some(path) => path.clone(),
        None => env::var("DRIVERD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./driverd.yaml")),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Check(args) => {
            let path = resolve_config(&args);
            let config = DriverdConfig::load(&path)?;
            println!(
                "{} is valid: {} hook driver(s), {} vm driver(s)",
                path.display(),
                config.hook_manager.drivers.len(),
                config.vm_manager.drivers.len()
            );
            Ok(())
        }
        Commands::Run(args) => {
            if let Err(err) = run(args).await {
                error!("driverd failed: {err:#}");
                eprintln!("driverd failed: {err:#}");
                process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = DriverdConfig::load(&resolve_config(&args.config))?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(dir) = args.log_dir {
        config.log.dir = Some(dir);
    }
    let _guard = init_tracing(&config.log)?;

    info!(drivers_dir = %config.drivers_dir.display(), "driverd starting up");
    let ctx = AppContext::new(config);

    let hooks = HookManager::new(&ctx)?;
    let vms = VirtualMachineManager::new(&ctx)?;
    hooks.start()?;
    if let Err(err) = vms.start() {
        hooks.finalize();
        return Err(err);
    }

    info!("driverd running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    info!("driverd shutting down");

    // both managers shut down in parallel
    let outcomes = thread::scope(|scope| {
        let hook_outcomes = scope.spawn(|| hooks.finalize());
        let mut outcomes = vms.finalize();
        match hook_outcomes.join() {
            Ok(hook_outcomes) => outcomes.extend(hook_outcomes),
            Err(_) => error!("hook manager shutdown panicked"),
        }
        outcomes
    });
    for (driver, outcome) in outcomes {
        info!(%driver, ?outcome, "driver stopped");
    }
    Ok(())
}
