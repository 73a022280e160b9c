//! LiteIPC demo binary
//!
//! `echo` runs the registry, an echo server and a client as threads over the
//! in-process driver. `probe` opens the real character device and reports
//! the driver version.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;

use liteipc::{console, IpcClient, IpcConfig, IpcError, Outcome, Registry, SimKernel};

/// Echo service request codes
const ECHO: u32 = 1;
const ECHO_STOP: u32 = 2;

#[derive(Parser)]
#[command(name = "liteipc-demo")]
#[command(about = "LiteIPC message passing and service registry demo", long_about = None)]
struct Cli {
    /// Call timeout in milliseconds (overrides LITEIPC_CALL_TIMEOUT_MS)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register an echo service and call it through the registry
    Echo {
        /// Payload to send
        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Number of calls
        #[arg(short, long, default_value_t = 3)]
        rounds: u32,
    },
    /// Open the driver device and print its version
    Probe {
        /// Device path
        #[arg(long, default_value = liteipc::ipc::LITEIPC_DRIVER)]
        device: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        console::init(log::LevelFilter::Debug);
    } else {
        console::init_from_env();
    }

    let mut config = IpcConfig::from_env()?;
    if let Some(ms) = cli.timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
        config.validate()?;
    }

    match cli.command {
        Command::Echo { message, rounds } => run_echo(config, &message, rounds)?,
        Command::Probe { device } => probe(config, device)?,
    }
    Ok(())
}

fn run_echo(config: IpcConfig, message: &str, rounds: u32) -> liteipc::Result<()> {
    let kernel = SimKernel::with_config(&config);

    let mut registry = Registry::new(kernel.open_task()?, config);
    registry.elect()?;
    let control = registry.controller();
    let cms = thread::spawn(move || registry.run());

    let server = IpcClient::new(kernel.open_task()?, config);
    let identity = server.register_service("echo")?;
    info!(target: "liteipc::demo", "echo registered as handle {}", identity.handle);
    let echo = thread::spawn(move || {
        server.serve_loop(|msg| match msg.code() {
            ECHO_STOP => Outcome::Stop,
            _ => Outcome::Reply(msg.payload().to_vec()),
        })
    });

    let client = IpcClient::new(kernel.open_task()?, config);
    let target = client.lookup_service("echo")?;
    for round in 1..=rounds {
        let reply = client.call_owned(target, ECHO, message.as_bytes())?;
        println!("[{round}/{rounds}] {}", String::from_utf8_lossy(&reply));
    }

    client.call_owned(target, ECHO_STOP, Vec::new())?;
    control.stop_registry()?;

    echo.join().map_err(|_| IpcError::invalid("echo server panicked"))??;
    cms.join().map_err(|_| IpcError::invalid("registry panicked"))??;
    kernel.shutdown();
    Ok(())
}

#[cfg(unix)]
fn probe(config: IpcConfig, device: PathBuf) -> liteipc::Result<()> {
    use liteipc::ipc::device::DeviceTransport;
    use liteipc::Transport;

    let transport = DeviceTransport::open(&device)?;
    transport.map_pool(config.pool_size)?;
    let version = transport.driver_version()?;
    println!("{}: driver version {}.{}", device.display(), version.major, version.minor);
    Ok(())
}

#[cfg(not(unix))]
fn probe(_config: IpcConfig, device: PathBuf) -> liteipc::Result<()> {
    Err(IpcError::DeviceUnavailable(format!(
        "{}: no driver on this platform",
        device.display()
    )))
}
