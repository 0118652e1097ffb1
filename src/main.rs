//! picprog - program PIC16F, PIC18F and PIC32MX parts over USB
//!
//! Operations run in a fixed order: erase, program, id, dump. A failing
//! operation is logged and the next one still runs; the exit status tells
//! whether everything succeeded.

mod cli;

use clap::Parser;
use cli::Cli;
use picprog_rs::{Config, Engine, HexImage, PicprogConnection, Programmer};

use std::process::ExitCode;
use std::time::Duration;

fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let mut ok = true;

    if let Some(path) = &cli.print_hex {
        match HexImage::load(path) {
            Ok(image) => print!("{}", image),
            Err(e) => {
                log::error!("{}", e);
                ok = false;
            }
        }
    }

    if cli.wants_device() {
        if let Err(e) = run(&cli) {
            log::error!("{}", e);
            ok = false;
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Opens the programmer and runs the requested operations. Returns an error
/// if any of them failed.
fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let family = cli
        .family
        .ok_or("a device family (--family) is required for device operations")?;

    // Load the image first so a bad file never touches the target.
    let image = cli.program.as_deref().map(HexImage::load).transpose()?;

    let config = Config {
        print_txrx: cli.rxtx,
        settle_delay: Duration::from_millis(cli.settle_ms),
        idle_limit: cli.idle_limit,
        ..Config::default()
    };

    let ctx = rusb::Context::new()?;
    let conn = PicprogConnection::new(ctx, cli.device, config.clone())?;
    let mut engine = Engine::new(family, conn, config);
    log::info!("Using the {} programmer", engine.family());

    let mut failures = 0;
    let mut report = |what: &str, result: picprog_rs::cmd::Result<()>| {
        if let Err(e) = result {
            log::error!("{} failed: {}", what, e);
            failures += 1;
        }
    };

    if cli.erase {
        report("Erase", engine.erase());
    }
    if let Some(image) = &image {
        report("Program", engine.program(image));
    }
    if cli.id {
        report("Device ID", engine.read_device_id().map(|id| println!("{}", id)));
    }
    if cli.dump {
        report(
            "Dump",
            engine.dump().map(|sections| {
                for section in sections {
                    print!("{}", section);
                }
            }),
        );
    }

    if failures > 0 {
        return Err(format!("{} operation(s) failed", failures).into());
    }
    Ok(())
}
