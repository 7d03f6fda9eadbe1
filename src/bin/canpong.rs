// canpong/src/bin/canpong.rs
//
// Command-line ping/pong node.
//
// This file is part of the Rust 'canpong' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Runs one end of the CAN ping/pong integrity test on a Linux SocketCAN
//! interface, or configures the interface for it.
//!
//! ```text
//! $ canpong can0                      # run as the node (0x123/0x124)
//! $ canpong can0 --role peer          # run as the peer (0x223/0x224)
//! $ canpong can0 iface up --bitrate 125000 --restart-ms 100
//! $ canpong can0 iface details
//! ```

use anyhow::{anyhow, Context, Result};
use canpong::{LinkConfig, MonotonicClock, Node, PingPongIds, SocketController};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::{
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

#[cfg(feature = "netlink")]
use canpong::nl::CanCtrlMode;
#[cfg(feature = "netlink")]
use canpong::CanInterface;

// Make the app version the same as the package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// --------------------------------------------------------------------------

/// Log lines to stderr, one per record.
struct ConsoleLogger {
    level: LevelFilter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Info => eprintln!("{}", record.args()),
            lvl => eprintln!("[{}] {}: {}", lvl, record.target(), record.args()),
        }
    }

    fn flush(&self) {}
}

/// Whether a boolean flag was given.
fn flag(opts: &ArgMatches, name: &str) -> bool {
    opts.get_one::<bool>(name).copied().unwrap_or(false)
}

/// The value of an unsigned option, if it was given.
fn uint(opts: &ArgMatches, name: &str) -> Option<u32> {
    opts.get_one::<u32>(name).copied()
}

fn init_logger(opts: &ArgMatches) -> Result<()> {
    let verbose = opts.get_one::<u64>("verbose").copied().unwrap_or(0);
    let level = match (verbose, flag(opts, "quiet")) {
        (_, true) => LevelFilter::Warn,
        (0, _) => LevelFilter::Info,
        (1, _) => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_boxed_logger(Box::new(ConsoleLogger { level }))
        .map_err(|err| anyhow!("Could not install the logger: {}", err))?;
    log::set_max_level(level);
    Ok(())
}

// --------------------------------------------------------------------------

/// Builds the link configuration from the defaults and the command line.
fn link_config(opts: &ArgMatches) -> Result<LinkConfig> {
    let ids = match opts.get_one::<String>("role").map(String::as_str) {
        Some("peer") => PingPongIds::peer(),
        _ => PingPongIds::node(),
    };
    let mut config = LinkConfig::with_ids(ids);

    if let Some(ms) = uint(opts, "ping-period") {
        config.ping_period_ms = ms;
    }
    if let Some(ms) = uint(opts, "timeout") {
        config.activity_timeout_ms = ms;
    }
    if let Some(bitrate) = uint(opts, "bitrate") {
        config.bitrate = bitrate;
    }
    if let Some(hz) = uint(opts, "clock") {
        config.clock_hz = hz;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "netlink")]
fn open_controller(iface_name: &str, opts: &ArgMatches) -> Result<SocketController> {
    let ctrl = if flag(opts, "manage") {
        SocketController::managed(iface_name)
    } else {
        SocketController::open(iface_name)
    };
    ctrl.with_context(|| format!("Could not open '{}'", iface_name))
}

#[cfg(not(feature = "netlink"))]
fn open_controller(iface_name: &str, _opts: &ArgMatches) -> Result<SocketController> {
    SocketController::open(iface_name).with_context(|| format!("Could not open '{}'", iface_name))
}

/// Runs the node until interrupted, then prints the totals.
fn run_cmd(iface_name: &str, opts: &ArgMatches) -> Result<()> {
    let config = link_config(opts)?;
    let ctrl = open_controller(iface_name, opts)?;

    log::info!("{}: {} at {} bit/s", iface_name, config.ids, config.bitrate);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::Relaxed))
        .context("Could not install the interrupt handler")?;

    let mut node = Node::start(ctrl, config, MonotonicClock::new())
        .with_context(|| format!("Could not start the node on '{}'", iface_name))?;
    node.run_until(&stop);

    println!("{}", node.stats());
    Ok(())
}

// --------------------------------------------------------------------------

/// Process the 'iface' subcommand.
///
/// Set parameters on the interface, bring it up or down, or show it.
#[cfg(feature = "netlink")]
fn iface_cmd(iface_name: &str, opts: &ArgMatches) -> Result<()> {
    let iface = CanInterface::open(iface_name)
        .with_context(|| format!("No CAN interface named '{}'", iface_name))?;

    match opts.subcommand() {
        Some(("up", up_opts)) => {
            // Parameters can only be changed while the interface is down
            iface.bring_down()?;
            if let Some(bitrate) = uint(up_opts, "bitrate") {
                // A zero sample point lets the driver pick its default
                iface.set_bitrate(bitrate, 0)?;
            }
            if let Some(ms) = uint(up_opts, "restart-ms") {
                iface.set_restart_ms(ms)?;
            }
            if let Some(len) = uint(up_opts, "txqueuelen") {
                iface.set_txqueuelen(len)?;
            }
            if let Some(on) = up_opts.get_one::<String>("triple-sampling") {
                iface.set_ctrlmode(CanCtrlMode::TripleSampling, on == "on")?;
            }
            iface.bring_up()?;
        }
        Some(("down", _)) => iface.bring_down()?,
        Some(("details", _)) => println!("{}", iface.details()?),
        _ => return Err(anyhow!("Unknown 'iface' subcommand")),
    }
    Ok(())
}

#[cfg(not(feature = "netlink"))]
fn iface_cmd(_iface_name: &str, _opts: &ArgMatches) -> Result<()> {
    Err(anyhow!(
        "The 'netlink' feature is required to configure an interface."
    ))
}

// --------------------------------------------------------------------------

fn main() {
    let uint_arg = |name: &'static str, help: &'static str| {
        Arg::new(name)
            .long(name)
            .takes_value(true)
            .value_name("N")
            .value_parser(value_parser!(u32))
            .help(help)
    };

    let opts = Command::new("canpong")
        .version(VERSION)
        .about("CAN bus ping/pong integrity test node")
        .arg(
            Arg::new("iface")
                .help("The CAN interface to use, like 'can0', 'vcan0', etc")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Log more: -v for debug, -vv for trace"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Only log warnings and errors, whatever -v says"),
        )
        .arg(
            Arg::new("role")
                .long("role")
                .takes_value(true)
                .value_parser(["node", "peer"])
                .default_value("node")
                .help("Which side of the exchange to run"),
        )
        .arg(uint_arg("ping-period", "Milliseconds between pings [1000]"))
        .arg(uint_arg("timeout", "Activity timeout after a send error, in ms [5000]"))
        .arg(uint_arg("bitrate", "Bus bitrate, in bit/s [125000]"))
        .arg(uint_arg("clock", "Controller clock, in Hz [8000000]"))
        .arg(
            Arg::new("manage")
                .long("manage")
                .action(ArgAction::SetTrue)
                .help("Take the interface down and up, and program its bitrate"),
        )
        .subcommand(
            Command::new("iface")
                .about("Get/set parameters on the CAN interface")
                .subcommand(
                    Command::new("up")
                        .about("Bring the interface up, optionally setting parameters")
                        .arg(uint_arg("bitrate", "Bus bitrate, in bit/s"))
                        .arg(uint_arg("restart-ms", "Automatic bus-off restart delay, in ms"))
                        .arg(uint_arg("txqueuelen", "Transmit queue length, in frames"))
                        .arg(
                            Arg::new("triple-sampling")
                                .long("triple-sampling")
                                .takes_value(true)
                                .value_parser(["on", "off"])
                                .help("Sample each bit three times"),
                        ),
                )
                .subcommand(Command::new("down").about("Bring the interface down"))
                .subcommand(Command::new("details").about("Show the interface settings")),
        )
        .get_matches();

    let res = init_logger(&opts).and_then(|_| {
        let iface_name = opts
            .get_one::<String>("iface")
            .ok_or_else(|| anyhow!("Need to specify an interface"))?;

        if let Some(sub_opts) = opts.subcommand_matches("iface") {
            iface_cmd(iface_name, sub_opts)
        } else {
            run_cmd(iface_name, &opts)
        }
    });

    if let Err(err) = res {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}
