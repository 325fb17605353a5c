//! Natbox main binary

pub mod app;
pub mod config;

use std::path::PathBuf;

use app::App;
use clap::{Parser, Subcommand, ValueEnum};

/// Path to the default configuration file
const DEFAULT_CONFIG_FILE: &str = "/etc/natbox.yml";

/// Command line options
#[derive(Debug, Parser)]
#[command(version, author, about)]
struct Opts {
    /// Controls the verbosity/logging level (-v, -vv, -vvv)
    #[clap(short, long, global=true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[clap(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Command to execute
    #[clap(subcommand)]
    cmd: Command,
}

/// Which side of the NAT a packet arrives from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    /// Internal network towards the outside
    Outgoing,

    /// Outside towards the internal network
    Incoming,

    /// Incoming if addressed to the external address, outgoing otherwise
    Auto,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replays a capture through the NAT table and writes the translated packets
    Translate {
        /// Capture to read (ethernet or raw ipv4 link type)
        #[clap(short, long)]
        input: PathBuf,

        /// Capture to write, same link type as the input
        #[clap(short, long)]
        output: PathBuf,

        /// Direction applied to every packet
        #[clap(short, long, value_enum, default_value_t = Direction::Auto)]
        direction: Direction,

        /// Reassemble fragmented datagrams before translating them
        #[clap(long)]
        reassemble: bool,

        /// Fragment translated datagrams larger than this many bytes
        #[clap(long)]
        mtu: Option<usize>,
    },

    /// Prints the ipv4 packets contained in a capture
    Dump {
        /// Capture to read
        input: PathBuf,

        /// Print one json record per line instead of a table
        #[clap(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    natbox_core::init_tracing(opts.verbose);

    let app = App::new(opts.config);
    app.run(opts.cmd)?;

    Ok(())
}
