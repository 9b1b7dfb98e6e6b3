#[path = "../bin_common.rs"]
mod common;

use clap::{ArgAction, Parser};
use netdev_collector::console::{render_interfaces, render_qdiscs};
use netdev_collector::{NetlinkSource, StatSource};

#[derive(Parser)]
#[command(name = "netdev-query")]
#[command(about = "Print network interface and qdisc counters once")]
struct Args {
    /// Print per-interface counters
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    netdev: bool,

    /// Print per-qdisc counters
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    qdisc: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_tracing();
    let args = Args::parse();

    let source = NetlinkSource::open()?;

    if args.netdev {
        let interfaces = source.list_interfaces()?;
        print!("{}", render_interfaces(&interfaces));
    }

    if args.qdisc {
        let qdiscs = source.list_qdiscs()?;
        print!("{}", render_qdiscs(&qdiscs));
    }

    Ok(())
}
