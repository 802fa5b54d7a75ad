//! raftkv is a replicated key/value store replica. It is launched with the
//! simulator's loopback port, its own replica ID, and the IDs of its peers,
//! then joins the cluster and serves client get/put requests until killed.

#![warn(clippy::all)]

use raftkv::errinput;
use raftkv::error::Result;
use raftkv::kv::KV;
use raftkv::raft::{Log, UdpTransport};
use raftkv::Server;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A Raft-replicated key/value store replica")
        .arg(
            clap::Arg::new("port")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("Simulator port on localhost"),
        )
        .arg(clap::Arg::new("id").required(true).help("ID of this replica"))
        .arg(
            clap::Arg::new("peers")
                .num_args(0..)
                .help("IDs of the other replicas; none runs a single-replica cluster"),
        )
        .get_matches();

    let port = *args.get_one::<u16>("port").unwrap();
    let id = args.get_one::<String>("id").unwrap().clone();
    let peers: Vec<String> =
        args.get_many::<String>("peers").map(|peers| peers.cloned().collect()).unwrap_or_default();
    if peers.contains(&id) {
        return errinput!("replica {id} can't be its own peer");
    }

    // Diagnostic traces go to a per-replica logfile, since stdout belongs to
    // the simulator.
    let level = std::env::var("RAFTKV_LOG_LEVEL")
        .unwrap_or_else(|_| "info".into())
        .parse::<simplelog::LevelFilter>()?;
    simplelog::WriteLogger::init(
        level,
        simplelog::ConfigBuilder::new().build(),
        std::fs::File::create(format!("{id}.log"))?,
    )?;

    let transport = UdpTransport::new(port)?;
    Server::new(id, peers, Log::new(), Box::new(KV::new()), Box::new(transport))?.serve()
}
