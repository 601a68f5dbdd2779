use std::{error::Error, net::IpAddr, path::PathBuf, process};

use clap::Parser;
use log::info;
use rankwire::{Node, NodeConfig, ProcessGroup, TransportConfig, protocol::DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Newline delimited list of participating hosts; line index is rank
    #[arg(long, default_value = "host_file")]
    hostfile: PathBuf,
    /// Port to listen on and to dial peers at
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    /// Use this name instead of the machine hostname to find our rank
    #[arg(long)]
    hostname: Option<String>,
    /// Message rank 0 sends to every other rank
    #[arg(long, default_value = "The quick red fox jumps over the lazy dog")]
    message: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    ctrlc::set_handler(|| {
        eprintln!("interrupted");
        process::exit(130);
    })?;

    let cli = Cli::parse();
    let group = ProcessGroup::from_hostfile(&cli.hostfile)?;
    let config = NodeConfig {
        transport: TransportConfig {
            bind_addr: cli.bind,
            port: cli.port,
        },
        hostname: cli.hostname,
    };

    let mut node = Node::bind(group, &config)?;
    info!("rank {} of {}", node.rank(), node.size());
    node.initialize()?;

    let message = cli.message.into_bytes();
    if node.rank() == 0 {
        for dest in 1..node.size() {
            node.send(&message, message.len(), dest, 0)?;
            info!("sent {} bytes to rank {dest}", message.len());
        }
    } else {
        let mut buf = Vec::new();
        let status = node.receive(&mut buf, message.len(), 0, 0)?;
        info!("received {status:?}");
        println!("{}", String::from_utf8_lossy(&buf));
    }

    node.finalize()?;
    Ok(())
}
