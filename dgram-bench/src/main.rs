use dgram_bench::StopSignal;
use dgram_bench::client::launch;
use dgram_bench::config::{ClientCLI, TransportKind};
use dgram_bench::directory::{Directory, DirectoryServer, MemoryDirectory, TcpDirectory};
use dgram_bench::identity::{EndpointName, Role};
use dgram_bench::transport::{LoopbackFabric, LoopbackProvider, UdpProvider};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::{io, process};
use tracing::level_filters::LevelFilter;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Pipelined datagram request/response benchmark client.")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, default_value_t = Level::INFO)]
    log: Level,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run this machine's client threads.
    Client(ClientCLI),
    /// Serve the endpoint directory clients and servers rendezvous through.
    Directory {
        #[arg(long, default_value_t = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 18515))]
        listen: SocketAddr,
    },
}

fn main() {
    let args: Args = clap::Parser::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(args.log).into())
                .from_env_lossy(),
        )
        .with_thread_names(true)
        .compact()
        .init();

    let result = match args.command {
        Command::Client(cli) => run_client(cli),
        Command::Directory { listen } => DirectoryServer::bind(listen).and_then(|s| s.serve()),
    };
    if let Err(e) = result {
        error!(error = %e, kind = ?e.kind(), "Benchmark failed");
        process::exit(1);
    }
}

fn run_client(cli: ClientCLI) -> io::Result<()> {
    let config = cli.bench_config()?;
    info!(?config, transport = ?cli.transport, "Starting clients");

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            stop.stop();
        })
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to install signal handler: {}", e),
            )
        })?;
    }

    let round_trips = match cli.transport {
        TransportKind::Udp => {
            let provider = UdpProvider::new(cli.interfaces.clone())
                .with_base_port(cli.base_port)
                .with_queue_key(config.queue_key);
            let directory = TcpDirectory::new(cli.directory);
            launch(config, Arc::new(provider), Arc::new(directory), stop)?
        }
        TransportKind::Loopback => {
            let fabric = LoopbackFabric::new();
            let directory = MemoryDirectory::new();
            for server in 0..config.server_threads {
                let info = fabric.add_reflector(config.queue_key);
                directory.publish(&EndpointName::new(Role::Server, server), &info)?;
            }
            let provider = LoopbackProvider::new(fabric).with_queue_key(config.queue_key);
            launch(config, Arc::new(provider), Arc::new(directory), stop)?
        }
    };

    info!(round_trips, "All clients stopped");
    Ok(())
}
