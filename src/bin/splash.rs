//! Developer-facing CLI: init a project's controller connection, inspect
//! cluster state, and request builds.

use clap::{Parser, Subcommand};
use splash::config::{ClientConfig, ClientIdentity, ServerConfig};
use splash_proto::{ClientType, InfoKind, Message};
use std::net::TcpStream;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "splash", about = "Splash developer client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Writes `.splash/config.yml` pointing at a controller.
    Init {
        host: String,
        #[arg(long, default_value_t = 49000)]
        port: u16,
    },
    ListArches,
    ListClients,
    ListConfigs,
    ListTargets,
    ListToolchains,
    DumpGraph,
    Build {
        target: String,
        arch: String,
        config: String,
        #[arg(long)]
        rebuild: bool,
    },
}

fn config_path() -> splash::Result<PathBuf> {
    Ok(splash::cache::splash_home_dir()?.join("config.yml"))
}

fn connect(cfg: &ClientConfig) -> splash::Result<TcpStream> {
    let mut stream = TcpStream::connect((cfg.server.host.as_str(), cfg.server.port))?;
    splash_proto::write_message(
        &mut stream,
        &Message::ClientHello {
            magic: splash_proto::PROTOCOL_MAGIC,
            version: splash_proto::PROTOCOL_VERSION,
            client_type: ClientType::Developer,
            hostname: hostname(),
            uuid: Some(cfg.client.uuid.to_string()),
        },
    )?;
    match splash_proto::read_message(&mut stream)? {
        Some(Message::ServerHello { magic, version }) if magic == splash_proto::PROTOCOL_MAGIC && version == splash_proto::PROTOCOL_VERSION => {}
        other => return Err(splash::Error::from(format!("handshake failed: {:?}", other))),
    }
    Ok(stream)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "devbox".to_owned())
}

fn info_request(stream: &mut TcpStream, kind: InfoKind) -> splash::Result<Message> {
    splash_proto::write_message(stream, &Message::InfoRequest { kind, query: None })?;
    splash_proto::read_message(stream)?.ok_or_else(|| splash::Error::from("connection closed before response"))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> splash::Result<()> {
    if let Command::Init { host, port } = cli.command {
        let cfg = ClientConfig { server: ServerConfig { host, port }, client: ClientIdentity::default() };
        cfg.save(&config_path()?)?;
        println!("wrote {}", config_path()?.display());
        return Ok(());
    }

    let cfg = ClientConfig::load(&config_path()?)?;
    let mut stream = connect(&cfg)?;

    match cli.command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::ListArches => match info_request(&mut stream, InfoKind::Arch)? {
            Message::ArchList { arches } => arches.iter().for_each(|a| println!("{}", a)),
            other => return Err(splash::Error::from(format!("unexpected response: {:?}", other))),
        },
        Command::ListClients => match info_request(&mut stream, InfoKind::Client)? {
            Message::ClientList { clients } => clients.iter().for_each(|c| println!("{} ({:?})", c.hostname, c.client_type)),
            other => return Err(splash::Error::from(format!("unexpected response: {:?}", other))),
        },
        Command::ListConfigs => match info_request(&mut stream, InfoKind::Config)? {
            Message::ConfigList { configs } => configs.iter().for_each(|c| println!("{}", c)),
            other => return Err(splash::Error::from(format!("unexpected response: {:?}", other))),
        },
        Command::ListTargets => match info_request(&mut stream, InfoKind::Target)? {
            Message::TargetList { targets } => targets.iter().for_each(|t| println!("{}/{}/{}", t.name, t.arch, t.config)),
            other => return Err(splash::Error::from(format!("unexpected response: {:?}", other))),
        },
        Command::ListToolchains => match info_request(&mut stream, InfoKind::Toolchain)? {
            Message::ToolchainList { toolchains } => toolchains.iter().for_each(|t| println!("{} ({:?}, {})", t.hash, t.kind, t.version)),
            other => return Err(splash::Error::from(format!("unexpected response: {:?}", other))),
        },
        Command::DumpGraph => match info_request(&mut stream, InfoKind::Node)? {
            Message::NodeList { nodes } => nodes.iter().for_each(|n| println!("{} {} {} {}/{}", n.hash, n.kind, n.name, n.arch, n.config)),
            other => return Err(splash::Error::from(format!("unexpected response: {:?}", other))),
        },
        Command::Build { target, arch, config, rebuild } => {
            splash_proto::write_message(&mut stream, &Message::BuildRequest { target, arch, config, rebuild })?;
            match splash_proto::read_message(&mut stream)?.ok_or_else(|| splash::Error::from("connection closed before build results"))? {
                Message::BuildResults { status, results } => {
                    for r in &results {
                        if !r.log.is_empty() {
                            println!("{}", r.log);
                        }
                    }
                    if !status {
                        std::process::exit(1);
                    }
                }
                other => return Err(splash::Error::from(format!("unexpected response: {:?}", other))),
            }
        }
    }

    Ok(())
}
