//! The worker binary: advertises its installed toolchains to a
//! controller, then services `DependencyScan`/`NodeBuildRequest` jobs
//! until the connection drops.
//!
//! Sources and outputs are addressed as paths under `--workdir`, which is
//! expected to be the same tree the developer client is syncing (a
//! shared or mirrored filesystem, as in a typical compile-farm
//! deployment); this worker does not itself fetch file bytes over the
//! wire.

use clap::Parser;
use splash::cache::content_hash;
use splash::toolchain::gnu::GnuToolchain;
use splash::toolchain::ToolchainAdapter;
use splash_proto::{BuildOutput, ClientType, DepEntry, Message};
use std::net::TcpStream;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "splash-worker", about = "Splash build worker")]
struct Args {
    #[arg(long)]
    host: String,

    #[arg(long, default_value_t = 49000)]
    port: u16,

    /// Target triplet this worker builds for, e.g. `x86_64-linux-gnu`.
    #[arg(long)]
    arch: String,

    #[arg(long, default_value = ".")]
    workdir: PathBuf,
}

fn main() -> splash::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let adapter = GnuToolchain::discover(&args.arch)
        .ok_or_else(|| splash::Error::from(format!("no GNU-family toolchain found for {}", args.arch)))?;
    let info = adapter.probe().ok_or_else(|| splash::Error::from("toolchain probe failed"))?;

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))?;
    splash_proto::write_message(
        &mut stream,
        &Message::ClientHello {
            magic: splash_proto::PROTOCOL_MAGIC,
            version: splash_proto::PROTOCOL_VERSION,
            client_type: ClientType::Build,
            hostname: hostname(),
            uuid: None,
        },
    )?;
    match splash_proto::read_message(&mut stream)? {
        Some(Message::ServerHello { magic, version }) if magic == splash_proto::PROTOCOL_MAGIC && version == splash_proto::PROTOCOL_VERSION => {}
        other => return Err(splash::Error::from(format!("handshake failed: {:?}", other))),
    }

    splash_proto::write_message(
        &mut stream,
        &Message::BuildInfo { cpu_count: num_cpus::get() as u32, cpu_speed_mhz: 0, ram_mb: 0, num_chains: 1 },
    )?;
    splash_proto::write_message(&mut stream, &Message::AddCompiler(info))?;

    log::info!("connected to {}:{}, serving {}", args.host, args.port, args.arch);

    loop {
        let msg = match splash_proto::read_message(&mut stream)? {
            Some(m) => m,
            None => {
                log::info!("controller closed the connection");
                return Ok(());
            }
        };

        match msg {
            Message::DependencyScan { fname, arch, toolchain: _, flags } => {
                let result = adapter.scan(&fname, &arch, &flags, &args.workdir);
                splash_proto::write_message(
                    &mut stream,
                    &Message::DependencyResults {
                        ok: result.ok,
                        stdout: result.stdout,
                        deps: result.deps.into_iter().map(|(fname, hash)| DepEntry { fname, hash }).collect(),
                        libflags: result.libflags,
                    },
                )?;
            }
            Message::NodeBuildRequest { node_hash, fname, toolchain: _, toolchain_hash: _, arch, flags, sources, stage } => {
                let source_paths: Vec<PathBuf> = sources.iter().map(|d| args.workdir.join(&d.fname)).collect();
                let outcome = adapter.build(&stage, &arch, &flags, &source_paths, std::path::Path::new(&fname), &args.workdir);
                let outputs = outcome
                    .outputs
                    .into_iter()
                    .map(|(path, data)| BuildOutput { fname: path.to_string_lossy().into_owned(), hash: content_hash(&data), data })
                    .collect();
                splash_proto::write_message(
                    &mut stream,
                    &Message::NodeBuildResults { node_hash, success: outcome.success, stdout: outcome.stdout, fname, outputs },
                )?;
            }
            other => log::warn!("unexpected message from controller: {:?}", other),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_owned())
}
