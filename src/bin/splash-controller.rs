//! The controller binary: accepts workstation and worker TCP connections
//! and runs one session thread per connection against shared state.

use clap::Parser;
use splash::cache::ObjectCache;
use splash::registry::Registry;
use splash::scheduler::Scheduler;
use splash::session::{self, ControllerContext};
use splash::workingcopy::WorkingCopy;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

#[derive(Parser)]
#[command(name = "splash-controller", about = "Splash distributed build cluster controller")]
struct Args {
    #[arg(long, default_value_t = 49000)]
    port: u16,

    /// Object cache namespace; lets multiple controllers share a host
    /// without colliding cache directories.
    #[arg(long, default_value = "default")]
    cache_name: String,

    /// Soft eviction threshold in bytes; omit to disable eviction.
    #[arg(long)]
    cache_byte_budget: Option<u64>,
}

fn main() -> splash::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cache = Arc::new(ObjectCache::open(&args.cache_name, args.cache_byte_budget)?);
    let registry = Arc::new(Registry::new());
    let scheduler = Arc::new(Scheduler::new(registry.clone()));
    let working_copy = Arc::new(WorkingCopy::new(registry.clone()));
    let ctx = Arc::new(ControllerContext::new(cache, registry, scheduler, working_copy));

    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    log::info!("listening on 0.0.0.0:{}", args.port);

    for incoming in listener.incoming() {
        let mut stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let ctx = ctx.clone();
        thread::spawn(move || {
            let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_owned());
            if let Err(e) = session::handle_connection(&ctx, &mut stream) {
                log::warn!("session with {} ended: {}", peer, e);
            }
        });
    }

    Ok(())
}
