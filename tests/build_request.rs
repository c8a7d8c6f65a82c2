//! Scenarios B, C and D: a successful build, a missing-source failure,
//! and oid-based de-duplication of identical targets.

use splash::cache::ObjectCache;
use splash::ids::WorkerId;
use splash::job::{BuildOutcome, Outcome, Payload, ScanOutcome};
use splash::registry::Registry;
use splash::scheduler::Scheduler;
use splash::session::{self, ControllerContext};
use splash::workingcopy::WorkingCopy;
use splash_proto::{ClientType, CompilerInfo, Message, ToolchainKind, VersionTriple};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const GCC_HASH: &str = "gcchash";
const WORKER: WorkerId = WorkerId(1);

fn gcc_info() -> CompilerInfo {
    CompilerInfo {
        hash: GCC_HASH.to_owned(),
        kind: ToolchainKind::Gnu,
        version: VersionTriple { major: 9, minor: 0, patch: 0 },
        version_string: "gcc 9.0.0".into(),
        languages: vec!["c++".into()],
        triplets: vec!["x86_64-linux-gnu".into()],
        compiler_names: vec!["g++".into(), "c++".into()],
        affixes: vec![],
    }
}

struct Fixture {
    ctx: Arc<ControllerContext>,
    _tmp: TempDir,
    stop: Arc<AtomicBool>,
    worker_thread: thread::JoinHandle<()>,
}

impl Fixture {
    fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.ctx.scheduler.notify_waiters();
        self.worker_thread.join().unwrap();
    }
}

/// Builds a controller context with one registered GCC toolchain and a
/// background thread that plays the worker side of the scheduler protocol
/// without any real compiler invocation -- every build "succeeds" and
/// writes a fixed payload into the cache.
fn start_fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(ObjectCache::open_at(tmp.path().join("cache"), None).unwrap());
    let registry = Arc::new(Registry::new());
    registry.add_toolchain(WORKER, gcc_info(), false);
    let scheduler = Arc::new(Scheduler::new(registry.clone()));
    scheduler.register_worker(WORKER);
    let working_copy = Arc::new(WorkingCopy::new(registry.clone()));
    let ctx = Arc::new(ControllerContext::new(cache, registry, scheduler, working_copy));

    let stop = Arc::new(AtomicBool::new(false));
    let worker_thread = {
        let ctx = ctx.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if let Some(job) = ctx.scheduler.pop_scan_job(WORKER) {
                    job.set_results(Outcome::Scan(ScanOutcome { ok: true, stdout: String::new(), deps: vec![], libflags: vec![] }));
                    ctx.scheduler.mark_done(WORKER, &job);
                    continue;
                }
                if let Some(job) = ctx.scheduler.pop_build_job(WORKER) {
                    let b = match &*job.payload {
                        Payload::Build(b) => b,
                        _ => unreachable!(),
                    };
                    ctx.cache.add(&b.output_path, &b.node_hash, &splash::cache::content_hash(b"built"), b"built", "build ok").unwrap();
                    job.set_results(Outcome::Build(BuildOutcome {
                        success: true,
                        stdout: String::new(),
                        outputs: vec![(b.output_path.clone(), b"built".to_vec())],
                    }));
                    ctx.scheduler.mark_done(WORKER, &job);
                    continue;
                }
                ctx.scheduler.wait_poll(Duration::from_millis(20));
            }
        })
    };

    Fixture { ctx, _tmp: tmp, stop, worker_thread }
}

fn handshake(stream: &mut TcpStream) {
    splash_proto::write_message(
        stream,
        &Message::ClientHello {
            magic: splash_proto::PROTOCOL_MAGIC,
            version: splash_proto::PROTOCOL_VERSION,
            client_type: ClientType::Developer,
            hostname: "devbox".into(),
            uuid: None,
        },
    )
    .unwrap();
    assert!(matches!(splash_proto::read_message(stream).unwrap(), Some(Message::ServerHello { .. })));
}

fn push(client: &mut TcpStream, fname: &str, data: &[u8]) {
    splash_proto::write_message(
        client,
        &Message::BulkFileChanged {
            entries: vec![splash_proto::FileChangeEntry {
                fname: fname.to_owned(),
                hash: splash::cache::content_hash(data),
                data: Some(data.to_vec()),
            }],
        },
    )
    .unwrap();
    assert!(matches!(splash_proto::read_message(client).unwrap(), Some(Message::BulkFileAck { .. })));
}

fn build(client: &mut TcpStream, target: &str, arch: &str, config: &str) -> (bool, String) {
    splash_proto::write_message(
        client,
        &Message::BuildRequest { target: target.to_owned(), arch: arch.to_owned(), config: config.to_owned(), rebuild: false },
    )
    .unwrap();
    match splash_proto::read_message(client).unwrap() {
        Some(Message::BuildResults { status, results }) => (status, results[0].log.clone()),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[test]
fn builds_a_declared_target_successfully() {
    let fixture = start_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = fixture.ctx.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        session::handle_connection(&ctx, &mut stream).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    handshake(&mut client);
    push(
        &mut client,
        "/build.yml",
        b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [release]\nhello:\n  toolchain: c++\n  sources: [main.c]\n",
    );
    push(&mut client, "/main.c", b"int main(){}");

    let (status, log) = build(&mut client, "hello", "x86_64-linux-gnu", "release");
    assert!(status);
    assert_eq!(log, "build ok");

    drop(client);
    server.join().unwrap();
    fixture.shutdown();
}

#[test]
fn missing_source_is_reported_by_name() {
    let fixture = start_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = fixture.ctx.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        session::handle_connection(&ctx, &mut stream).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    handshake(&mut client);
    push(
        &mut client,
        "/build.yml",
        b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [release]\nhello:\n  toolchain: c++\n  sources: [does_not_exist.c]\n",
    );

    let (status, log) = build(&mut client, "hello", "x86_64-linux-gnu", "release");
    assert!(!status);
    assert!(log.contains("No file named /does_not_exist.c in working copy"), "log was: {}", log);

    drop(client);
    server.join().unwrap();
    fixture.shutdown();
}

#[test]
fn identical_targets_dedupe_to_one_build_job() {
    let fixture = start_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = fixture.ctx.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        session::handle_connection(&ctx, &mut stream).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    handshake(&mut client);
    push(
        &mut client,
        "/build.yml",
        b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [release]\na:\n  toolchain: c++\n  sources: [main.c]\nb:\n  toolchain: c++\n  sources: [main.c]\n",
    );
    push(&mut client, "/main.c", b"int main(){}");

    let (status_a, _) = build(&mut client, "a", "x86_64-linux-gnu", "release");
    let (status_b, _) = build(&mut client, "b", "x86_64-linux-gnu", "release");
    assert!(status_a);
    assert!(status_b);

    // Both targets have identical dependency/flag/toolchain/arch multisets,
    // so they finalize to the same oid and the second build was served
    // straight out of the cache without a second job ever reaching the
    // worker thread's build branch.
    let (hash_a, hash_b) = fixture.ctx.working_copy.with_graph(|g| {
        let a = g.find_target("a", "x86_64-linux-gnu", "release").and_then(|id| g.node(id)).map(|n| n.hash.clone());
        let b = g.find_target("b", "x86_64-linux-gnu", "release").and_then(|id| g.node(id)).map(|n| n.hash.clone());
        (a, b)
    });
    assert_eq!(hash_a, hash_b);
    assert!(fixture.ctx.cache.is_cached(&hash_a.unwrap()));

    drop(client);
    server.join().unwrap();
    fixture.shutdown();
}
