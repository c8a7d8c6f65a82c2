//! Worker-role protocol state machine: after the handshake, a build
//! client sends `BuildInfo` + `num_chains` x `AddCompiler`, then services
//! `DependencyScan`/`NodeBuildRequest` jobs the scheduler hands it until
//! it disconnects.

use super::{ClientHelloInfo, ControllerContext};
use crate::cache::content_hash;
use crate::errors::*;
use crate::ids::WorkerId;
use crate::job::{BuildOutcome, Job, Outcome, Payload, ScanOutcome};
use splash_proto::{BulkHashEntry, ContentEntry, DepEntry, Message};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

pub fn run(ctx: &ControllerContext, stream: &mut TcpStream, hello: &ClientHelloInfo) -> Result<()> {
    let worker_id = ctx.alloc_worker_id();
    ctx.scheduler.register_worker(worker_id);
    log::info!("worker {} ({}) connected", worker_id, hello.hostname);

    let result = run_inner(ctx, stream, worker_id);

    ctx.scheduler.remove_node(worker_id);
    log::info!("worker {} disconnected: {:?}", worker_id, result.as_ref().err());
    result
}

fn run_inner(ctx: &ControllerContext, stream: &mut TcpStream, worker_id: WorkerId) -> Result<()> {
    let num_chains = match splash_proto::read_message(stream)?.ok_or_else(|| Error::from("connection closed before BuildInfo"))? {
        Message::BuildInfo { num_chains, .. } => num_chains,
        other => return Err(ErrorKind::BadHandshake(format!("expected BuildInfo, got {:?}", other)).into()),
    };

    for i in 0..num_chains {
        match splash_proto::read_message(stream)?.ok_or_else(|| Error::from("connection closed during toolchain advertisement"))? {
            Message::AddCompiler(info) => {
                let more_coming = i + 1 < num_chains;
                ctx.registry.add_toolchain(worker_id, info, more_coming);
            }
            other => return Err(ErrorKind::BadHandshake(format!("expected AddCompiler, got {:?}", other)).into()),
        }
    }

    loop {
        if let Some(job) = ctx.scheduler.pop_scan_job(worker_id) {
            run_scan(ctx, stream, &job)?;
            ctx.scheduler.mark_done(worker_id, &job);
            continue;
        }
        if let Some(job) = ctx.scheduler.pop_build_job(worker_id) {
            let success = run_build(ctx, stream, &job)?;
            if success {
                ctx.scheduler.mark_done(worker_id, &job);
            } else {
                ctx.scheduler.mark_failed_but_done(worker_id, &job);
            }
            continue;
        }
        if peer_hung_up(stream) {
            return Err(Error::from("worker closed its connection"));
        }
        ctx.scheduler.wait_poll(Duration::from_millis(250));
    }
}

/// Answers a `ContentRequestByHash` out of the object cache.
fn answer_content_request<S: Read + Write>(ctx: &ControllerContext, stream: &mut S, oids: Vec<String>) -> Result<()> {
    let entries = oids
        .into_iter()
        .map(|oid| match ctx.cache.read(&oid) {
            Ok(data) => ContentEntry { hash: oid, found: true, data: Some(data) },
            Err(_) => ContentEntry { hash: oid, found: false, data: None },
        })
        .collect();
    splash_proto::write_message(stream, &Message::ContentResponse { entries })?;
    Ok(())
}

/// Answers a `BulkHashRequest` out of the working copy.
fn answer_bulk_hash_request<S: Read + Write>(ctx: &ControllerContext, stream: &mut S, fnames: Vec<String>) -> Result<()> {
    let files = fnames
        .into_iter()
        .map(|f| {
            let hash = ctx.working_copy.get_hash(&f);
            BulkHashEntry { found: hash.is_some(), hash, fname: f }
        })
        .collect();
    splash_proto::write_message(stream, &Message::BulkHashResponse { files })?;
    Ok(())
}

fn run_scan<S: Read + Write>(ctx: &ControllerContext, stream: &mut S, job: &Job) -> Result<()> {
    let Payload::Scan(p) = &*job.payload else { unreachable!("scan queue only ever holds Scan payloads") };
    splash_proto::write_message(
        stream,
        &Message::DependencyScan { fname: p.source_path.clone(), arch: p.arch.clone(), toolchain: p.toolchain_name.clone(), flags: p.flags.clone() },
    )?;
    loop {
        match splash_proto::read_message(stream)?.ok_or_else(|| Error::from("connection closed during dependency scan"))? {
            Message::ContentRequestByHash { oids } => answer_content_request(ctx, stream, oids)?,
            Message::BulkHashRequest { fnames } => answer_bulk_hash_request(ctx, stream, fnames)?,
            Message::DependencyResults { ok, stdout, deps, libflags } => {
                pull_system_dependencies(ctx, stream, &deps)?;
                job.set_results(Outcome::Scan(ScanOutcome {
                    ok,
                    stdout,
                    deps: deps.into_iter().map(|d| (d.fname, d.hash)).collect(),
                    libflags,
                }));
                return Ok(());
            }
            other => return Err(Error::from(format!("expected DependencyResults, got {:?}", other))),
        }
    }
}

/// Fetches content for any `__sys`-prefixed dependency the cache doesn't
/// already hold, so a later build against these headers doesn't need to
/// go back to the worker that happened to scan them.
fn pull_system_dependencies<S: Read + Write>(ctx: &ControllerContext, stream: &mut S, deps: &[DepEntry]) -> Result<()> {
    let missing: Vec<String> = deps.iter().filter(|d| d.fname.starts_with("__sys") && !ctx.cache.is_cached(&d.hash)).map(|d| d.hash.clone()).collect();
    if missing.is_empty() {
        return Ok(());
    }
    splash_proto::write_message(stream, &Message::ContentRequestByHash { oids: missing })?;
    match splash_proto::read_message(stream)?.ok_or_else(|| Error::from("connection closed during system header fetch"))? {
        Message::ContentResponse { entries } => {
            for e in entries {
                if !e.found {
                    continue;
                }
                let Some(data) = e.data else { continue };
                let basename = deps.iter().find(|d| d.hash == e.hash).map(|d| d.fname.as_str()).unwrap_or(e.hash.as_str());
                ctx.cache.add(basename, &e.hash, &content_hash(&data), &data, "")?;
            }
            Ok(())
        }
        other => Err(Error::from(format!("expected ContentResponse, got {:?}", other))),
    }
}

/// Returns whether the build succeeded (for `mark_done` vs.
/// `mark_failed_but_done`); protocol/I/O failures are still `Err`.
fn run_build<S: Read + Write>(ctx: &ControllerContext, stream: &mut S, job: &Job) -> Result<bool> {
    let Payload::Build(p) = &*job.payload else { unreachable!("build queue only ever holds Build payloads") };
    let sources: Vec<DepEntry> = p.sources.iter().map(|(f, h)| DepEntry { fname: f.clone(), hash: h.clone() }).collect();
    splash_proto::write_message(
        stream,
        &Message::NodeBuildRequest {
            node_hash: p.node_hash.clone(),
            fname: p.output_path.clone(),
            toolchain: p.toolchain_name.clone(),
            toolchain_hash: p.toolchain_hash.clone(),
            arch: p.arch.clone(),
            flags: p.flags.clone(),
            sources,
            stage: p.stage.clone(),
        },
    )?;

    loop {
        match splash_proto::read_message(stream)?.ok_or_else(|| Error::from("connection closed during build"))? {
            Message::ContentRequestByHash { oids } => answer_content_request(ctx, stream, oids)?,
            Message::BulkHashRequest { fnames } => answer_bulk_hash_request(ctx, stream, fnames)?,
            Message::NodeBuildResults { node_hash, success, stdout, fname, outputs } => {
                if success {
                    // The entry matching the node's own output is cached
                    // under its node hash with the job's stdout as the
                    // build log; every other output (e.g. a map file, a
                    // bitstream's accompanying report) is a side artifact
                    // cached under its own content hash.
                    for o in &outputs {
                        if o.fname == fname {
                            ctx.cache.add(&o.fname, &node_hash, &content_hash(&o.data), &o.data, &stdout)?;
                        } else {
                            ctx.cache.add(&o.fname, &o.hash, &content_hash(&o.data), &o.data, "")?;
                        }
                    }
                } else {
                    ctx.cache.add_failed(&fname, &node_hash, &stdout)?;
                }
                job.set_results(Outcome::Build(BuildOutcome {
                    success,
                    stdout,
                    outputs: outputs.into_iter().map(|o| (o.fname, o.data)).collect(),
                }));
                return Ok(success);
            }
            other => return Err(Error::from(format!("expected NodeBuildResults, got {:?}", other))),
        }
    }
}

fn peer_hung_up(stream: &TcpStream) -> bool {
    let mut pfd = libc::pollfd { fd: stream.as_raw_fd(), events: libc::POLLRDHUP, revents: 0 };
    let ret = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, 0) };
    ret > 0 && (pfd.revents & (libc::POLLRDHUP | libc::POLLHUP | libc::POLLERR)) != 0
}
