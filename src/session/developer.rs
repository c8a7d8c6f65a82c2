//! Developer/UI-role protocol state machine: file sync, build requests,
//! and the informational queries behind the `splash` CLI.

use super::{ClientHelloInfo, ControllerContext};
use crate::errors::*;
use crate::graph::node::{NodeId, Variant};
use crate::job::{Job, Outcome, Payload};
use crate::job::{BuildPayload, Priority};
use splash_proto::{BuildResultEntry, ContentEntry, InfoKind, Message, NodeInfoEntry, TargetInfoEntry};
use std::io::{Read, Write};

pub fn run<S: Read + Write>(ctx: &ControllerContext, stream: &mut S, hello: &ClientHelloInfo) -> Result<()> {
    log::info!("developer {} ({}) connected", hello.hostname, hello.uuid.as_deref().unwrap_or("no-uuid"));

    loop {
        let msg = match splash_proto::read_message(stream)? {
            Some(m) => m,
            None => return Ok(()),
        };

        let response = match msg {
            Message::DevInfo { .. } => None,

            Message::BulkFileChanged { entries } => {
                let mut acks = Vec::with_capacity(entries.len());
                for e in &entries {
                    let have_content = match &e.data {
                        Some(data) => {
                            ctx.working_copy.update(&e.fname, data).map_err(Error::from)?;
                            ctx.working_copy.set_file_owner(&e.fname, &hello.hostname, hello.uuid.as_deref());
                            true
                        }
                        None => ctx.working_copy.get_hash(&e.fname).as_deref() == Some(e.hash.as_str()),
                    };
                    acks.push(splash_proto::FileAckEntry { fname: e.fname.clone(), have_content });
                }
                Some(Message::BulkFileAck { entries: acks })
            }
            Message::FileRemoved { fname } => {
                ctx.working_copy.remove(&fname);
                None
            }
            Message::BulkHashRequest { fnames } => {
                let files = fnames
                    .into_iter()
                    .map(|f| {
                        let hash = ctx.working_copy.get_hash(&f);
                        splash_proto::BulkHashEntry { found: hash.is_some(), hash, fname: f }
                    })
                    .collect();
                Some(Message::BulkHashResponse { files })
            }

            Message::ContentRequestByHash { oids } => {
                let entries = oids
                    .into_iter()
                    .map(|oid| match ctx.cache.read(&oid) {
                        Ok(data) => ContentEntry { hash: oid, found: true, data: Some(data) },
                        Err(_) => ContentEntry { hash: oid, found: false, data: None },
                    })
                    .collect();
                Some(Message::ContentResponse { entries })
            }

            Message::BuildRequest { target, arch, config, rebuild } => Some(run_build_request(ctx, &target, &arch, &config, rebuild)?),

            Message::InfoRequest { kind, query } => Some(run_info_request(ctx, kind, query)),

            other => return Err(Error::from(format!("unexpected message in developer session: {:?}", other))),
        };

        if let Some(response) = response {
            splash_proto::write_message(stream, &response)?;
        }
    }
}

fn stage_for_variant(v: Variant) -> &'static str {
    match v {
        Variant::Object => "compile",
        Variant::HdlNetlist => "synthesize",
        Variant::PhysicalNetlist => "map",
        Variant::FpgaBitstream => "image",
        Variant::Executable | Variant::SharedLibrary => "link",
        Variant::FormalVerification => "proof",
        Variant::ConstantTable => "generate",
        Variant::SystemLibrary | Variant::SourceFile => "",
    }
}

/// Recursively ensures `id`'s artifact (and every derived dependency's)
/// is in the cache, submitting and waiting on build jobs as needed.
/// Returns whether the artifact ended up READY.
fn ensure_built(ctx: &ControllerContext, id: NodeId) -> Result<bool> {
    let (variant, hash, is_invalid, deps, toolchain_name, toolchain_hash, arch, output_path, flags) = ctx.working_copy.with_graph(|g| {
        let n = g.node(id).expect("caller holds a valid node id");
        (
            n.variant,
            n.hash.clone(),
            n.is_invalid(),
            n.dependencies.iter().cloned().collect::<Vec<_>>(),
            n.toolchain_name.clone(),
            n.toolchain_hash.clone(),
            n.arch.clone(),
            n.file_path.clone(),
            n.flags.iter().map(|f| f.as_str().to_owned()).collect::<Vec<_>>(),
        )
    });

    if is_invalid {
        return Ok(false);
    }
    if matches!(variant, Variant::SourceFile | Variant::SystemLibrary) {
        return Ok(true);
    }
    if ctx.cache.is_cached(&hash) {
        return Ok(true);
    }
    if ctx.cache.is_failed(&hash) {
        return Err(Error::from(format!("{} previously failed to build and will not be retried automatically", output_path)));
    }

    let mut sources = Vec::new();
    for dep_path in deps {
        let dep_id = ctx.working_copy.with_graph(|g| g.node_id_by_path(&dep_path));
        let dep_hash = match dep_id {
            Some(did) => {
                if !ensure_built(ctx, did)? {
                    return Ok(false);
                }
                ctx.working_copy.with_graph(|g| g.node(did).map(|n| n.hash.clone())).unwrap_or_default()
            }
            None => match ctx.working_copy.get_hash(&dep_path) {
                Some(h) => h,
                None => return Err(Error::from(format!("No file named {} in working copy", dep_path))),
            },
        };
        sources.push((dep_path, dep_hash));
    }

    let job = Job::new(
        ctx.scheduler.next_job_id(),
        Priority::Normal,
        Payload::Build(BuildPayload {
            node_hash: hash.clone(),
            output_path,
            toolchain_name,
            toolchain_hash: toolchain_hash.clone(),
            arch,
            stage: stage_for_variant(variant).to_owned(),
            flags,
            sources,
        }),
        vec![],
    );

    if ctx.scheduler.submit_job(job.clone(), &toolchain_hash).is_none() {
        return Ok(false);
    }
    if !job.wait_for_completion() {
        return Ok(false);
    }
    match job.take_results() {
        Some(Outcome::Build(b)) => Ok(b.success),
        _ => Ok(false),
    }
}

fn run_build_request(ctx: &ControllerContext, target: &str, arch: &str, config: &str, _rebuild: bool) -> Result<Message> {
    loop {
        let needing_scan = ctx.working_copy.rebuild();
        if needing_scan.is_empty() {
            break;
        }
        for id in needing_scan {
            let (source_path, scan_arch, toolchain_name, toolchain_hash, flags) = ctx.working_copy.with_graph(|g| {
                let n = g.node(id).expect("rebuild returned a live node id");
                let source_path = n.sources.iter().next().cloned().unwrap_or_default();
                (source_path, n.arch.clone(), n.toolchain_name.clone(), n.toolchain_hash.clone(), n.flags.iter().map(|f| f.as_str().to_owned()).collect::<Vec<_>>())
            });
            if let Some(job) = ctx.scheduler.scan_dependencies(&source_path, &scan_arch, &toolchain_name, &toolchain_hash, flags) {
                if let Some(Outcome::Scan(s)) = job.take_results() {
                    ctx.working_copy.set_scanned_dependencies(id, s.deps, s.libflags);
                }
            }
        }
    }

    let node_id = ctx.working_copy.with_graph(|g| g.find_target(target, arch, config));
    let Some(id) = node_id else {
        return Ok(Message::BuildResults {
            status: false,
            results: vec![BuildResultEntry {
                fname: target.to_owned(),
                hash: String::new(),
                log: format!("no target named {} for {}/{}", target, arch, config),
                ok: false,
                sync: false,
            }],
        });
    };

    match ensure_built(ctx, id) {
        Ok(success) => {
            let hash = ctx.working_copy.with_graph(|g| g.node(id).map(|n| n.hash.clone())).unwrap_or_default();
            let log = ctx.cache.read_log(&hash).unwrap_or_default();
            Ok(Message::BuildResults {
                status: success,
                results: vec![BuildResultEntry { fname: target.to_owned(), hash, log, ok: success, sync: true }],
            })
        }
        Err(e) => Ok(Message::BuildResults {
            status: false,
            results: vec![BuildResultEntry { fname: target.to_owned(), hash: String::new(), log: e.to_string(), ok: false, sync: false }],
        }),
    }
}

fn run_info_request(ctx: &ControllerContext, kind: InfoKind, _query: Option<String>) -> Message {
    match kind {
        InfoKind::Toolchain => {
            let toolchains = ctx.registry.all_toolchains().into_iter().map(|d| d.info).collect();
            Message::ToolchainList { toolchains }
        }
        InfoKind::Arch => {
            let mut arches: Vec<String> = ctx.registry.all_toolchains().into_iter().flat_map(|d| d.info.triplets).collect();
            arches.sort_unstable();
            arches.dedup();
            Message::ArchList { arches }
        }
        InfoKind::Config => {
            let mut configs: Vec<String> = ctx.working_copy.with_graph(|g| g.all_targets()).into_iter().map(|(_, _, c)| c).collect();
            configs.sort_unstable();
            configs.dedup();
            Message::ConfigList { configs }
        }
        InfoKind::Target => {
            let targets = ctx
                .working_copy
                .with_graph(|g| g.all_targets())
                .into_iter()
                .map(|(name, arch, config)| TargetInfoEntry { name, arch, config })
                .collect();
            Message::TargetList { targets }
        }
        InfoKind::Node => {
            let nodes = ctx.working_copy.with_graph(|g| {
                g.all_node_ids()
                    .into_iter()
                    .filter_map(|id| g.node(id))
                    .map(|n| NodeInfoEntry {
                        hash: n.hash.clone(),
                        kind: format!("{:?}", n.variant),
                        arch: n.arch.clone(),
                        config: n.config.clone(),
                        name: n.name.clone(),
                        path: n.file_path.clone(),
                        dependencies: n.dependencies.iter().cloned().collect(),
                    })
                    .collect()
            });
            Message::NodeList { nodes }
        }
        InfoKind::Client => Message::ClientList { clients: ctx.working_copy.list_clients() },
    }
}
