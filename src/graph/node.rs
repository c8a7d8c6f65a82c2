//! Build graph node variants.
//!
//! Modeled as spec.md §9 suggests: a tagged `NodeKind` plays the role the
//! original's class hierarchy played, with `start_finalization`/
//! `finalize`/`build` dispatching on the tag. Edges are stored as working
//! copy *paths*, not pointers or numeric ids -- a path resolves through
//! the working copy's `path -> oid` map to another node in the same
//! graph's `by-hash` index, exactly as spec'd.

use crate::flags::BuildFlag;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    SourceFile,
    Object,
    Executable,
    SharedLibrary,
    ConstantTable,
    HdlNetlist,
    PhysicalNetlist,
    FpgaBitstream,
    FormalVerification,
    SystemLibrary,
}

impl Variant {
    /// Whether this variant owns a `DependencyScanJob` during
    /// finalization (§4.3 "Build Graph — derived variants").
    pub fn is_scanned(&self) -> bool {
        matches!(self, Variant::Object | Variant::HdlNetlist)
    }

    pub fn is_link_time(&self) -> bool {
        matches!(self, Variant::Executable | Variant::SharedLibrary)
    }
}

/// Attributes common to every node variant (spec.md §3 "Build graph node").
pub struct Node {
    pub id: NodeId,
    pub variant: Variant,
    /// Final oid once finalized; a per-object placeholder before that
    /// (distinct from any real oid, per the invariant in §3).
    pub hash: String,
    pub arch: String,
    pub config: String,
    pub name: String,
    pub script_path: String,
    pub file_path: String,
    pub toolchain_name: String,
    pub toolchain_hash: String,
    pub flags: HashSet<BuildFlag>,
    pub dependencies: HashSet<String>,
    pub sources: HashSet<String>,
    pub finalized: bool,
    pub finalization_started: bool,
    /// Whether a dependency scan has populated indirect dependencies for
    /// this node. Only meaningful for `Variant::is_scanned` nodes.
    pub scanned: bool,
    pub invalid_input: Option<String>,
    pub referenced: bool,
    /// Extra per-variant data that doesn't belong on every node.
    pub extra: NodeExtra,
}

#[derive(Default)]
pub struct NodeExtra {
    /// For `ConstantTable`: the generator command used to produce it.
    pub generators: Vec<String>,
    /// For `FpgaBitstream`/boards: the board identifier this instance was
    /// generated for.
    pub board: Option<String>,
    /// Libraries discovered during a dependency scan that could not be
    /// resolved to a `SystemLibrary` node (drives `invalid_input`).
    pub missing_libraries: Vec<String>,
}

impl Node {
    pub fn placeholder_hash(id: NodeId) -> String {
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        ctx.update(b"placeholder");
        ctx.update(&id.0.to_le_bytes());
        hex::encode(ctx.finish().as_ref())
    }

    pub fn new_source_file(id: NodeId, path: &str, hash: &str) -> Node {
        Node {
            id,
            variant: Variant::SourceFile,
            hash: hash.to_owned(),
            arch: "generic".to_owned(),
            config: "generic".to_owned(),
            name: basename(path),
            script_path: String::new(),
            file_path: path.to_owned(),
            toolchain_name: String::new(),
            toolchain_hash: String::new(),
            flags: HashSet::new(),
            dependencies: HashSet::new(),
            sources: HashSet::new(),
            finalized: true,
            finalization_started: true,
            scanned: true,
            invalid_input: None,
            referenced: false,
            extra: NodeExtra::default(),
        }
    }

    pub fn new_derived(
        id: NodeId,
        variant: Variant,
        toolchain_name: &str,
        toolchain_hash: &str,
        arch: &str,
        config: &str,
        name: &str,
        script_path: &str,
        file_path: &str,
        flags: HashSet<BuildFlag>,
    ) -> Node {
        Node {
            id,
            variant,
            hash: Node::placeholder_hash(id),
            arch: arch.to_owned(),
            config: config.to_owned(),
            name: name.to_owned(),
            script_path: script_path.to_owned(),
            file_path: file_path.to_owned(),
            toolchain_name: toolchain_name.to_owned(),
            toolchain_hash: toolchain_hash.to_owned(),
            flags,
            dependencies: HashSet::new(),
            sources: HashSet::new(),
            finalized: false,
            finalization_started: false,
            scanned: false,
            invalid_input: None,
            referenced: false,
            extra: NodeExtra::default(),
        }
    }

    pub fn set_invalid_input(&mut self, message: impl Into<String>) {
        self.invalid_input = Some(message.into());
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid_input.is_some()
    }

    pub fn add_dependency(&mut self, path: &str, is_source: bool) {
        self.dependencies.insert(path.to_owned());
        if is_source {
            self.sources.insert(path.to_owned());
        }
    }
}

pub fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_owned()
}

pub fn dirname(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_owned(),
        None => String::new(),
    }
}
