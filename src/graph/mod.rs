//! The working copy and incremental build graph.
//!
//! Per Design Note 9 ("one node type per oid, not per C++ class, and a
//! single mutex over the whole graph rather than the working copy's own
//! lock plus the graph's"), `BuildGraph` owns both the path -> oid map
//! *and* the node arena behind one lock. `WorkingCopy` (see
//! `crate::workingcopy`) is a thin `Mutex<BuildGraph>` wrapper exposing
//! only the operations spec'd for it; every traversal or mutation of
//! either the path map or the node arena goes through that one lock.

pub mod board;
pub mod node;
pub mod script;

use crate::cache::content_hash;
use crate::flags::{hash_flag_set, BuildFlag, FlagGroup};
use crate::registry::Registry;
use board::{BoardInfo, ConstraintFormat};
use node::{basename, dirname, Node, NodeId, Variant};
use script::{ParsedScript, TargetDoc, ToolchainSettings};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct ScriptState {
    body: Vec<u8>,
    target_names: Vec<String>,
}

/// A target as declared across every `(arch, config)` instantiation the
/// loader produced for it.
pub struct TargetEntry {
    pub node_ids: Vec<NodeId>,
}

pub struct BuildGraph {
    registry: Arc<Registry>,
    /// Working copy: path -> content oid, for every file the developer
    /// client has told the controller about.
    paths: HashMap<String, String>,
    /// Raw bytes behind `paths`, kept around so board-info files and other
    /// script-referenced inputs can be parsed during target loading
    /// without a round trip to the object cache (original_source's
    /// `WorkingCopy` keeps a `Cache*` for exactly this: "so we can get to
    /// actual file contents").
    file_bodies: HashMap<String, Vec<u8>>,
    nodes: HashMap<NodeId, Node>,
    by_hash: HashMap<String, NodeId>,
    /// Every derived node's synthesized output path, so a dependent node
    /// can resolve "depends on the *output* of target T" the same way it
    /// resolves "depends on working-copy file F".
    nodes_by_file_path: HashMap<String, NodeId>,
    scripts: HashMap<String, ScriptState>,
    recursive_settings: HashMap<(String, String), ToolchainSettings>,
    file_settings: HashMap<(String, String), ToolchainSettings>,
    /// `(script_path, target_name) -> target`. GC roots.
    target_map: HashMap<(String, String), TargetEntry>,
    /// `(target_name, arch, config) -> node`, for `BuildRequest` lookups
    /// that address a target by name alone (spec.md §6).
    name_index: HashMap<(String, String, String), NodeId>,
    /// Reverse index: target name -> scripts observed to reference it by
    /// name (spec.md §4.3's "dependent scripts" hint), so a redeclaration
    /// can trigger reparsing of everything that named it.
    dependent_scripts: HashMap<String, HashSet<String>>,
    /// `target_name -> script_path` of the script that currently declares
    /// it, so a second script declaring the same name is rejected rather
    /// than silently shadowing the first (spec.md §4.3 "Reject if the
    /// target name is already claimed by another script").
    claimed_targets: HashMap<String, String>,
    next_id: u64,
}

impl BuildGraph {
    pub fn new(registry: Arc<Registry>) -> BuildGraph {
        BuildGraph {
            registry,
            paths: HashMap::new(),
            file_bodies: HashMap::new(),
            nodes: HashMap::new(),
            by_hash: HashMap::new(),
            nodes_by_file_path: HashMap::new(),
            scripts: HashMap::new(),
            recursive_settings: HashMap::new(),
            file_settings: HashMap::new(),
            target_map: HashMap::new(),
            name_index: HashMap::new(),
            dependent_scripts: HashMap::new(),
            claimed_targets: HashMap::new(),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    // ---- working copy surface -------------------------------------------------

    pub fn has(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    pub fn get_hash(&self, path: &str) -> Option<String> {
        self.paths.get(path).cloned()
    }

    /// Records (or updates) a working-copy file's content and, if it's a
    /// `build.yml` script, reparses it. Returns the set of script paths
    /// that need a follow-up `rebuild()` because their declared targets
    /// changed.
    pub fn update(&mut self, path: &str, data: &[u8]) -> Result<HashSet<String>, String> {
        let oid = content_hash(data);
        self.paths.insert(path.to_owned(), oid.clone());
        self.file_bodies.insert(path.to_owned(), data.to_vec());

        let id = self.alloc_id();
        let source_node = Node::new_source_file(id, path, &oid);
        self.nodes.insert(id, source_node);
        self.by_hash.insert(oid, id);
        self.nodes_by_file_path.insert(path.to_owned(), id);

        if basename(path) == "build.yml" {
            self.update_script(path, data)
        } else {
            Ok(HashSet::new())
        }
    }

    pub fn remove(&mut self, path: &str) {
        self.paths.remove(path);
        self.file_bodies.remove(path);
        if let Some(id) = self.nodes_by_file_path.remove(path) {
            self.nodes.remove(&id);
        }
    }

    /// Re-resolves every derived node's toolchain hash against the
    /// registry's current `by-name` map. Called after the registry
    /// changes shape (a worker connected/disconnected a toolchain).
    /// Returns the node ids whose toolchain hash actually changed, so
    /// the caller knows which targets need rebuilding.
    pub fn refresh_toolchains(&mut self) -> Vec<NodeId> {
        let mut changed = Vec::new();
        for (id, node) in self.nodes.iter_mut() {
            if node.toolchain_name.is_empty() {
                continue;
            }
            if let Some(new_hash) = self.registry.get_toolchain_hash(&node.arch, &node.toolchain_name) {
                if new_hash != node.toolchain_hash {
                    node.toolchain_hash = new_hash;
                    node.finalized = false;
                    changed.push(*id);
                }
            }
        }
        changed
    }

    // ---- script processing (spec.md §4.3 "Build Graph — script processing") --

    fn update_script(&mut self, path: &str, body: &[u8]) -> Result<HashSet<String>, String> {
        let parsed: ParsedScript = script::parse_script(body)?;
        let dir = dirname(path);

        for (toolchain, settings) in &parsed.recursive_config {
            self.recursive_settings.insert((dir.clone(), toolchain.clone()), settings.clone());
        }
        for (toolchain, settings) in &parsed.file_config {
            self.file_settings.insert((path.to_owned(), toolchain.clone()), settings.clone());
        }

        let previous_targets: Vec<String> =
            self.scripts.get(path).map(|s| s.target_names.clone()).unwrap_or_default();
        let new_names: HashSet<&str> = parsed.targets.iter().map(|(n, _)| n.as_str()).collect();
        for old in &previous_targets {
            if !new_names.contains(old.as_str()) {
                self.target_map.remove(&(path.to_owned(), old.clone()));
                if self.claimed_targets.get(old).map(String::as_str) == Some(path) {
                    self.claimed_targets.remove(old);
                }
            }
        }

        let mut target_names = Vec::new();
        for (name, doc) in &parsed.targets {
            target_names.push(name.clone());
            if let Err(e) = self.load_target(path, name, doc) {
                log::warn!("{}: target {:?} not loaded: {}", path, name, e);
            }
        }

        self.scripts.insert(path.to_owned(), ScriptState { body: body.to_vec(), target_names });

        let mut dirty = HashSet::new();
        dirty.insert(path.to_owned());
        if !parsed.recursive_config.is_empty() {
            let descendants: Vec<String> = self
                .scripts
                .keys()
                .filter(|s| *s != path && dirname(s).starts_with(&dir))
                .cloned()
                .collect();
            for d in descendants {
                if let Some(body) = self.scripts.get(&d).map(|s| s.body.clone()) {
                    dirty.extend(self.update_script(&d, &body)?);
                }
            }
        }
        Ok(dirty)
    }

    fn effective_settings(&self, toolchain: &str, script_path: &str) -> ToolchainSettings {
        let mut result = ToolchainSettings::default();
        for ancestor in ancestor_dirs(&dirname(script_path)) {
            if let Some(s) = self.recursive_settings.get(&(ancestor, toolchain.to_owned())) {
                result.merge_from(s);
            }
        }
        if let Some(s) = self.file_settings.get(&(script_path.to_owned(), toolchain.to_owned())) {
            result.merge_from(s);
        }
        result
    }

    // ---- target loading (spec.md §4.3 "Build Graph — target loading") --------

    fn load_target(&mut self, script_path: &str, target_name: &str, doc: &TargetDoc) -> Result<(), String> {
        if let Some(owner) = self.claimed_targets.get(target_name) {
            if owner != script_path {
                return Err(format!("target name {:?} is already claimed by {:?}", target_name, owner));
            }
        } else {
            self.claimed_targets.insert(target_name.to_owned(), script_path.to_owned());
        }

        let toolchain = doc
            .toolchain
            .clone()
            .ok_or_else(|| format!("target {:?} in {:?} declares no toolchain", target_name, script_path))?;

        let settings = self.effective_settings(&toolchain, script_path);
        let chain_type = toolchain.split('/').next().unwrap_or(&toolchain);
        let variant = match &doc.ty {
            Some(t) => variant_from_str(t).ok_or_else(|| format!("unknown target type {:?}", t))?,
            None => default_variant_for_chain_type(chain_type),
        };

        // Each entry is the arch string plus, for a board-backed target,
        // the board name and its parsed BoardInfo (device triplet stands
        // in for the arch, per original_source's BoardInfoFile).
        let mut arch_sources: Vec<(String, Option<(String, BoardInfo)>)> = Vec::new();
        if let Some(arches) = doc.arches.clone().filter(|v| !v.is_empty()) {
            for a in arches {
                arch_sources.push((a, None));
            }
        } else if let Some(boards) = doc.boards.clone().filter(|v| !v.is_empty()) {
            for board_name in boards {
                match self.load_board(script_path, &board_name) {
                    Ok(info) => {
                        let arch = info.device_triplet.clone();
                        arch_sources.push((arch, Some((board_name, info))));
                    }
                    Err(e) => log::warn!("{}: target {:?} board {:?}: {}", script_path, target_name, board_name, e),
                }
            }
        }
        if arch_sources.is_empty() {
            for a in &settings.arches {
                arch_sources.push((a.clone(), None));
            }
        }
        if arch_sources.is_empty() {
            return Err(format!("target {:?} has no arch and no inherited default arch", target_name));
        }
        let configs: Vec<String> = if settings.configs.is_empty() { vec!["default".to_owned()] } else { settings.configs.clone() };

        let mut flags: HashSet<BuildFlag> = HashSet::new();
        for raw in settings.flags.iter().chain(doc.flags.iter()) {
            if raw == "global" {
                continue;
            }
            flags.insert(BuildFlag::parse(raw)?);
        }

        let constant_headers = self.load_constants(script_path, &doc.constants);

        let mut node_ids = Vec::new();
        for (arch, board) in &arch_sources {
            let toolchain_hash = self.registry.get_toolchain_hash(arch, &toolchain).unwrap_or_default();
            let (prefix, suffix) = self
                .registry
                .get_descriptor(&toolchain_hash)
                .map(|d| {
                    let kind = affix_kind_for_variant(variant);
                    (d.prefix(kind).unwrap_or("").to_owned(), d.suffix(kind).unwrap_or("").to_owned())
                })
                .unwrap_or_default();
            for config in &configs {
                let output_path = format!("build/{}/{}/{}{}{}", arch, config, prefix, target_name, suffix);
                let id = self.alloc_id();

                let mut node_flags = flags.clone();
                if let Some((_, info)) = board {
                    if let Some(speed) = info.speed {
                        node_flags.insert(BuildFlag::hardware("speed", &speed.to_string()));
                    }
                    if let Some(pkg) = &info.package {
                        node_flags.insert(BuildFlag::hardware("package", pkg));
                    }
                }

                let mut n = Node::new_derived(
                    id,
                    variant,
                    &toolchain,
                    &toolchain_hash,
                    arch,
                    config,
                    target_name,
                    script_path,
                    &output_path,
                    node_flags,
                );
                if let Some((board_name, _)) = board {
                    n.extra.board = Some(board_name.clone());
                }

                for src in &doc.sources {
                    let resolved = resolve_rel(script_path, src);
                    if !self.has(&resolved) && !self.nodes_by_file_path.contains_key(&resolved) {
                        n.set_invalid_input(format!("No file named {} in working copy", resolved));
                    }
                    n.add_dependency(&resolved, true);
                }
                for h in &constant_headers {
                    n.add_dependency(h, false);
                }

                if variant == Variant::FpgaBitstream {
                    self.wire_fpga_bitstream(
                        &mut n,
                        script_path,
                        target_name,
                        arch,
                        config,
                        &toolchain,
                        &toolchain_hash,
                        board.as_ref(),
                        &doc.pins,
                        &doc.sources,
                    );
                }

                self.nodes_by_file_path.insert(output_path, id);
                self.name_index.insert((target_name.to_owned(), arch.clone(), config.clone()), id);
                self.nodes.insert(id, n);
                node_ids.push(id);
            }
        }

        self.target_map.insert((script_path.to_owned(), target_name.to_owned()), TargetEntry { node_ids });
        Ok(())
    }

    /// Parses a `boards:`-referenced `BoardInfo` file out of the working
    /// copy, grounded in original_source's `BoardInfoFile.cpp` (device
    /// triplet/speed/package plus per-pin location/iostandard/clock data).
    fn load_board(&self, script_path: &str, board: &str) -> Result<BoardInfo, String> {
        let resolved = resolve_rel(script_path, board);
        let data = self
            .file_bodies
            .get(&resolved)
            .ok_or_else(|| format!("no board info file named {} in working copy", resolved))?;
        serde_yaml::from_slice(data).map_err(|e| format!("invalid board info file {}: {}", resolved, e))
    }

    /// Synthesizes a `ConstantTable` node (plus its virtual generated
    /// header path) for every `generator` requested against every table
    /// file in a target's `constants:` map. Returns the virtual header
    /// paths, which the caller wires in as non-source dependencies of the
    /// target's main node.
    ///
    /// Grounded in original_source's `ConstantTableNode.cpp`, whose
    /// `GetOutputBasename` picks the generated header's suffix from the
    /// generator name (`c/enum` -> `_enum.h`, `c/define` -> `_define.h`,
    /// `verilog/define` -> `_define.vh`, `verilog/localparam` ->
    /// `_localparam.vh`).
    fn load_constants(&mut self, script_path: &str, constants: &HashMap<String, Vec<String>>) -> Vec<String> {
        let mut header_paths = Vec::new();
        let dir = dirname(script_path);
        let mut tables: Vec<(&String, &Vec<String>)> = constants.iter().collect();
        tables.sort_by(|a, b| a.0.cmp(b.0));
        for (table, generators) in tables {
            let resolved_table = resolve_rel(script_path, table);
            let stem = match basename(table).rsplit_once('.') {
                Some((s, _)) => s.to_owned(),
                None => basename(table),
            };
            let mut gens = generators.clone();
            gens.sort();
            for generator in gens {
                let Some(suffix) = constant_generator_suffix(&generator) else {
                    log::warn!("{}: constant table {:?} has unknown generator {:?}", script_path, table, generator);
                    continue;
                };
                let header_path = format!("{}/{}{}", dir, stem, suffix);
                let id = self.alloc_id();
                let mut n = Node::new_derived(
                    id,
                    Variant::ConstantTable,
                    "",
                    "",
                    "generic",
                    "generic",
                    &basename(&header_path),
                    script_path,
                    &header_path,
                    HashSet::new(),
                );
                if !self.has(&resolved_table) && !self.nodes_by_file_path.contains_key(&resolved_table) {
                    n.set_invalid_input(format!("No file named {} in working copy", resolved_table));
                }
                n.add_dependency(&resolved_table, true);
                n.extra.generators.push(generator);
                self.nodes_by_file_path.insert(header_path.clone(), id);
                self.nodes.insert(id, n);
                header_paths.push(header_path);
            }
        }
        header_paths
    }

    /// Builds the synthesis/implementation chain a `FpgaBitstream` target
    /// needs: a generated constraint file (board-backed targets only, per
    /// original_source's `FPGABitstreamNode::GenerateConstraintFile`), an
    /// `HdlNetlist` synthesis node over the target's sources, and a
    /// `PhysicalNetlist` node wrapping that netlist plus the constraint
    /// file (`PhysicalNetlistNode`'s constructor: "No dependency scanning
    /// needed here", just netlist + constraints as deps). The bitstream
    /// node depends on the physical netlist's output.
    fn wire_fpga_bitstream(
        &mut self,
        n: &mut Node,
        script_path: &str,
        target_name: &str,
        arch: &str,
        config: &str,
        toolchain: &str,
        toolchain_hash: &str,
        board: Option<&(String, BoardInfo)>,
        pins: &HashMap<String, u32>,
        sources: &[String],
    ) {
        let mut constraint_path: Option<String> = None;
        if let Some((board_name, info)) = board {
            if pins.is_empty() {
                n.set_invalid_input("No top-level pins specified (this bitstream is useless!)".to_owned());
                return;
            }
            let format = if toolchain.contains("yosys") || toolchain.contains("ice") { ConstraintFormat::Pcf } else { ConstraintFormat::Ucf };
            let ext = match format {
                ConstraintFormat::Ucf => "ucf",
                ConstraintFormat::Pcf => "pcf",
            };
            let path = format!("{}/{}_{}.{}", dirname(script_path), target_name, board_name, ext);
            match board::generate_constraints(info, pins, &format) {
                Ok(text) => {
                    let oid = content_hash(text.as_bytes());
                    self.paths.insert(path.clone(), oid.clone());
                    self.file_bodies.insert(path.clone(), text.into_bytes());
                    let cid = self.alloc_id();
                    let cnode = Node::new_source_file(cid, &path, &oid);
                    self.nodes.insert(cid, cnode);
                    self.nodes_by_file_path.insert(path.clone(), cid);
                    n.add_dependency(&path, true);
                    constraint_path = Some(path);
                }
                Err(e) => {
                    n.set_invalid_input(format!("constraint file generation failed: {}", e));
                    return;
                }
            }
        }

        let netlist_path = format!("build/{}/{}/{}.netlist", arch, config, target_name);
        let nid = self.alloc_id();
        let mut netnode = Node::new_derived(nid, Variant::HdlNetlist, toolchain, toolchain_hash, arch, config, target_name, script_path, &netlist_path, n.flags.clone());
        for src in sources {
            let resolved = resolve_rel(script_path, src);
            if !self.has(&resolved) && !self.nodes_by_file_path.contains_key(&resolved) {
                netnode.set_invalid_input(format!("No file named {} in working copy", resolved));
            }
            netnode.add_dependency(&resolved, true);
        }
        self.nodes_by_file_path.insert(netlist_path.clone(), nid);
        self.nodes.insert(nid, netnode);

        let physical_path = format!("build/{}/{}/{}.physnetlist", arch, config, target_name);
        let pid = self.alloc_id();
        let mut physnode = Node::new_derived(
            pid,
            Variant::PhysicalNetlist,
            toolchain,
            toolchain_hash,
            arch,
            config,
            target_name,
            script_path,
            &physical_path,
            n.flags.clone(),
        );
        physnode.add_dependency(&netlist_path, true);
        if let Some(cpath) = &constraint_path {
            physnode.add_dependency(cpath, true);
        }
        self.nodes_by_file_path.insert(physical_path.clone(), pid);
        self.nodes.insert(pid, physnode);

        n.add_dependency(&physical_path, false);
    }

    // ---- finalization (spec.md §4.3 "Build Graph — rebuild") -----------------

    /// Marks every node reachable from the target map roots as referenced
    /// and, for those not yet finalized, begins finalization. Returns the
    /// node ids that still need a dependency scan (`Variant::is_scanned`)
    /// before `finalize` can compute their real hash -- the session layer
    /// drives those scans and calls `set_scanned_dependencies` before the
    /// next `rebuild()`.
    pub fn rebuild(&mut self) -> Vec<NodeId> {
        for n in self.nodes.values_mut() {
            n.referenced = false;
        }

        let roots: Vec<NodeId> = self.target_map.values().flat_map(|t| t.node_ids.iter().copied()).collect();
        let mut stack = roots;
        let mut needing_scan = Vec::new();
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let deps: Vec<String> = match self.nodes.get_mut(&id) {
                Some(n) => {
                    n.referenced = true;
                    if !n.finalization_started {
                        n.finalization_started = true;
                    }
                    if n.variant.is_scanned() && !n.scanned {
                        needing_scan.push(id);
                    }
                    n.dependencies.iter().cloned().collect()
                }
                None => continue,
            };
            for dep_path in deps {
                if let Some(dep_id) = self.nodes_by_file_path.get(&dep_path) {
                    stack.push(*dep_id);
                }
            }
        }

        let order = self.topological_order(&visited);
        for id in order {
            self.finalize(id);
        }

        self.collect_garbage();
        needing_scan
    }

    fn topological_order(&self, nodes: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut ids: Vec<NodeId> = nodes.iter().copied().collect();
        ids.sort_by_key(|id| id.0);
        fn visit(
            id: NodeId,
            graph: &BuildGraph,
            nodes: &HashSet<NodeId>,
            done: &mut HashSet<NodeId>,
            order: &mut Vec<NodeId>,
        ) {
            if done.contains(&id) {
                return;
            }
            done.insert(id);
            if let Some(n) = graph.nodes.get(&id) {
                for dep_path in &n.dependencies {
                    if let Some(dep_id) = graph.nodes_by_file_path.get(dep_path) {
                        if nodes.contains(dep_id) {
                            visit(*dep_id, graph, nodes, done, order);
                        }
                    }
                }
            }
            order.push(id);
        }
        for id in ids {
            visit(id, self, nodes, &mut done, &mut order);
        }
        order
    }

    /// Supplies dependency-scan results for a node whose real input set
    /// couldn't be known until a worker scanned it (§4.3/§4.5
    /// `DependencyScan`/`DependencyResults`).
    ///
    /// For `Object`/`HdlNetlist` nodes this also reclassifies scanned
    /// dependencies against the node's `library/<name>` flags: a dep
    /// whose basename matches `lib<name>` plus the toolchain's
    /// shared/static library suffix becomes a `SystemLibrary` node and
    /// contributes a `define/HAVE_<NAME>` flag; a requested library with
    /// no matching dep is recorded as invalid input. Grounded in
    /// original_source's `HDLNetlistNode.cpp` (`DoFinalize`'s library
    /// resolution pass).
    pub fn set_scanned_dependencies(&mut self, id: NodeId, deps: Vec<(String, String)>, libflags: Vec<String>) {
        let Some(node) = self.nodes.get(&id) else { return };
        let variant = node.variant;
        let toolchain_hash = node.toolchain_hash.clone();
        let requested_libs: Vec<String> =
            node.flags.iter().filter(|f| f.group() == FlagGroup::Library).map(|f| f.name().to_owned()).collect();

        let (shlib_suf, stlib_suf) = self
            .registry
            .get_descriptor(&toolchain_hash)
            .map(|d| (d.suffix("shared-library").unwrap_or(".so").to_owned(), d.suffix("static-library").unwrap_or(".a").to_owned()))
            .unwrap_or_else(|| (".so".to_owned(), ".a".to_owned()));

        let mut resolved_libs: HashSet<String> = HashSet::new();
        let mut missing_libs: Vec<String> = Vec::new();
        let mut extra_flags: Vec<BuildFlag> = Vec::new();

        if matches!(variant, Variant::Object | Variant::HdlNetlist) {
            for lib in &requested_libs {
                let want_prefix = format!("lib{}", lib);
                let hit = deps.iter().find(|(path, _)| {
                    let b = basename(path);
                    b.starts_with(want_prefix.as_str()) && (b.ends_with(shlib_suf.as_str()) || b.ends_with(stlib_suf.as_str()))
                });
                match hit {
                    Some((path, oid)) => {
                        resolved_libs.insert(path.clone());
                        extra_flags.push(BuildFlag::have_define(lib));
                        if !self.nodes_by_file_path.contains_key(path) {
                            let sid = self.alloc_id();
                            let mut snode =
                                Node::new_derived(sid, Variant::SystemLibrary, "", "", "generic", "generic", &basename(path), "", path, HashSet::new());
                            snode.hash = oid.clone();
                            snode.finalized = true;
                            snode.scanned = true;
                            self.nodes_by_file_path.insert(path.clone(), sid);
                            self.paths.entry(path.clone()).or_insert_with(|| oid.clone());
                            self.by_hash.insert(oid.clone(), sid);
                            self.nodes.insert(sid, snode);
                        }
                    }
                    None => missing_libs.push(lib.clone()),
                }
            }
        }

        if let Some(n) = self.nodes.get_mut(&id) {
            for (path, oid) in &deps {
                n.dependencies.insert(path.clone());
                if !resolved_libs.contains(path) {
                    self.paths.entry(path.clone()).or_insert_with(|| oid.clone());
                }
            }
            for raw in libflags {
                if let Ok(f) = BuildFlag::parse(&raw) {
                    n.flags.insert(f);
                }
            }
            for f in extra_flags {
                n.flags.insert(f);
            }
            if !missing_libs.is_empty() {
                n.extra.missing_libraries = missing_libs.clone();
                n.set_invalid_input(format!("could not resolve required libraries: {}", missing_libs.join(", ")));
            }
            n.scanned = true;
            n.finalized = false;
        }
    }

    fn finalize(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else { return };
        if node.finalized {
            return;
        }
        if node.is_invalid() {
            return;
        }

        let mut dep_hashes: Vec<String> = Vec::new();
        for dep_path in &node.dependencies {
            match self.resolve_dependency_hash(dep_path) {
                Some(h) => dep_hashes.push(h),
                None => {
                    let msg = format!("No file named {} in working copy", dep_path);
                    self.nodes.get_mut(&id).unwrap().set_invalid_input(msg);
                    return;
                }
            }
        }
        dep_hashes.sort_unstable();

        let node = self.nodes.get(&id).unwrap();
        let flag_digest = hash_flag_set(&node.flags);
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        for h in &dep_hashes {
            ctx.update(h.as_bytes());
        }
        ctx.update(&flag_digest);
        ctx.update(node.toolchain_hash.as_bytes());
        ctx.update(node.arch.as_bytes());
        let hash = hex::encode(ctx.finish().as_ref());

        let node = self.nodes.get_mut(&id).unwrap();
        node.hash = hash.clone();
        node.finalized = true;
        self.by_hash.insert(hash, id);
    }

    fn resolve_dependency_hash(&self, path: &str) -> Option<String> {
        if let Some(oid) = self.paths.get(path) {
            return Some(oid.clone());
        }
        if let Some(id) = self.nodes_by_file_path.get(path) {
            return self.nodes.get(id).filter(|n| n.finalized).map(|n| n.hash.clone());
        }
        None
    }

    /// Drops every node not marked `referenced` during the last
    /// `rebuild()` -- a simple mark-and-sweep from the target map roots.
    fn collect_garbage(&mut self) {
        let dead: Vec<NodeId> = self.nodes.iter().filter(|(_, n)| !n.referenced && !matches!(n.variant, Variant::SourceFile)).map(|(id, _)| *id).collect();
        for id in dead {
            if let Some(n) = self.nodes.remove(&id) {
                self.by_hash.remove(&n.hash);
                self.nodes_by_file_path.remove(&n.file_path);
                self.name_index.remove(&(n.name.clone(), n.arch.clone(), n.config.clone()));
            }
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_by_hash(&self, hash: &str) -> Option<&Node> {
        self.by_hash.get(hash).and_then(|id| self.nodes.get(id))
    }

    pub fn target(&self, script_path: &str, name: &str) -> Option<&TargetEntry> {
        self.target_map.get(&(script_path.to_owned(), name.to_owned()))
    }

    pub fn find_target(&self, name: &str, arch: &str, config: &str) -> Option<NodeId> {
        self.name_index.get(&(name.to_owned(), arch.to_owned(), config.to_owned())).copied()
    }

    pub fn node_id_by_path(&self, path: &str) -> Option<NodeId> {
        self.nodes_by_file_path.get(path).copied()
    }

    pub fn all_targets(&self) -> Vec<(String, String, String)> {
        self.name_index.keys().cloned().collect()
    }

    pub fn all_node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn ancestor_dirs(dir: &str) -> Vec<String> {
    if dir.is_empty() {
        return vec![String::new()];
    }
    let mut out = vec![String::new()];
    let mut acc = String::new();
    for part in dir.split('/') {
        if part.is_empty() {
            continue;
        }
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        out.push(acc.clone());
    }
    out
}

/// Resolves a script-relative path reference (a source, a board file, a
/// constant table) against the script's directory, unless it's already
/// absolute.
fn resolve_rel(script_path: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        rel.to_owned()
    } else {
        format!("{}/{}", dirname(script_path), rel)
    }
}

fn constant_generator_suffix(generator: &str) -> Option<&'static str> {
    match generator {
        "c/enum" => Some("_enum.h"),
        "c/define" => Some("_define.h"),
        "verilog/define" => Some("_define.vh"),
        "verilog/localparam" => Some("_localparam.vh"),
        _ => None,
    }
}

fn affix_kind_for_variant(v: Variant) -> &'static str {
    match v {
        Variant::Object => "object",
        Variant::Executable => "executable",
        Variant::SharedLibrary => "shared-library",
        _ => "",
    }
}

fn default_variant_for_chain_type(chain_type: &str) -> Variant {
    match chain_type {
        "c" | "c++" => Variant::Executable,
        "verilog" | "vhdl" => Variant::HdlNetlist,
        "fpga" => Variant::FpgaBitstream,
        "formal" => Variant::FormalVerification,
        _ => Variant::Object,
    }
}

fn variant_from_str(s: &str) -> Option<Variant> {
    Some(match s {
        "object" => Variant::Object,
        "executable" => Variant::Executable,
        "shared_library" => Variant::SharedLibrary,
        "constant_table" => Variant::ConstantTable,
        "hdl_netlist" => Variant::HdlNetlist,
        "physical_netlist" => Variant::PhysicalNetlist,
        "fpga_bitstream" => Variant::FpgaBitstream,
        "formal_verification" => Variant::FormalVerification,
        "system_library" => Variant::SystemLibrary,
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn graph() -> BuildGraph {
        BuildGraph::new(Arc::new(Registry::new()))
    }

    #[test]
    fn missing_source_marks_target_invalid() {
        let mut g = graph();
        let yaml = b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\nhello:\n  toolchain: c++\n  sources: [missing.c]\n";
        g.update("/proj/build.yml", yaml).unwrap();
        g.rebuild();
        let entry = g.target("/proj/build.yml", "hello").unwrap();
        let node = g.node(entry.node_ids[0]).unwrap();
        assert!(node.is_invalid());
        assert!(node.invalid_input.as_ref().unwrap().contains("No file named"));
    }

    #[test]
    fn hash_is_independent_of_flag_order() {
        let mut g1 = graph();
        g1.update("/proj/main.c", b"int main(){}").unwrap();
        g1.update(
            "/proj/build.yml",
            b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [debug]\n    flags: [warning/all, optimize/2]\nhello:\n  toolchain: c++\n  sources: [main.c]\n",
        )
        .unwrap();
        g1.rebuild();

        let mut g2 = graph();
        g2.update("/proj/main.c", b"int main(){}").unwrap();
        g2.update(
            "/proj/build.yml",
            b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [debug]\n    flags: [optimize/2, warning/all]\nhello:\n  toolchain: c++\n  sources: [main.c]\n",
        )
        .unwrap();
        g2.rebuild();

        let e1 = g1.target("/proj/build.yml", "hello").unwrap();
        let e2 = g2.target("/proj/build.yml", "hello").unwrap();
        let n1 = g1.node(e1.node_ids[0]).unwrap();
        let n2 = g2.node(e2.node_ids[0]).unwrap();
        assert_eq!(n1.hash, n2.hash);
    }

    #[test]
    fn recursive_config_propagates_to_descendant_scripts() {
        let mut g = graph();
        g.update(
            "/proj/build.yml",
            b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [release]\n",
        )
        .unwrap();
        g.update("/proj/sub/main.c", b"int main(){}").unwrap();
        g.update("/proj/sub/build.yml", b"hello:\n  toolchain: c++\n  sources: [main.c]\n").unwrap();
        g.rebuild();
        let entry = g.target("/proj/sub/build.yml", "hello").unwrap();
        let node = g.node(entry.node_ids[0]).unwrap();
        assert_eq!(node.config, "release");
    }

    #[test]
    fn removing_a_target_from_a_script_garbage_collects_it() {
        let mut g = graph();
        g.update("/proj/main.c", b"x").unwrap();
        g.update(
            "/proj/build.yml",
            b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [debug]\nhello:\n  toolchain: c++\n  sources: [main.c]\n",
        )
        .unwrap();
        g.rebuild();
        assert!(g.target("/proj/build.yml", "hello").is_some());

        g.update("/proj/build.yml", b"recursive_config:\n  c++:\n    arches: [x86_64-linux-gnu]\n    configs: [debug]\n").unwrap();
        g.rebuild();
        assert!(g.target("/proj/build.yml", "hello").is_none());
    }
}
