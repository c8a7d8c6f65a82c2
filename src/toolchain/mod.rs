//! Toolchain descriptors and the worker-side adapter interface.
//!
//! Controller-side, a descriptor is pure data (§4.2/§9: "Keep them
//! plain-old-data on the controller side and put executable logic only on
//! the worker side"). The executable probing/scan/build logic lives behind
//! the `ToolchainAdapter` trait and is only ever instantiated in the
//! worker binary.

pub mod gnu;

use splash_proto::{ArtifactAffix, CompilerInfo, ToolchainKind, VersionTriple};

/// Controller-side wrapper around the wire descriptor, with the derived
/// comparisons the registry needs (version-triple ordering, interchange
/// by hash).
#[derive(Debug, Clone)]
pub struct ToolchainDescriptor {
    pub info: CompilerInfo,
}

impl ToolchainDescriptor {
    pub fn hash(&self) -> &str {
        &self.info.hash
    }

    pub fn kind(&self) -> ToolchainKind {
        self.info.kind
    }

    pub fn version(&self) -> VersionTriple {
        self.info.version
    }

    pub fn supports_language(&self, lang: &str) -> bool {
        self.info.languages.iter().any(|l| l.eq_ignore_ascii_case(lang))
    }

    pub fn supports_triplet(&self, arch: &str) -> bool {
        self.info.triplets.iter().any(|t| t == arch)
    }

    pub fn compiler_names(&self) -> &[String] {
        &self.info.compiler_names
    }

    pub fn suffix(&self, kind: &str) -> Option<&str> {
        self.info.affixes.iter().find(|a| a.kind == kind).map(|a| a.suffix.as_str())
    }

    pub fn prefix(&self, kind: &str) -> Option<&str> {
        self.info.affixes.iter().find(|a| a.kind == kind).map(|a| a.prefix.as_str())
    }

    /// Strict version-triple compare, ties broken by a fixed toolchain
    /// type precedence (kept stable so `by-name` resolution is
    /// deterministic across runs): Gnu < Clang < Yosys < Ise < Vivado.
    pub fn outranks(&self, other: &ToolchainDescriptor) -> bool {
        match self.version().cmp(&other.version()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => kind_rank(self.kind()) > kind_rank(other.kind()),
        }
    }
}

fn kind_rank(kind: ToolchainKind) -> u8 {
    match kind {
        ToolchainKind::Gnu => 0,
        ToolchainKind::Clang => 1,
        ToolchainKind::Yosys => 2,
        ToolchainKind::Ise => 3,
        ToolchainKind::Vivado => 4,
    }
}

/// Result of a dependency scan: the set of files that influence this
/// translation unit's output, plus any flags the scan discovered it needs
/// (e.g. `define/HAVE_FOO` once a system library is located).
pub struct ScanResult {
    pub ok: bool,
    pub stdout: String,
    pub deps: Vec<(String, String)>,
    pub libflags: Vec<String>,
}

/// Result of an actual compile/link/synthesis invocation.
pub struct BuildOutcome {
    pub success: bool,
    pub stdout: String,
    /// `(path, content)` pairs for every output file the node declared.
    pub outputs: Vec<(std::path::PathBuf, Vec<u8>)>,
}

/// Worker-side toolchain adapter. One implementation per vendor family;
/// the reference implementation (`gnu::GnuToolchain`) covers GCC/Clang as
/// a single driver-compatible family, matching how the spec treats `c++`
/// and `c` under one `chain-type`.
pub trait ToolchainAdapter: Send + Sync {
    /// Probes the adapter's install location (honoring e.g. `$XILINX` for
    /// vendor toolchains) and returns the descriptor to advertise, or
    /// `None` if this toolchain isn't installed on this worker.
    fn probe(&self) -> Option<CompilerInfo>;

    fn scan(&self, fname: &str, arch: &str, flags: &[String], cwd: &std::path::Path) -> ScanResult;

    fn build(
        &self,
        stage: &str,
        arch: &str,
        flags: &[String],
        sources: &[std::path::PathBuf],
        output: &std::path::Path,
        cwd: &std::path::Path,
    ) -> BuildOutcome;
}

pub fn affix(kind: &str, prefix: &str, suffix: &str) -> ArtifactAffix {
    ArtifactAffix { kind: kind.to_owned(), prefix: prefix.to_owned(), suffix: suffix.to_owned() }
}
