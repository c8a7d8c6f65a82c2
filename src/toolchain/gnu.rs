//! Reference GNU toolchain adapter (worker side).
//!
//! Grounded in original_source's `GNUToolchain.cpp`/`GNUCPPToolchain.cpp`/
//! `GNUCToolchain.cpp`/`GNULinkerToolchain.cpp`, which probe the compiler
//! via a version invocation and split compile/link into methods of one
//! family rather than unrelated classes. We keep that as a single
//! `GnuToolchain` struct with `compile`/`link` entry points selected by
//! `stage`.

use crate::toolchain::{affix, BuildOutcome, ScanResult, ToolchainAdapter};
use regex::Regex;
use splash_proto::{CompilerInfo, ToolchainKind, VersionTriple};
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct GnuToolchain {
    /// `cc`/`gcc` by default; overridable for cross toolchains.
    pub c_compiler: String,
    pub cxx_compiler: String,
    pub target_triplet: String,
}

impl GnuToolchain {
    pub fn discover(target_triplet: &str) -> Option<GnuToolchain> {
        let c = which::which("gcc").or_else(|_| which::which("cc")).ok()?;
        let cxx = which::which("g++").or_else(|_| which::which("c++")).ok()?;
        Some(GnuToolchain {
            c_compiler: c.to_string_lossy().into_owned(),
            cxx_compiler: cxx.to_string_lossy().into_owned(),
            target_triplet: target_triplet.to_owned(),
        })
    }

    fn version(&self) -> Option<(VersionTriple, String)> {
        let output = Command::new(&self.c_compiler).arg("--version").output().ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let first_line = text.lines().next().unwrap_or("").to_owned();
        let re = Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok()?;
        let caps = re.captures(&first_line)?;
        let triple = VersionTriple {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        };
        Some((triple, first_line))
    }

    fn flags_to_args(flags: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        for raw in flags {
            let mut parts = raw.splitn(3, '/');
            let group = parts.next().unwrap_or("");
            let name = parts.next().unwrap_or("");
            let arg = parts.next();
            match group {
                "warning" => args.push(format!("-W{}", name)),
                "optimize" => args.push(format!("-O{}", name)),
                "debug" if name == "symbols" => args.push("-g".to_owned()),
                "dialect" => args.push(format!("-std={}", name)),
                "define" => args.push(match arg {
                    Some(v) => format!("-D{}={}", name, v),
                    None => format!("-D{}", name),
                }),
                "library" => args.push(format!("-l{}", name)),
                _ => {}
            }
        }
        args
    }
}

impl ToolchainAdapter for GnuToolchain {
    fn probe(&self) -> Option<CompilerInfo> {
        let (version, version_string) = self.version()?;
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        ctx.update(version_string.as_bytes());
        ctx.update(self.target_triplet.as_bytes());
        let hash = hex::encode(ctx.finish().as_ref());

        Some(CompilerInfo {
            hash,
            kind: ToolchainKind::Gnu,
            version,
            version_string,
            languages: vec!["c".to_owned(), "c++".to_owned()],
            triplets: vec![self.target_triplet.clone()],
            compiler_names: vec!["gcc".to_owned(), "g++".to_owned(), "cc".to_owned(), "c++".to_owned()],
            affixes: vec![
                affix("object", "", ".o"),
                affix("executable", "", ""),
                affix("shared-library", "lib", ".so"),
                affix("static-library", "lib", ".a"),
            ],
        })
    }

    fn scan(&self, fname: &str, _arch: &str, flags: &[String], cwd: &Path) -> ScanResult {
        let mut cmd = Command::new(&self.cxx_compiler);
        cmd.current_dir(cwd);
        cmd.args(Self::flags_to_args(flags));
        cmd.args(["-MM", "-MG", fname]);
        let output = match cmd.output() {
            Ok(o) => o,
            Err(e) => {
                return ScanResult { ok: false, stdout: e.to_string(), deps: Vec::new(), libflags: Vec::new() }
            }
        };
        if !output.status.success() {
            return ScanResult {
                ok: false,
                stdout: String::from_utf8_lossy(&output.stderr).into_owned(),
                deps: Vec::new(),
                libflags: Vec::new(),
            };
        }

        let text = String::from_utf8_lossy(&output.stdout);
        // `-MM` output is `target: dep1 dep2 \\\n  dep3 ...`; strip the
        // target and line continuations, then hash each dependency file.
        let body = text.splitn(2, ':').nth(1).unwrap_or("");
        let mut deps = Vec::new();
        for tok in body.split_whitespace().filter(|t| *t != "\\") {
            let path = cwd.join(tok);
            if let Ok(data) = std::fs::read(&path) {
                deps.push((tok.to_owned(), crate::cache::content_hash(&data)));
            }
        }

        ScanResult { ok: true, stdout: String::new(), deps, libflags: Vec::new() }
    }

    fn build(
        &self,
        stage: &str,
        _arch: &str,
        flags: &[String],
        sources: &[PathBuf],
        output: &Path,
        cwd: &Path,
    ) -> BuildOutcome {
        let compiler = if sources.iter().any(|s| matches!(s.extension().and_then(|e| e.to_str()), Some("cc" | "cpp" | "cxx"))) {
            &self.cxx_compiler
        } else {
            &self.c_compiler
        };

        let mut cmd = Command::new(compiler);
        cmd.current_dir(cwd);
        cmd.args(Self::flags_to_args(flags));
        match stage {
            "compile" => {
                cmd.arg("-c");
            }
            "link" => {}
            other => {
                return BuildOutcome { success: false, stdout: format!("GNU adapter cannot perform stage {:?}", other), outputs: Vec::new() }
            }
        }
        cmd.args(sources);
        cmd.arg("-o").arg(output);

        let result = cmd.output();
        let output_path = cwd.join(output);
        match result {
            Ok(out) if out.status.success() => {
                let data = std::fs::read(&output_path).unwrap_or_default();
                BuildOutcome {
                    success: true,
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    outputs: vec![(output.to_path_buf(), data)],
                }
            }
            Ok(out) => BuildOutcome {
                success: false,
                stdout: String::from_utf8_lossy(&out.stderr).into_owned(),
                outputs: Vec::new(),
            },
            Err(e) => BuildOutcome { success: false, stdout: e.to_string(), outputs: Vec::new() },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn translates_flags_to_gcc_style_args() {
        let flags = vec!["warning/all".to_owned(), "optimize/2".to_owned(), "dialect/c++17".to_owned()];
        let args = GnuToolchain::flags_to_args(&flags);
        assert_eq!(args, vec!["-Wall", "-O2", "-std=c++17"]);
    }

    #[test]
    fn define_without_value_omits_equals() {
        let flags = vec!["define/NDEBUG".to_owned()];
        assert_eq!(GnuToolchain::flags_to_args(&flags), vec!["-DNDEBUG"]);
    }
}
