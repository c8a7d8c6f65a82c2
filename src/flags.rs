//! Build flags: categorized `group/name[/arg]` tags with a per-group bitmask
//! of the build stages they apply to.
//!
//! Flags compare and hash by their raw text form (`Eq`/`Hash` derive from
//! the stored string) so that a `HashSet<BuildFlag>` de-duplicates exactly
//! as spec'd, regardless of which group/name/arg split produced the string.

use std::fmt;

bitflags::bitflags! {
    /// Build stages a flag can be applicable to. original_source's
    /// `BuildFlag.h` keys this off the flag's group rather than storing a
    /// mask per instance; we keep that rule as a static table in
    /// `FlagGroup::stage_mask`.
    #[derive(Default)]
    pub struct Stage: u32 {
        const COMPILE         = 1 << 0;
        const LINK            = 1 << 1;
        const SYNTHESIZE      = 1 << 2;
        const MAP             = 1 << 3;
        const PLACE_AND_ROUTE = 1 << 4;
        const IMAGE           = 1 << 5;
        const PROOF           = 1 << 6;
        const ANALYSIS        = 1 << 7;
        const SCAN            = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagGroup {
    Warning,
    Error,
    Optimize,
    Debug,
    Analysis,
    Dialect,
    Output,
    Library,
    Define,
    Hardware,
}

impl FlagGroup {
    pub fn from_str(s: &str) -> Option<FlagGroup> {
        use FlagGroup::*;
        Some(match s {
            "warning" => Warning,
            "error" => Error,
            "optimize" => Optimize,
            "debug" => Debug,
            "analysis" => Analysis,
            "dialect" => Dialect,
            "output" => Output,
            "library" => Library,
            "define" => Define,
            "hardware" => Hardware,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        use FlagGroup::*;
        match self {
            Warning => "warning",
            Error => "error",
            Optimize => "optimize",
            Debug => "debug",
            Analysis => "analysis",
            Dialect => "dialect",
            Output => "output",
            Library => "library",
            Define => "define",
            Hardware => "hardware",
        }
    }

    /// Which build stages this group's flags apply to. Every flag in a
    /// group shares the same mask; there is no per-instance override.
    pub fn stage_mask(&self) -> Stage {
        use FlagGroup::*;
        match self {
            Warning | Error | Dialect => Stage::COMPILE,
            Optimize => Stage::COMPILE | Stage::LINK | Stage::SYNTHESIZE,
            Debug => Stage::COMPILE | Stage::LINK,
            Analysis => Stage::ANALYSIS | Stage::SCAN,
            Output => Stage::COMPILE | Stage::LINK | Stage::SYNTHESIZE | Stage::MAP | Stage::PLACE_AND_ROUTE | Stage::IMAGE,
            Library => Stage::LINK,
            Define => Stage::COMPILE | Stage::SCAN,
            Hardware => Stage::SYNTHESIZE | Stage::MAP | Stage::PLACE_AND_ROUTE | Stage::IMAGE,
        }
    }
}

/// A single `group/name[/arg]` build flag. Hashes and compares by its raw
/// textual form so de-duplication in a `HashSet<BuildFlag>` matches the
/// hash key the build worker's own scan cache uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildFlag {
    raw: String,
}

impl BuildFlag {
    pub fn parse(raw: &str) -> Result<BuildFlag, String> {
        let mut parts = raw.splitn(3, '/');
        let group = parts.next().unwrap_or("");
        let name = parts.next();
        if FlagGroup::from_str(group).is_none() {
            return Err(format!("unknown flag group {:?} in flag {:?}", group, raw));
        }
        if name.is_none() || name == Some("") {
            return Err(format!("flag {:?} is missing a name component", raw));
        }
        Ok(BuildFlag { raw: raw.to_owned() })
    }

    pub fn group(&self) -> FlagGroup {
        let group = self.raw.splitn(2, '/').next().unwrap_or("");
        FlagGroup::from_str(group).expect("validated at parse time")
    }

    pub fn name(&self) -> &str {
        let mut parts = self.raw.splitn(3, '/');
        parts.next();
        parts.next().unwrap_or("")
    }

    pub fn arg(&self) -> Option<&str> {
        let mut parts = self.raw.splitn(3, '/');
        parts.next();
        parts.next();
        parts.next()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn applies_to(&self, stage: Stage) -> bool {
        self.group().stage_mask().contains(stage)
    }

    /// Builds a `define/HAVE_<UPPER>` flag, as injected when a
    /// dependency scan discovers a system library.
    pub fn have_define(library_name: &str) -> BuildFlag {
        let upper: String = library_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        BuildFlag { raw: format!("define/HAVE_{}", upper) }
    }

    pub fn hardware(name: &str, arg: &str) -> BuildFlag {
        BuildFlag { raw: format!("hardware/{}/{}", name, arg) }
    }
}

impl fmt::Display for BuildFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Hashes a flag multiset by sorting the raw text forms first, so the
/// result is independent of the set's iteration order (oid-determinism,
/// invariant 1 in spec.md section 8).
pub fn hash_flag_set<'a, I: IntoIterator<Item = &'a BuildFlag>>(flags: I) -> Vec<u8> {
    let mut raws: Vec<&str> = flags.into_iter().map(|f| f.as_str()).collect();
    raws.sort_unstable();
    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    for r in raws {
        ctx.update(r.as_bytes());
        ctx.update(b"\0");
    }
    ctx.finish().as_ref().to_vec()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn parses_group_name_and_optional_arg() {
        let f = BuildFlag::parse("hardware/speed/3").unwrap();
        assert_eq!(f.group(), FlagGroup::Hardware);
        assert_eq!(f.name(), "speed");
        assert_eq!(f.arg(), Some("3"));
    }

    #[test]
    fn rejects_unknown_group() {
        assert!(BuildFlag::parse("bogus/thing").is_err());
    }

    #[test]
    fn dedups_by_raw_text_regardless_of_construction_path() {
        let mut set: HashSet<BuildFlag> = HashSet::new();
        set.insert(BuildFlag::parse("warning/all").unwrap());
        set.insert(BuildFlag::parse("warning/all").unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn flag_set_hash_is_order_independent() {
        let a = [BuildFlag::parse("warning/all").unwrap(), BuildFlag::parse("optimize/2").unwrap()];
        let b = [BuildFlag::parse("optimize/2").unwrap(), BuildFlag::parse("warning/all").unwrap()];
        assert_eq!(hash_flag_set(&a), hash_flag_set(&b));
    }

    #[test]
    fn stage_applicability_follows_group() {
        let f = BuildFlag::parse("library/pthread").unwrap();
        assert!(f.applies_to(Stage::LINK));
        assert!(!f.applies_to(Stage::COMPILE));
    }
}
