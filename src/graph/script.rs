//! `build.yml` parsing: `recursive_config`/`file_config`/target documents.
//!
//! A script's top-level keys are either `recursive_config` (applies to its
//! directory and all descendant directories), `file_config` (applies only
//! to this script), or a target name. Both config kinds route to a named
//! toolchain's settings; everything else is `load_target`.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolchainSettings {
    #[serde(default)]
    pub arches: Vec<String>,
    #[serde(default)]
    pub configs: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl ToolchainSettings {
    /// A more specific scope's settings override the broader scope's
    /// non-empty fields; flags from both scopes accumulate.
    pub fn merge_from(&mut self, more_specific: &ToolchainSettings) {
        if !more_specific.arches.is_empty() {
            self.arches = more_specific.arches.clone();
        }
        if !more_specific.configs.is_empty() {
            self.configs = more_specific.configs.clone();
        }
        for f in &more_specific.flags {
            if !self.flags.contains(f) {
                self.flags.push(f.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConstantGeneratorList {
    List(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetDoc {
    pub toolchain: Option<String>,
    #[serde(rename = "type")]
    pub ty: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub arches: Option<Vec<String>>,
    pub boards: Option<Vec<String>>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub constants: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub pins: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TopLevelDoc {
    Config(ConfigBlock),
    Target(TargetDoc),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigBlock {
    #[serde(flatten)]
    pub by_toolchain: HashMap<String, ToolchainSettings>,
}

/// One parsed `build.yml`: the raw top-level keys, split into config
/// blocks and targets, in source order (lexical parse order matters for
/// §4.2/§4.3 re-derivation rules).
pub struct ParsedScript {
    pub recursive_config: HashMap<String, ToolchainSettings>,
    pub file_config: HashMap<String, ToolchainSettings>,
    pub targets: Vec<(String, TargetDoc)>,
}

pub fn parse_script(body: &[u8]) -> Result<ParsedScript, String> {
    let value: serde_yaml::Value = serde_yaml::from_slice(body).map_err(|e| e.to_string())?;
    let mapping = value.as_mapping().ok_or_else(|| "build.yml must be a mapping at the top level".to_owned())?;

    let mut recursive_config = HashMap::new();
    let mut file_config = HashMap::new();
    let mut targets = Vec::new();

    for (k, v) in mapping {
        let key = k.as_str().ok_or_else(|| "non-string top-level key".to_owned())?;
        match key {
            "recursive_config" => {
                let block: ConfigBlock = serde_yaml::from_value(v.clone()).map_err(|e| e.to_string())?;
                recursive_config = block.by_toolchain;
            }
            "file_config" => {
                let block: ConfigBlock = serde_yaml::from_value(v.clone()).map_err(|e| e.to_string())?;
                file_config = block.by_toolchain;
            }
            name => {
                let doc: TargetDoc = serde_yaml::from_value(v.clone()).map_err(|e| format!("target {:?}: {}", name, e))?;
                targets.push((name.to_owned(), doc));
            }
        }
    }

    Ok(ParsedScript { recursive_config, file_config, targets })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_targets_and_config_blocks() {
        let yaml = br#"
recursive_config:
  c++:
    arches: [x86_64-linux-gnu]
    configs: [debug, release]
hello:
  toolchain: c++/x86_64-linux-gnu
  sources: [main.c]
"#;
        let parsed = parse_script(yaml).unwrap();
        assert_eq!(parsed.targets.len(), 1);
        assert_eq!(parsed.targets[0].0, "hello");
        assert!(parsed.recursive_config.contains_key("c++"));
    }

    #[test]
    fn rejects_non_mapping_documents() {
        assert!(parse_script(b"- not\n- a\n- mapping\n").is_err());
    }
}
