use crate::HashMap;
use color_eyre::eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Fraction manifests are resolved relative to this directory.
pub const FRAC_MANIFEST_ROOT: &str = "./manifest";

/// One output extractor: run `cmd` through the shell and collect every
/// non-empty `format` regex match from its stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub cmd: String,
    pub format: String,
}

/// A manifest-declared named unit of work. Every field may be omitted in
/// the manifest file and behaves as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, OutputConfig>,
}

/// The per-node declarative document: node name, codebase globs, functions,
/// warmup commands and optional per-role manifest fractions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub codebase: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub functions: HashMap<String, FunctionConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warmup: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fractions: HashMap<String, String>,
}

impl Manifest {
    /// Loads a manifest from disk and merges in the fractions selected by
    /// `role`: each `-`-separated token of the role that names a fraction
    /// contributes that fraction's `codebase`, `functions` and `warmup`, in
    /// declaration order; later entries override earlier ones per key.
    pub fn load(file: impl AsRef<Path>, role: &str) -> Result<Self, Report> {
        let file = file.as_ref();
        let contents = std::fs::read_to_string(file)
            .wrap_err_with(|| format!("reading manifest {:?}", file))?;
        let mut manifest: Manifest = serde_json::from_str(&contents)
            .wrap_err_with(|| format!("parsing manifest {:?}", file))?;

        for token in role.split('-') {
            if let Some(frac) = manifest.fractions.get(token).cloned() {
                let frac_file = Path::new(FRAC_MANIFEST_ROOT).join(frac);
                let frac = Self::load(&frac_file, "")?;
                manifest.codebase.extend(frac.codebase);
                manifest.functions.extend(frac.functions);
                manifest.warmup.extend(frac.warmup);
            }
        }
        Ok(manifest)
    }

    /// The globs selected by a `sync_code` basename: `*` unions every
    /// codebase entry; anything else must name one.
    pub fn codebase_globs(
        &self,
        basename: &str,
    ) -> Option<Vec<String>> {
        if basename == "*" {
            let globs = self
                .codebase
                .values()
                .flat_map(|globs| globs.iter().cloned())
                .collect();
            Some(globs)
        } else {
            self.codebase.get(basename).cloned()
        }
    }
}
