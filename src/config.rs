use std::path::Path;

use serde::Deserialize;

use crate::diagnostics::CompileError;

/// Options controlling ISA selection and module emission, read from the
/// `[codegen]` table of a `vesta.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodegenOptions {
    /// Target triple passed to Cranelift's ISA lookup.
    pub target: String,
    /// Emit position-independent code.
    pub pic: bool,
    /// Name of the emitted object module.
    pub module_name: String,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            target: "x86_64-unknown-linux-gnu".to_string(),
            pic: true,
            module_name: "vesta_module".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TomlFile {
    #[serde(default)]
    codegen: CodegenOptions,
}

/// Load codegen options from a `vesta.toml`. Missing keys fall back to
/// defaults; a missing `[codegen]` table yields all defaults.
pub fn load_options(path: &Path) -> Result<CodegenOptions, CompileError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CompileError::config(format!("failed to read config: {e}"), path.to_path_buf()))?;
    parse_options(&text).map_err(|msg| CompileError::config(msg, path.to_path_buf()))
}

/// Parse codegen options from TOML text.
pub fn parse_options(text: &str) -> Result<CodegenOptions, String> {
    let file: TomlFile = toml::from_str(text).map_err(|e| e.to_string())?;
    Ok(file.codegen)
}
