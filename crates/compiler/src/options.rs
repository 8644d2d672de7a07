//! Compiler options.
//!
//! Options arrive as comma- or semicolon-separated `key=value` lists
//! (`set-option`, the CLI `-O` flag, or a `quill.toml` project file).
//! Keys beginning with `vm.` are forwarded to the VM host unparsed; any
//! other unknown key is a diagnosed error.

use serde::Deserialize;

use crate::errors::{CompileError, ErrorFormat, ErrorKind};

/// Where local variables live when a function body is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalVarMode {
    /// Prefer a free register until the per-function budget is spent,
    /// then fall back to stack slots.
    #[default]
    Auto,
    /// Always allocate stack slots.
    Stack,
    /// Always allocate registers; exhausting them is an error.
    Register,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// 0 silences all warnings; 5 reports everything.
    pub warning_level: u32,
    pub error_format: ErrorFormat,
    /// Per-unit progress and link statistics at info level.
    pub verbose: bool,
    /// 0 disables the link-time peephole pass entirely.
    pub optimize: u8,
    /// Extension appended when resolving `import a.b.c;` to a file.
    pub file_extension: String,
    pub allow_file_import: bool,
    /// Emit `rtchk` when narrowing from `var`/interface types.
    pub use_rtchk: bool,
    pub local_var_mode: LocalVarMode,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            warning_level: 3,
            error_format: ErrorFormat::Default,
            verbose: false,
            optimize: 2,
            file_extension: "ql".to_string(),
            allow_file_import: true,
            use_rtchk: true,
            local_var_mode: LocalVarMode::Auto,
        }
    }
}

impl Options {
    /// Parse a `key=value[,key=value...]` list into this option set.
    /// `forward` receives entries whose key starts with `vm.`, with the
    /// prefix stripped.
    pub fn parse_list(
        &mut self,
        list: &str,
        mut forward: impl FnMut(&str, &str) -> Result<(), String>,
    ) -> Result<(), CompileError> {
        for entry in list.split([',', ';']) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                CompileError::new(
                    ErrorKind::BadOption,
                    format!("option '{}' is not of the form key=value", entry),
                )
            })?;
            let key = key.trim();
            let value = value.trim();
            if let Some(vm_key) = key.strip_prefix("vm.") {
                forward(vm_key, value).map_err(|msg| {
                    CompileError::new(ErrorKind::BadOption, format!("vm option rejected: {}", msg))
                })?;
                continue;
            }
            self.set(key, value)?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), CompileError> {
        match key {
            "warning-level" => {
                self.warning_level = parse_range(key, value, 0, 5)?;
            }
            "error-format" => {
                self.error_format = match value {
                    "default" => ErrorFormat::Default,
                    "ms" => ErrorFormat::Ms,
                    _ => return Err(bad_value(key, value, "default, ms")),
                };
            }
            "verbose" => self.verbose = parse_bool(key, value)?,
            "optimize" => {
                self.optimize = parse_range(key, value, 0, 3)? as u8;
            }
            "file-extension" => {
                self.file_extension = value.trim_start_matches('.').to_string();
            }
            "allow-file-import" => self.allow_file_import = parse_bool(key, value)?,
            "use-rtchk" => self.use_rtchk = parse_bool(key, value)?,
            "local-var-mode" => {
                self.local_var_mode = match value {
                    "auto" => LocalVarMode::Auto,
                    "stack" => LocalVarMode::Stack,
                    "register" => LocalVarMode::Register,
                    _ => return Err(bad_value(key, value, "auto, stack, register")),
                };
            }
            // Legacy spelling of local-var-mode=stack.
            "stack-locals" => {
                if parse_bool(key, value)? {
                    self.local_var_mode = LocalVarMode::Stack;
                }
            }
            _ => {
                return Err(CompileError::new(
                    ErrorKind::BadOption,
                    format!("unknown option '{}'", key),
                ));
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CompileError> {
    match value {
        "on" | "yes" | "true" | "1" => Ok(true),
        "off" | "no" | "false" | "0" => Ok(false),
        _ => Err(bad_value(key, value, "on, off")),
    }
}

fn parse_range(key: &str, value: &str, min: u32, max: u32) -> Result<u32, CompileError> {
    let n: u32 = value
        .parse()
        .map_err(|_| bad_value(key, value, "a number"))?;
    if n < min || n > max {
        return Err(bad_value(key, value, &format!("{}..{}", min, max)));
    }
    Ok(n)
}

fn bad_value(key: &str, value: &str, expected: &str) -> CompileError {
    CompileError::new(
        ErrorKind::BadOption,
        format!("bad value '{}' for option '{}', expected {}", value, key, expected),
    )
}

/// `quill.toml` project configuration read by the CLI. Every field maps
/// onto [`Options`] or an import-path entry.
#[derive(Debug, Default, Deserialize)]
pub struct ProjectConfig {
    /// Option list in the same grammar as `set-option`.
    pub options: Option<String>,
    /// Identifier-prefix to directory mappings for `import`.
    #[serde(default)]
    pub import_paths: Vec<ImportPathEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ImportPathEntry {
    pub name: String,
    pub path: String,
}

impl ProjectConfig {
    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("bad project config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.warning_level, 3);
        assert_eq!(opts.file_extension, "ql");
        assert!(opts.use_rtchk);
        assert_eq!(opts.local_var_mode, LocalVarMode::Auto);
    }

    #[test]
    fn test_parse_list() {
        let mut opts = Options::default();
        opts.parse_list(
            "warning-level=1, error-format=ms; verbose=on, optimize=0",
            |_, _| Ok(()),
        )
        .unwrap();
        assert_eq!(opts.warning_level, 1);
        assert_eq!(opts.error_format, ErrorFormat::Ms);
        assert!(opts.verbose);
        assert_eq!(opts.optimize, 0);
    }

    #[test]
    fn test_unknown_key_is_error() {
        let mut opts = Options::default();
        let err = opts.parse_list("no-such-option=1", |_, _| Ok(())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadOption);
    }

    #[test]
    fn test_vm_namespace_is_forwarded() {
        let mut opts = Options::default();
        let mut seen = Vec::new();
        opts.parse_list("vm.heap-size=4096, verbose=on", |k, v| {
            seen.push((k.to_string(), v.to_string()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![("heap-size".to_string(), "4096".to_string())]);
        assert!(opts.verbose);
    }

    #[test]
    fn test_stack_locals_alias() {
        let mut opts = Options::default();
        opts.parse_list("stack-locals=on", |_, _| Ok(())).unwrap();
        assert_eq!(opts.local_var_mode, LocalVarMode::Stack);
    }

    #[test]
    fn test_project_config() {
        let cfg = ProjectConfig::parse(
            r#"
options = "warning-level=2"

[[import_paths]]
name = "runtime"
path = "lib/runtime"
"#,
        )
        .unwrap();
        assert_eq!(cfg.options.as_deref(), Some("warning-level=2"));
        assert_eq!(cfg.import_paths.len(), 1);
        assert_eq!(cfg.import_paths[0].name, "runtime");
    }
}
