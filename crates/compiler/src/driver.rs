//! The two-pass driver.
//!
//! Each translation unit is walked twice over the same token stream:
//! pass 1 (precompile) records declarations and skips function bodies
//! brace-balanced, pass 2 (compile) compiles bodies and global
//! initializers. Imports resolve depth-first during pass 1, so a class
//! referenced in pass 1 of any file is available in pass 2 of every
//! file.
//!
//! The driver also owns the generated `__init` function: it is opened
//! when the compiler is created, re-opened (trailing `ret` rewound) at
//! every `compile` call, and closed at `link`.

use std::path::{Path, PathBuf};

use quill_core::{Opcode, REG_GLOBALS, TYPE_GLOBAL, Word};

use crate::errors::{CompileError, ErrorKind};
use crate::lexer::{Locator, Sym, TokenKind, TokenStream};
use crate::registry::{FuncRecord, FuncState};
use crate::state::{Compiler, Pass, Unit};

/// Pluggable text loader for `import`ed script files. The compiler
/// never touches the filesystem directly.
pub trait SourceLoader {
    fn load(&self, path: &Path) -> Result<String, String>;
}

/// The default loader: plain filesystem reads.
#[derive(Debug, Default)]
pub struct FsLoader;

impl SourceLoader for FsLoader {
    fn load(&self, path: &Path) -> Result<String, String> {
        std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))
    }
}

impl Compiler {
    // ----- unit compilation --------------------------------------------------

    /// Compile one translation unit through both passes.
    pub(crate) fn compile_unit(
        &mut self,
        name: &str,
        path: &str,
        text: &str,
    ) -> Result<(), CompileError> {
        if self.fatal_state {
            return Err(CompileError::new(
                ErrorKind::FatalInternal,
                "compiler is in a fatal state",
            ));
        }
        if self.num_units == 0 {
            self.start_time = Some(std::time::Instant::now());
            self.log_verbose(&format!(
                "*** Quill compiler v{} ***",
                env!("CARGO_PKG_VERSION")
            ));
        }
        self.num_units += 1;
        let display = if path.is_empty() { name } else { path };
        self.log_verbose(&format!("Compiling '{}'", display));

        let stream = match TokenStream::new(name, text) {
            Ok(stream) => stream,
            Err(err) => {
                self.record_error(&err);
                return Err(err);
            }
        };
        self.units.push(Unit {
            name: name.to_string(),
            path: path.to_string(),
            stream,
            usings: Vec::new(),
        });
        self.cg_resume_intro();

        // Imports recurse into compile_unit mid-pass; the outer pass
        // resumes where it was.
        let saved_pass = self.pass;
        let result = self
            .run_pass(Pass::Precompile)
            .and_then(|()| self.run_pass(Pass::Compile))
            .and_then(|()| {
                // Function literals in this unit's global initializers
                // must compile while the unit's tokens are still here.
                let init = self.init_func;
                self.resolve_function_literals(TYPE_GLOBAL, init)
            });
        self.pass = saved_pass;
        self.units.pop();
        result
    }

    fn run_pass(&mut self, pass: Pass) -> Result<(), CompileError> {
        self.pass = pass;
        self.stream().restore(Locator(0));
        let mut first_err: Option<CompileError> = None;
        while !self.stream().at_end() {
            match self.parse_declaration() {
                Ok(()) => {}
                Err(err) if err.kind.is_fatal() => return Err(err),
                Err(err) => {
                    // Keep going so one unit can surface several errors;
                    // resynchronize at the next declaration boundary.
                    first_err.get_or_insert(err);
                    self.resync_top_level();
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Skip tokens until a plausible top-level declaration boundary:
    /// past a `;` at depth zero, or past the `}` closing an open brace.
    fn resync_top_level(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.stream().peek().kind.clone() {
                TokenKind::Eof => return,
                TokenKind::Sym(Sym::LBrace) => {
                    depth += 1;
                    self.stream().advance();
                }
                TokenKind::Sym(Sym::RBrace) => {
                    self.stream().advance();
                    if depth <= 1 {
                        return;
                    }
                    depth -= 1;
                }
                TokenKind::Sym(Sym::Semicolon) => {
                    self.stream().advance();
                    if depth == 0 {
                        return;
                    }
                }
                _ => self.stream().advance(),
            }
        }
    }

    // ----- __init ------------------------------------------------------------

    /// Create the global `__init` function and emit the global-object
    /// allocation. Called once when the compiler is created.
    pub(crate) fn cg_begin_intro(&mut self) -> Result<(), CompileError> {
        let index = self.registry.class(TYPE_GLOBAL).funcs.len();
        let handle = self.alloc_func_handle();
        let mut record = FuncRecord::new(TYPE_GLOBAL, index, "__init");
        record.handle = Some(handle);
        record.state = FuncState::Defined;
        self.registry.class_mut(TYPE_GLOBAL).funcs.push(record);
        self.init_func = index;
        self.out_class = TYPE_GLOBAL;
        self.out_func = index;
        self.cur_class = TYPE_GLOBAL;
        self.cur_func = index;
        self.emit(
            Opcode::Alloc,
            &[TYPE_GLOBAL as Word, REG_GLOBALS as Word],
        );
        self.intro_finished = false;
        Ok(())
    }

    /// Re-open `__init` for a further `compile` call: rewind the
    /// trailing `ret`.
    pub(crate) fn cg_resume_intro(&mut self) {
        if !self.intro_finished {
            return;
        }
        let code = &mut self.registry.classes[TYPE_GLOBAL].funcs[self.init_func].code;
        if code.last() == Some(&(Opcode::Ret as Word)) {
            code.pop();
        }
        self.intro_finished = false;
        self.linked = false;
    }

    /// Close `__init` with its final `ret`.
    pub(crate) fn cg_finish_intro(&mut self) {
        if self.intro_finished {
            return;
        }
        let init = self.init_func;
        self.registry.classes[TYPE_GLOBAL].funcs[init]
            .code
            .push(Opcode::Ret as Word);
        self.intro_finished = true;
    }

    // ----- imports -----------------------------------------------------------

    /// `import all;` or `import a.b.c;`
    pub(crate) fn p_import_statement(&mut self) -> Result<(), CompileError> {
        self.stream().advance(); // import

        if self.pass == Pass::Compile {
            // Imports resolve fully during pass 1.
            while !self.stream().eat_sym(Sym::Semicolon) {
                if self.stream().at_end() {
                    return Err(self.error(
                        ErrorKind::MissingSemicolon,
                        "unterminated import statement",
                    ));
                }
                self.stream().advance();
            }
            return Ok(());
        }

        // `import all;` pulls in every registered native class.
        if let TokenKind::Ident(word) = self.stream().peek().kind.clone() {
            if word == "all" && self.stream().peek2().kind == TokenKind::Sym(Sym::Semicolon) {
                self.stream().advance();
                self.stream().advance();
                let names = self.vm.native_names();
                for name in names {
                    self.import_one(&name)?;
                }
                return Ok(());
            }
        }

        let mut segments = vec![self.expect_ident("import name")?];
        while self.stream().eat_sym(Sym::Dot) {
            segments.push(self.expect_ident("import name segment")?);
        }
        self.expect_sym(Sym::Semicolon, "';' after import")?;
        self.import_one(&segments.join("."))
    }

    /// Resolve one import: a native class from the registry, or a
    /// script file through the import-path map.
    pub(crate) fn import_one(&mut self, name: &str) -> Result<(), CompileError> {
        if self.imported.contains(name) {
            return Ok(());
        }
        self.imported.insert(name.to_string());
        tracing::debug!("importing '{}'", name);

        // A native class: synthesize its declaration header and parse it.
        if let Some(native) = self.vm.native_decl(name) {
            let unit_name = format!("import {}", name);
            return self.compile_unit(&unit_name, "", &native.declaration);
        }

        if !self.opts().allow_file_import {
            return Err(self.error(
                ErrorKind::ImportNotFound,
                format!("'{}' is not a native class and file import is disabled", name),
            ));
        }

        let path = self.resolve_import_path(name);
        let text = match self.loader.load(&path) {
            Ok(text) => text,
            Err(msg) => {
                return Err(self.error(
                    ErrorKind::FileOpen,
                    format!("cannot import '{}': {}", name, msg),
                ));
            }
        };
        let path_display = path.display().to_string();
        self.compile_unit(name, &path_display, &text)
    }

    /// `a.b.c` resolves to `<mapped a>/b/c.<ext>`, or `a/b/c.<ext>` when no
    /// import path matches the first segment.
    pub(crate) fn resolve_import_path(&self, name: &str) -> PathBuf {
        let segments: Vec<&str> = name.split('.').collect();
        let ext = &self.opts().file_extension;
        let mapped = self
            .import_paths
            .iter()
            .find(|(prefix, _)| prefix == segments[0]);
        let (mut path, rest) = match mapped {
            Some((_, base)) => (base.clone(), &segments[1..]),
            None => (PathBuf::new(), &segments[..]),
        };
        for segment in rest {
            path.push(segment);
        }
        path.set_extension(ext);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_loader_missing_file() {
        let loader = FsLoader;
        assert!(loader.load(Path::new("/no/such/file.ql")).is_err());
    }
}
