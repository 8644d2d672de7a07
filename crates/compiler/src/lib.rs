//! Quill Compiler Library
//!
//! Compiles Quill source modules into a loadable program image for the
//! Quill register VM: a type table, a function table with bytecode
//! bodies and a literal pool, the global-object layout and a function
//! handle table.
//!
//! # Embedding
//!
//! ```rust,ignore
//! use quill_core::ImageVm;
//! use quillc::Compiler;
//!
//! let mut compiler = Compiler::new(Box::new(ImageVm::new()), "warning-level=3")?;
//! compiler.compile("main", "function int main() { return 0; }")?;
//! let image = compiler.link()?;
//! ```
//!
//! # Modules
//!
//! - [`lexer`]: token stream with save/restore locators
//! - [`registry`]: class records and the type table
//! - [`frame`]: the simulated register file and data stack
//! - `expr` / `stmt` / `decl`: the parse-and-emit front end
//! - `overload`: best-match overload resolution
//! - `emit`: opcode selection
//! - `clause`: the clause/goto back-patching engine
//! - `literals`: the literal pool and anonymous-function resolver
//! - [`driver`]: the two-pass driver and imports
//! - `linker`: final offsets, handle patching, peephole
//! - [`typeinfo`]: XML export of the type registry
//! - [`errors`] / [`options`]: diagnostics and configuration

pub mod errors;
pub mod frame;
pub mod lexer;
pub mod options;
pub mod registry;
pub mod typeinfo;

mod clause;
mod decl;
pub mod driver;
mod emit;
mod expr;
mod linker;
mod literals;
mod overload;
mod state;
mod stmt;

pub use driver::{FsLoader, SourceLoader};
pub use errors::{CompileError, ErrorFormat, ErrorKind, WarningKind};
pub use options::{LocalVarMode, Options, ProjectConfig};
pub use state::Compiler;
pub use typeinfo::{TypeSummary, parse_type_info, registry_summaries};

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use quill_core::{
    ImageVm, ProgramImage, TYPE_EXCEPTION, TYPE_INT, TYPE_THREAD, TypeFamily, TypeId, Vm,
};

use crate::registry::{ClassState, Registry};
use crate::state::Pass;

/// The built-in exception interface, compiled at startup. All throwable
/// script classes implement it.
const INTERFACE_EXCEPTION: &str = "\
strict interface exception {
    /// Returns the error code for this exception; any non-zero value.
    method int getError();
    /// Returns the error message, or an empty string when unavailable.
    method string getMessage();
}";

/// The predefined type table, in fixed id order.
const PREDEFINED: &[(&str, TypeFamily, bool)] = &[
    ("null", TypeFamily::Undefined, false),
    ("var", TypeFamily::Undefined, false),
    ("int", TypeFamily::Integral, false),
    ("float", TypeFamily::Integral, false),
    ("string", TypeFamily::Class, true),
    ("array", TypeFamily::Class, true),
    ("global", TypeFamily::Class, false),
    ("__delegate", TypeFamily::Delegate, false),
];

impl Compiler {
    /// Create a compiler session around a VM host: register the
    /// predefined types, install the default aliases (`bool`, `char`),
    /// compile the built-in `exception` interface and open `__init`.
    pub fn new(vm: Box<dyn Vm>, option_list: &str) -> Result<Compiler, CompileError> {
        let mut compiler = Compiler {
            vm,
            registry: Registry::new(),
            loader: Box::new(FsLoader),
            units: Vec::new(),
            pass: Pass::Precompile,
            cur_class: 0,
            cur_func: 0,
            out_class: 0,
            out_func: 0,
            vars: Vec::new(),
            locals: Vec::new(),
            regs: crate::frame::RegisterFile::new(),
            stack: crate::frame::SimStack::new(),
            block_level: 0,
            scope_starts: Vec::new(),
            loop_unroll_depth: 0,
            cont_unroll_depth: 0,
            break_fixups: Vec::new(),
            cont_fixups: Vec::new(),
            break_ctx: 0,
            cont_ctx: 0,
            clauses: Vec::new(),
            var_reg_budget: 0,
            probing: 0,
            call_wants_value: true,
            options_stack: vec![Options::default()],
            errors: Vec::new(),
            flushed: 0,
            num_errors: 0,
            num_warnings: 0,
            num_units: 0,
            fatal_state: false,
            fatal_handler: None,
            intro_finished: false,
            init_func: 0,
            linked: false,
            next_func_handle: 0,
            import_paths: Vec::new(),
            imported: HashSet::new(),
            opt_saved_instr: 0,
            opt_size_before: 0,
            opt_size_after: 0,
            start_time: None,
        };

        for &(name, family, native) in PREDEFINED {
            let id = compiler.create_type(name, quill_core::TYPE_GLOBAL, family, native)?;
            compiler.registry.class_mut(id).state = ClassState::BodyClosed;
        }

        compiler.cg_begin_intro()?;

        // The exception interface is ordinary source; compiling it must
        // land on its reserved id.
        compiler.compile_unit("exception", "", INTERFACE_EXCEPTION)?;
        if compiler.registry.find_by_name("exception") != Some(TYPE_EXCEPTION) {
            return Err(compiler.error(
                errors::ErrorKind::FatalTypeIdDesync,
                "built-in exception interface landed on the wrong type id",
            ));
        }

        let thread = compiler.create_type(
            "__thread",
            quill_core::TYPE_GLOBAL,
            TypeFamily::Thread,
            false,
        )?;
        debug_assert_eq!(thread, TYPE_THREAD);
        compiler.registry.class_mut(thread).state = ClassState::BodyClosed;

        for alias in ["bool", "char"] {
            compiler
                .registry
                .add_alias(alias, TYPE_INT)
                .map_err(|msg| CompileError::new(ErrorKind::IdentifierAlreadyDefined, msg))?;
        }

        compiler.set_options(option_list)?;
        Ok(compiler)
    }

    /// Replace the text loader used for file imports.
    pub fn set_loader(&mut self, loader: Box<dyn SourceLoader>) {
        self.loader = loader;
    }

    /// Add a translation unit. Returns the first error of the unit, if
    /// any; compilation continues past recoverable errors so several
    /// can be queued for [`error_text`](Compiler::error_text).
    pub fn compile(&mut self, name: &str, text: &str) -> Result<(), CompileError> {
        self.compile_unit(name, "", text)
    }

    /// Load and compile a file through the pluggable loader.
    pub fn compile_file(&mut self, path: &Path) -> Result<(), CompileError> {
        let text = self.loader.load(path).map_err(|msg| {
            let err = CompileError::new(ErrorKind::FileOpen, msg);
            self.record_error(&err);
            err
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.compile_unit(&name, &path.display().to_string(), &text)
    }

    /// Finalize all pending code, close `__init` and install the image
    /// into the VM host. The image is also returned.
    pub fn link(&mut self) -> Result<ProgramImage, CompileError> {
        let image = self.link_program()?;
        self.vm.install(image.clone());
        Ok(image)
    }

    /// Parse a `key=value[,...]` option list. Keys under `vm.` forward to
    /// the host.
    pub fn set_options(&mut self, list: &str) -> Result<(), CompileError> {
        let mut opts = self.options_stack[0].clone();
        let vm = &mut self.vm;
        let result = opts.parse_list(list, |key, value| {
            vm.set_option(key, value).map_err(|e| e.to_string())
        });
        match result {
            Ok(()) => {
                self.options_stack[0] = opts;
                Ok(())
            }
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Map an identifier prefix to a filesystem prefix for `import`.
    pub fn add_import_path(&mut self, name: &str, path: impl Into<PathBuf>) {
        let path = path.into();
        match self
            .import_paths
            .iter_mut()
            .find(|(prefix, _)| prefix == name)
        {
            Some(entry) => entry.1 = path,
            None => self.import_paths.push((name.to_string(), path)),
        }
    }

    /// Imperatively import a class, as if `import name;` had appeared
    /// in source.
    pub fn import_class(&mut self, name: &str) -> Result<(), CompileError> {
        self.import_one(name)
    }

    /// Forward-declare a class by name.
    pub fn forward_class(&mut self, name: &str) -> Result<TypeId, CompileError> {
        if let Some(t) = self.registry.find_by_name(name) {
            return Ok(t);
        }
        self.create_type(name, quill_core::TYPE_GLOBAL, TypeFamily::Class, false)
    }

    /// Dump the type registry as an XML tree.
    pub fn export_type_info(&mut self, path: &Path) -> Result<(), CompileError> {
        let xml = typeinfo::to_xml(&self.registry);
        std::fs::write(path, xml).map_err(|e| {
            let err = CompileError::new(
                ErrorKind::FileOpen,
                format!("cannot write type info to '{}': {}", path.display(), e),
            );
            self.record_error(&err);
            err
        })
    }

    /// The type registry XML as a string.
    pub fn type_info_xml(&self) -> String {
        typeinfo::to_xml(&self.registry)
    }

    /// Wrap `text` in an anonymous void function, compile, link and
    /// invoke it through the VM host.
    pub fn compile_and_run(&mut self, text: &str) -> Result<(), CompileError> {
        let ident = format!("anonymous_{}", self.random_identifier(16));
        let source = format!("function {}() {{ {} }}", ident, text);
        self.compile("anonymous function", &source)?;
        self.link()?;
        let handle = self
            .registry
            .class(quill_core::TYPE_GLOBAL)
            .funcs
            .iter()
            .find(|f| f.name == ident)
            .and_then(|f| f.handle)
            .ok_or_else(|| {
                CompileError::new(ErrorKind::FatalInternal, "anonymous function vanished")
            })?;
        self.vm
            .run_init()
            .map_err(|e| CompileError::new(ErrorKind::VmFailure, e.to_string()))?;
        self.vm
            .invoke(handle)
            .map_err(|e| CompileError::new(ErrorKind::VmFailure, e.to_string()))
    }

    /// Stream one queued diagnostic message; None when drained. The
    /// queue is a cursor, so new messages keep arriving in order.
    pub fn error_text(&mut self) -> Option<String> {
        if self.flushed < self.errors.len() {
            let text = self.errors[self.flushed].clone();
            self.flushed += 1;
            Some(text)
        } else {
            None
        }
    }

    /// Install the fatal-error callback invoked on internal
    /// consistency failures.
    pub fn set_fatal_handler(&mut self, handler: Box<dyn FnMut(&str)>) {
        if !self.fatal_state {
            self.fatal_handler = Some(handler);
        }
    }

    pub fn error_count(&self) -> usize {
        self.num_errors
    }

    pub fn warning_count(&self) -> usize {
        self.num_warnings
    }

    /// Read-only view of the class table, mainly for tooling and tests.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The VM host, for embedders that need it back.
    pub fn vm(&mut self) -> &mut dyn Vm {
        self.vm.as_mut()
    }

    /// Tear down the compiler session and hand the VM host back; the
    /// host keeps the installed image and stays usable to run it.
    pub fn into_vm(self) -> Box<dyn Vm> {
        self.vm
    }
}

/// Compile a single source text to an image with a throwaway
/// storage-only VM. Convenience for tests and the CLI `check` path.
pub fn compile_to_image(source: &str) -> Result<ProgramImage, CompileError> {
    let mut compiler = Compiler::new(Box::new(ImageVm::new()), "")?;
    compiler.compile("input", source)?;
    compiler.link()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registers_predefined_types() {
        let compiler = Compiler::new(Box::new(ImageVm::new()), "").unwrap();
        let reg = compiler.registry();
        assert_eq!(reg.find_by_name("int"), Some(quill_core::TYPE_INT));
        assert_eq!(reg.find_by_name("exception"), Some(TYPE_EXCEPTION));
        assert_eq!(reg.find_by_name("bool"), Some(TYPE_INT));
        assert_eq!(reg.find_by_name("char"), Some(TYPE_INT));
        assert_eq!(reg.family(TYPE_EXCEPTION), TypeFamily::Interface);
        // The exception interface carries its two methods.
        let exception = reg.class(TYPE_EXCEPTION);
        assert_eq!(exception.funcs.len(), 2);
        assert_eq!(exception.funcs[0].name, "getError");
        assert_eq!(exception.funcs[1].name, "getMessage");
    }

    #[test]
    fn test_compile_minimal_program() {
        let image = compile_to_image("function int main() { return 42; }").unwrap();
        assert!(image.find_function(quill_core::TYPE_GLOBAL, "main").is_some());
        assert!(image.init_function.is_some());
    }

    #[test]
    fn test_error_text_streams_once() {
        let mut compiler = Compiler::new(Box::new(ImageVm::new()), "").unwrap();
        let result = compiler.compile("bad", "function int f() { return }");
        assert!(result.is_err());
        assert!(compiler.error_text().is_some());
        while compiler.error_text().is_some() {}
        assert!(compiler.error_text().is_none());
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let err = Compiler::new(Box::new(ImageVm::new()), "bogus=1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadOption);
    }
}
