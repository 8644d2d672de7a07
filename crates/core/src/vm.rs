//! The narrow compiler-facing VM contract.
//!
//! The compiler never touches the interpreter. It needs exactly four
//! things from the runtime: type-record reservation (so type ids stay in
//! sync on both sides), constant-handle allocation at link time, the
//! native type-library registry (an opaque reflection service that can
//! synthesize declaration headers for `import`), and an entry point to
//! invoke a linked function for compile-and-run.

use std::collections::HashMap;

use crate::image::{ConstValue, ProgramImage};
use crate::types::{TypeFamily, TypeId};

/// Errors the VM side can report through this contract.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// The host does not execute code (e.g. [`ImageVm`]).
    NotExecutable,
    /// No function exists for the given handle.
    BadHandle(usize),
    /// An option in the VM namespace was rejected.
    BadOption(String),
    /// Execution failed with a runtime message.
    Runtime(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::NotExecutable => write!(f, "this VM host does not execute code"),
            VmError::BadHandle(h) => write!(f, "no function for handle {}", h),
            VmError::BadOption(o) => write!(f, "bad VM option: {}", o),
            VmError::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

/// A native class known to the runtime's type-library registry.
///
/// The declaration text is a Quill declaration header (`class`/`interface`
/// body without function bodies) the compiler parses when the class is
/// imported.
#[derive(Debug, Clone)]
pub struct NativeDecl {
    pub name: String,
    pub declaration: String,
}

/// What the compiler requires of the runtime.
pub trait Vm {
    /// Reserve a runtime type record and return its id. The compiler
    /// creates its class record at exactly this slot; a mismatch is a
    /// fatal consistency error on the compiler side.
    fn reserve_type(&mut self, name: &str, family: TypeFamily) -> TypeId;

    /// Number of type records reserved so far.
    fn type_count(&self) -> usize;

    /// Allocate a constant handle. Equal values may share a handle.
    fn alloc_handle(&mut self, value: ConstValue) -> usize;

    /// The constant table built so far, in handle order.
    fn constant_table(&self) -> Vec<ConstValue>;

    /// Look up a native class declaration by qualified name.
    fn native_decl(&self, name: &str) -> Option<NativeDecl>;

    /// All registered native class names, for `import all`.
    fn native_names(&self) -> Vec<String>;

    /// Handle an option in the VM namespace (`vm.` prefix stripped).
    fn set_option(&mut self, key: &str, value: &str) -> Result<(), VmError>;

    /// Receive the linked image.
    fn install(&mut self, image: ProgramImage);

    /// Run the image's `__init` function.
    fn run_init(&mut self) -> Result<(), VmError>;

    /// Invoke a linked function by handle.
    fn invoke(&mut self, handle: usize) -> Result<(), VmError>;
}

/// A storage-only VM host: it keeps everything the compiler produces and
/// satisfies the contract, but does not execute. Useful for tooling
/// (build/check/dump-types) and for tests.
#[derive(Default)]
pub struct ImageVm {
    types: Vec<(String, TypeFamily)>,
    constants: Vec<ConstValue>,
    natives: HashMap<String, NativeDecl>,
    options: HashMap<String, String>,
    image: Option<ProgramImage>,
}

impl ImageVm {
    pub fn new() -> Self {
        ImageVm::default()
    }

    /// Register a native class declaration, making it importable.
    pub fn register_native(&mut self, name: &str, declaration: &str) {
        self.natives.insert(
            name.to_string(),
            NativeDecl {
                name: name.to_string(),
                declaration: declaration.to_string(),
            },
        );
    }

    pub fn image(&self) -> Option<&ProgramImage> {
        self.image.as_ref()
    }

    pub fn take_image(&mut self) -> Option<ProgramImage> {
        self.image.take()
    }

    pub fn constants(&self) -> &[ConstValue] {
        &self.constants
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

impl Vm for ImageVm {
    fn reserve_type(&mut self, name: &str, family: TypeFamily) -> TypeId {
        self.types.push((name.to_string(), family));
        self.types.len() - 1
    }

    fn type_count(&self) -> usize {
        self.types.len()
    }

    fn alloc_handle(&mut self, value: ConstValue) -> usize {
        if let Some(i) = self.constants.iter().position(|c| *c == value) {
            return i;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn constant_table(&self) -> Vec<ConstValue> {
        self.constants.clone()
    }

    fn native_decl(&self, name: &str) -> Option<NativeDecl> {
        self.natives.get(name).cloned()
    }

    fn native_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.natives.keys().cloned().collect();
        names.sort();
        names
    }

    fn set_option(&mut self, key: &str, value: &str) -> Result<(), VmError> {
        self.options.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn install(&mut self, image: ProgramImage) {
        self.image = Some(image);
    }

    fn run_init(&mut self) -> Result<(), VmError> {
        Err(VmError::NotExecutable)
    }

    fn invoke(&mut self, _handle: usize) -> Result<(), VmError> {
        Err(VmError::NotExecutable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_type_ids_are_sequential() {
        let mut vm = ImageVm::new();
        assert_eq!(vm.reserve_type("null", TypeFamily::Undefined), 0);
        assert_eq!(vm.reserve_type("var", TypeFamily::Undefined), 1);
        assert_eq!(vm.type_count(), 2);
    }

    #[test]
    fn test_handles_dedupe_equal_values() {
        let mut vm = ImageVm::new();
        let a = vm.alloc_handle(ConstValue::Int(42));
        let b = vm.alloc_handle(ConstValue::Str("x".into()));
        let c = vm.alloc_handle(ConstValue::Int(42));
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_native_registry() {
        let mut vm = ImageVm::new();
        vm.register_native("runtime.file", "class file { method file(); }");
        assert!(vm.native_decl("runtime.file").is_some());
        assert!(vm.native_decl("runtime.socket").is_none());
        assert_eq!(vm.native_names(), vec!["runtime.file".to_string()]);
    }
}
