//! Quill Core
//!
//! The fixed contracts shared between the Quill compiler and the virtual
//! machine: predefined type ids and families, the register layout, the
//! opcode set and instruction-word encoding, the loadable program image,
//! and the narrow [`Vm`] trait the compiler programs against.
//!
//! Nothing in this crate executes code. The interpreter lives with the
//! host; [`ImageVm`] is a storage-only stand-in for tooling and tests.

pub mod image;
pub mod opcode;
pub mod types;
pub mod vm;

pub use image::{ConstValue, FunctionEntry, GlobalLayout, ProgramImage, TypeEntry};
pub use opcode::{BadOpcode, Opcode, Word, instructions};
pub use types::{
    NUM_PREDEFINED_TYPES, NUM_REGISTERS, REG_FIRST_VAR, REG_GLOBALS, REG_RESULT, REG_THIS,
    TYPE_ARRAY, TYPE_DELEGATE, TYPE_EXCEPTION, TYPE_FLOAT, TYPE_GLOBAL, TYPE_INT, TYPE_NULL,
    TYPE_STRING, TYPE_THREAD, TYPE_VAR, TypeFamily, TypeId,
};
pub use vm::{ImageVm, NativeDecl, Vm, VmError};
