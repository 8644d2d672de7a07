//! Type identifiers and families shared between compiler and VM.
//!
//! A `TypeId` is assigned by the VM when a type record is reserved and is
//! equal to the type's index in both the runtime type table and the
//! compiler's class table. The predefined ids below are a fixed contract:
//! they are created in this order by `Compiler::new` and the VM relies on
//! their values when loading an image.

use serde::{Deserialize, Serialize};

/// Runtime/compiler shared type identifier. Doubles as the index into the
/// type table on both sides of the boundary.
pub type TypeId = usize;

pub const TYPE_NULL: TypeId = 0;
/// The dynamic type. Everything is implicitly convertible to and from `var`.
pub const TYPE_VAR: TypeId = 1;
pub const TYPE_INT: TypeId = 2;
pub const TYPE_FLOAT: TypeId = 3;
pub const TYPE_STRING: TypeId = 4;
pub const TYPE_ARRAY: TypeId = 5;
/// The module-wide pseudo-class holding global functions and variables.
pub const TYPE_GLOBAL: TypeId = 6;
/// The generic delegate type; concrete delegate signatures derive from it.
pub const TYPE_DELEGATE: TypeId = 7;
/// The built-in `exception` interface.
pub const TYPE_EXCEPTION: TypeId = 8;
/// The cofunction context type; concrete cofunction signatures derive from it.
pub const TYPE_THREAD: TypeId = 9;

/// Number of ids reserved before any user or library type is created.
pub const NUM_PREDEFINED_TYPES: usize = 10;

/// Broad category of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeFamily {
    /// Placeholder for forward declarations whose kind is not yet known.
    Undefined,
    /// `int`, `float` and their aliases.
    Integral,
    Class,
    Interface,
    /// Cofunction context types.
    Thread,
    Delegate,
}

impl TypeFamily {
    pub fn is_callable(self) -> bool {
        matches!(self, TypeFamily::Delegate | TypeFamily::Thread)
    }
}

impl std::fmt::Display for TypeFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TypeFamily::Undefined => "undefined",
            TypeFamily::Integral => "integral",
            TypeFamily::Class => "class",
            TypeFamily::Interface => "interface",
            TypeFamily::Thread => "thread",
            TypeFamily::Delegate => "delegate",
        };
        write!(f, "{}", s)
    }
}

/// Number of VM registers visible to compiled code.
pub const NUM_REGISTERS: usize = 32;
/// Register holding the current `this` object.
pub const REG_THIS: usize = 0;
/// Register receiving a function's return value.
pub const REG_RESULT: usize = 1;
/// Register holding the global object.
pub const REG_GLOBALS: usize = 2;
/// First register available for locals and temporaries.
pub const REG_FIRST_VAR: usize = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_ids_are_dense() {
        let ids = [
            TYPE_NULL,
            TYPE_VAR,
            TYPE_INT,
            TYPE_FLOAT,
            TYPE_STRING,
            TYPE_ARRAY,
            TYPE_GLOBAL,
            TYPE_DELEGATE,
            TYPE_EXCEPTION,
            TYPE_THREAD,
        ];
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(*id, i);
        }
        assert_eq!(NUM_PREDEFINED_TYPES, ids.len());
    }

    #[test]
    fn test_register_layout() {
        assert!(REG_FIRST_VAR > REG_GLOBALS);
        assert!(NUM_REGISTERS > REG_FIRST_VAR);
    }
}
