//! The loadable program image.
//!
//! The compiler's end product: a type table, a function table with linked
//! code, a constant table, and the global-object layout. The VM's own
//! persistent disk layout is out of scope; this image is the in-memory
//! hand-off shape, and the CLI serializes it with bincode.

use serde::{Deserialize, Serialize};

use crate::opcode::Word;
use crate::types::{TypeFamily, TypeId};

/// A value in the image constant table. Handles index into this table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    /// A function handle (index into the function table).
    Func(usize),
}

/// Reflective entry for one type, enough for the VM to rebuild its
/// dispatch tables and for `export-type-info` round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeEntry {
    pub name: String,
    pub family: TypeFamily,
    /// Inherited interface, if any.
    pub base: Option<TypeId>,
    pub native: bool,
    /// Method handles in method-index order (class/interface families).
    pub methods: Vec<usize>,
    /// Number of member-variable slots an instance carries.
    pub instance_size: usize,
}

/// One linked function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub name: String,
    pub owner: TypeId,
    /// Offset of the body in [`ProgramImage::code`].
    pub code_offset: usize,
    pub code_len: usize,
    pub arg_count: usize,
    pub has_result: bool,
}

/// Layout of the global object: one slot per global variable, in
/// declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalLayout {
    pub names: Vec<String>,
    pub types: Vec<TypeId>,
}

impl GlobalLayout {
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// The complete loadable program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramImage {
    pub types: Vec<TypeEntry>,
    pub functions: Vec<FunctionEntry>,
    pub constants: Vec<ConstValue>,
    /// All function bodies, concatenated in handle order.
    pub code: Vec<Word>,
    pub globals: GlobalLayout,
    /// Handle of the generated `__init` function, run at VM startup.
    pub init_function: Option<usize>,
}

impl ProgramImage {
    /// Find a function handle by owner and name. Linear scan; the image
    /// is not a lookup structure, the VM builds its own tables on load.
    pub fn find_function(&self, owner: TypeId, name: &str) -> Option<usize> {
        self.functions
            .iter()
            .position(|f| f.owner == owner && f.name == name)
    }

    pub fn code_of(&self, handle: usize) -> Option<&[Word]> {
        let f = self.functions.get(handle)?;
        self.code.get(f.code_offset..f.code_offset + f.code_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn test_code_of_slices_by_entry() {
        let image = ProgramImage {
            functions: vec![
                FunctionEntry {
                    name: "a".into(),
                    owner: 6,
                    code_offset: 0,
                    code_len: 1,
                    arg_count: 0,
                    has_result: false,
                },
                FunctionEntry {
                    name: "b".into(),
                    owner: 6,
                    code_offset: 1,
                    code_len: 1,
                    arg_count: 0,
                    has_result: false,
                },
            ],
            code: vec![Opcode::Ret as Word, Opcode::Ret as Word],
            ..ProgramImage::default()
        };
        assert_eq!(image.code_of(0), Some(&[Opcode::Ret as Word][..]));
        assert_eq!(image.code_of(1), Some(&[Opcode::Ret as Word][..]));
        assert_eq!(image.code_of(2), None);
        assert_eq!(image.find_function(6, "b"), Some(1));
    }

    #[test]
    fn test_global_layout_slots() {
        let mut layout = GlobalLayout::default();
        layout.names.push("x".into());
        layout.types.push(crate::types::TYPE_INT);
        layout.names.push("y".into());
        layout.types.push(crate::types::TYPE_STRING);
        assert_eq!(layout.slot_of("y"), Some(1));
        assert_eq!(layout.slot_of("z"), None);
    }
}
