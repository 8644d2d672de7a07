//! Storage-location model for code generation.
//!
//! A [`Var`] describes where a value lives while a function body is
//! compiled: a register, a stack slot, a member of an object held in a
//! register, or an element of an array held in a register. The compiler
//! allocates registers and stack locations automatically; source code
//! only ever names variables.
//!
//! Vars live in a per-session arena ([`VarId`] indices) so that the
//! register file and the simulated stack can reference the same record
//! without aliasing headaches.

use quill_core::{NUM_REGISTERS, REG_FIRST_VAR, TYPE_NULL, TypeId};

use crate::errors::{CompileError, ErrorKind};

pub type VarId = usize;

/// Which kind of location a Var currently occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Unused,
    Register(usize),
    /// Offset from the simulated stack pointer; 0 is the top.
    Stack(usize),
    /// Member slot of an object held in a register.
    Member { object: usize, member: usize },
    /// Element of an array held in a register, indexed by another Var.
    ArrayElem { array: usize, index: VarId },
}

/// What role a Var plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    /// A named local, argument or member.
    Var,
    /// An expression temporary.
    Temp,
    /// A function result descriptor.
    Result,
}

/// A storage location plus everything the semantic checks need to know
/// about the value in it.
#[derive(Debug, Clone)]
pub struct Var {
    /// Type this Var currently represents; casts and array-element
    /// access may change it.
    pub type_id: TypeId,
    pub is_const: bool,
    pub is_ref: bool,
    /// Requires `is_ref`.
    pub is_weak: bool,
    /// Array element type when `type_id` is the array type.
    pub elem_type: TypeId,
    pub elem_ref: bool,

    pub name: String,
    pub slot: Slot,
    pub usage: Usage,
    /// Type this Var was declared with; never changes after creation.
    pub ini_type: TypeId,
    pub inited: bool,
    /// True when a temp holds the only reference to its value, so it may
    /// be mutated in place.
    pub unique: bool,
    /// Member access through a const object.
    pub const_parent: bool,
    /// Currently resident on the simulated stack.
    pub on_stack: bool,
    /// A type-cast operator was applied; enables `explicit` members.
    pub type_cast: bool,
    /// Hidden from name lookup (hybrid delegate members resolved only
    /// through the v-table).
    pub hidden: bool,
}

impl Var {
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Var {
            type_id,
            is_const: false,
            is_ref: false,
            is_weak: false,
            elem_type: TYPE_NULL,
            elem_ref: false,
            name: name.into(),
            slot: Slot::Unused,
            usage: Usage::Var,
            ini_type: type_id,
            inited: false,
            unique: false,
            const_parent: false,
            on_stack: false,
            type_cast: false,
            hidden: false,
        }
    }

    pub fn temp(type_id: TypeId) -> Self {
        let mut v = Var::new("", type_id);
        v.usage = Usage::Temp;
        v
    }

    pub fn result(type_id: TypeId) -> Self {
        let mut v = Var::new("", type_id);
        v.usage = Usage::Result;
        v
    }

    pub fn register(&self) -> Option<usize> {
        match self.slot {
            Slot::Register(r) => Some(r),
            _ => None,
        }
    }

    /// Copy only the type half of another Var (type, modifiers, element
    /// type), leaving the location half alone.
    pub fn copy_type(&mut self, src: &Var) {
        self.type_id = src.type_id;
        self.is_const = src.is_const;
        self.is_ref = src.is_ref;
        self.is_weak = src.is_weak;
        self.elem_type = src.elem_type;
        self.elem_ref = src.elem_ref;
    }
}

/// The static type of a sub-expression, reported upward through the
/// expression engine. Kept field-compatible with the type half of `Var`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeInfo {
    pub type_id: TypeId,
    pub is_const: bool,
    pub is_ref: bool,
    pub is_weak: bool,
    pub elem_type: TypeId,
    pub elem_ref: bool,
}

impl TypeInfo {
    pub fn of(type_id: TypeId) -> Self {
        TypeInfo {
            type_id,
            ..TypeInfo::default()
        }
    }

    pub fn from_var(var: &Var) -> Self {
        TypeInfo {
            type_id: var.type_id,
            is_const: var.is_const,
            is_ref: var.is_ref,
            is_weak: var.is_weak,
            elem_type: var.elem_type,
            elem_ref: var.elem_ref,
        }
    }

    /// For a source-to-destination operation, choose the reported type:
    /// the destination's pure type wins unless the destination is `var`
    /// and the source is concrete; const/ref modifiers always travel
    /// with the source.
    pub fn src_dst(src: &Var, dst: Option<&Var>) -> Self {
        match dst {
            Some(dst) => {
                if src.type_id != quill_core::TYPE_VAR && dst.type_id == quill_core::TYPE_VAR {
                    TypeInfo::from_var(src)
                } else {
                    let mut info = TypeInfo::from_var(dst);
                    info.is_const = src.is_const;
                    info.is_ref = src.is_ref;
                    info.elem_ref = src.elem_ref;
                    info
                }
            }
            None => TypeInfo::from_var(src),
        }
    }

    pub fn apply_to(&self, var: &mut Var) {
        var.type_id = self.type_id;
        var.is_const = self.is_const;
        var.is_ref = self.is_ref;
        var.is_weak = self.is_weak;
        var.elem_type = self.elem_type;
        var.elem_ref = self.elem_ref;
    }
}

/// The simulated register file. Holds which Var occupies each register
/// and per-function allocation counts.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    slots: Vec<Option<VarId>>,
    usage: Vec<u32>,
    /// Registers currently holding named locals (as opposed to temps).
    pub num_var_regs: usize,
}

impl RegisterFile {
    pub fn new() -> Self {
        RegisterFile {
            slots: vec![None; NUM_REGISTERS],
            usage: vec![0; NUM_REGISTERS],
            num_var_regs: 0,
        }
    }

    /// Reset for a new function body.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.usage.iter_mut().for_each(|u| *u = 0);
        self.num_var_regs = 0;
    }

    /// Allocate the lowest free register in the variable pool.
    pub fn alloc(&mut self, var: VarId) -> Option<usize> {
        for r in REG_FIRST_VAR..NUM_REGISTERS {
            if self.slots[r].is_none() {
                self.slots[r] = Some(var);
                self.usage[r] += 1;
                return Some(r);
            }
        }
        None
    }

    pub fn free(&mut self, r: usize) {
        self.slots[r] = None;
    }

    pub fn occupant(&self, r: usize) -> Option<VarId> {
        self.slots.get(r).copied().flatten()
    }

    pub fn is_free(&self, r: usize) -> bool {
        self.slots[r].is_none()
    }

    /// Highest register ever allocated this function, for save/restore
    /// bookkeeping. Returns `REG_FIRST_VAR - 1` when none were used.
    pub fn high_water(&self) -> usize {
        (REG_FIRST_VAR..NUM_REGISTERS)
            .rev()
            .find(|&r| self.usage[r] > 0)
            .unwrap_or(REG_FIRST_VAR - 1)
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        RegisterFile::new()
    }
}

/// The simulated data stack. Entry 0 is the top. Pushing shifts every
/// resident Var's stack offset by +1; popping reverses it. The checks
/// here are the compiler's main self-consistency net: a Var may be on
/// the stack at most once, and underflow is a fatal error.
#[derive(Debug, Clone, Default)]
pub struct SimStack {
    entries: Vec<VarId>,
}

impl SimStack {
    pub fn new() -> Self {
        SimStack::default()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entry(&self, offset: usize) -> Option<VarId> {
        self.entries.get(offset).copied()
    }

    pub fn push(&mut self, vars: &mut [Var], id: VarId) -> Result<(), CompileError> {
        if vars[id].on_stack {
            return Err(CompileError::new(
                ErrorKind::FatalRegisterState,
                "variable pushed while already on the simulated stack",
            ));
        }
        for &resident in &self.entries {
            if let Slot::Stack(ofs) = vars[resident].slot {
                vars[resident].slot = Slot::Stack(ofs + 1);
            }
        }
        self.entries.insert(0, id);
        vars[id].slot = Slot::Stack(0);
        vars[id].on_stack = true;
        Ok(())
    }

    pub fn pop(&mut self, vars: &mut [Var]) -> Result<VarId, CompileError> {
        if self.entries.is_empty() {
            return Err(CompileError::new(
                ErrorKind::FatalStackUnderflow,
                "simulated stack underflow",
            ));
        }
        let id = self.entries.remove(0);
        vars[id].on_stack = false;
        vars[id].slot = Slot::Unused;
        for &resident in &self.entries {
            if let Slot::Stack(ofs) = vars[resident].slot {
                debug_assert!(ofs > 0);
                vars[resident].slot = Slot::Stack(ofs - 1);
            }
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::TYPE_INT;

    #[test]
    fn test_register_alloc_prefers_lowest_free() {
        let mut regs = RegisterFile::new();
        assert_eq!(regs.alloc(0), Some(REG_FIRST_VAR));
        assert_eq!(regs.alloc(1), Some(REG_FIRST_VAR + 1));
        regs.free(REG_FIRST_VAR);
        assert_eq!(regs.alloc(2), Some(REG_FIRST_VAR));
    }

    #[test]
    fn test_register_exhaustion() {
        let mut regs = RegisterFile::new();
        for i in REG_FIRST_VAR..NUM_REGISTERS {
            assert_eq!(regs.alloc(i), Some(i));
        }
        assert_eq!(regs.alloc(99), None);
    }

    #[test]
    fn test_stack_push_shifts_offsets() {
        let mut vars = vec![Var::temp(TYPE_INT), Var::temp(TYPE_INT)];
        let mut stack = SimStack::new();
        stack.push(&mut vars, 0).unwrap();
        assert_eq!(vars[0].slot, Slot::Stack(0));
        stack.push(&mut vars, 1).unwrap();
        assert_eq!(vars[1].slot, Slot::Stack(0));
        assert_eq!(vars[0].slot, Slot::Stack(1));

        let popped = stack.pop(&mut vars).unwrap();
        assert_eq!(popped, 1);
        assert_eq!(vars[0].slot, Slot::Stack(0));
        assert!(!vars[1].on_stack);
    }

    #[test]
    fn test_double_push_is_fatal() {
        let mut vars = vec![Var::temp(TYPE_INT)];
        let mut stack = SimStack::new();
        stack.push(&mut vars, 0).unwrap();
        let err = stack.push(&mut vars, 0).unwrap_err();
        assert!(err.kind.is_fatal());
    }

    #[test]
    fn test_underflow_is_fatal() {
        let mut vars: Vec<Var> = Vec::new();
        let mut stack = SimStack::new();
        let err = stack.pop(&mut vars).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FatalStackUnderflow);
    }

    #[test]
    fn test_type_info_src_dst_prefers_concrete_source() {
        let mut src = Var::temp(TYPE_INT);
        src.inited = true;
        let dst = Var::new("d", quill_core::TYPE_VAR);
        let info = TypeInfo::src_dst(&src, Some(&dst));
        assert_eq!(info.type_id, TYPE_INT);
    }
}
