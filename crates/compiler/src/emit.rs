//! Opcode selection and emission.
//!
//! The expression and statement parsers never write instruction words
//! themselves; they call the `cg_*` layer here. Each logical operation
//! picks its opcode from the operand addressing modes and the static
//! types involved, and writes operand words in canonical order (sources
//! first, destination last).
//!
//! Memory-to-memory forms do not exist in the instruction set: operands
//! living in members or array elements are staged through temporary
//! registers first.

use quill_core::{
    Opcode, REG_RESULT, REG_THIS, TYPE_ARRAY, TYPE_FLOAT, TYPE_INT, TYPE_STRING, TYPE_VAR,
    TypeFamily, TypeId, Word,
};

use crate::errors::{CompileError, ErrorKind, WarningKind};
use crate::frame::{Slot, TypeInfo, Usage, Var, VarId};
use crate::literals::{LiteralRecord, LiteralValue};
use crate::state::{Compiler, POPM_THRESHOLD};

/// Binary arithmetic/logic selector used by the expression engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Comparison relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rel {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A resolved operand address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr {
    R(usize),
    S(usize),
    M(usize, usize),
    A(usize, usize),
}

impl Addr {
    fn words(self, out: &mut Vec<Word>) {
        match self {
            Addr::R(r) | Addr::S(r) => out.push(r as Word),
            Addr::M(a, b) | Addr::A(a, b) => {
                out.push(a as Word);
                out.push(b as Word);
            }
        }
    }
}

/// Pick the opcode of a move-family operation for a mode pair, if the
/// instruction set carries that pair directly.
fn mode_pair_opcode(base: [Opcode; 8], src: Addr, dst: Addr) -> Option<Opcode> {
    let [rr, rs, sr, ss, rm, mr, ra, ar] = base;
    match (src, dst) {
        (Addr::R(_), Addr::R(_)) => Some(rr),
        (Addr::R(_), Addr::S(_)) => Some(rs),
        (Addr::S(_), Addr::R(_)) => Some(sr),
        (Addr::S(_), Addr::S(_)) => Some(ss),
        (Addr::R(_), Addr::M(..)) => Some(rm),
        (Addr::M(..), Addr::R(_)) => Some(mr),
        (Addr::R(_), Addr::A(..)) => Some(ra),
        (Addr::A(..), Addr::R(_)) => Some(ar),
        _ => None,
    }
}

const MOVE_OPS: [Opcode; 8] = [
    Opcode::MoveRR,
    Opcode::MoveRS,
    Opcode::MoveSR,
    Opcode::MoveSS,
    Opcode::MoveRM,
    Opcode::MoveMR,
    Opcode::MoveRA,
    Opcode::MoveAR,
];
const COPY_OPS: [Opcode; 8] = [
    Opcode::CopyRR,
    Opcode::CopyRS,
    Opcode::CopySR,
    Opcode::CopySS,
    Opcode::CopyRM,
    Opcode::CopyMR,
    Opcode::CopyRA,
    Opcode::CopyAR,
];
const WREF_OPS: [Opcode; 8] = [
    Opcode::WrefRR,
    Opcode::WrefRS,
    Opcode::WrefSR,
    Opcode::WrefSS,
    Opcode::WrefRM,
    Opcode::WrefMR,
    Opcode::WrefRA,
    Opcode::WrefAR,
];

impl Compiler {
    // ----- addressing -------------------------------------------------------

    pub(crate) fn addr_of(&mut self, id: VarId) -> Result<Addr, CompileError> {
        match self.var(id).slot.clone() {
            Slot::Register(r) => Ok(Addr::R(r)),
            Slot::Stack(s) => Ok(Addr::S(s)),
            Slot::Member { object, member } => Ok(Addr::M(object, member)),
            Slot::ArrayElem { array, index } => match self.var(index).slot {
                Slot::Register(r) => Ok(Addr::A(array, r)),
                _ => Err(self.error(
                    ErrorKind::FatalRegisterState,
                    "array index variable is not in a register",
                )),
            },
            Slot::Unused => Err(self.error(
                ErrorKind::FatalRegisterState,
                format!("variable '{}' has no storage location", self.var(id).name),
            )),
        }
    }

    /// Ensure the value lives in a register. Returns the register-resident
    /// var and whether a staging temp was created (the caller frees it).
    pub(crate) fn stage_in_register(&mut self, id: VarId) -> Result<(VarId, bool), CompileError> {
        if matches!(self.var(id).slot, Slot::Register(_)) {
            return Ok((id, false));
        }
        let src_addr = self.addr_of(id)?;
        let src_clone = self.var(id).clone();
        let temp = self.make_temp(src_clone.type_id)?;
        self.var_mut(temp).copy_type(&src_clone);
        let Slot::Register(r) = self.var(temp).slot else {
            return Err(self.error(ErrorKind::FatalRegisterState, "temp without register"));
        };
        let op = match src_addr {
            Addr::S(_) => Opcode::MoveSR,
            Addr::M(..) => Opcode::MoveMR,
            Addr::A(..) => Opcode::MoveAR,
            Addr::R(_) => unreachable!("register case returned above"),
        };
        let mut operands = Vec::new();
        src_addr.words(&mut operands);
        operands.push(r as Word);
        self.emit(op, &operands);
        self.var_mut(temp).inited = true;
        Ok((temp, true))
    }

    // ----- ownership and const checks ---------------------------------------

    /// Rules for reading `src` into `dst`.
    pub(crate) fn check_src_dst(&mut self, src: VarId, dst: VarId) -> Result<(), CompileError> {
        if !self.var(src).inited {
            let name = self.var(src).name.clone();
            return Err(self.error(
                ErrorKind::NotInitialized,
                format!("variable '{}' used before initialization", name),
            ));
        }
        let _ = dst;
        Ok(())
    }

    /// True for pure expression temporaries. Member and array-element
    /// vars are also carried as temps, but they name real storage and
    /// stay subject to const rules.
    fn is_scratch_temp(&self, v: VarId) -> bool {
        let var = self.var(v);
        var.usage == Usage::Temp
            && !matches!(var.slot, Slot::Member { .. } | Slot::ArrayElem { .. })
    }

    /// Rules for mutating `dst` in place (compound assigns, inc/dec).
    pub(crate) fn check_dst_modify(&mut self, dst: VarId) -> Result<(), CompileError> {
        let var = self.var(dst);
        if var.const_parent || (var.is_const && !self.is_scratch_temp(dst)) {
            let name = self.var(dst).name.clone();
            return Err(self.error(
                ErrorKind::ConstViolation,
                format!("cannot modify const '{}'", name),
            ));
        }
        if !self.var(dst).inited {
            let name = self.var(dst).name.clone();
            return Err(self.error(
                ErrorKind::NotInitialized,
                format!("variable '{}' modified before initialization", name),
            ));
        }
        Ok(())
    }

    /// Rules for assigning to `dst`.
    pub(crate) fn check_dst_assign(&mut self, dst: VarId) -> Result<(), CompileError> {
        let var = self.var(dst);
        if var.const_parent
            || (var.is_const && var.inited && !self.is_scratch_temp(dst))
        {
            let name = self.var(dst).name.clone();
            return Err(self.error(
                ErrorKind::ConstViolation,
                format!("cannot assign to const '{}'", name),
            ));
        }
        Ok(())
    }

    // ----- the move/copy/wref engine ----------------------------------------

    /// Transfer `src` into `dst`, running the automatic conversion
    /// machinery and choosing between move, copy and weak-ref.
    pub(crate) fn cg_move_var(&mut self, src: VarId, dst: VarId) -> Result<(), CompileError> {
        self.check_src_dst(src, dst)?;
        self.check_dst_assign(dst)?;

        let dst_info = TypeInfo::from_var(self.var(dst));
        let type_cast = self.var(src).type_cast;
        let src = self.cg_auto_convert(src, dst_info, type_cast)?;

        let src_var = self.var(src).clone();
        let dst_var = self.var(dst).clone();

        // Weak destinations take a weak reference; warn when the source
        // lives in a local slot, since the referent may die first.
        let weak = dst_var.is_weak && dst_var.usage != Usage::Temp && !src_var.is_weak;
        if weak {
            let local_source = src_var.usage == Usage::Temp
                || matches!(src_var.slot, Slot::Register(_) | Slot::Stack(_));
            if local_source {
                self.warning(
                    WarningKind::AssignWeakRefTemp,
                    "weak reference may outlive its value",
                );
            }
        }

        let mut mv = dst_var.is_ref
            || (src_var.usage == Usage::Temp && src_var.unique)
            || dst_var.is_const;
        // A const source never hands out a mutable reference: downgrade
        // to a copy unless the destination is weak.
        if mv
            && src_var.is_const
            && !dst_var.is_const
            && dst_var.usage != Usage::Temp
            && !dst_var.is_weak
        {
            mv = false;
        }

        let mut copied = false;
        let ops = if weak {
            WREF_OPS
        } else if mv {
            MOVE_OPS
        } else {
            if !self.registry.is_copyable(self.var(src).type_id) {
                let type_name = self.registry.type_name(self.var(src).type_id).to_string();
                return Err(self.error(
                    ErrorKind::NoCopyConstructor,
                    format!("type '{}' has no copy constructor", type_name),
                ));
            }
            copied = true;
            COPY_OPS
        };

        self.emit_mode_pair(ops, src, dst)?;
        self.var_mut(dst).inited = true;
        if copied {
            self.var_mut(dst).unique = true;
        }
        // Assignments to `this` members feed the constructor's
        // initialization tracking.
        if let Slot::Member { object, member } = self.var(dst).slot {
            if object == REG_THIS
                && member < self.registry.class(self.cur_class).members.len()
            {
                self.registry.classes[self.cur_class].members[member].inited = true;
            }
        }
        if src != dst {
            self.free_temp(src);
        }
        Ok(())
    }

    /// Emit one move-family instruction, staging memory-to-memory pairs
    /// through a register.
    fn emit_mode_pair(
        &mut self,
        ops: [Opcode; 8],
        src: VarId,
        dst: VarId,
    ) -> Result<(), CompileError> {
        let src_addr = self.addr_of(src)?;
        let dst_addr = self.addr_of(dst)?;
        if let Some(op) = mode_pair_opcode(ops, src_addr, dst_addr) {
            let mut operands = Vec::new();
            src_addr.words(&mut operands);
            dst_addr.words(&mut operands);
            self.emit(op, &operands);
            return Ok(());
        }
        // Stage the source into a register, then retry; every (R, _)
        // pair is covered.
        let (staged, created) = self.stage_in_register(src)?;
        self.emit_mode_pair(ops, staged, dst)?;
        if created {
            self.free_temp(staged);
        }
        Ok(())
    }

    // ----- automatic conversion ----------------------------------------------

    /// Produce a source var whose type satisfies `want`, emitting
    /// conversion code when required.
    pub(crate) fn cg_auto_convert(
        &mut self,
        src: VarId,
        want: TypeInfo,
        type_cast: bool,
    ) -> Result<VarId, CompileError> {
        let src_type = self.var(src).type_id;
        let dst_type = want.type_id;

        // 1. Implicit conversions emit no code.
        if self.implicitly_convertible(src, &want) {
            if src_type == TYPE_VAR
                && dst_type != TYPE_VAR
                && dst_type != TYPE_STRING
                && self.opts().use_rtchk
            {
                self.cg_rtchk(src, dst_type)?;
            }
            return Ok(src);
        }

        // 2. int <-> float.
        if src_type == TYPE_INT && dst_type == TYPE_FLOAT {
            let (reg_src, staged) = self.stage_in_register(src)?;
            let temp = self.make_temp(TYPE_FLOAT)?;
            let (a, b) = (self.reg_index(reg_src)?, self.reg_index(temp)?);
            self.emit(Opcode::Cvf, &[a as Word, b as Word]);
            if staged {
                self.free_temp(reg_src);
            }
            self.var_mut(temp).inited = true;
            self.var_mut(temp).unique = true;
            return Ok(temp);
        }
        if src_type == TYPE_FLOAT && dst_type == TYPE_INT {
            self.warning(
                WarningKind::PrecisionLoss,
                "implicit float to int conversion loses the fraction",
            );
            let (reg_src, staged) = self.stage_in_register(src)?;
            let temp = self.make_temp(TYPE_INT)?;
            let (a, b) = (self.reg_index(reg_src)?, self.reg_index(temp)?);
            self.emit(Opcode::Cvl, &[a as Word, b as Word]);
            if staged {
                self.free_temp(reg_src);
            }
            self.var_mut(temp).inited = true;
            self.var_mut(temp).unique = true;
            return Ok(temp);
        }

        // 3. var -> string goes through the dynamic convertor.
        if src_type == TYPE_VAR && dst_type == TYPE_STRING {
            self.warning(
                WarningKind::DynamicConversion,
                "dynamic conversion to string",
            );
            let (reg_src, staged) = self.stage_in_register(src)?;
            let temp = self.make_temp(TYPE_STRING)?;
            let (a, b) = (self.reg_index(reg_src)?, self.reg_index(temp)?);
            self.emit(Opcode::Dcvt, &[TYPE_STRING as Word, a as Word, b as Word]);
            if staged {
                self.free_temp(reg_src);
            }
            self.var_mut(temp).inited = true;
            self.var_mut(temp).unique = true;
            return Ok(temp);
        }

        // 4. A convertor method on the source class returning the
        // destination type.
        if self.registry.is_class(src_type) {
            if let Some(idx) = self.find_convertor(src_type, dst_type, type_cast) {
                return self.cg_call_convertor(src, src_type, idx, dst_type);
            }
            if !type_cast && self.find_convertor(src_type, dst_type, true).is_some() {
                return Err(self.error(
                    ErrorKind::ConvertorRequiresCast,
                    format!(
                        "conversion from '{}' to '{}' requires an explicit cast",
                        self.registry.type_name(src_type),
                        self.registry.type_name(dst_type)
                    ),
                ));
            }
        }

        // 5. A single-argument constructor on the destination class
        // accepting the source type.
        if self.registry.is_class(dst_type) {
            if let Some(idx) = self.find_converting_ctor(dst_type, src_type, type_cast) {
                return self.cg_construct_from(src, dst_type, idx);
            }
        }

        let src_name = self.registry.type_name(src_type).to_string();
        let dst_name = self.registry.type_name(dst_type).to_string();
        Err(self.error(
            ErrorKind::IncompatibleType,
            format!("cannot convert '{}' to '{}'", src_name, dst_name),
        ))
    }

    /// The no-code conversion test; shared with the overload scorer.
    pub(crate) fn implicitly_convertible(&self, src: VarId, want: &TypeInfo) -> bool {
        self.implicitly_convertible_info(&TypeInfo::from_var(self.var(src)), want)
    }

    pub(crate) fn find_convertor(&self, class: TypeId, result: TypeId, allow_explicit: bool) -> Option<usize> {
        self.registry
            .class(class)
            .funcs
            .iter()
            .position(|f| {
                f.is_convertor
                    && f.result.as_ref().is_some_and(|r| r.type_id == result)
                    && (allow_explicit || !f.is_explicit)
            })
    }

    pub(crate) fn find_converting_ctor(
        &self,
        class: TypeId,
        arg: TypeId,
        allow_explicit: bool,
    ) -> Option<usize> {
        self.registry.class(class).funcs.iter().position(|f| {
            f.is_ctor
                && f.args.len() == 1
                && (allow_explicit || !f.is_explicit)
                && (f.args[0].type_id == arg
                    || f.args[0].type_id == TYPE_VAR
                    || self.registry.is_subclass(arg, f.args[0].type_id))
        })
    }

    /// Call `src.convertor()` preserving r0: `push r0; move src, r0;
    /// callm; move r1, temp; pop r0`.
    fn cg_call_convertor(
        &mut self,
        src: VarId,
        class: TypeId,
        func_idx: usize,
        result_type: TypeId,
    ) -> Result<VarId, CompileError> {
        let saved = self.cg_save_register(REG_THIS)?;
        let (reg_src, staged) = self.stage_in_register(src)?;
        let r = self.reg_index(reg_src)?;
        self.emit(Opcode::MoveRR, &[r as Word, REG_THIS as Word]);
        if staged {
            self.free_temp(reg_src);
        }
        self.emit(Opcode::Callm, &[class as Word, func_idx as Word]);
        let temp = self.cg_capture_result(result_type)?;
        self.cg_restore_register(REG_THIS, saved)?;
        Ok(temp)
    }

    /// `alloc D; push src; move temp, r0; callm ctor; pop; restore r0`.
    fn cg_construct_from(
        &mut self,
        src: VarId,
        class: TypeId,
        ctor_idx: usize,
    ) -> Result<VarId, CompileError> {
        let ctor_arg = self.registry.class(class).funcs[ctor_idx].args[0].clone();
        let want = TypeInfo::from_var(&ctor_arg);
        let src = self.cg_auto_convert(src, want, false)?;

        let obj = self.cg_alloc(class)?;
        let saved = self.cg_save_register(REG_THIS)?;
        let arg_tracker = self.cg_push_var(src)?;
        let obj_reg = self.reg_index(obj)?;
        self.emit(Opcode::MoveRR, &[obj_reg as Word, REG_THIS as Word]);
        self.emit(Opcode::Callm, &[class as Word, ctor_idx as Word]);
        self.cg_pop_discard(1)?;
        let _ = arg_tracker;
        self.cg_restore_register(REG_THIS, saved)?;
        self.free_temp(src);
        self.var_mut(obj).inited = true;
        self.var_mut(obj).unique = true;
        Ok(obj)
    }

    // ----- arithmetic, logic, comparison ------------------------------------

    /// `dst <- dst op src`. The destination must be a register temp
    /// acting as the accumulator of the current expression level.
    pub(crate) fn cg_math_var(
        &mut self,
        src: VarId,
        dst: VarId,
        op: BinOp,
    ) -> Result<(), CompileError> {
        let dst_type = self.var(dst).type_id;
        let int_only = matches!(
            op,
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
        );
        let want_type = if int_only { TYPE_INT } else { dst_type };
        let src = self.cg_auto_convert(src, TypeInfo::of(want_type), false)?;
        let (src_reg, staged) = self.stage_in_register(src)?;

        self.cg_make_unique(dst)?;

        let opcode = match (op, self.math_kind(want_type)) {
            (BinOp::Add, MathKind::Int) => Opcode::AddL,
            (BinOp::Add, MathKind::Float) => Opcode::AddF,
            (BinOp::Add, MathKind::Str) => Opcode::StrAdd,
            (BinOp::Add, MathKind::Array) => Opcode::ArrAdd,
            (BinOp::Add, MathKind::Dynamic) => Opcode::AddV,
            (BinOp::Sub, MathKind::Int) => Opcode::SubL,
            (BinOp::Sub, MathKind::Float) => Opcode::SubF,
            (BinOp::Sub, MathKind::Dynamic) => Opcode::SubV,
            (BinOp::Mul, MathKind::Int) => Opcode::MulL,
            (BinOp::Mul, MathKind::Float) => Opcode::MulF,
            (BinOp::Mul, MathKind::Dynamic) => Opcode::MulV,
            (BinOp::Div, MathKind::Int) => Opcode::DivL,
            (BinOp::Div, MathKind::Float) => Opcode::DivF,
            (BinOp::Div, MathKind::Dynamic) => Opcode::DivV,
            (BinOp::Mod, MathKind::Int) => Opcode::ModL,
            (BinOp::Mod, MathKind::Float) => Opcode::ModF,
            (BinOp::Mod, MathKind::Dynamic) => Opcode::ModV,
            (BinOp::BitAnd, _) => Opcode::AndL,
            (BinOp::BitOr, _) => Opcode::OrL,
            (BinOp::BitXor, _) => Opcode::XorL,
            (BinOp::Shl, _) => Opcode::ShlL,
            (BinOp::Shr, _) => Opcode::ShrL,
            (op, kind) => {
                return Err(self.error(
                    ErrorKind::IncompatibleType,
                    format!("operator {:?} not defined for {:?} operands", op, kind),
                ));
            }
        };
        let a = self.reg_index(src_reg)?;
        let d = self.reg_index(dst)?;
        self.emit(opcode, &[a as Word, d as Word]);
        if staged {
            self.free_temp(src_reg);
        }
        if src != src_reg {
            self.free_temp(src);
        }
        Ok(())
    }

    /// Comparison producing a fresh int temp holding 0/1.
    pub(crate) fn cg_compare_var(
        &mut self,
        rel: Rel,
        lhs: VarId,
        rhs: VarId,
    ) -> Result<VarId, CompileError> {
        let kind = self.compare_kind(self.var(lhs).type_id, self.var(rhs).type_id);
        let want = match kind {
            MathKind::Int => TypeInfo::of(TYPE_INT),
            MathKind::Float => TypeInfo::of(TYPE_FLOAT),
            MathKind::Str => TypeInfo::of(TYPE_STRING),
            _ => TypeInfo::of(TYPE_VAR),
        };
        let lhs = if kind == MathKind::Dynamic {
            lhs
        } else {
            self.cg_auto_convert(lhs, want, false)?
        };
        let rhs = if kind == MathKind::Dynamic {
            rhs
        } else {
            self.cg_auto_convert(rhs, want, false)?
        };
        let (a, a_staged) = self.stage_in_register(lhs)?;
        let (b, b_staged) = self.stage_in_register(rhs)?;
        let result = self.make_temp(TYPE_INT)?;

        let opcode = match (rel, kind) {
            (Rel::Eq, MathKind::Int) => Opcode::EqL,
            (Rel::Ne, MathKind::Int) => Opcode::NeL,
            (Rel::Lt, MathKind::Int) => Opcode::LtL,
            (Rel::Le, MathKind::Int) => Opcode::LeL,
            (Rel::Gt, MathKind::Int) => Opcode::GtL,
            (Rel::Ge, MathKind::Int) => Opcode::GeL,
            (Rel::Eq, MathKind::Float) => Opcode::EqF,
            (Rel::Ne, MathKind::Float) => Opcode::NeF,
            (Rel::Lt, MathKind::Float) => Opcode::LtF,
            (Rel::Le, MathKind::Float) => Opcode::LeF,
            (Rel::Gt, MathKind::Float) => Opcode::GtF,
            (Rel::Ge, MathKind::Float) => Opcode::GeF,
            (Rel::Eq, MathKind::Str) => Opcode::EqS,
            (Rel::Ne, MathKind::Str) => Opcode::NeS,
            (Rel::Lt, MathKind::Str) => Opcode::LtS,
            (Rel::Le, MathKind::Str) => Opcode::LeS,
            (Rel::Gt, MathKind::Str) => Opcode::GtS,
            (Rel::Ge, MathKind::Str) => Opcode::GeS,
            (Rel::Eq, _) => Opcode::EqV,
            (Rel::Ne, _) => Opcode::NeV,
            (Rel::Lt, _) => Opcode::LtV,
            (Rel::Le, _) => Opcode::LeV,
            (Rel::Gt, _) => Opcode::GtV,
            (Rel::Ge, _) => Opcode::GeV,
        };
        let (ra, rb, rd) = (
            self.reg_index(a)?,
            self.reg_index(b)?,
            self.reg_index(result)?,
        );
        self.emit(opcode, &[ra as Word, rb as Word, rd as Word]);
        if a_staged {
            self.free_temp(a);
        }
        if b_staged {
            self.free_temp(b);
        }
        if a != lhs {
            self.free_temp(lhs);
        }
        if b != rhs {
            self.free_temp(rhs);
        }
        self.var_mut(result).inited = true;
        self.var_mut(result).unique = true;
        Ok(result)
    }

    /// Unary negate/not/bit-not on a register temp, in place.
    pub(crate) fn cg_unary(&mut self, op: Opcode, v: VarId) -> Result<(), CompileError> {
        self.cg_make_unique(v)?;
        let r = self.reg_index(v)?;
        self.emit(op, &[r as Word]);
        Ok(())
    }

    /// Emit a copy-on-write for a non-unique temp about to be mutated.
    pub(crate) fn cg_make_unique(&mut self, v: VarId) -> Result<(), CompileError> {
        let var = self.var(v);
        if var.usage == Usage::Temp && !var.unique && !self.registry.is_value(var.type_id) {
            let r = self.reg_index(v)?;
            self.emit(Opcode::CopyRR, &[r as Word, r as Word]);
            self.var_mut(v).unique = true;
        }
        Ok(())
    }

    // ----- stack ------------------------------------------------------------

    /// Push a value onto the VM stack and mirror it on the simulated
    /// stack with an anonymous tracker var. Returns the tracker.
    pub(crate) fn cg_push_var(&mut self, src: VarId) -> Result<VarId, CompileError> {
        let (reg, staged) = self.stage_in_register(src)?;
        let r = self.reg_index(reg)?;
        self.emit(Opcode::PushR, &[r as Word]);
        if staged {
            self.free_temp(reg);
        }
        let mut tracker = Var::temp(self.var(src).type_id);
        tracker.copy_type(&self.var(src).clone());
        tracker.inited = true;
        let tracker = self.new_var(tracker);
        // Trackers are stack residents, not register holders.
        self.vars[tracker].slot = Slot::Unused;
        self.sim_push(tracker)?;
        Ok(tracker)
    }

    /// Reserve an uninitialized stack slot for a local.
    pub(crate) fn cg_push_slot(&mut self, id: VarId) -> Result<(), CompileError> {
        self.emit(Opcode::PushZ, &[]);
        self.sim_push(id)
    }

    /// Pop and discard `n` stack entries, collapsing long unwinds into
    /// `popm`.
    pub(crate) fn cg_pop_discard(&mut self, n: usize) -> Result<(), CompileError> {
        if n == 0 {
            return Ok(());
        }
        if n <= POPM_THRESHOLD {
            for _ in 0..n {
                self.emit(Opcode::Pop, &[]);
            }
        } else {
            self.emit(Opcode::PopM, &[n as Word]);
        }
        for _ in 0..n {
            self.sim_pop()?;
        }
        Ok(())
    }

    /// Save a reserved register across a call. Returns the tracker.
    pub(crate) fn cg_save_register(&mut self, reg: usize) -> Result<VarId, CompileError> {
        self.emit(Opcode::PushR, &[reg as Word]);
        let mut tracker = Var::temp(TYPE_VAR);
        tracker.inited = true;
        let tracker = self.new_var(tracker);
        self.sim_push(tracker)?;
        Ok(tracker)
    }

    pub(crate) fn cg_restore_register(
        &mut self,
        reg: usize,
        tracker: VarId,
    ) -> Result<(), CompileError> {
        self.emit(Opcode::PopR, &[reg as Word]);
        let popped = self.sim_pop()?;
        if popped != tracker {
            return Err(self.error(
                ErrorKind::FatalStackUnderflow,
                "register save/restore out of order",
            ));
        }
        Ok(())
    }

    // ----- literals ----------------------------------------------------------

    /// Load a value literal into a fresh temp via `moveh`/`copyh` with a
    /// link-patched handle operand.
    pub(crate) fn cg_load_literal(
        &mut self,
        value: LiteralValue,
        copy: bool,
    ) -> Result<VarId, CompileError> {
        let type_id = match &value {
            LiteralValue::Int(_) => TYPE_INT,
            LiteralValue::Float(_) => TYPE_FLOAT,
            LiteralValue::Str(_) => TYPE_STRING,
            LiteralValue::Func { delegate_type, .. } => *delegate_type,
        };
        let temp = self.make_temp(type_id)?;
        let r = self.reg_index(temp)?;
        let op = if copy { Opcode::CopyhR } else { Opcode::MovehR };
        let at = self.emit(op, &[0, r as Word]);
        let (_, line, column) = self.here();
        self.add_literal(LiteralRecord {
            value,
            code_offset: at + 1,
            line,
            column,
        });
        self.var_mut(temp).inited = true;
        self.var_mut(temp).unique = copy;
        if !copy {
            // Constants are shared; flag them const so mutation paths
            // copy first.
            self.var_mut(temp).is_const = false;
        }
        Ok(temp)
    }

    // ----- allocation and calls ----------------------------------------------

    pub(crate) fn cg_alloc(&mut self, type_id: TypeId) -> Result<VarId, CompileError> {
        let class = self.registry.class(type_id);
        let op = if class.native {
            Opcode::Allocn
        } else if class.family == TypeFamily::Interface {
            Opcode::Alloci
        } else {
            Opcode::Alloc
        };
        let temp = self.make_temp(type_id)?;
        let r = self.reg_index(temp)?;
        self.emit(op, &[type_id as Word, r as Word]);
        Ok(temp)
    }

    pub(crate) fn cg_alloc_array(
        &mut self,
        elem_type: TypeId,
        size: VarId,
    ) -> Result<VarId, CompileError> {
        let (size_reg, staged) = self.stage_in_register(size)?;
        let temp = self.make_temp(TYPE_ARRAY)?;
        let rs = self.reg_index(size_reg)?;
        let rd = self.reg_index(temp)?;
        self.emit(Opcode::Alloca, &[elem_type as Word, rs as Word, rd as Word]);
        if staged {
            self.free_temp(size_reg);
        }
        self.var_mut(temp).elem_type = elem_type;
        self.var_mut(temp).inited = true;
        self.var_mut(temp).unique = true;
        Ok(temp)
    }

    /// Static or global call by function handle.
    pub(crate) fn cg_call_static(&mut self, handle: usize) {
        self.emit(Opcode::Calls, &[handle as Word]);
    }

    /// Virtual call through the type's method table. The object must
    /// already be in r0.
    pub(crate) fn cg_call_method_raw(&mut self, class: TypeId, index: usize) {
        self.emit(Opcode::Callm, &[class as Word, index as Word]);
    }

    pub(crate) fn cg_call_native(&mut self, class: TypeId, index: usize) {
        self.emit(Opcode::Calln, &[class as Word, index as Word]);
    }

    /// Invoke a delegate value, dispatching on its addressing mode.
    pub(crate) fn cg_call_delegate(&mut self, dg: VarId) -> Result<(), CompileError> {
        let addr = self.addr_of(dg)?;
        let (op, operands): (Opcode, Vec<Word>) = match addr {
            Addr::R(r) => (Opcode::CalldgR, vec![r as Word]),
            Addr::S(s) => (Opcode::CalldgS, vec![s as Word]),
            Addr::M(a, b) => (Opcode::CalldgM, vec![a as Word, b as Word]),
            Addr::A(a, b) => (Opcode::CalldgA, vec![a as Word, b as Word]),
        };
        self.emit(op, &operands);
        Ok(())
    }

    /// Resume a cofunction context, dispatching on its addressing mode.
    pub(crate) fn cg_resume(&mut self, ctx: VarId) -> Result<(), CompileError> {
        let addr = self.addr_of(ctx)?;
        let (op, operands): (Opcode, Vec<Word>) = match addr {
            Addr::R(r) => (Opcode::ResumeR, vec![r as Word]),
            Addr::S(s) => (Opcode::ResumeS, vec![s as Word]),
            Addr::M(a, b) => (Opcode::ResumeM, vec![a as Word, b as Word]),
            Addr::A(a, b) => (Opcode::ResumeA, vec![a as Word, b as Word]),
        };
        self.emit(op, &operands);
        Ok(())
    }

    /// Wrap a global function in a delegate value.
    pub(crate) fn cg_new_delegate(
        &mut self,
        delegate_type: TypeId,
        handle: usize,
    ) -> Result<VarId, CompileError> {
        let temp = self.make_temp(delegate_type)?;
        let r = self.reg_index(temp)?;
        self.emit(Opcode::Newdg, &[handle as Word, r as Word]);
        self.var_mut(temp).inited = true;
        self.var_mut(temp).unique = true;
        Ok(temp)
    }

    /// Wrap a bound method in a delegate value; `this` comes from the
    /// given register.
    pub(crate) fn cg_new_delegate_method(
        &mut self,
        delegate_type: TypeId,
        class: TypeId,
        index: usize,
        this_reg: usize,
    ) -> Result<VarId, CompileError> {
        let temp = self.make_temp(delegate_type)?;
        let r = self.reg_index(temp)?;
        self.emit(
            Opcode::Newdgm,
            &[class as Word, index as Word, this_reg as Word, r as Word],
        );
        self.var_mut(temp).inited = true;
        self.var_mut(temp).unique = true;
        Ok(temp)
    }

    /// Instantiate a cofunction context.
    pub(crate) fn cg_newctx(
        &mut self,
        thread_type: TypeId,
        handle: usize,
    ) -> Result<VarId, CompileError> {
        let temp = self.make_temp(thread_type)?;
        let r = self.reg_index(temp)?;
        self.emit(
            Opcode::Newctx,
            &[thread_type as Word, handle as Word, r as Word],
        );
        self.var_mut(temp).inited = true;
        self.var_mut(temp).unique = true;
        Ok(temp)
    }

    /// Move the call result out of r1 into a fresh temp.
    pub(crate) fn cg_capture_result(&mut self, type_id: TypeId) -> Result<VarId, CompileError> {
        let temp = self.make_temp(type_id)?;
        let r = self.reg_index(temp)?;
        self.emit(Opcode::MoveRR, &[REG_RESULT as Word, r as Word]);
        self.var_mut(temp).inited = true;
        Ok(temp)
    }

    /// Runtime type check against a declared static type.
    pub(crate) fn cg_rtchk(&mut self, v: VarId, type_id: TypeId) -> Result<(), CompileError> {
        let (reg, staged) = self.stage_in_register(v)?;
        let r = self.reg_index(reg)?;
        self.emit(Opcode::Rtchk, &[type_id as Word, r as Word]);
        if staged {
            self.free_temp(reg);
        }
        Ok(())
    }

    // ----- helpers -----------------------------------------------------------

    pub(crate) fn reg_index(&mut self, v: VarId) -> Result<usize, CompileError> {
        match self.var(v).slot {
            Slot::Register(r) => Ok(r),
            _ => Err(self.error(
                ErrorKind::FatalRegisterState,
                "operand expected in a register",
            )),
        }
    }

    fn math_kind(&self, t: TypeId) -> MathKind {
        match t {
            TYPE_INT => MathKind::Int,
            TYPE_FLOAT => MathKind::Float,
            TYPE_STRING => MathKind::Str,
            TYPE_ARRAY => MathKind::Array,
            _ => MathKind::Dynamic,
        }
    }

    fn compare_kind(&self, a: TypeId, b: TypeId) -> MathKind {
        match (a, b) {
            (TYPE_INT, TYPE_INT) => MathKind::Int,
            (TYPE_FLOAT, _) | (_, TYPE_FLOAT) if a != TYPE_STRING && b != TYPE_STRING => {
                if (a == TYPE_INT || a == TYPE_FLOAT) && (b == TYPE_INT || b == TYPE_FLOAT) {
                    MathKind::Float
                } else {
                    MathKind::Dynamic
                }
            }
            (TYPE_STRING, TYPE_STRING) => MathKind::Str,
            _ => MathKind::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MathKind {
    Int,
    Float,
    Str,
    Array,
    Dynamic,
}
