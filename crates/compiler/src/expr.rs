//! The expression engine.
//!
//! A recursive-descent chain with one method per precedence level,
//! low to high: logical-or, logical-and, bit-or, bit-xor, bit-and,
//! equality, relational, shift, additive, multiplicative, unary,
//! postfix/atomic. Each level receives an optional l-value hint and
//! returns the variable holding the sub-result together with its static
//! type. Code is emitted directly; there is no expression tree.
//!
//! Assignment is not an expression; the statement parser owns it.

use quill_core::{
    Opcode, REG_THIS, TYPE_ARRAY, TYPE_FLOAT, TYPE_GLOBAL, TYPE_INT, TYPE_NULL, TYPE_STRING,
    TYPE_VAR, TypeFamily, TypeId, Word,
};

use crate::emit::{BinOp, Rel};
use crate::errors::{CompileError, ErrorKind};
use crate::frame::{Slot, TypeInfo, Usage, Var, VarId};
use crate::lexer::{Kw, Sym, TokenKind};
use crate::literals::LiteralValue;
use crate::overload::Candidate;
use crate::state::Compiler;

impl Compiler {
    /// Parse one full expression. The l-value hint types array
    /// initializers and function literals; it may be absent.
    pub(crate) fn parse_expression(
        &mut self,
        lvalue: Option<VarId>,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_logical_or(lvalue)
    }

    // ----- short-circuit levels ---------------------------------------------

    fn p_logical_or(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        let (acc, info) = self.p_logical_and(lv)?;
        if !self.stream().is_sym(Sym::OrOr) {
            return Ok((acc, info));
        }
        self.p_short_circuit(acc, Sym::OrOr, Opcode::TstNe)
    }

    fn p_logical_and(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        let (acc, info) = self.p_bit_or(lv)?;
        if !self.stream().is_sym(Sym::AndAnd) {
            return Ok((acc, info));
        }
        self.p_short_circuit(acc, Sym::AndAnd, Opcode::TstEq)
    }

    /// Shared `&&`/`||` tail: both operands coerce to int, and a
    /// conditional skip past the right operand guarantees it is never
    /// evaluated once the left operand decides the result.
    fn p_short_circuit(
        &mut self,
        first: VarId,
        sym: Sym,
        skip_op: Opcode,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        let first = self.cg_auto_convert(first, TypeInfo::of(TYPE_INT), false)?;
        let acc = self.to_accumulator(first)?;
        let acc_reg = self.reg_index(acc)?;
        let mut skips = Vec::new();
        while self.stream().eat_sym(sym) {
            skips.push(self.emit(skip_op, &[acc_reg as Word, 0]));
            let (rhs, _) = if sym == Sym::OrOr {
                self.p_logical_and(None)?
            } else {
                self.p_bit_or(None)?
            };
            let rhs = self.cg_auto_convert(rhs, TypeInfo::of(TYPE_INT), false)?;
            let (rhs_reg, staged) = self.stage_in_register(rhs)?;
            let r = self.reg_index(rhs_reg)?;
            self.emit(Opcode::MoveRR, &[r as Word, acc_reg as Word]);
            if staged {
                self.free_temp(rhs_reg);
            }
            self.free_temp(rhs);
        }
        let end = self.code_pos();
        for at in skips {
            self.patch_branch(at, end);
        }
        Ok((acc, TypeInfo::of(TYPE_INT)))
    }

    // ----- bitwise and arithmetic levels ------------------------------------

    fn p_bit_or(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_binary_level(lv, &[(Sym::Pipe, BinOp::BitOr)], Compiler::p_bit_xor)
    }

    fn p_bit_xor(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_binary_level(lv, &[(Sym::Caret, BinOp::BitXor)], Compiler::p_bit_and)
    }

    fn p_bit_and(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_binary_level(lv, &[(Sym::Amp, BinOp::BitAnd)], Compiler::p_equality)
    }

    fn p_equality(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_compare_level(
            lv,
            &[(Sym::Eq, Rel::Eq), (Sym::Ne, Rel::Ne)],
            Compiler::p_relational,
        )
    }

    fn p_relational(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_compare_level(
            lv,
            &[
                (Sym::Lt, Rel::Lt),
                (Sym::Le, Rel::Le),
                (Sym::Gt, Rel::Gt),
                (Sym::Ge, Rel::Ge),
            ],
            Compiler::p_shift,
        )
    }

    fn p_shift(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_binary_level(
            lv,
            &[(Sym::Shl, BinOp::Shl), (Sym::Shr, BinOp::Shr)],
            Compiler::p_additive,
        )
    }

    fn p_additive(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_binary_level(
            lv,
            &[(Sym::Plus, BinOp::Add), (Sym::Minus, BinOp::Sub)],
            Compiler::p_multiplicative,
        )
    }

    fn p_multiplicative(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        self.p_binary_level(
            lv,
            &[
                (Sym::Star, BinOp::Mul),
                (Sym::Slash, BinOp::Div),
                (Sym::Percent, BinOp::Mod),
            ],
            Compiler::p_unary,
        )
    }

    fn p_binary_level(
        &mut self,
        lv: Option<VarId>,
        ops: &[(Sym, BinOp)],
        next: fn(&mut Compiler, Option<VarId>) -> Result<(VarId, TypeInfo), CompileError>,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        let (mut acc, mut info) = next(self, lv)?;
        loop {
            let hit = ops
                .iter()
                .find(|(sym, _)| self.stream().is_sym(*sym))
                .copied();
            let Some((_, op)) = hit else {
                return Ok((acc, info));
            };
            self.stream().advance();
            acc = self.to_accumulator(acc)?;
            let (rhs, _) = next(self, None)?;
            self.cg_math_var(rhs, acc, op)?;
            info = TypeInfo::from_var(self.var(acc));
        }
    }

    fn p_compare_level(
        &mut self,
        lv: Option<VarId>,
        rels: &[(Sym, Rel)],
        next: fn(&mut Compiler, Option<VarId>) -> Result<(VarId, TypeInfo), CompileError>,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        let (mut acc, mut info) = next(self, lv)?;
        loop {
            let hit = rels
                .iter()
                .find(|(sym, _)| self.stream().is_sym(*sym))
                .copied();
            let Some((_, rel)) = hit else {
                return Ok((acc, info));
            };
            self.stream().advance();
            let (rhs, _) = next(self, None)?;
            let result = self.cg_compare_var(rel, acc, rhs)?;
            self.free_temp(acc);
            acc = result;
            info = TypeInfo::of(TYPE_INT);
        }
    }

    // ----- unary ------------------------------------------------------------

    fn p_unary(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        if self.stream().eat_sym(Sym::Minus) {
            let (v, info) = self.p_unary(None)?;
            let v = self.to_accumulator(v)?;
            let op = match self.var(v).type_id {
                TYPE_INT => Opcode::NegL,
                TYPE_FLOAT => Opcode::NegF,
                _ => Opcode::NegV,
            };
            self.cg_unary(op, v)?;
            return Ok((v, info));
        }
        if self.stream().eat_sym(Sym::Not) {
            let (v, _) = self.p_unary(None)?;
            let v = self.cg_auto_convert(v, TypeInfo::of(TYPE_INT), false)?;
            let v = self.to_accumulator(v)?;
            self.cg_unary(Opcode::Not, v)?;
            return Ok((v, TypeInfo::of(TYPE_INT)));
        }
        if self.stream().eat_sym(Sym::Tilde) {
            let (v, _) = self.p_unary(None)?;
            let v = self.cg_auto_convert(v, TypeInfo::of(TYPE_INT), false)?;
            let v = self.to_accumulator(v)?;
            self.cg_unary(Opcode::BNot, v)?;
            return Ok((v, TypeInfo::of(TYPE_INT)));
        }
        if self.stream().eat_sym(Sym::Inc) {
            let (v, info) = self.p_unary(None)?;
            self.cg_inc_dec(v, true)?;
            return Ok((v, info));
        }
        if self.stream().eat_sym(Sym::Dec) {
            let (v, info) = self.p_unary(None)?;
            self.cg_inc_dec(v, false)?;
            return Ok((v, info));
        }
        if self.stream().eat_kw(Kw::RtChk) {
            let (v, info) = self.p_unary(None)?;
            self.cg_rtchk(v, info.type_id)?;
            return Ok((v, info));
        }
        self.p_postfix(lv)
    }

    /// In-place increment/decrement. The destination becomes unique.
    fn cg_inc_dec(&mut self, v: VarId, inc: bool) -> Result<(), CompileError> {
        self.check_dst_modify(v)?;
        let op = if inc { Opcode::IncR } else { Opcode::DecR };
        if matches!(self.var(v).slot, Slot::Register(_)) {
            self.cg_make_unique(v)?;
            let r = self.reg_index(v)?;
            self.emit(op, &[r as Word]);
            return Ok(());
        }
        // Stage, modify, write back.
        let (reg, staged) = self.stage_in_register(v)?;
        let r = self.reg_index(reg)?;
        self.emit(op, &[r as Word]);
        self.cg_store_back(reg, v)?;
        if staged {
            self.free_temp(reg);
        }
        Ok(())
    }

    /// Raw store of a register value into a var's location, no
    /// conversion or ownership logic. Used for read-modify-write.
    fn cg_store_back(&mut self, reg: VarId, dst: VarId) -> Result<(), CompileError> {
        let r = self.reg_index(reg)?;
        let addr = self.addr_of(dst)?;
        use crate::emit::Addr;
        match addr {
            Addr::R(d) => {
                self.emit(Opcode::MoveRR, &[r as Word, d as Word]);
            }
            Addr::S(s) => {
                self.emit(Opcode::MoveRS, &[r as Word, s as Word]);
            }
            Addr::M(o, m) => {
                self.emit(Opcode::MoveRM, &[r as Word, o as Word, m as Word]);
            }
            Addr::A(a, i) => {
                self.emit(Opcode::MoveRA, &[r as Word, a as Word, i as Word]);
            }
        }
        Ok(())
    }

    // ----- postfix ----------------------------------------------------------

    fn p_postfix(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        let (mut cur, mut info) = self.p_atomic(lv)?;
        loop {
            if self.stream().eat_sym(Sym::LBracket) {
                (cur, info) = self.p_index(cur)?;
                continue;
            }
            if self.stream().eat_sym(Sym::Dot) {
                (cur, info) = self.p_member(cur)?;
                continue;
            }
            if self.stream().is_sym(Sym::LParen) {
                (cur, info) = self.p_invoke_value(cur)?;
                continue;
            }
            if self.stream().eat_sym(Sym::Inc) {
                let pre = self.cg_capture_value(cur)?;
                self.cg_inc_dec(cur, true)?;
                self.free_if_temp_distinct(cur, pre);
                cur = pre;
                continue;
            }
            if self.stream().eat_sym(Sym::Dec) {
                let pre = self.cg_capture_value(cur)?;
                self.cg_inc_dec(cur, false)?;
                self.free_if_temp_distinct(cur, pre);
                cur = pre;
                continue;
            }
            return Ok((cur, info));
        }
    }

    /// `base[index]`: produce an array-element var.
    fn p_index(&mut self, base: VarId) -> Result<(VarId, TypeInfo), CompileError> {
        let base_type = self.var(base).type_id;
        if base_type != TYPE_ARRAY && base_type != TYPE_VAR {
            let name = self.registry.type_name(base_type).to_string();
            return Err(self.error(
                ErrorKind::IncompatibleType,
                format!("type '{}' cannot be indexed", name),
            ));
        }
        let (index, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::RBracket, "']' after array index")?;
        let index = self.cg_auto_convert(index, TypeInfo::of(TYPE_INT), false)?;
        let (index_reg, _staged) = self.stage_in_register(index)?;

        let (array_reg_var, _array_staged) = self.stage_in_register(base)?;
        let array_reg = self.reg_index(array_reg_var)?;

        let elem_type = if base_type == TYPE_ARRAY {
            let e = self.var(base).elem_type;
            if e == TYPE_NULL { TYPE_VAR } else { e }
        } else {
            TYPE_VAR
        };
        let mut elem = Var::temp(elem_type);
        elem.slot = Slot::ArrayElem {
            array: array_reg,
            index: index_reg,
        };
        elem.inited = true;
        elem.is_const = self.var(base).is_const;
        elem.const_parent = self.var(base).is_const;
        elem.is_ref = self.var(base).elem_ref;
        let elem = self.new_var(elem);
        Ok((elem, TypeInfo::from_var(self.var(elem))))
    }

    /// `base.name`: member access, accessor call or method call.
    fn p_member(&mut self, base: VarId) -> Result<(VarId, TypeInfo), CompileError> {
        let name = self.expect_ident("member name after '.'")?;
        let class_id = self.var(base).type_id;
        if !self.registry.is_class(class_id) && !self.registry.is_interface(class_id) {
            if class_id == TYPE_VAR {
                return Err(self.error(
                    ErrorKind::IncompatibleType,
                    "member access on 'var' requires a cast to a concrete type",
                ));
            }
            let type_name = self.registry.type_name(class_id).to_string();
            return Err(self.error(
                ErrorKind::IncompatibleType,
                format!("type '{}' has no members", type_name),
            ));
        }

        // Method call?
        if self.stream().is_sym(Sym::LParen) {
            return self.p_call_method(base, class_id, &name);
        }

        // Plain member variable.
        if let Some(slot) = self.registry.class(class_id).find_member(&name) {
            let member_decl = self.registry.class(class_id).members[slot].clone();
            if member_decl.hidden {
                return Err(self.error(
                    ErrorKind::UndefinedIdentifier,
                    format!("member '{}' is not accessible", name),
                ));
            }
            let (obj_reg_var, _) = self.stage_in_register(base)?;
            let obj_reg = self.reg_index(obj_reg_var)?;
            let mut member = member_decl.clone();
            member.usage = Usage::Temp;
            member.slot = Slot::Member {
                object: obj_reg,
                member: slot,
            };
            member.inited = true;
            member.const_parent = self.var(base).is_const || member_decl.is_const;
            let member = self.new_var(member);
            return Ok((member, TypeInfo::from_var(self.var(member))));
        }

        // Accessor getter.
        let getter = self
            .registry
            .class(class_id)
            .funcs
            .iter()
            .position(|f| f.is_accessor && f.name == name && f.args.is_empty() && f.has_result());
        if let Some(idx) = getter {
            let result_type = self.registry.class(class_id).funcs[idx]
                .result
                .clone()
                .map(|r| r.type_id)
                .unwrap_or(TYPE_VAR);
            let saved = self.cg_save_register(REG_THIS)?;
            let (obj_reg_var, staged) = self.stage_in_register(base)?;
            let r = self.reg_index(obj_reg_var)?;
            self.emit(Opcode::MoveRR, &[r as Word, REG_THIS as Word]);
            if staged {
                self.free_temp(obj_reg_var);
            }
            self.cg_call_method_raw(class_id, idx);
            let result = self.cg_capture_result(result_type)?;
            self.cg_restore_register(REG_THIS, saved)?;
            self.free_temp(base);
            return Ok((result, TypeInfo::from_var(self.var(result))));
        }

        // Accessor setter as an assignment target: `obj.name = value`
        // compiles into a setter call and yields no value.
        if self.stream().is_sym(Sym::Assign) {
            let setter = self
                .registry
                .class(class_id)
                .funcs
                .iter()
                .position(|f| {
                    f.is_accessor && f.name == name && f.args.len() == 1 && !f.has_result()
                });
            if let Some(idx) = setter {
                self.stream().advance(); // =
                let param = self.registry.class(class_id).funcs[idx].args[0].clone();
                let (value, _) = self.parse_expression(None)?;
                let value = self.cg_auto_convert(value, TypeInfo::from_var(&param), false)?;
                let saved = self.cg_save_register(REG_THIS)?;
                self.cg_push_var(value)?;
                let (obj_reg_var, staged) = self.stage_in_register(base)?;
                let r = self.reg_index(obj_reg_var)?;
                self.emit(Opcode::MoveRR, &[r as Word, REG_THIS as Word]);
                if staged {
                    self.free_temp(obj_reg_var);
                }
                self.cg_call_method_raw(class_id, idx);
                self.cg_pop_discard(1)?;
                self.cg_restore_register(REG_THIS, saved)?;
                self.free_temp(value);
                self.free_temp(base);
                let v = self.new_var(Var::temp(TYPE_NULL));
                return Ok((v, TypeInfo::of(TYPE_NULL)));
            }
        }

        Err(self.error(
            ErrorKind::UndefinedIdentifier,
            format!(
                "'{}' is not a member of '{}'",
                name,
                self.registry.type_name(class_id)
            ),
        ))
    }

    /// Postfix `()` on a first-class value: delegate call or cofunction
    /// resume, dispatching on family.
    fn p_invoke_value(&mut self, value: VarId) -> Result<(VarId, TypeInfo), CompileError> {
        let type_id = self.var(value).type_id;
        match self.registry.family(type_id) {
            TypeFamily::Delegate => self.p_call_delegate_value(value, type_id),
            TypeFamily::Thread => {
                self.expect_sym(Sym::LParen, "'('")?;
                self.expect_sym(Sym::RParen, "')' (cofunction resume takes no arguments)")?;
                self.cg_resume(value)?;
                let result_type = self
                    .registry
                    .class(type_id)
                    .signature
                    .as_ref()
                    .and_then(|s| s.result.as_ref())
                    .map(|r| r.type_id)
                    .unwrap_or(TYPE_VAR);
                let result = self.cg_capture_result(result_type)?;
                self.free_temp(value);
                Ok((result, TypeInfo::from_var(self.var(result))))
            }
            _ if type_id == TYPE_VAR => {
                // Dynamic call: arguments go unchecked and the VM
                // dispatches on the runtime value's family (a delegate
                // is invoked, a cofunction context is resumed).
                self.expect_sym(Sym::LParen, "'('")?;
                let mut pushed = 0usize;
                if !self.stream().is_sym(Sym::RParen) {
                    loop {
                        let (v, _) = self.parse_expression(None)?;
                        self.cg_push_var(v)?;
                        self.free_temp(v);
                        pushed += 1;
                        if !self.stream().eat_sym(Sym::Comma) {
                            break;
                        }
                    }
                }
                self.expect_sym(Sym::RParen, "')'")?;
                self.cg_call_delegate(value)?;
                self.cg_pop_discard(pushed)?;
                let result = self.cg_capture_result(TYPE_VAR)?;
                self.free_temp(value);
                Ok((result, TypeInfo::of(TYPE_VAR)))
            }
            _ => Err(self.error(
                ErrorKind::NoSuitableDelegate,
                format!(
                    "value of type '{}' is not callable",
                    self.registry.type_name(type_id)
                ),
            )),
        }
    }

    fn p_call_delegate_value(
        &mut self,
        dg: VarId,
        delegate_type: TypeId,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        let sig = self
            .registry
            .class(delegate_type)
            .signature
            .clone()
            .unwrap_or_default();
        self.expect_sym(Sym::LParen, "'('")?;
        let argc = self.p_compile_args_against(&sig.args)?;
        self.cg_call_delegate(dg)?;
        self.cg_pop_discard(argc)?;
        let out = match &sig.result {
            Some(r) => {
                let v = self.cg_capture_result(r.type_id)?;
                (v, TypeInfo::from_var(self.var(v)))
            }
            None => {
                let v = self.new_var(Var::temp(TYPE_NULL));
                (v, TypeInfo::of(TYPE_NULL))
            }
        };
        self.free_temp(dg);
        Ok(out)
    }

    // ----- atomic -----------------------------------------------------------

    fn p_atomic(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        let tok = self.stream().peek().clone();
        match tok.kind {
            TokenKind::Int(n) => {
                self.stream().advance();
                let v = self.cg_load_literal(LiteralValue::Int(n), false)?;
                Ok((v, TypeInfo::of(TYPE_INT)))
            }
            TokenKind::Char(n) => {
                self.stream().advance();
                let v = self.cg_load_literal(LiteralValue::Int(n), false)?;
                Ok((v, TypeInfo::of(TYPE_INT)))
            }
            TokenKind::Float(f) => {
                self.stream().advance();
                let v = self.cg_load_literal(LiteralValue::Float(f), false)?;
                Ok((v, TypeInfo::of(TYPE_FLOAT)))
            }
            TokenKind::Str(ref s) => {
                let s = s.clone();
                self.stream().advance();
                let v = self.cg_load_literal(LiteralValue::Str(s), false)?;
                Ok((v, TypeInfo::of(TYPE_STRING)))
            }
            TokenKind::Kw(Kw::Null) => {
                self.stream().advance();
                let v = self.make_temp(TYPE_NULL)?;
                let r = self.reg_index(v)?;
                self.emit(Opcode::LdNull, &[r as Word]);
                self.var_mut(v).inited = true;
                Ok((v, TypeInfo::of(TYPE_NULL)))
            }
            TokenKind::Sym(Sym::LParen) => self.p_paren_or_cast(lv),
            TokenKind::Sym(Sym::LBrace) => self.p_array_initializer(lv),
            TokenKind::Kw(Kw::New) => {
                self.stream().advance();
                self.p_new(lv)
            }
            TokenKind::Kw(Kw::Typeof) => {
                self.stream().advance();
                self.p_typeof()
            }
            TokenKind::Kw(Kw::Sameref) => {
                self.stream().advance();
                self.p_sameref()
            }
            TokenKind::Kw(Kw::Function) => {
                self.stream().advance();
                self.p_function_literal(lv, false)
            }
            TokenKind::Kw(Kw::Method) => {
                self.stream().advance();
                self.p_function_literal(lv, true)
            }
            TokenKind::Kw(Kw::This) => {
                self.stream().advance();
                match self.find_local("this") {
                    Some(id) => Ok((id, TypeInfo::from_var(self.var(id)))),
                    None => Err(self.error(
                        ErrorKind::CallingMethodFromStatic,
                        "'this' is only available inside methods",
                    )),
                }
            }
            TokenKind::Ident(ref name) => {
                let name = name.clone();
                self.stream().advance();
                self.p_identifier(&name)
            }
            _ => Err(self.error(
                ErrorKind::UnexpectedToken,
                format!("unexpected token in expression (line {})", tok.line),
            )),
        }
    }

    /// `(expr)` or `(Type)expr`.
    fn p_paren_or_cast(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        // A cast is `(` type-name `)` with the type name resolving in
        // the registry.
        if let TokenKind::Ident(name) = &self.stream().peek2().kind {
            let name = name.clone();
            if let Some(type_id) = self.find_type(&name) {
                let save = self.stream().save();
                self.stream().advance(); // (
                self.stream().advance(); // type name
                if self.stream().eat_sym(Sym::RParen) {
                    let (v, _) = self.p_unary(None)?;
                    self.var_mut(v).type_cast = true;
                    let src_type = self.var(v).type_id;
                    let v = self.cg_auto_convert(v, TypeInfo::of(type_id), true)?;
                    // Narrowing from the dynamic type or an interface
                    // needs a runtime check.
                    if (src_type == TYPE_VAR || self.registry.is_interface(src_type))
                        && self.registry.is_class(type_id)
                        && self.opts().use_rtchk
                    {
                        self.cg_rtchk(v, type_id)?;
                    }
                    self.var_mut(v).type_id = type_id;
                    self.var_mut(v).type_cast = false;
                    return Ok((v, TypeInfo::from_var(self.var(v))));
                }
                self.stream().restore(save);
            }
        }
        self.expect_sym(Sym::LParen, "'('")?;
        let out = self.parse_expression(lv)?;
        self.expect_sym(Sym::RParen, "')'")?;
        Ok(out)
    }

    /// `{ e1, ..., en }`: allocate and fill an array.
    fn p_array_initializer(
        &mut self,
        lv: Option<VarId>,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        let elem_type = lv
            .map(|v| {
                let var = self.var(v);
                if var.type_id == TYPE_ARRAY && var.elem_type != TYPE_NULL {
                    var.elem_type
                } else {
                    TYPE_VAR
                }
            })
            .unwrap_or(TYPE_VAR);

        // First pass counts the elements, then everything is rolled
        // back and compiled for real against the known size.
        let snapshot = self.begin_probe();
        self.stream().advance();
        let mut count = 0usize;
        if !self.stream().is_sym(Sym::RBrace) {
            loop {
                let (v, _) = self.parse_expression(None)?;
                self.free_temp(v);
                count += 1;
                if !self.stream().eat_sym(Sym::Comma) {
                    break;
                }
            }
        }
        self.end_probe(snapshot);

        self.expect_sym(Sym::LBrace, "'{'")?;
        let size = self.cg_load_literal(LiteralValue::Int(count as i64), false)?;
        let array = self.cg_alloc_array(elem_type, size)?;
        self.free_temp(size);
        let array_reg = self.reg_index(array)?;

        for i in 0..count {
            let (value, _) = self.parse_expression(None)?;
            let value = self.cg_auto_convert(value, TypeInfo::of(elem_type), false)?;
            let index = self.cg_load_literal(LiteralValue::Int(i as i64), false)?;
            let index_reg = self.reg_index(index)?;
            let (value_reg, staged) = self.stage_in_register(value)?;
            let r = self.reg_index(value_reg)?;
            self.emit(
                Opcode::MoveRA,
                &[r as Word, array_reg as Word, index_reg as Word],
            );
            if staged {
                self.free_temp(value_reg);
            }
            self.free_temp(value);
            self.free_temp(index);
            if i + 1 < count {
                self.expect_sym(Sym::Comma, "','")?;
            }
        }
        self.expect_sym(Sym::RBrace, "'}' after array initializer")?;
        self.var_mut(array).elem_type = elem_type;
        Ok((array, TypeInfo::from_var(self.var(array))))
    }

    /// `new Type`, `new Type(args)`, `new Elem[size]`, `new array(n)`.
    fn p_new(&mut self, lv: Option<VarId>) -> Result<(VarId, TypeInfo), CompileError> {
        let name = self.expect_ident("type name after 'new'")?;
        let type_id = match self.find_type(&name) {
            Some(t) => t,
            None => {
                return Err(self.error(
                    ErrorKind::UndefinedIdentifier,
                    format!("undefined type '{}'", name),
                ));
            }
        };

        // `new Elem[size]`: array of Elem.
        if self.stream().eat_sym(Sym::LBracket) {
            let (size, _) = self.parse_expression(None)?;
            self.expect_sym(Sym::RBracket, "']'")?;
            let size = self.cg_auto_convert(size, TypeInfo::of(TYPE_INT), false)?;
            let array = self.cg_alloc_array(type_id, size)?;
            self.free_temp(size);
            return Ok((array, TypeInfo::from_var(self.var(array))));
        }

        // `new array(n)`: element type from the l-value hint.
        if type_id == TYPE_ARRAY {
            let elem_type = lv
                .map(|v| {
                    let var = self.var(v);
                    if var.elem_type != TYPE_NULL { var.elem_type } else { TYPE_VAR }
                })
                .unwrap_or(TYPE_VAR);
            self.expect_sym(Sym::LParen, "'(' after 'new array'")?;
            let (size, _) = self.parse_expression(None)?;
            self.expect_sym(Sym::RParen, "')'")?;
            let size = self.cg_auto_convert(size, TypeInfo::of(TYPE_INT), false)?;
            let array = self.cg_alloc_array(elem_type, size)?;
            self.free_temp(size);
            return Ok((array, TypeInfo::from_var(self.var(array))));
        }

        if !self.registry.is_class(type_id) {
            return Err(self.error(
                ErrorKind::IncompatibleType,
                format!("'{}' is not a class type", name),
            ));
        }

        self.p_construct(type_id)
    }

    /// Allocate and run a constructor: `alloc; save r0; push args;
    /// move obj, r0; callm ctor; pop args; restore r0`.
    pub(crate) fn p_construct(&mut self, type_id: TypeId) -> Result<(VarId, TypeInfo), CompileError> {
        let ctors: Vec<Candidate> = self
            .registry
            .class(type_id)
            .funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_ctor)
            .map(|(index, _)| Candidate {
                class: type_id,
                index,
            })
            .collect();

        let has_parens = self.stream().is_sym(Sym::LParen);
        let (cand, argc) = if has_parens {
            self.stream().advance();
            let arg_types = self.p_probe_args()?;
            let viable: Vec<Candidate> = ctors
                .iter()
                .copied()
                .filter(|c| self.registry.class(c.class).funcs[c.index].args.len() == arg_types.len())
                .collect();
            let name = self.registry.type_name(type_id).to_string();
            let cand = self.resolve_overload(&name, &viable, &arg_types, false)?;
            (cand, arg_types.len())
        } else {
            let default = self.registry.class(type_id).method_info.default_ctor;
            match default {
                Some(index) => (
                    Candidate {
                        class: type_id,
                        index,
                    },
                    0,
                ),
                None => {
                    return Err(self.error(
                        ErrorKind::ClassWithoutConstructor,
                        format!(
                            "class '{}' has no default constructor",
                            self.registry.type_name(type_id)
                        ),
                    ));
                }
            }
        };

        let obj = self.cg_alloc(type_id)?;
        let saved = self.cg_save_register(REG_THIS)?;
        let params = self.registry.class(cand.class).funcs[cand.index].args.clone();
        let pushed = if has_parens {
            self.p_compile_args_against(&params)?
        } else {
            0
        };
        debug_assert_eq!(pushed, argc);
        let obj_reg = self.reg_index(obj)?;
        self.emit(Opcode::MoveRR, &[obj_reg as Word, REG_THIS as Word]);
        if self.registry.class(cand.class).native {
            self.cg_call_native(cand.class, cand.index);
        } else {
            self.cg_call_method_raw(cand.class, cand.index);
        }
        self.cg_pop_discard(pushed)?;
        self.cg_restore_register(REG_THIS, saved)?;
        self.var_mut(obj).inited = true;
        self.var_mut(obj).unique = true;
        Ok((obj, TypeInfo::from_var(self.var(obj))))
    }

    fn p_typeof(&mut self) -> Result<(VarId, TypeInfo), CompileError> {
        self.expect_sym(Sym::LParen, "'(' after 'typeof'")?;
        // `typeof(TypeName)` folds to a constant.
        if let TokenKind::Ident(name) = &self.stream().peek().kind {
            let name = name.clone();
            if self.stream().peek2().kind == TokenKind::Sym(Sym::RParen) {
                if let Some(type_id) = self.find_type(&name) {
                    self.stream().advance();
                    self.stream().advance();
                    let v = self.cg_load_literal(LiteralValue::Int(type_id as i64), false)?;
                    return Ok((v, TypeInfo::of(TYPE_INT)));
                }
            }
        }
        let (v, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::RParen, "')'")?;
        let (src, staged) = self.stage_in_register(v)?;
        let result = self.make_temp(TYPE_INT)?;
        let (a, d) = (self.reg_index(src)?, self.reg_index(result)?);
        self.emit(Opcode::TypeOf, &[a as Word, d as Word]);
        if staged {
            self.free_temp(src);
        }
        self.free_temp(v);
        self.var_mut(result).inited = true;
        self.var_mut(result).unique = true;
        Ok((result, TypeInfo::of(TYPE_INT)))
    }

    fn p_sameref(&mut self) -> Result<(VarId, TypeInfo), CompileError> {
        self.expect_sym(Sym::LParen, "'(' after 'sameref'")?;
        let (a, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::Comma, "','")?;
        let (b, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::RParen, "')'")?;
        let (ar, a_staged) = self.stage_in_register(a)?;
        let (br, b_staged) = self.stage_in_register(b)?;
        let result = self.make_temp(TYPE_INT)?;
        let (ra, rb, rd) = (
            self.reg_index(ar)?,
            self.reg_index(br)?,
            self.reg_index(result)?,
        );
        self.emit(Opcode::SameRef, &[ra as Word, rb as Word, rd as Word]);
        if a_staged {
            self.free_temp(ar);
        }
        if b_staged {
            self.free_temp(br);
        }
        self.free_temp(a);
        self.free_temp(b);
        self.var_mut(result).inited = true;
        self.var_mut(result).unique = true;
        Ok((result, TypeInfo::of(TYPE_INT)))
    }

    /// An anonymous `function`/`method` literal. The body is recorded
    /// and compiled after the enclosing function completes.
    fn p_function_literal(
        &mut self,
        lv: Option<VarId>,
        is_method: bool,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        let delegate_type = match lv {
            Some(v)
                if self.registry.family(self.var(v).type_id) == TypeFamily::Delegate =>
            {
                self.var(v).type_id
            }
            _ => {
                return Err(self.error(
                    ErrorKind::NoSuitableDelegate,
                    "a function literal needs a delegate-typed destination",
                ));
            }
        };
        if is_method && self.find_local("this").is_none() {
            return Err(self.error(
                ErrorKind::CallingMethodFromStatic,
                "a method literal is only available inside methods",
            ));
        }

        // Optional argument-name list.
        let mut arg_names: Option<Vec<String>> = None;
        if self.stream().eat_sym(Sym::LParen) {
            let mut names = Vec::new();
            if !self.stream().is_sym(Sym::RParen) {
                loop {
                    names.push(self.expect_ident("argument name")?);
                    if !self.stream().eat_sym(Sym::Comma) {
                        break;
                    }
                }
            }
            self.expect_sym(Sym::RParen, "')'")?;
            arg_names = Some(names);
        }

        // Record the body position, then skip it.
        let locator = self.stream().save();
        let (line, column) = {
            let (_, l, c) = self.here();
            (l, c)
        };
        if self.stream().skip_braced_block().is_err() {
            return Err(self.error(
                ErrorKind::MismatchedBrace,
                "unterminated function literal body",
            ));
        }

        let value = LiteralValue::Func {
            locator,
            arg_names,
            is_method,
            delegate_type,
            resolved: None,
        };

        if is_method {
            // Bound-method delegates are built at runtime; the method
            // index operand is patched once the literal resolves.
            let temp = self.make_temp(delegate_type)?;
            let r = self.reg_index(temp)?;
            let at = self.emit(
                Opcode::Newdgm,
                &[
                    self.cur_class as Word,
                    0,
                    REG_THIS as Word,
                    r as Word,
                ],
            );
            self.add_literal(crate::literals::LiteralRecord {
                value,
                code_offset: at + 2,
                line,
                column,
            });
            self.var_mut(temp).inited = true;
            self.var_mut(temp).unique = true;
            Ok((temp, TypeInfo::from_var(self.var(temp))))
        } else {
            let v = self.cg_load_literal_at(value, line, column)?;
            Ok((v, TypeInfo::from_var(self.var(v))))
        }
    }

    // ----- identifier resolution ---------------------------------------------

    fn p_identifier(&mut self, name: &str) -> Result<(VarId, TypeInfo), CompileError> {
        // `Class::member` or `Class::f(args)`.
        if self.stream().is_sym(Sym::Scope) {
            return self.p_scoped_identifier(name);
        }

        // A local shadows everything; a callable local is invoked by
        // the postfix `()` handler.
        if let Some(id) = self.find_local(name) {
            return Ok((id, TypeInfo::from_var(self.var(id))));
        }

        // Call syntax resolves through the function scopes.
        if self.stream().is_sym(Sym::LParen) {
            return self.p_call_named(name);
        }
        if self.cur_class != TYPE_GLOBAL {
            if let Some(slot) = self.registry.class(self.cur_class).find_member(name) {
                if self.find_local("this").is_none() {
                    return Err(self.error(
                        ErrorKind::CallingMethodFromStatic,
                        format!("member '{}' needs an object context", name),
                    ));
                }
                let member_decl = self.registry.class(self.cur_class).members[slot].clone();
                let mut member = member_decl;
                member.usage = Usage::Temp;
                member.slot = Slot::Member {
                    object: REG_THIS,
                    member: slot,
                };
                let member = self.new_var(member);
                return Ok((member, TypeInfo::from_var(self.var(member))));
            }
        }

        // Global variable.
        if let Some(slot) = self.registry.class(TYPE_GLOBAL).find_member(name) {
            let member_decl = self.registry.class(TYPE_GLOBAL).members[slot].clone();
            let mut member = member_decl;
            member.usage = Usage::Temp;
            member.slot = Slot::Member {
                object: quill_core::REG_GLOBALS,
                member: slot,
            };
            member.inited = true;
            let member = self.new_var(member);
            return Ok((member, TypeInfo::from_var(self.var(member))));
        }

        // A bare function name yields a delegate value.
        self.p_function_reference(name)
    }

    /// `Class::name`: class-qualified constant or static call.
    fn p_scoped_identifier(&mut self, class_name: &str) -> Result<(VarId, TypeInfo), CompileError> {
        self.stream().advance(); // ::
        let member = self.expect_ident("name after '::'")?;
        let class_id = match self.find_type(class_name) {
            Some(t) => t,
            None => {
                return Err(self.error(
                    ErrorKind::UndefinedIdentifier,
                    format!("undefined class '{}'", class_name),
                ));
            }
        };

        if self.stream().is_sym(Sym::LParen) {
            // Static call restricted to that class's functions.
            self.stream().advance();
            let arg_types = self.p_probe_args()?;
            let candidates: Vec<Candidate> = self
                .funcs_named_in(class_id, &member, arg_types.len())
                .into_iter()
                .map(|index| Candidate {
                    class: class_id,
                    index,
                })
                .collect();
            let want = self.take_call_wants_value();
            let cand = self.resolve_overload(&member, &candidates, &arg_types, want)?;
            return self.p_emit_call(cand, None);
        }

        // Class-qualified constants live in the global object under a
        // mangled key.
        let mangled = format!("{}::{}", self.registry.type_name(class_id), member);
        if let Some(slot) = self.registry.class(TYPE_GLOBAL).find_member(&mangled) {
            let member_decl = self.registry.class(TYPE_GLOBAL).members[slot].clone();
            let mut var = member_decl;
            var.usage = Usage::Temp;
            var.slot = Slot::Member {
                object: quill_core::REG_GLOBALS,
                member: slot,
            };
            var.inited = true;
            let var = self.new_var(var);
            return Ok((var, TypeInfo::from_var(self.var(var))));
        }
        Err(self.error(
            ErrorKind::UndefinedIdentifier,
            format!("'{}::{}' is not defined", class_name, member),
        ))
    }

    /// A bare function name used as a value: build a delegate.
    fn p_function_reference(&mut self, name: &str) -> Result<(VarId, TypeInfo), CompileError> {
        let matches: Vec<usize> = self
            .registry
            .class(TYPE_GLOBAL)
            .funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name == name && !f.is_anonymous)
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => Err(self.error(
                ErrorKind::UndefinedIdentifier,
                format!("undefined identifier '{}'", name),
            )),
            1 => {
                let idx = matches[0];
                let record = self.registry.class(TYPE_GLOBAL).funcs[idx].clone();
                let sig = crate::registry::FuncSig {
                    result: record.result.clone(),
                    args: record.args.clone(),
                };
                let family = if record.is_cofunction {
                    TypeFamily::Thread
                } else {
                    TypeFamily::Delegate
                };
                let delegate_type = self.get_or_create_signature_type(family, sig)?;
                let handle = record.handle.unwrap_or(0);
                let v = self.cg_new_delegate(delegate_type, handle)?;
                Ok((v, TypeInfo::from_var(self.var(v))))
            }
            _ => Err(self.error(
                ErrorKind::AmbiguousFunctionCall,
                format!("'{}' is overloaded; a cast is needed to take its reference", name),
            )),
        }
    }

    // ----- calls -------------------------------------------------------------

    /// `name(args)` resolved through the three-scope rule.
    fn p_call_named(&mut self, name: &str) -> Result<(VarId, TypeInfo), CompileError> {
        self.stream().advance(); // (
        let arg_types = self.p_probe_args()?;
        let candidates = self.collect_candidates(name, arg_types.len())?;
        if candidates.is_empty() {
            // Undefined call sites are tolerated while probing an outer
            // call's arguments.
            return Err(self.error(
                ErrorKind::UndefinedFunctionCall,
                format!("call to undefined function '{}'", name),
            ));
        }
        let want = self.take_call_wants_value();
        let cand = self.resolve_overload(name, &candidates, &arg_types, want)?;
        self.p_emit_call(cand, None)
    }

    /// `obj.name(args)`.
    fn p_call_method(
        &mut self,
        obj: VarId,
        class_id: TypeId,
        name: &str,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        // A callable member (delegate or cofunction context) takes
        // precedence over method lookup when no method has this name.
        let has_method = {
            let mut cur = Some(class_id);
            let mut found = false;
            while let Some(class) = cur {
                if self
                    .registry
                    .class(class)
                    .funcs
                    .iter()
                    .any(|f| f.name == name && !f.is_anonymous)
                {
                    found = true;
                    break;
                }
                cur = self.registry.class(class).base;
            }
            found
        };
        if !has_method {
            if let Some(slot) = self.registry.class(class_id).find_member(name) {
                let member_decl = self.registry.class(class_id).members[slot].clone();
                if self.registry.family(member_decl.type_id).is_callable() && !member_decl.hidden
                {
                    let (obj_reg_var, _) = self.stage_in_register(obj)?;
                    let obj_reg = self.reg_index(obj_reg_var)?;
                    let mut member = member_decl;
                    member.usage = Usage::Temp;
                    member.slot = Slot::Member {
                        object: obj_reg,
                        member: slot,
                    };
                    member.inited = true;
                    let member = self.new_var(member);
                    return self.p_invoke_value(member);
                }
            }
        }

        self.stream().advance(); // (
        let arg_types = self.p_probe_args()?;
        let mut candidates = Vec::new();
        let mut cur = Some(class_id);
        while let Some(class) = cur {
            for index in self.funcs_named_in(class, name, arg_types.len()) {
                candidates.push(Candidate { class, index });
            }
            cur = self.registry.class(class).base;
        }
        if candidates.is_empty() {
            return Err(self.error(
                ErrorKind::UndefinedFunctionCall,
                format!(
                    "'{}' is not a method of '{}'",
                    name,
                    self.registry.type_name(class_id)
                ),
            ));
        }
        let want = self.take_call_wants_value();
        let cand = self.resolve_overload(name, &candidates, &arg_types, want)?;
        let out = self.p_emit_call(cand, Some(obj))?;
        self.free_temp(obj);
        Ok(out)
    }

    fn funcs_named_in(&self, class: TypeId, name: &str, argc: usize) -> Vec<usize> {
        self.registry
            .class(class)
            .funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name == name && f.args.len() == argc && !f.is_anonymous)
            .map(|(i, _)| i)
            .collect()
    }

    /// Probe the argument list once with diagnostics suppressed to
    /// learn each argument's type, then roll everything back. The
    /// cursor is left right after the opening parenthesis.
    pub(crate) fn p_probe_args(&mut self) -> Result<Vec<TypeInfo>, CompileError> {
        let snapshot = self.begin_probe();
        let mut types = Vec::new();
        let mut failed = None;
        if !self.stream().is_sym(Sym::RParen) {
            loop {
                match self.parse_expression(None) {
                    Ok((v, info)) => {
                        self.free_temp(v);
                        types.push(info);
                    }
                    Err(err) if err.kind.is_tolerated() => {
                        // The argument still occupies a slot; its exact
                        // type stays unknown.
                        types.push(TypeInfo::of(TYPE_VAR));
                        self.p_skip_balanced_to_arg_end();
                    }
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                }
                if !self.stream().eat_sym(Sym::Comma) {
                    break;
                }
            }
        }
        self.end_probe(snapshot);
        match failed {
            Some(err) => Err(err),
            None => Ok(types),
        }
    }

    /// Skip to the end of the current argument (a comma or the closing
    /// parenthesis at depth zero).
    fn p_skip_balanced_to_arg_end(&mut self) {
        let mut depth = 0usize;
        loop {
            match &self.stream().peek().kind {
                TokenKind::Eof => return,
                TokenKind::Sym(Sym::LParen) | TokenKind::Sym(Sym::LBracket) => depth += 1,
                TokenKind::Sym(Sym::RParen) | TokenKind::Sym(Sym::RBracket) => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                }
                TokenKind::Sym(Sym::Comma) if depth == 0 => return,
                _ => {}
            }
            self.stream().advance();
        }
    }

    /// Re-compile the argument list against the chosen parameter types
    /// and push each value. Consumes up to and including `)`. Returns
    /// the number of pushed arguments.
    pub(crate) fn p_compile_args_against(
        &mut self,
        params: &[Var],
    ) -> Result<usize, CompileError> {
        let mut pushed = 0usize;
        if !self.stream().is_sym(Sym::RParen) {
            loop {
                let param = params.get(pushed).cloned();
                let (v, _) = self.parse_expression(None)?;
                let v = match &param {
                    Some(p) => self.cg_auto_convert(v, TypeInfo::from_var(p), false)?,
                    None => v,
                };
                if let Some(p) = &param {
                    if p.is_ref && !p.is_weak && self.var(v).is_const && !p.is_const {
                        return Err(self.error(
                            ErrorKind::ConstViolation,
                            format!("argument {} drops const", pushed + 1),
                        ));
                    }
                }
                self.cg_push_var(v)?;
                self.free_temp(v);
                pushed += 1;
                if !self.stream().eat_sym(Sym::Comma) {
                    break;
                }
            }
        }
        self.expect_sym(Sym::RParen, "')' after arguments")?;
        if pushed != params.len() {
            return Err(self.error(
                ErrorKind::ErrorInFunctionArgument,
                format!("expected {} arguments, found {}", params.len(), pushed),
            ));
        }
        Ok(pushed)
    }

    /// Emit the call for a resolved candidate. `receiver` carries the
    /// object for method calls; constructors and statics pass None.
    pub(crate) fn p_emit_call(
        &mut self,
        cand: Candidate,
        receiver: Option<VarId>,
    ) -> Result<(VarId, TypeInfo), CompileError> {
        let record = self.registry.class(cand.class).funcs[cand.index].clone();

        // Cofunction call: push activation arguments, newctx.
        if record.is_cofunction {
            let pushed = self.p_compile_args_against(&record.args)?;
            let sig = crate::registry::FuncSig {
                result: record.result.clone(),
                args: record.args.clone(),
            };
            let thread_type = self.get_or_create_signature_type(TypeFamily::Thread, sig)?;
            let ctx = self.cg_newctx(thread_type, record.handle.unwrap_or(0))?;
            self.cg_pop_discard(pushed)?;
            return Ok((ctx, TypeInfo::from_var(self.var(ctx))));
        }

        let is_method_call = record.is_method || record.is_accessor || record.is_convertor;
        let needs_this = is_method_call || receiver.is_some();

        let saved = if needs_this {
            Some(self.cg_save_register(REG_THIS)?)
        } else {
            None
        };
        let pushed = self.p_compile_args_against(&record.args)?;

        if needs_this {
            match receiver {
                Some(obj) => {
                    let (obj_reg_var, staged) = self.stage_in_register(obj)?;
                    let r = self.reg_index(obj_reg_var)?;
                    self.emit(Opcode::MoveRR, &[r as Word, REG_THIS as Word]);
                    if staged {
                        self.free_temp(obj_reg_var);
                    }
                }
                None => {
                    // Implicit `this` call: r0 already holds the object,
                    // but it was just saved; reload it from the save slot.
                    self.emit(Opcode::MoveSR, &[pushed as Word, REG_THIS as Word]);
                }
            }
        }

        let native = self.registry.class(cand.class).native;
        if native {
            self.cg_call_native(cand.class, cand.index);
        } else if is_method_call {
            self.cg_call_method_raw(cand.class, cand.index);
        } else {
            self.cg_call_static(record.handle.unwrap_or(0));
        }

        self.cg_pop_discard(pushed)?;
        if let Some(saved) = saved {
            self.cg_restore_register(REG_THIS, saved)?;
        }

        match &record.result {
            Some(r) => {
                let v = self.cg_capture_result(r.type_id)?;
                self.var_mut(v).elem_type = r.elem_type;
                Ok((v, TypeInfo::from_var(self.var(v))))
            }
            None => {
                let v = self.new_var(Var::temp(TYPE_NULL));
                Ok((v, TypeInfo::of(TYPE_NULL)))
            }
        }
    }

    // ----- helpers -----------------------------------------------------------

    /// Make sure the value sits in a register temp this expression may
    /// mutate as an accumulator.
    pub(crate) fn to_accumulator(&mut self, v: VarId) -> Result<VarId, CompileError> {
        let var = self.var(v);
        if var.usage == Usage::Temp && matches!(var.slot, Slot::Register(_)) {
            return Ok(v);
        }
        let value_copy = self.cg_capture_value(v)?;
        self.free_if_temp_distinct(v, value_copy);
        Ok(value_copy)
    }

    /// Capture the current value of a var into a fresh register temp.
    fn cg_capture_value(&mut self, v: VarId) -> Result<VarId, CompileError> {
        if !self.var(v).inited {
            let name = self.var(v).name.clone();
            return Err(self.error(
                ErrorKind::NotInitialized,
                format!("variable '{}' used before initialization", name),
            ));
        }
        let src_clone = self.var(v).clone();
        let temp = self.make_temp(src_clone.type_id)?;
        self.var_mut(temp).copy_type(&src_clone);
        let r = self.reg_index(temp)?;
        let addr = self.addr_of(v)?;
        use crate::emit::Addr;
        match addr {
            Addr::R(s) => {
                self.emit(Opcode::MoveRR, &[s as Word, r as Word]);
            }
            Addr::S(s) => {
                self.emit(Opcode::MoveSR, &[s as Word, r as Word]);
            }
            Addr::M(o, m) => {
                self.emit(Opcode::MoveMR, &[o as Word, m as Word, r as Word]);
            }
            Addr::A(a, i) => {
                self.emit(Opcode::MoveAR, &[a as Word, i as Word, r as Word]);
            }
        }
        self.var_mut(temp).inited = true;
        self.var_mut(temp).unique = self.registry.is_value(src_clone.type_id);
        Ok(temp)
    }

    fn free_if_temp_distinct(&mut self, v: VarId, keep: VarId) {
        if v != keep {
            self.free_temp(v);
        }
    }

    fn take_call_wants_value(&mut self) -> bool {
        let want = self.call_wants_value;
        self.call_wants_value = true;
        want
    }

    /// Like `cg_load_literal` but stamping an explicit source position
    /// into the record.
    fn cg_load_literal_at(
        &mut self,
        value: LiteralValue,
        line: usize,
        column: usize,
    ) -> Result<VarId, CompileError> {
        let type_id = match &value {
            LiteralValue::Int(_) => TYPE_INT,
            LiteralValue::Float(_) => TYPE_FLOAT,
            LiteralValue::Str(_) => TYPE_STRING,
            LiteralValue::Func { delegate_type, .. } => *delegate_type,
        };
        let temp = self.make_temp(type_id)?;
        let r = self.reg_index(temp)?;
        let at = self.emit(Opcode::MovehR, &[0, r as Word]);
        self.add_literal(crate::literals::LiteralRecord {
            value,
            code_offset: at + 1,
            line,
            column,
        });
        self.var_mut(temp).inited = true;
        Ok(temp)
    }
}
