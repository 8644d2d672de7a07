//! Statement parsing and code generation.
//!
//! Statements compile directly to bytecode as they parse. Assignment is
//! a statement tail on an atomic l-value, not an expression. Loops use
//! the token stream's locator save/restore for the `for` update clause,
//! and `break`/`continue` record branch placeholders that are patched
//! when the construct closes.
//!
//! Inside constructors, every branching construct snapshots the
//! member-initialization flags and joins the branch outcomes with
//! boolean AND, so a member counts as initialized only when all paths
//! initialize it.

use quill_core::{Opcode, REG_RESULT, TYPE_INT, TYPE_STRING, Word};

use crate::errors::{CompileError, ErrorKind, WarningKind};
use crate::frame::{Slot, TypeInfo, Usage, Var, VarId};
use crate::lexer::{Kw, Sym, TokenKind};
use crate::literals::LiteralValue;
use crate::clause::Clause;
use crate::state::Compiler;

/// Saved scope boundary for block entry/exit.
pub(crate) struct ScopeMark {
    locals_len: usize,
    stack_depth: usize,
}

/// Saved break/continue context around a loop or switch.
struct LoopCtx {
    saved_break: Vec<usize>,
    saved_break_depth: usize,
    /// Present only for loops.
    saved_cont: Option<(Vec<usize>, usize)>,
}

impl Compiler {
    // ----- scopes -----------------------------------------------------------

    pub(crate) fn enter_scope(&mut self) -> ScopeMark {
        self.block_level += 1;
        self.scope_starts.push(self.locals.len());
        ScopeMark {
            locals_len: self.locals.len(),
            stack_depth: self.stack.depth(),
        }
    }

    /// Leave a block: emit the paired pops for stack locals and release
    /// register locals.
    pub(crate) fn exit_scope(&mut self, mark: ScopeMark) -> Result<(), CompileError> {
        let pops = self.stack.depth() - mark.stack_depth;
        self.cg_pop_discard(pops)?;
        let released: Vec<VarId> = self
            .locals
            .drain(mark.locals_len..)
            .map(|(_, id)| id)
            .collect();
        for id in released {
            if let Slot::Register(r) = self.var(id).slot {
                self.regs.free(r);
                self.var_mut(id).slot = Slot::Unused;
            }
        }
        self.scope_starts.pop();
        self.block_level -= 1;
        Ok(())
    }

    // ----- blocks and statements --------------------------------------------

    /// `{ statements }`. Returns whether the block ends in a
    /// terminating statement on this path.
    pub(crate) fn parse_block(&mut self) -> Result<bool, CompileError> {
        self.expect_sym(Sym::LBrace, "'{'")?;
        let mark = self.enter_scope();
        let mut terminated = false;
        let mut warned_unreachable = false;
        while !self.stream().is_sym(Sym::RBrace) {
            if self.stream().at_end() {
                return Err(self.error(ErrorKind::UnexpectedEndOfFile, "unterminated block"));
            }
            if terminated && !warned_unreachable {
                self.warning(WarningKind::UnreachableCode, "unreachable code");
                warned_unreachable = true;
            }
            let t = self.parse_statement()?;
            terminated = terminated || t;
        }
        self.expect_sym(Sym::RBrace, "'}'")?;
        self.exit_scope(mark)?;
        Ok(terminated)
    }

    /// One statement. Returns true when control cannot flow past it.
    pub(crate) fn parse_statement(&mut self) -> Result<bool, CompileError> {
        match self.stream().peek().kind.clone() {
            TokenKind::Sym(Sym::LBrace) => self.parse_block(),
            TokenKind::Sym(Sym::Semicolon) => {
                self.stream().advance();
                Ok(false)
            }
            TokenKind::Kw(Kw::If) => self.p_if(),
            TokenKind::Kw(Kw::For) => self.p_for(),
            TokenKind::Kw(Kw::While) => self.p_while(),
            TokenKind::Kw(Kw::Do) => self.p_do_while(),
            TokenKind::Kw(Kw::Switch) => self.p_switch(),
            TokenKind::Kw(Kw::Break) => self.p_break(),
            TokenKind::Kw(Kw::Continue) => self.p_continue(),
            TokenKind::Kw(Kw::Return) => self.p_return(),
            TokenKind::Kw(Kw::Throw) => self.p_throw(),
            TokenKind::Kw(Kw::Yield) => self.p_yield(),
            TokenKind::Kw(Kw::Clause) => self.p_clause(),
            TokenKind::Kw(Kw::Goto) => self.p_goto(),
            TokenKind::Kw(Kw::Hybrid) => {
                self.p_hybrid_init()?;
                Ok(false)
            }
            TokenKind::Kw(Kw::Brk) => {
                self.stream().advance();
                self.emit(Opcode::Brk, &[]);
                self.expect_sym(Sym::Semicolon, "';'")?;
                Ok(false)
            }
            TokenKind::Kw(Kw::Selftest) => {
                self.stream().advance();
                self.emit(Opcode::Selftest, &[]);
                self.expect_sym(Sym::Semicolon, "';'")?;
                Ok(false)
            }
            _ => {
                if let Some(spec) = self.try_parse_type_spec()? {
                    self.p_local_decl(spec)?;
                    return Ok(false);
                }
                self.p_expression_statement()?;
                self.expect_sym(Sym::Semicolon, "';' after expression")?;
                Ok(false)
            }
        }
    }

    // ----- locals -----------------------------------------------------------

    /// Declarators after a parsed type spec:
    /// `T a = e, b, c = f;`
    fn p_local_decl(&mut self, spec: crate::decl::TypeSpec) -> Result<(), CompileError> {
        loop {
            let name = self.expect_ident("variable name")?;

            let scope_start = self.scope_starts.last().copied().unwrap_or(0);
            if self.locals[scope_start..].iter().any(|(n, _)| *n == name) {
                return Err(self.error(
                    ErrorKind::IdentifierAlreadyDefined,
                    format!("'{}' is already defined in this scope", name),
                ));
            }
            if self.find_local(&name).is_some()
                || self.registry.class(quill_core::TYPE_GLOBAL).find_member(&name).is_some()
            {
                self.warning(
                    WarningKind::LocalHidesGlobal,
                    format!("'{}' hides an outer declaration", name),
                );
            }

            let mut var = Var::new(name.clone(), spec.type_id);
            var.elem_type = spec.elem_type;
            var.is_const = spec.is_const;
            var.is_ref = spec.is_ref;
            var.is_weak = spec.is_weak;
            let id = self.new_var(var);

            // Prefer a register while the per-function budget lasts.
            if self.var_reg_budget > 0 {
                match self.regs.alloc(id) {
                    Some(r) => {
                        self.var_reg_budget -= 1;
                        self.vars[id].slot = Slot::Register(r);
                        self.regs.num_var_regs += 1;
                    }
                    None => self.cg_push_slot(id)?,
                }
            } else {
                self.cg_push_slot(id)?;
            }
            self.locals.push((name, id));

            if self.stream().eat_sym(Sym::Assign) {
                let (value, _) = self.parse_expression(Some(id))?;
                self.cg_move_var(value, id)?;
            }

            if !self.stream().eat_sym(Sym::Comma) {
                break;
            }
        }
        self.expect_sym(Sym::Semicolon, "';' after declaration")?;
        Ok(())
    }

    // ----- expression statements and assignment -----------------------------

    /// Expression statement body (shared with the `for` update clause):
    /// an atomic l-value followed by an optional assignment tail.
    pub(crate) fn p_expression_statement(&mut self) -> Result<(), CompileError> {
        self.call_wants_value = false;
        let (lhs, _info) = self.parse_expression(None)?;
        self.call_wants_value = true;

        let compound = [
            (Sym::PlusAssign, crate::emit::BinOp::Add),
            (Sym::MinusAssign, crate::emit::BinOp::Sub),
            (Sym::StarAssign, crate::emit::BinOp::Mul),
            (Sym::SlashAssign, crate::emit::BinOp::Div),
            (Sym::PercentAssign, crate::emit::BinOp::Mod),
            (Sym::AndAssign, crate::emit::BinOp::BitAnd),
            (Sym::OrAssign, crate::emit::BinOp::BitOr),
            (Sym::XorAssign, crate::emit::BinOp::BitXor),
            (Sym::ShlAssign, crate::emit::BinOp::Shl),
            (Sym::ShrAssign, crate::emit::BinOp::Shr),
        ];

        if self.stream().eat_sym(Sym::Assign) {
            self.require_lvalue(lhs)?;
            let (value, _) = self.parse_expression(Some(lhs))?;
            self.cg_move_var(value, lhs)?;
            self.free_temp(lhs);
            return Ok(());
        }

        for (sym, op) in compound {
            if self.stream().eat_sym(sym) {
                self.require_lvalue(lhs)?;
                self.check_dst_modify(lhs)?;
                let (value, _) = self.parse_expression(None)?;
                // Read-modify-write through an accumulator temp.
                let acc = self.to_accumulator(lhs)?;
                self.cg_math_var(value, acc, op)?;
                self.cg_move_var(acc, lhs)?;
                self.free_temp(lhs);
                return Ok(());
            }
        }

        self.free_temp(lhs);
        Ok(())
    }

    fn require_lvalue(&mut self, v: VarId) -> Result<(), CompileError> {
        let var = self.var(v);
        let ok = matches!(var.slot, Slot::Member { .. } | Slot::ArrayElem { .. })
            || var.usage == Usage::Var
            || var.usage == Usage::Result;
        if ok {
            Ok(())
        } else {
            Err(self.error(
                ErrorKind::IncompatibleType,
                "left side of assignment is not assignable",
            ))
        }
    }

    // ----- conditionals -----------------------------------------------------

    fn p_if(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        self.expect_sym(Sym::LParen, "'(' after 'if'")?;
        let (cond, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::RParen, "')'")?;
        let cond = self.cg_auto_convert(cond, TypeInfo::of(TYPE_INT), false)?;
        let (cond_reg, staged) = self.stage_in_register(cond)?;
        let r = self.reg_index(cond_reg)?;
        let skip = self.emit(Opcode::TstEq, &[r as Word, 0]);
        if staged {
            self.free_temp(cond_reg);
        }
        self.free_temp(cond);

        let before = self.snapshot_member_init();
        let then_terminated = self.parse_statement()?;
        let after_then = self.snapshot_member_init();

        if self.stream().eat_kw(Kw::Else) {
            let jump_end = self.emit(Opcode::Br, &[0]);
            let else_target = self.code_pos();
            self.patch_branch(skip, else_target);

            self.restore_member_init(&before);
            let else_terminated = self.parse_statement()?;
            let after_else = self.snapshot_member_init();
            self.join_member_init(&after_then, &after_else);

            let end = self.code_pos();
            self.patch_branch(jump_end, end);
            Ok(then_terminated && else_terminated)
        } else {
            let end = self.code_pos();
            self.patch_branch(skip, end);
            self.join_member_init(&before, &after_then);
            Ok(false)
        }
    }

    // ----- loops ------------------------------------------------------------

    /// Open a break context, and a continue context when this is a
    /// loop. A switch only captures `break`; `continue` inside it still
    /// belongs to the enclosing loop.
    fn enter_loop(&mut self, allow_continue: bool) -> LoopCtx {
        let ctx = LoopCtx {
            saved_break: std::mem::take(&mut self.break_fixups),
            saved_break_depth: self.loop_unroll_depth,
            saved_cont: allow_continue.then(|| {
                (
                    std::mem::take(&mut self.cont_fixups),
                    self.cont_unroll_depth,
                )
            }),
        };
        self.loop_unroll_depth = self.stack.depth();
        self.break_ctx += 1;
        if allow_continue {
            self.cont_unroll_depth = self.stack.depth();
            self.cont_ctx += 1;
        }
        ctx
    }

    fn leave_loop(&mut self, ctx: LoopCtx, break_target: usize, cont_target: Option<usize>) {
        let breaks = std::mem::replace(&mut self.break_fixups, ctx.saved_break);
        self.loop_unroll_depth = ctx.saved_break_depth;
        for at in breaks {
            self.patch_branch(at, break_target);
        }
        if let Some((saved_cont, saved_depth)) = ctx.saved_cont {
            let conts = std::mem::replace(&mut self.cont_fixups, saved_cont);
            self.cont_unroll_depth = saved_depth;
            if let Some(target) = cont_target {
                for at in conts {
                    self.patch_branch(at, target);
                }
            }
            self.cont_ctx -= 1;
        }
        self.break_ctx -= 1;
    }

    fn p_while(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        self.expect_sym(Sym::LParen, "'(' after 'while'")?;
        let saved = self.enter_loop(true);
        let top = self.code_pos();
        let (cond, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::RParen, "')'")?;
        let cond = self.cg_auto_convert(cond, TypeInfo::of(TYPE_INT), false)?;
        let (cond_reg, staged) = self.stage_in_register(cond)?;
        let r = self.reg_index(cond_reg)?;
        let exit = self.emit(Opcode::TstEq, &[r as Word, 0]);
        if staged {
            self.free_temp(cond_reg);
        }
        self.free_temp(cond);

        let before = self.snapshot_member_init();
        self.parse_statement()?;
        let after = self.snapshot_member_init();
        self.join_member_init(&before, &after);

        let back = self.emit(Opcode::Br, &[0]);
        self.patch_branch(back, top);
        let end = self.code_pos();
        self.patch_branch(exit, end);
        self.leave_loop(saved, end, Some(top));
        Ok(false)
    }

    fn p_do_while(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        let saved = self.enter_loop(true);
        let top = self.code_pos();

        let before = self.snapshot_member_init();
        self.parse_statement()?;
        let after = self.snapshot_member_init();
        self.join_member_init(&before, &after);

        if !self.stream().eat_kw(Kw::While) {
            return Err(self.error(ErrorKind::UnexpectedToken, "expected 'while' after 'do' body"));
        }
        let cond_pos = self.code_pos();
        self.expect_sym(Sym::LParen, "'('")?;
        let (cond, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::RParen, "')'")?;
        self.expect_sym(Sym::Semicolon, "';'")?;
        let cond = self.cg_auto_convert(cond, TypeInfo::of(TYPE_INT), false)?;
        let (cond_reg, staged) = self.stage_in_register(cond)?;
        let r = self.reg_index(cond_reg)?;
        let back = self.emit(Opcode::TstNe, &[r as Word, 0]);
        self.patch_branch(back, top);
        if staged {
            self.free_temp(cond_reg);
        }
        self.free_temp(cond);

        let end = self.code_pos();
        self.leave_loop(saved, end, Some(cond_pos));
        Ok(false)
    }

    /// `for (init; cond; update) body`. The update clause is compiled
    /// after the body via locator save/restore.
    fn p_for(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        self.expect_sym(Sym::LParen, "'(' after 'for'")?;
        let mark = self.enter_scope();

        // Init: declaration, expression or empty.
        if !self.stream().eat_sym(Sym::Semicolon) {
            if let Some(spec) = self.try_parse_type_spec()? {
                self.p_local_decl(spec)?;
            } else {
                self.p_expression_statement()?;
                self.expect_sym(Sym::Semicolon, "';'")?;
            }
        }

        let saved = self.enter_loop(true);
        let top = self.code_pos();

        // Condition: empty means an unconditional back-branch; the loop
        // terminates only via break/return/throw.
        let mut exit_branch = None;
        if !self.stream().is_sym(Sym::Semicolon) {
            let (cond, _) = self.parse_expression(None)?;
            let cond = self.cg_auto_convert(cond, TypeInfo::of(TYPE_INT), false)?;
            let (cond_reg, staged) = self.stage_in_register(cond)?;
            let r = self.reg_index(cond_reg)?;
            exit_branch = Some(self.emit(Opcode::TstEq, &[r as Word, 0]));
            if staged {
                self.free_temp(cond_reg);
            }
            self.free_temp(cond);
        }
        self.expect_sym(Sym::Semicolon, "';' after loop condition")?;

        // Remember the update clause, skip to ')'.
        let update_locator = self.stream().save();
        let mut depth = 0usize;
        loop {
            match &self.stream().peek().kind {
                TokenKind::Eof => {
                    return Err(self.error(ErrorKind::UnexpectedEndOfFile, "unterminated 'for'"));
                }
                TokenKind::Sym(Sym::LParen) => depth += 1,
                TokenKind::Sym(Sym::RParen) => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            self.stream().advance();
        }
        self.stream().advance(); // )

        let before = self.snapshot_member_init();
        self.parse_statement()?;
        let after = self.snapshot_member_init();
        self.join_member_init(&before, &after);
        let after_body = self.stream().save();

        // Update clause, compiled in loop order after the body.
        let update_pos = self.code_pos();
        self.stream().restore(update_locator);
        if !self.stream().is_sym(Sym::RParen) {
            self.p_expression_statement()?;
        }
        self.stream().restore(after_body);

        let back = self.emit(Opcode::Br, &[0]);
        self.patch_branch(back, top);
        let end = self.code_pos();
        if let Some(at) = exit_branch {
            self.patch_branch(at, end);
        }
        self.leave_loop(saved, end, Some(update_pos));
        self.exit_scope(mark)?;
        Ok(false)
    }

    // ----- switch -----------------------------------------------------------

    /// `switch (disc) { case K: ... default: ... }` with an int or string
    /// discriminator. The discriminator is always materialized on the
    /// stack so case emission stays safe under optimization.
    fn p_switch(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        self.expect_sym(Sym::LParen, "'(' after 'switch'")?;
        let (disc, disc_info) = self.parse_expression(None)?;
        self.expect_sym(Sym::RParen, "')'")?;
        let disc_type = match disc_info.type_id {
            TYPE_STRING => TYPE_STRING,
            _ => TYPE_INT,
        };
        let disc = self.cg_auto_convert(disc, TypeInfo::of(disc_type), false)?;
        let disc_tracker = self.cg_push_var(disc)?;
        self.free_temp(disc);

        self.expect_sym(Sym::LBrace, "'{' after switch head")?;
        let saved = self.enter_loop(false);
        let mark = self.enter_scope();

        let mut fail_branch: Option<usize> = None;
        let mut flowing = false;
        let mut saw_default = false;
        let mut init_snapshots: Vec<Vec<bool>> = Vec::new();
        let before_all = self.snapshot_member_init();

        while !self.stream().is_sym(Sym::RBrace) {
            if self.stream().at_end() {
                return Err(self.error(ErrorKind::UnexpectedEndOfFile, "unterminated switch"));
            }
            if self.stream().eat_kw(Kw::Case) {
                // Fallthrough from the previous body skips the test.
                let fall = if flowing {
                    Some(self.emit(Opcode::Br, &[0]))
                } else {
                    None
                };
                if let Some(at) = fail_branch.take() {
                    let here = self.code_pos();
                    self.patch_branch(at, here);
                }
                self.restore_member_init(&before_all);

                let literal = match self.stream().peek().kind.clone() {
                    TokenKind::Int(n) if disc_type == TYPE_INT => {
                        self.stream().advance();
                        LiteralValue::Int(n)
                    }
                    TokenKind::Char(n) if disc_type == TYPE_INT => {
                        self.stream().advance();
                        LiteralValue::Int(n)
                    }
                    TokenKind::Str(s) if disc_type == TYPE_STRING => {
                        self.stream().advance();
                        LiteralValue::Str(s)
                    }
                    _ => {
                        return Err(self.error(
                            ErrorKind::IncompatibleType,
                            "case label must be a constant matching the switch type",
                        ));
                    }
                };
                self.expect_sym(Sym::Colon, "':' after case label")?;

                // Load the discriminator back off the stack and compare.
                let disc_offset = match self.var(disc_tracker).slot {
                    Slot::Stack(ofs) => ofs,
                    _ => {
                        return Err(self.error(
                            ErrorKind::FatalStackUnderflow,
                            "switch discriminator left the stack",
                        ));
                    }
                };
                let copy = self.make_temp(disc_type)?;
                let cr = self.reg_index(copy)?;
                self.emit(Opcode::MoveSR, &[disc_offset as Word, cr as Word]);
                self.var_mut(copy).inited = true;
                let case_val = self.cg_load_literal(literal, false)?;
                let rel_result = self.cg_compare_var(crate::emit::Rel::Eq, copy, case_val)?;
                let rr = self.reg_index(rel_result)?;
                fail_branch = Some(self.emit(Opcode::TstEq, &[rr as Word, 0]));
                self.free_temp(rel_result);

                if let Some(at) = fall {
                    let here = self.code_pos();
                    self.patch_branch(at, here);
                }
                flowing = true;
                continue;
            }
            if self.stream().eat_kw(Kw::Default) {
                self.expect_sym(Sym::Colon, "':' after 'default'")?;
                if let Some(at) = fail_branch.take() {
                    let here = self.code_pos();
                    self.patch_branch(at, here);
                }
                self.restore_member_init(&before_all);
                saw_default = true;
                flowing = true;
                continue;
            }

            let terminated = self.parse_statement()?;
            if terminated {
                init_snapshots.push(self.snapshot_member_init());
                flowing = false;
            }
        }
        self.expect_sym(Sym::RBrace, "'}'")?;

        // Fall-through and failed tests run the scope-exit pops; breaks
        // unrolled the switch locals themselves and land after them.
        let fail_end = self.code_pos();
        if let Some(at) = fail_branch {
            self.patch_branch(at, fail_end);
        }
        self.exit_scope(mark)?;
        let end = self.code_pos();
        self.leave_loop(saved, end, None);

        // Join member-init over every arm; a missing default leaves the
        // pre-switch state as one of the paths.
        if !saw_default {
            init_snapshots.push(before_all.clone());
        }
        if let Some(first) = init_snapshots.first().cloned() {
            self.restore_member_init(&first);
            let snapshots = init_snapshots.split_off(1);
            for snap in snapshots {
                let cur = self.snapshot_member_init();
                self.join_member_init(&cur, &snap);
            }
        }

        // Drop the discriminator.
        let _ = self.sim_pop()?;
        self.emit(Opcode::Pop, &[]);
        Ok(false)
    }

    // ----- jumps ------------------------------------------------------------

    fn p_break(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        self.expect_sym(Sym::Semicolon, "';' after 'break'")?;
        if self.break_ctx == 0 {
            return Err(self.error(
                ErrorKind::BreakWithoutContext,
                "'break' outside loop or switch",
            ));
        }
        self.cg_unroll_to(self.loop_unroll_depth)?;
        let at = self.emit(Opcode::Br, &[0]);
        self.break_fixups.push(at);
        Ok(true)
    }

    fn p_continue(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        self.expect_sym(Sym::Semicolon, "';' after 'continue'")?;
        if self.cont_ctx == 0 {
            return Err(self.error(
                ErrorKind::ContinueWithoutContext,
                "'continue' outside loop",
            ));
        }
        self.cg_unroll_to(self.cont_unroll_depth)?;
        let at = self.emit(Opcode::Br, &[0]);
        self.cont_fixups.push(at);
        Ok(true)
    }

    /// Emit pops down to `depth` without disturbing the simulated
    /// stack; control leaves this path.
    pub(crate) fn cg_unroll_to(&mut self, depth: usize) -> Result<(), CompileError> {
        let n = self.stack.depth().saturating_sub(depth);
        if n == 0 {
            return Ok(());
        }
        if n <= crate::state::POPM_THRESHOLD {
            for _ in 0..n {
                self.emit(Opcode::Pop, &[]);
            }
        } else {
            self.emit(Opcode::PopM, &[n as Word]);
        }
        Ok(())
    }

    fn p_return(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        let record = self.registry.class(self.cur_class).funcs[self.cur_func].clone();

        if record.is_cofunction && !self.stream().is_sym(Sym::Semicolon) {
            return Err(self.error(
                ErrorKind::ReturnInCofunction,
                "a cofunction cannot return a value; use 'yield'",
            ));
        }

        if let Some(result) = &record.result {
            if self.stream().is_sym(Sym::Semicolon) {
                return Err(self.error(
                    ErrorKind::ReturnMissingValue,
                    format!("'{}' must return a value", record.name),
                ));
            }
            let result_var = self.find_result_var().ok_or_else(|| {
                CompileError::new(ErrorKind::FatalInternal, "result variable missing")
            })?;
            let (value, _) = self.parse_expression(Some(result_var))?;
            let _ = result;
            self.cg_move_var(value, result_var)?;
        } else if !self.stream().is_sym(Sym::Semicolon) {
            let (value, _) = self.parse_expression(None)?;
            self.free_temp(value);
            self.warning(
                WarningKind::DiscardedReturnValue,
                format!("'{}' does not return a value", record.name),
            );
        }
        self.expect_sym(Sym::Semicolon, "';' after 'return'")?;

        if record.is_ctor {
            self.check_members_initialized()?;
        }

        self.cg_unroll_to(record.args.len())?;
        self.emit(Opcode::Ret, &[]);
        self.out_func_record_mut().returned = true;
        Ok(true)
    }

    pub(crate) fn find_result_var(&self) -> Option<VarId> {
        self.vars
            .iter()
            .position(|v| v.usage == Usage::Result && v.slot == Slot::Register(REG_RESULT))
    }

    /// Constructors must leave every member initialized.
    pub(crate) fn check_members_initialized(&mut self) -> Result<(), CompileError> {
        let missing: Vec<String> = self
            .registry
            .class(self.cur_class)
            .members
            .iter()
            .filter(|m| !m.inited)
            .map(|m| m.name.clone())
            .collect();
        if let Some(name) = missing.first() {
            return Err(self.error(
                ErrorKind::UninitializedMember,
                format!("member '{}' may be uninitialized at constructor return", name),
            ));
        }
        Ok(())
    }

    fn p_throw(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        let (value, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::Semicolon, "';' after 'throw'")?;
        let (reg, staged) = self.stage_in_register(value)?;
        let r = self.reg_index(reg)?;
        self.emit(Opcode::Throw, &[r as Word]);
        if staged {
            self.free_temp(reg);
        }
        self.free_temp(value);
        Ok(true)
    }

    fn p_yield(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        let record = self.registry.class(self.cur_class).funcs[self.cur_func].clone();
        if !record.is_cofunction {
            return Err(self.error(
                ErrorKind::YieldOutsideCofunction,
                "'yield' outside cofunction",
            ));
        }
        if !self.stream().is_sym(Sym::Semicolon) {
            let result_var = self.find_result_var();
            match result_var {
                Some(rv) => {
                    let (value, _) = self.parse_expression(Some(rv))?;
                    self.cg_move_var(value, rv)?;
                }
                None => {
                    let (value, _) = self.parse_expression(None)?;
                    self.free_temp(value);
                }
            }
        }
        self.expect_sym(Sym::Semicolon, "';' after 'yield'")?;
        self.emit(Opcode::Yield, &[]);
        self.out_func_record_mut().yielded = true;
        Ok(false)
    }

    // ----- clause/goto ------------------------------------------------------

    /// `clause (T x) { ... } clause label: { ... } ...`
    fn p_clause(&mut self) -> Result<bool, CompileError> {
        self.stream().advance();
        self.expect_sym(Sym::LParen, "'(' after 'clause'")?;
        let mark = self.enter_scope();

        let spec = self.try_parse_type_spec()?.ok_or_else(|| {
            CompileError::new(ErrorKind::UnexpectedToken, "expected clause parameter type")
        })?;
        let name = self.expect_ident("clause parameter name")?;
        self.expect_sym(Sym::RParen, "')'")?;

        let mut param = Var::new(name.clone(), spec.type_id);
        param.elem_type = spec.elem_type;
        param.is_const = spec.is_const;
        param.is_ref = spec.is_ref;
        param.is_weak = spec.is_weak;
        // Default-initialized: the entry block runs before any goto has
        // filled the parameter.
        param.inited = true;
        let param = self.new_var(param);
        // The parameter lives in a register so gotos can fill it before
        // the unwind.
        match self.regs.alloc(param) {
            Some(r) => {
                self.vars[param].slot = Slot::Register(r);
                self.emit(Opcode::LdNull, &[r as Word]);
            }
            None => self.cg_push_slot(param)?,
        }
        self.locals.push((name, param));

        self.clauses.push(Clause::new(self.stack.depth(), param));

        // The clause body: ordinary statements, with `clause label:`
        // introducing the named blocks. A nested `clause (...)` statement
        // opens its own context and is handled by the statement parser.
        self.expect_sym(Sym::LBrace, "'{' after clause head")?;
        while !self.stream().is_sym(Sym::RBrace) {
            if self.stream().at_end() {
                return Err(self.error(ErrorKind::UnexpectedEndOfFile, "unterminated clause"));
            }
            let labeled = self.stream().is_kw(Kw::Clause)
                && matches!(self.stream().peek2().kind, TokenKind::Ident(_));
            if labeled {
                self.stream().advance();
                let label = self.expect_ident("clause label")?;
                self.expect_sym(Sym::Colon, "':' after clause label")?;
                let here = self.code_pos();
                let clause = self.clauses.last_mut().ok_or_else(|| {
                    CompileError::new(ErrorKind::FatalInternal, "clause stack empty")
                })?;
                if !clause.add_block(&label) {
                    return Err(self.error(
                        ErrorKind::IdentifierAlreadyDefined,
                        format!("duplicate clause label '{}'", label),
                    ));
                }
                if let Some(clause) = self.clauses.last_mut() {
                    clause.set_block(&label, here);
                }
                self.parse_block()?;
                continue;
            }
            self.parse_statement()?;
        }
        self.expect_sym(Sym::RBrace, "'}'")?;

        let clause = self.clauses.pop().ok_or_else(|| {
            CompileError::new(ErrorKind::FatalInternal, "clause stack empty")
        })?;
        let unit = self.unit().name.clone();
        let fixed = {
            let code = &mut self.out_func_record_mut().code;
            clause.fix_branches(code, &unit)
        };
        if let Err(err) = fixed {
            self.record_error(&err);
            return Err(err);
        }

        self.exit_scope(mark)?;
        Ok(false)
    }

    /// `goto label(expr);` inside a clause: fill the parameter, emit
    /// the unwind placeholder and the branch placeholder.
    fn p_goto(&mut self) -> Result<bool, CompileError> {
        let (_, line, column) = self.here();
        self.stream().advance();
        if self.clauses.is_empty() {
            return Err(self.error(
                ErrorKind::GotoWithoutContext,
                "'goto' outside a clause block",
            ));
        }
        let label = self.expect_ident("clause label after 'goto'")?;
        self.expect_sym(Sym::LParen, "'(' after goto label")?;
        let param = self
            .clauses
            .last()
            .map(|c| c.param)
            .unwrap_or_default();
        let (value, _) = self.parse_expression(Some(param))?;
        self.expect_sym(Sym::RParen, "')'")?;
        self.expect_sym(Sym::Semicolon, "';' after 'goto'")?;
        self.cg_move_var(value, param)?;

        let pop_pos = self.emit(Opcode::PopM, &[0]);
        let branch_pos = self.emit(Opcode::Br, &[0]);
        let depth = self.stack.depth();
        if let Some(clause) = self.clauses.last_mut() {
            clause.add_goto(&label, pop_pos, branch_pos, depth, line, column);
        }
        Ok(true)
    }
}
