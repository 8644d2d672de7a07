//! The linker.
//!
//! After all units are compiled: assign every function its final code
//! offset, allocate VM handles for literal values and patch the
//! `moveh`/`copyh` operands, rewrite hybrid interface dispatch into
//! delegate calls, run the peephole pass, and produce the loadable
//! [`ProgramImage`].
//!
//! The peephole pass removes self-moves, collapses adjacent pop
//! sequences into one `popm` and drops literal loads that are
//! immediately overwritten. Removal compacts the code, so branch
//! operands are rewritten through an old-offset to new-offset map.
//! A pop run is never collapsed across an instruction some branch
//! targets.

use std::collections::HashSet;

use quill_core::{
    ConstValue, FunctionEntry, GlobalLayout, Opcode, ProgramImage, REG_THIS, TypeEntry, TypeId,
    Word, instructions,
};

use crate::errors::{CompileError, ErrorKind};
use crate::literals::LiteralValue;
use crate::registry::FuncState;
use crate::state::Compiler;

impl Compiler {
    /// Finalize all pending code into a program image and hand it to
    /// the VM.
    pub(crate) fn link_program(&mut self) -> Result<ProgramImage, CompileError> {
        self.log_verbose("Linking ...");
        self.cg_finish_intro();

        // Functions in handle order; handles were assigned densely at
        // declaration.
        let mut ordered: Vec<(TypeId, usize, usize)> = Vec::new();
        for class in &self.registry.classes {
            for (index, func) in class.funcs.iter().enumerate() {
                if let Some(handle) = func.handle {
                    ordered.push((class.type_id, index, handle));
                }
            }
        }
        ordered.sort_by_key(|&(_, _, handle)| handle);
        for (expected, &(class, index, handle)) in ordered.iter().enumerate() {
            if handle != expected {
                let name = self.registry.class(class).funcs[index].name.clone();
                return Err(self.error(
                    ErrorKind::FatalInternal,
                    format!("function handle table has a hole at '{}'", name),
                ));
            }
        }

        // Hybrid-forwarding methods have no source body; they forward
        // the whole frame through their delegate member. Interface
        // dispatch reaches them through the v-table like any method.
        for &(class, index, _) in &ordered {
            let func = &self.registry.class(class).funcs[index];
            if let (Some(slot), true) = (func.hybrid_member, func.code.is_empty()) {
                let code = &mut self.registry.classes[class].funcs[index].code;
                code.push(Opcode::CalldgM as Word);
                code.push(REG_THIS as Word);
                code.push(slot as Word);
                code.push(Opcode::Ret as Word);
            }
        }

        // Patch literal operands and hybrid dispatch, then optimize.
        let mut size_before = 0usize;
        let mut size_after = 0usize;
        let mut saved_instr = 0usize;
        let optimize = self.opts().optimize;

        for &(class, index, _) in &ordered {
            self.patch_literals(class, index)?;
            self.patch_hybrid_dispatch(class, index);
            let code_len = self.registry.class(class).funcs[index].code.len();
            size_before += code_len;
            if optimize > 0 {
                let (new_code, removed) = {
                    let code = &self.registry.class(class).funcs[index].code;
                    peephole(code)
                };
                saved_instr += removed;
                self.registry.classes[class].funcs[index].code = new_code;
            }
            size_after += self.registry.class(class).funcs[index].code.len();
            // Patched records must not be re-patched by a later link
            // after the offsets have been compacted away.
            self.registry.classes[class].funcs[index].literals.clear();
        }

        // Lay the bodies out in handle order and build the tables.
        let mut image = ProgramImage::default();
        for &(class, index, handle) in &ordered {
            let func = &self.registry.classes[class].funcs[index];
            let name = func.name.clone();
            let arg_count = func.args.len();
            let has_result = func.has_result();
            let code_offset = image.code.len();
            image.code.extend_from_slice(&func.code);
            image.functions.push(FunctionEntry {
                name,
                owner: class,
                code_offset,
                code_len: image.code.len() - code_offset,
                arg_count,
                has_result,
            });
            let _ = handle;
            self.registry.classes[class].funcs[index].state = FuncState::Linked;
        }

        // Verify call sites: every `calls` handle must point at a
        // defined (or native) function.
        for &(class, index, _) in &ordered {
            let code = self.registry.class(class).funcs[index].code.clone();
            for (at, op) in instructions(&code) {
                if op == Opcode::Calls {
                    let handle = code[at + 1] as usize;
                    let target = ordered.get(handle).copied();
                    let defined = target.is_some_and(|(tc, ti, _)| {
                        let f = &self.registry.class(tc).funcs[ti];
                        f.state != FuncState::Declared || self.registry.class(tc).native
                    });
                    if !defined {
                        let caller = self.registry.class(class).funcs[index].name.clone();
                        return Err(self.error(
                            ErrorKind::UndefinedFunctionCall,
                            format!("'{}' calls a function that was never defined", caller),
                        ));
                    }
                }
            }
        }

        // Type table and global layout.
        for class in &self.registry.classes {
            image.types.push(TypeEntry {
                name: class.name.clone(),
                family: class.family,
                base: class.base,
                native: class.native,
                methods: class.funcs.iter().filter_map(|f| f.handle).collect(),
                instance_size: class.members.len(),
            });
        }
        let mut globals = GlobalLayout::default();
        for member in &self.registry.class(quill_core::TYPE_GLOBAL).members {
            globals.names.push(member.name.clone());
            globals.types.push(member.type_id);
        }
        image.globals = globals;
        let init_handle =
            self.registry.class(quill_core::TYPE_GLOBAL).funcs[self.init_func].handle;
        image.init_function = init_handle;
        image.constants = self.vm_constants();

        self.opt_size_before = size_before * std::mem::size_of::<Word>();
        self.opt_size_after = size_after * std::mem::size_of::<Word>();
        self.opt_saved_instr = saved_instr;
        self.linked = true;

        if saved_instr > 0 {
            self.log_verbose(&format!("Saved {} instructions in total.", saved_instr));
            self.log_verbose(&format!(
                "Code size reduced from {} to {} bytes in total.",
                self.opt_size_before, self.opt_size_after
            ));
        }
        let elapsed = self
            .start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.log_verbose(&format!(
            "{} bytes, {} files, {} errors, {} warnings, {:.3} seconds.",
            self.opt_size_after, self.num_units, self.num_errors, self.num_warnings, elapsed
        ));

        Ok(image)
    }

    /// Allocate constant handles for a function's literal records and
    /// patch the placeholder operands.
    fn patch_literals(&mut self, class: TypeId, index: usize) -> Result<(), CompileError> {
        let count = self.registry.class(class).funcs[index].literals.len();
        for i in 0..count {
            let record = self.registry.class(class).funcs[index].literals[i].clone();
            let patch_value: Word = match &record.value {
                LiteralValue::Int(n) => {
                    self.vm.alloc_handle(ConstValue::Int(*n)) as Word
                }
                LiteralValue::Float(f) => {
                    self.vm.alloc_handle(ConstValue::Float(*f)) as Word
                }
                LiteralValue::Str(s) => {
                    self.vm.alloc_handle(ConstValue::Str(s.clone())) as Word
                }
                LiteralValue::Func {
                    is_method,
                    resolved,
                    ..
                } => match resolved {
                    Some((owner, func_index)) => {
                        if *is_method {
                            // `newdgm` carries the method index directly.
                            *func_index as Word
                        } else {
                            let handle = self.registry.class(*owner).funcs[*func_index]
                                .handle
                                .unwrap_or(0);
                            self.vm.alloc_handle(ConstValue::Func(handle)) as Word
                        }
                    }
                    None => {
                        return Err(self.error_at(
                            ErrorKind::FatalInternal,
                            "unresolved function literal at link time",
                            record.line,
                            record.column,
                        ));
                    }
                },
            };
            self.registry.classes[class].funcs[index].code[record.code_offset] = patch_value;
        }
        Ok(())
    }

    /// Rewrite virtual calls to hybrid-forwarded methods into delegate
    /// calls through the recorded member slot.
    fn patch_hybrid_dispatch(&mut self, class: TypeId, index: usize) {
        let code = self.registry.class(class).funcs[index].code.clone();
        let mut patches: Vec<(usize, usize)> = Vec::new();
        for (at, op) in instructions(&code) {
            if op != Opcode::Callm {
                continue;
            }
            let target_class = code[at + 1] as usize;
            let target_index = code[at + 2] as usize;
            let Some(target) = self
                .registry
                .get(target_class)
                .and_then(|c| c.funcs.get(target_index))
            else {
                continue;
            };
            if let Some(slot) = target.hybrid_member {
                patches.push((at, slot));
            }
        }
        if patches.is_empty() {
            return;
        }
        let code = &mut self.registry.classes[class].funcs[index].code;
        for (at, slot) in patches {
            // Same instruction length: callm type,index -> calldg_m r0,slot.
            code[at] = Opcode::CalldgM as Word;
            code[at + 1] = REG_THIS as Word;
            code[at + 2] = slot as Word;
        }
    }

    fn vm_constants(&mut self) -> Vec<ConstValue> {
        self.vm.constant_table()
    }
}

/// One peephole pass over a function body. Returns the rewritten code
/// and the number of instructions removed.
fn peephole(code: &[Word]) -> (Vec<Word>, usize) {
    // Branch targets may not land inside a collapsed pop run.
    let mut targets = HashSet::new();
    for (at, op) in instructions(code) {
        if let Some(idx) = op.branch_operand() {
            let target = at as i64 + code[at + 1 + idx] as i64;
            if target >= 0 {
                targets.insert(target as usize);
            }
        }
    }

    // First walk: decide what each instruction becomes and build the
    // offset map.
    #[derive(Clone, Copy)]
    enum Action {
        Keep,
        Drop,
        /// Start of a pop run collapsed into `popm n`.
        PopRun(usize),
        /// Interior of a collapsed pop run.
        PopRunTail,
    }

    let insns: Vec<(usize, Opcode)> = instructions(code).collect();
    let mut actions = vec![Action::Keep; insns.len()];

    let mut i = 0usize;
    while i < insns.len() {
        let (at, op) = insns[i];

        // Self-moves.
        if matches!(op, Opcode::MoveRR | Opcode::MoveSS) && code[at + 1] == code[at + 2] {
            actions[i] = Action::Drop;
            i += 1;
            continue;
        }

        // Literal load immediately overwritten.
        if matches!(op, Opcode::MovehR | Opcode::CopyhR) {
            if let Some(&(next_at, next_op)) = insns.get(i + 1) {
                let dst = code[at + 2];
                let overwrites = match next_op {
                    Opcode::MovehR | Opcode::CopyhR => code[next_at + 2] == dst,
                    Opcode::LdNull => code[next_at + 1] == dst,
                    Opcode::MoveRR | Opcode::MoveSR => {
                        code[next_at + 2] == dst && code[next_at + 1] != dst
                    }
                    Opcode::Alloc | Opcode::Allocn | Opcode::Alloci => code[next_at + 2] == dst,
                    _ => false,
                };
                if overwrites && !targets.contains(&insns[i + 1].0) {
                    actions[i] = Action::Drop;
                    i += 1;
                    continue;
                }
            }
        }

        // Pop runs.
        if matches!(op, Opcode::Pop | Opcode::PopM) {
            let mut total = match op {
                Opcode::Pop => 1usize,
                _ => code[at + 1] as usize,
            };
            let mut j = i + 1;
            while let Some(&(next_at, next_op)) = insns.get(j) {
                if !matches!(next_op, Opcode::Pop | Opcode::PopM) {
                    break;
                }
                if targets.contains(&next_at) {
                    break;
                }
                total += match next_op {
                    Opcode::Pop => 1usize,
                    _ => code[next_at + 1] as usize,
                };
                j += 1;
            }
            if j > i + 1 || (op == Opcode::PopM && total <= 1) {
                if total == 0 {
                    actions[i] = Action::Drop;
                } else {
                    actions[i] = Action::PopRun(total);
                }
                for slot in actions.iter_mut().take(j).skip(i + 1) {
                    *slot = Action::PopRunTail;
                }
                i = j;
                continue;
            }
            if op == Opcode::PopM && total == 0 {
                actions[i] = Action::Drop;
                i += 1;
                continue;
            }
        }

        i += 1;
    }

    // Offset map: every old word offset to its new offset.
    let mut map = vec![0usize; code.len() + 1];
    let mut new_len = 0usize;
    for (k, &(at, op)) in insns.iter().enumerate() {
        for ofs in 0..op.len() {
            map[at + ofs] = new_len;
        }
        new_len += match actions[k] {
            Action::Keep => op.len(),
            Action::Drop | Action::PopRunTail => 0,
            Action::PopRun(n) => {
                if n == 1 {
                    Opcode::Pop.len()
                } else {
                    Opcode::PopM.len()
                }
            }
        };
    }
    map[code.len()] = new_len;

    // Second walk: emit.
    let mut out = Vec::with_capacity(new_len);
    let mut removed = 0usize;
    for (k, &(at, op)) in insns.iter().enumerate() {
        match actions[k] {
            Action::Drop => removed += 1,
            Action::PopRunTail => removed += 1,
            Action::PopRun(n) => {
                if n == 1 {
                    out.push(Opcode::Pop as Word);
                } else {
                    out.push(Opcode::PopM as Word);
                    out.push(n as Word);
                }
            }
            Action::Keep => {
                let new_at = out.len();
                out.push(code[at]);
                for ofs in 1..op.len() {
                    out.push(code[at + ofs]);
                }
                if let Some(idx) = op.branch_operand() {
                    let old_target = (at as i64 + code[at + 1 + idx] as i64) as usize;
                    let new_target = map[old_target.min(code.len())];
                    out[new_at + 1 + idx] = new_target as Word - new_at as Word;
                }
            }
        }
    }

    (out, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peephole_removes_self_move() {
        let code = vec![
            Opcode::MoveRR as Word,
            4,
            4,
            Opcode::Ret as Word,
        ];
        let (out, removed) = peephole(&code);
        assert_eq!(out, vec![Opcode::Ret as Word]);
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_peephole_collapses_pop_runs() {
        let code = vec![
            Opcode::Pop as Word,
            Opcode::Pop as Word,
            Opcode::Pop as Word,
            Opcode::Ret as Word,
        ];
        let (out, _) = peephole(&code);
        assert_eq!(out, vec![Opcode::PopM as Word, 3, Opcode::Ret as Word]);
    }

    #[test]
    fn test_peephole_fixes_branches_across_removal() {
        // br over a self-move to ret.
        let code = vec![
            Opcode::Br as Word,
            5, // to ret at 5
            Opcode::MoveRR as Word,
            3,
            3,
            Opcode::Ret as Word,
        ];
        let (out, _) = peephole(&code);
        assert_eq!(out[0], Opcode::Br as Word);
        // ret now sits at offset 2.
        assert_eq!(out[1], 2);
        assert_eq!(out[2], Opcode::Ret as Word);
    }

    #[test]
    fn test_peephole_drops_dead_literal_load() {
        let code = vec![
            Opcode::MovehR as Word,
            7,
            4,
            Opcode::MovehR as Word,
            8,
            4,
            Opcode::Ret as Word,
        ];
        let (out, removed) = peephole(&code);
        assert_eq!(removed, 1);
        assert_eq!(out, vec![Opcode::MovehR as Word, 8, 4, Opcode::Ret as Word]);
    }

    #[test]
    fn test_peephole_respects_branch_into_pop_run() {
        // tstne branches to the second pop; the run must not collapse
        // across it.
        let code = vec![
            Opcode::TstNe as Word,
            4,
            4, // to the pop at 4
            Opcode::Pop as Word,
            Opcode::Pop as Word,
            Opcode::Ret as Word,
        ];
        let (out, _) = peephole(&code);
        // Both pops survive individually.
        let pops = out.iter().filter(|&&w| w == Opcode::Pop as Word).count();
        assert_eq!(pops, 2);
    }
}
