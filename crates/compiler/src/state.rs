//! The compiler session state.
//!
//! One [`Compiler`] owns everything for a compile session: the class
//! table, the simulated register file and data stack, the unit (import)
//! stack, the option stack, the diagnostic queue and the optimization
//! counters. All of the original design's process-wide counters are
//! fields here.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use rand::Rng;
use quill_core::{
    NUM_REGISTERS, Opcode, REG_FIRST_VAR, REG_RESULT, REG_THIS, TypeFamily, TypeId, Vm, Word,
};

use crate::clause::Clause;
use crate::driver::SourceLoader;
use crate::errors::{CompileError, ErrorKind, WarningKind, format_warning};
use crate::frame::{RegisterFile, SimStack, Slot, Usage, Var, VarId};
use crate::lexer::{Sym, TokenKind, TokenStream};
use crate::options::{LocalVarMode, Options};
use crate::registry::{FuncRecord, Registry};

/// Compilation pass over a translation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Pass 1: declarations only, function bodies skipped.
    Precompile,
    /// Pass 2: function bodies and global initializers.
    Compile,
}

/// One translation unit on the import stack.
pub struct Unit {
    pub name: String,
    pub path: String,
    pub stream: TokenStream,
    /// Classes named by `using` statements in this file.
    pub usings: Vec<TypeId>,
}

/// The main compiler object.
pub struct Compiler {
    pub(crate) vm: Box<dyn Vm>,
    pub(crate) registry: Registry,
    pub(crate) loader: Box<dyn SourceLoader>,

    pub(crate) units: Vec<Unit>,
    pub(crate) pass: Pass,

    /// Class currently being parsed.
    pub(crate) cur_class: TypeId,
    /// Function currently being parsed.
    pub(crate) cur_func: usize,
    /// Where bytecode goes; usually equals (`cur_class`, `cur_func`).
    pub(crate) out_class: TypeId,
    pub(crate) out_func: usize,

    pub(crate) vars: Vec<Var>,
    /// Named locals in scope, innermost last. Blocks remember their
    /// entry length and truncate on exit.
    pub(crate) locals: Vec<(String, VarId)>,
    pub(crate) regs: RegisterFile,
    pub(crate) stack: SimStack,
    pub(crate) block_level: usize,
    /// Locals-list length at each open block, innermost last. Used for
    /// same-scope redefinition checks.
    pub(crate) scope_starts: Vec<usize>,
    /// Stack depth to unwind to on `break`.
    pub(crate) loop_unroll_depth: usize,
    /// Stack depth to unwind to on `continue` (the innermost loop;
    /// switch does not move it).
    pub(crate) cont_unroll_depth: usize,
    pub(crate) break_fixups: Vec<usize>,
    pub(crate) cont_fixups: Vec<usize>,
    /// Nesting depth of constructs `break` may leave (loops, switch).
    pub(crate) break_ctx: usize,
    /// Nesting depth of constructs `continue` may re-enter (loops).
    pub(crate) cont_ctx: usize,
    pub(crate) clauses: Vec<Clause>,
    /// Registers named locals may still claim in this function.
    pub(crate) var_reg_budget: usize,

    /// Nonzero while probing call arguments; diagnostics are not queued.
    pub(crate) probing: usize,
    /// Whether the next resolved call's return value is consumed.
    /// Statement-expressions clear it; argument contexts read it as true.
    pub(crate) call_wants_value: bool,

    pub(crate) options_stack: Vec<Options>,
    pub(crate) errors: Vec<String>,
    pub(crate) flushed: usize,
    pub(crate) num_errors: usize,
    pub(crate) num_warnings: usize,
    pub(crate) num_units: usize,
    pub(crate) fatal_state: bool,
    pub(crate) fatal_handler: Option<Box<dyn FnMut(&str)>>,

    pub(crate) intro_finished: bool,
    pub(crate) init_func: usize,
    pub(crate) linked: bool,
    /// Next function handle; handles are assigned at declaration and
    /// become indices into the image function table at link.
    pub(crate) next_func_handle: usize,

    pub(crate) import_paths: Vec<(String, PathBuf)>,
    pub(crate) imported: HashSet<String>,

    pub(crate) opt_saved_instr: usize,
    pub(crate) opt_size_before: usize,
    pub(crate) opt_size_after: usize,
    pub(crate) start_time: Option<Instant>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("pass", &self.pass)
            .field("num_errors", &self.num_errors)
            .field("num_warnings", &self.num_warnings)
            .finish_non_exhaustive()
    }
}

/// Default register budget for named locals in `local-var-mode=auto`.
pub(crate) const AUTO_VAR_REG_BUDGET: usize = 8;

/// Pop counts up to this many emit individual `pop`s; larger unwinds
/// emit one `popm`.
pub(crate) const POPM_THRESHOLD: usize = 2;

impl Compiler {
    // ----- units and tokens -------------------------------------------------

    pub(crate) fn stream(&mut self) -> &mut TokenStream {
        &mut self
            .units
            .last_mut()
            .expect("token access with no unit on the import stack")
            .stream
    }

    pub(crate) fn unit(&self) -> &Unit {
        self.units
            .last()
            .expect("unit access with no unit on the import stack")
    }

    /// (unit name, line, column) of the current token.
    pub(crate) fn here(&self) -> (String, usize, usize) {
        match self.units.last() {
            Some(unit) => {
                let (line, column) = unit.stream.position();
                (unit.name.clone(), line, column)
            }
            None => (String::new(), 0, 0),
        }
    }

    // ----- diagnostics ------------------------------------------------------

    /// Build, queue and return an error at the current token.
    pub(crate) fn error(&mut self, kind: ErrorKind, msg: impl Into<String>) -> CompileError {
        let (unit, line, column) = self.here();
        let err = CompileError::new(kind, msg).at(&unit, line, column);
        self.record_error(&err);
        err
    }

    /// Build, queue and return an error at an explicit position.
    pub(crate) fn error_at(
        &mut self,
        kind: ErrorKind,
        msg: impl Into<String>,
        line: usize,
        column: usize,
    ) -> CompileError {
        let unit = self.units.last().map(|u| u.name.clone()).unwrap_or_default();
        let err = CompileError::new(kind, msg).at(&unit, line, column);
        self.record_error(&err);
        err
    }

    pub(crate) fn record_error(&mut self, err: &CompileError) {
        if err.kind.is_fatal() {
            self.fatal_state = true;
            let text = err.format(self.opts().error_format);
            if let Some(mut handler) = self.fatal_handler.take() {
                handler(&text);
                self.fatal_handler = Some(handler);
            }
            self.errors.push(text);
            self.num_errors += 1;
            return;
        }
        if self.probing > 0 {
            // The argument will be re-compiled against the chosen
            // candidate; diagnostics surface then.
            return;
        }
        self.num_errors += 1;
        let text = err.format(self.opts().error_format);
        self.errors.push(text);
    }

    pub(crate) fn warning(&mut self, kind: WarningKind, msg: impl Into<String>) {
        if self.probing > 0 {
            return;
        }
        if kind.level() > self.opts().warning_level {
            return;
        }
        let (unit, line, column) = self.here();
        let text = format_warning(
            kind,
            &msg.into(),
            &unit,
            line,
            column,
            self.opts().error_format,
        );
        self.errors.push(text);
        self.num_warnings += 1;
    }

    // ----- options ----------------------------------------------------------

    pub(crate) fn opts(&self) -> &Options {
        self.options_stack
            .last()
            .expect("option stack is never empty")
    }

    pub(crate) fn log_verbose(&self, msg: &str) {
        if self.opts().verbose {
            tracing::info!("{}", msg);
        } else {
            tracing::debug!("{}", msg);
        }
    }

    // ----- parser helpers ---------------------------------------------------

    pub(crate) fn expect_sym(&mut self, sym: Sym, what: &str) -> Result<(), CompileError> {
        if self.stream().eat_sym(sym) {
            return Ok(());
        }
        let kind = match sym {
            Sym::Semicolon => ErrorKind::MissingSemicolon,
            Sym::LBrace | Sym::RBrace => ErrorKind::MismatchedBrace,
            _ => ErrorKind::UnexpectedToken,
        };
        Err(self.error(kind, format!("expected {}", what)))
    }

    pub(crate) fn expect_ident(&mut self, what: &str) -> Result<String, CompileError> {
        match self.stream().peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.stream().advance();
                Ok(name)
            }
            _ => Err(self.error(ErrorKind::ExpectedIdentifier, format!("expected {}", what))),
        }
    }

    // ----- code emission ----------------------------------------------------

    pub(crate) fn out_func_record(&self) -> &FuncRecord {
        &self.registry.class(self.out_class).funcs[self.out_func]
    }

    pub(crate) fn out_func_record_mut(&mut self) -> &mut FuncRecord {
        &mut self.registry.classes[self.out_class].funcs[self.out_func]
    }

    pub(crate) fn code_pos(&self) -> usize {
        self.out_func_record().code.len()
    }

    /// Emit one instruction; returns its offset.
    pub(crate) fn emit(&mut self, op: Opcode, operands: &[Word]) -> usize {
        debug_assert_eq!(op.operand_count(), operands.len());
        let code = &mut self.out_func_record_mut().code;
        let at = code.len();
        code.push(op as Word);
        code.extend_from_slice(operands);
        at
    }

    /// Patch a branch instruction's relative operand to point at `target`.
    pub(crate) fn patch_branch(&mut self, branch_at: usize, target: usize) {
        let code = &mut self.out_func_record_mut().code;
        let op = Opcode::try_from(code[branch_at]).expect("patching a non-instruction offset");
        let idx = op
            .branch_operand()
            .expect("patching a non-branch instruction");
        code[branch_at + 1 + idx] = target as Word - branch_at as Word;
    }

    // ----- variables, registers, stack --------------------------------------

    pub(crate) fn new_var(&mut self, var: Var) -> VarId {
        self.vars.push(var);
        self.vars.len() - 1
    }

    pub(crate) fn var(&self, id: VarId) -> &Var {
        &self.vars[id]
    }

    pub(crate) fn var_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id]
    }

    /// Allocate a temporary in a free register.
    pub(crate) fn make_temp(&mut self, type_id: TypeId) -> Result<VarId, CompileError> {
        let id = self.new_var(Var::temp(type_id));
        match self.regs.alloc(id) {
            Some(r) => {
                self.vars[id].slot = Slot::Register(r);
                Ok(id)
            }
            None => Err(self.error(
                ErrorKind::FatalRegisterState,
                "expression too complex: out of temporary registers",
            )),
        }
    }

    /// Release an expression temporary. Named variables and stack
    /// residents are left alone.
    pub(crate) fn free_temp(&mut self, id: VarId) {
        let var = &self.vars[id];
        if var.usage != Usage::Temp || var.on_stack {
            return;
        }
        if let Slot::Register(r) = var.slot {
            if self.regs.occupant(r) == Some(id) {
                self.regs.free(r);
            }
        }
        if let Slot::ArrayElem { array, index } = self.vars[id].slot {
            self.free_temp(index);
            // The staged array base is consumed with its element.
            if let Some(base) = self.regs.occupant(array) {
                if self.vars[base].usage == Usage::Temp && base != id {
                    self.free_temp(base);
                }
            }
        }
        self.vars[id].slot = Slot::Unused;
    }

    /// Innermost named local (arguments and `this` included).
    pub(crate) fn find_local(&self, name: &str) -> Option<VarId> {
        self.locals
            .iter()
            .rev()
            .find(|(n, id)| n.as_str() == name && !self.vars[*id].hidden)
            .map(|(_, id)| *id)
    }

    pub(crate) fn sim_push(&mut self, id: VarId) -> Result<(), CompileError> {
        match self.stack.push(&mut self.vars, id) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    pub(crate) fn sim_pop(&mut self) -> Result<VarId, CompileError> {
        match self.stack.pop(&mut self.vars) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    // ----- function body context --------------------------------------------

    /// Enter a function body: reset the location model and materialize
    /// `this`, the result descriptor and the arguments.
    pub(crate) fn begin_function_body(
        &mut self,
        class: TypeId,
        func: usize,
    ) -> Result<(), CompileError> {
        self.cur_class = class;
        self.cur_func = func;
        self.out_class = class;
        self.out_func = func;
        self.vars.clear();
        self.locals.clear();
        self.regs.reset();
        self.stack.clear();
        self.block_level = 0;
        self.scope_starts.clear();
        self.loop_unroll_depth = 0;
        self.cont_unroll_depth = 0;
        self.break_fixups.clear();
        self.cont_fixups.clear();
        self.break_ctx = 0;
        self.cont_ctx = 0;
        self.clauses.clear();
        self.var_reg_budget = match self.opts().local_var_mode {
            LocalVarMode::Auto => AUTO_VAR_REG_BUDGET,
            LocalVarMode::Stack => 0,
            LocalVarMode::Register => NUM_REGISTERS - REG_FIRST_VAR,
        };

        let record = self.registry.class(class).funcs[func].clone();

        if record.is_method || record.is_ctor || record.is_convertor {
            let mut this_var = Var::new("this", class);
            this_var.slot = Slot::Register(REG_THIS);
            this_var.inited = true;
            let id = self.new_var(this_var);
            self.locals.push(("this".to_string(), id));
        }
        if let Some(result) = &record.result {
            let mut result_var = result.clone();
            result_var.usage = Usage::Result;
            result_var.slot = Slot::Register(REG_RESULT);
            self.new_var(result_var);
        }
        // Arguments sit on the caller's stack, pushed left to right:
        // the last argument is on top.
        let argc = record.args.len();
        for (i, arg) in record.args.iter().enumerate() {
            let mut arg_var = arg.clone();
            arg_var.inited = true;
            arg_var.slot = Slot::Stack(argc - 1 - i);
            let name = arg_var.name.clone();
            let id = self.new_var(arg_var);
            // Seed the simulated stack bottom-up so offsets line up.
            self.stack_seed(id)?;
            self.locals.push((name, id));
        }
        Ok(())
    }

    /// Push an argument var during body entry without emitting code.
    fn stack_seed(&mut self, id: VarId) -> Result<(), CompileError> {
        // Re-push through the simulated stack so its bookkeeping holds;
        // the recorded slot offsets are recomputed by the push.
        self.vars[id].slot = Slot::Unused;
        self.sim_push(id)
    }

    /// Leave a function body: record register usage and close the code.
    pub(crate) fn end_function_body(&mut self) {
        let high = self.regs.high_water();
        let used = if high < REG_FIRST_VAR {
            0
        } else {
            high + 1 - REG_FIRST_VAR
        };
        let opt_level = self.opts().optimize;
        let record = self.out_func_record_mut();
        record.regs_used = used;
        record.opt_level = opt_level;
    }

    // ----- member-initialization tracking -----------------------------------

    pub(crate) fn snapshot_member_init(&self) -> Vec<bool> {
        self.registry
            .class(self.cur_class)
            .members
            .iter()
            .map(|m| m.inited)
            .collect()
    }

    pub(crate) fn restore_member_init(&mut self, snapshot: &[bool]) {
        let members = &mut self.registry.classes[self.cur_class].members;
        for (member, &inited) in members.iter_mut().zip(snapshot) {
            member.inited = inited;
        }
    }

    /// Join two branch outcomes: a member counts as initialized only
    /// when every path initialized it.
    pub(crate) fn join_member_init(&mut self, a: &[bool], b: &[bool]) {
        let members = &mut self.registry.classes[self.cur_class].members;
        for (i, member) in members.iter_mut().enumerate() {
            member.inited = a.get(i).copied().unwrap_or(false) && b.get(i).copied().unwrap_or(false);
        }
    }

    // ----- type creation ----------------------------------------------------

    /// Two-step type creation: reserve the VM-side record, then create
    /// the compiler-side record at exactly that slot.
    pub(crate) fn create_type(
        &mut self,
        name: &str,
        parent: TypeId,
        family: TypeFamily,
        native: bool,
    ) -> Result<TypeId, CompileError> {
        let id = self.vm.reserve_type(name, family);
        if id != self.registry.len() {
            return Err(self.error(
                ErrorKind::FatalTypeIdDesync,
                format!(
                    "type id desync creating '{}': VM reserved {}, class table has {}",
                    name,
                    id,
                    self.registry.len()
                ),
            ));
        }
        let mut record = crate::registry::ClassRecord::new(id, name, parent, family);
        record.native = native;
        self.registry.classes.push(record);
        Ok(id)
    }

    /// Resolve an identifier to a type id, following aliases.
    pub(crate) fn find_type(&self, name: &str) -> Option<TypeId> {
        self.registry.find_by_name(name)
    }

    // ----- misc -------------------------------------------------------------

    pub(crate) fn alloc_func_handle(&mut self) -> usize {
        let handle = self.next_func_handle;
        self.next_func_handle += 1;
        handle
    }

    pub(crate) fn random_identifier(&self, len: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| {
                let c: u8 = rng.gen_range(0..26);
                (b'a' + c) as char
            })
            .collect()
    }
}
