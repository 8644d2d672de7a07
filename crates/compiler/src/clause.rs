//! The clause/goto facility.
//!
//! A `clause (T x) { ... } clause label: { ... }` statement introduces a
//! typed parameter and a set of named blocks. Inside any block,
//! `goto label(expr)` evaluates `expr` into the parameter slot, unwinds
//! the stack back to the clause's entry depth and branches to the named
//! block. Blocks may be referenced before they are declared, so every
//! goto emits a `popm` placeholder and a branch placeholder that are
//! patched once the whole clause has been parsed.

use crate::errors::{CompileError, ErrorKind};
use crate::frame::VarId;

/// A named block inside a clause.
#[derive(Debug, Clone)]
pub struct ClauseBlock {
    pub label: String,
    /// Code offset of the block entry; 0 until the block is parsed.
    pub code_pos: usize,
}

/// One pending `goto` inside a clause.
#[derive(Debug, Clone)]
pub struct ClauseGoto {
    pub label: String,
    /// Offset of the `popm` instruction emitted for the unwind.
    pub pop_pos: usize,
    /// Offset of the branch instruction following it.
    pub branch_pos: usize,
    /// Simulated stack depth at the goto site.
    pub stack_depth: usize,
    pub line: usize,
    pub column: usize,
}

/// Per-clause state, stacked for nesting.
#[derive(Debug, Clone)]
pub struct Clause {
    /// Simulated stack depth when the clause was entered; every goto
    /// unwinds back to this.
    pub entry_depth: usize,
    /// The clause parameter variable.
    pub param: VarId,
    pub blocks: Vec<ClauseBlock>,
    pub gotos: Vec<ClauseGoto>,
}

impl Clause {
    pub fn new(entry_depth: usize, param: VarId) -> Self {
        Clause {
            entry_depth,
            param,
            blocks: Vec::new(),
            gotos: Vec::new(),
        }
    }

    pub fn block(&self, label: &str) -> Option<&ClauseBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    /// Register a block label. Fails when the label already exists.
    pub fn add_block(&mut self, label: &str) -> bool {
        if self.block(label).is_some() {
            return false;
        }
        self.blocks.push(ClauseBlock {
            label: label.to_string(),
            code_pos: 0,
        });
        true
    }

    /// Record the code position a parsed block starts at.
    pub fn set_block(&mut self, label: &str, code_pos: usize) -> bool {
        match self.blocks.iter_mut().find(|b| b.label == label) {
            Some(block) => {
                block.code_pos = code_pos;
                true
            }
            None => false,
        }
    }

    pub fn add_goto(
        &mut self,
        label: &str,
        pop_pos: usize,
        branch_pos: usize,
        stack_depth: usize,
        line: usize,
        column: usize,
    ) {
        self.gotos.push(ClauseGoto {
            label: label.to_string(),
            pop_pos,
            branch_pos,
            stack_depth,
            line,
            column,
        });
    }

    /// Patch every goto's unwind count and branch offset into `code`.
    /// An unresolved label is reported at the goto's source position.
    pub fn fix_branches(
        &self,
        code: &mut [quill_core::Word],
        unit: &str,
    ) -> Result<(), CompileError> {
        for goto in &self.gotos {
            let block = self.block(&goto.label).ok_or_else(|| {
                CompileError::new(
                    ErrorKind::UnresolvedLabel,
                    format!("unresolved clause label '{}'", goto.label),
                )
                .at(unit, goto.line, goto.column)
            })?;
            let num_to_pop = goto.stack_depth - self.entry_depth;
            code[goto.pop_pos + 1] = num_to_pop as quill_core::Word;
            code[goto.branch_pos + 1] =
                block.code_pos as quill_core::Word - goto.branch_pos as quill_core::Word;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{Opcode, Word};

    #[test]
    fn test_duplicate_block_rejected() {
        let mut clause = Clause::new(0, 0);
        assert!(clause.add_block("more"));
        assert!(!clause.add_block("more"));
    }

    #[test]
    fn test_fix_branches_patches_pop_and_branch() {
        let mut clause = Clause::new(1, 0);
        clause.add_block("more");
        clause.set_block("more", 8);
        // popm placeholder at 0, branch placeholder at 2, goto at depth 3.
        clause.add_goto("more", 0, 2, 3, 1, 1);
        let mut code: Vec<Word> = vec![
            Opcode::PopM as Word,
            0,
            Opcode::Br as Word,
            0,
            Opcode::Nop as Word,
            Opcode::Nop as Word,
            Opcode::Nop as Word,
            Opcode::Nop as Word,
            Opcode::Ret as Word,
        ];
        clause.fix_branches(&mut code, "t").unwrap();
        // Unwind from depth 3 back to entry depth 1.
        assert_eq!(code[1], 2);
        // Branch from offset 2 to block entry 8.
        assert_eq!(code[3], 6);
    }

    #[test]
    fn test_unresolved_label_reports_goto_position() {
        let mut clause = Clause::new(0, 0);
        clause.add_goto("nowhere", 0, 2, 0, 7, 3);
        let mut code = vec![0; 4];
        let err = clause.fix_branches(&mut code, "t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedLabel);
        assert_eq!((err.line, err.column), (7, 3));
    }
}
