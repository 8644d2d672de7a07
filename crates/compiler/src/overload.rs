//! Function lookup and overload resolution.
//!
//! Lookup fans out over three scopes: the current class (with its base
//! chain), the global scope, and every class named by the current file's
//! `using` set. A name matching in more than one scope is ambiguous.
//!
//! Within a scope, the best overload is chosen by a conversion-cost
//! score: 2 per argument needing a non-trivial conversion, plus 1 when
//! the caller's use of the return value disagrees with the candidate.
//! The unique lowest score wins; a tie is ambiguous.
//!
//! Call sites compile arguments twice: a *probe* pass with diagnostics
//! suppressed infers each argument's type, then after a candidate is
//! chosen the arguments are re-compiled against its declared parameter
//! types so conversion code lands correctly. The probe rolls back all
//! emitted code and allocation state.

use quill_core::{TYPE_FLOAT, TYPE_GLOBAL, TYPE_INT, TYPE_NULL, TYPE_STRING, TYPE_VAR, TypeId};

use crate::errors::{CompileError, ErrorKind};
use crate::frame::{RegisterFile, SimStack, TypeInfo, Var};
use crate::lexer::Locator;
use crate::state::Compiler;

/// A function identified by owner and in-class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub class: TypeId,
    pub index: usize,
}

/// How a source type reaches a parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    No,
    /// No code needed.
    Trivial,
    /// Conversion code required (int<->float, convertor, ctor, dcvt).
    NonTrivial,
}

/// Saved state for a probe compilation of an argument expression.
pub(crate) struct ProbeSnapshot {
    locator: Locator,
    code_len: usize,
    literal_len: usize,
    vars_len: usize,
    regs: RegisterFile,
    stack: SimStack,
}

impl Compiler {
    // ----- scope fan-out ----------------------------------------------------

    /// Collect candidates named `name` taking `argc` arguments, honoring
    /// the three-scope rule.
    pub(crate) fn collect_candidates(
        &mut self,
        name: &str,
        argc: usize,
    ) -> Result<Vec<Candidate>, CompileError> {
        let mut per_scope: Vec<Vec<Candidate>> = Vec::new();

        // (i) implicit-this scope: the current class and its base chain.
        if self.cur_class != TYPE_GLOBAL {
            let mut hits = Vec::new();
            let mut cur = Some(self.cur_class);
            while let Some(class) = cur {
                for idx in self.funcs_named_with_argc(class, name, argc) {
                    hits.push(Candidate { class, index: idx });
                }
                cur = self.registry.class(class).base;
            }
            if !hits.is_empty() {
                per_scope.push(hits);
            }
        }

        // (ii) global scope.
        let globals: Vec<Candidate> = self
            .funcs_named_with_argc(TYPE_GLOBAL, name, argc)
            .into_iter()
            .map(|index| Candidate {
                class: TYPE_GLOBAL,
                index,
            })
            .collect();
        if !globals.is_empty() {
            per_scope.push(globals);
        }

        // (iii) classes imported with `using`.
        let usings = self.unit().usings.clone();
        let mut using_hits = Vec::new();
        for class in usings {
            for idx in self.funcs_named_with_argc(class, name, argc) {
                using_hits.push(Candidate { class, index: idx });
            }
        }
        if !using_hits.is_empty() {
            per_scope.push(using_hits);
        }

        match per_scope.len() {
            0 => Ok(Vec::new()),
            1 => Ok(per_scope.pop().unwrap_or_default()),
            _ => Err(self.error(
                ErrorKind::AmbiguousFunctionCall,
                format!("'{}' is visible in more than one scope", name),
            )),
        }
    }

    fn funcs_named_with_argc(&self, class: TypeId, name: &str, argc: usize) -> Vec<usize> {
        self.registry
            .class(class)
            .funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| f.name == name && f.args.len() == argc && !f.is_anonymous)
            .map(|(i, _)| i)
            .collect()
    }

    // ----- scoring ----------------------------------------------------------

    /// Pick the unique best candidate for the probed argument types.
    /// `want_result` says whether the call site consumes a value.
    pub(crate) fn resolve_overload(
        &mut self,
        name: &str,
        candidates: &[Candidate],
        args: &[TypeInfo],
        want_result: bool,
    ) -> Result<Candidate, CompileError> {
        let mut best: Option<(u32, Candidate)> = None;
        let mut tied = false;

        'candidates: for &cand in candidates {
            let record = &self.registry.class(cand.class).funcs[cand.index];
            let strict = record.is_strict || self.registry.class(cand.class).strict;
            let mut score = 0u32;
            let params: Vec<Var> = record.args.clone();
            let has_result = record.has_result();

            for (arg, param) in args.iter().zip(&params) {
                match self.convertibility(arg, &TypeInfo::from_var(param)) {
                    Convert::No => continue 'candidates,
                    Convert::Trivial => {}
                    Convert::NonTrivial => {
                        if strict {
                            continue 'candidates;
                        }
                        score += 2;
                    }
                }
            }
            if want_result != has_result {
                score += 1;
            }

            match best {
                Some((best_score, _)) if score > best_score => {}
                Some((best_score, _)) if score == best_score => tied = true,
                _ => {
                    best = Some((score, cand));
                    tied = false;
                }
            }
        }

        match best {
            Some((_, cand)) if !tied => Ok(cand),
            Some(_) => Err(self.error(
                ErrorKind::AmbiguousFunctionCall,
                format!("ambiguous call to '{}'", name),
            )),
            None => Err(self.error(
                ErrorKind::UndefinedFunctionCall,
                format!("no matching overload for '{}'", name),
            )),
        }
    }

    /// Classify how `src` reaches `want` for scoring purposes. Mirrors
    /// the code paths of `cg_auto_convert` without emitting anything.
    pub(crate) fn convertibility(&self, src: &TypeInfo, want: &TypeInfo) -> Convert {
        if self.implicitly_convertible_info(src, want) {
            return Convert::Trivial;
        }
        let (s, d) = (src.type_id, want.type_id);
        if (s == TYPE_INT && d == TYPE_FLOAT) || (s == TYPE_FLOAT && d == TYPE_INT) {
            return Convert::NonTrivial;
        }
        if s == TYPE_VAR && d == TYPE_STRING {
            return Convert::NonTrivial;
        }
        if self.registry.is_class(s) && self.find_convertor(s, d, false).is_some() {
            return Convert::NonTrivial;
        }
        if self.registry.is_class(d) && self.find_converting_ctor(d, s, false).is_some() {
            return Convert::NonTrivial;
        }
        Convert::No
    }

    /// The pure-types version of the implicit-conversion test.
    pub(crate) fn implicitly_convertible_info(&self, src: &TypeInfo, want: &TypeInfo) -> bool {
        let (s, d) = (src.type_id, want.type_id);
        if s == d {
            if s == quill_core::TYPE_ARRAY {
                let (se, de) = (src.elem_type, want.elem_type);
                return se == de || se == TYPE_VAR || de == TYPE_VAR || de == TYPE_NULL;
            }
            return true;
        }
        if s == TYPE_VAR || d == TYPE_VAR {
            return true;
        }
        if s == TYPE_NULL {
            return !self.registry.is_value(d);
        }
        self.registry.is_subclass(s, d)
    }

    // ----- probe rollback ----------------------------------------------------

    /// Enter probe mode: diagnostics are suppressed and all effects of
    /// the argument compilation will be rolled back by [`end_probe`].
    ///
    /// [`end_probe`]: Compiler::end_probe
    pub(crate) fn begin_probe(&mut self) -> ProbeSnapshot {
        self.probing += 1;
        ProbeSnapshot {
            locator: self.stream().save(),
            code_len: self.out_func_record().code.len(),
            literal_len: self.out_func_record().literals.len(),
            vars_len: self.vars.len(),
            regs: self.regs.clone(),
            stack: self.stack.clone(),
        }
    }

    /// Leave probe mode, erasing emitted code, literals, temporaries and
    /// location-model changes. The token cursor is restored to where the
    /// probe began.
    pub(crate) fn end_probe(&mut self, snapshot: ProbeSnapshot) {
        self.probing -= 1;
        self.stream().restore(snapshot.locator);
        let record = self.out_func_record_mut();
        record.code.truncate(snapshot.code_len);
        record.literals.truncate(snapshot.literal_len);
        self.vars.truncate(snapshot.vars_len);
        self.regs = snapshot.regs;
        self.stack = snapshot.stack;
    }
}
