//! The per-function literal pool and the anonymous-function resolver.
//!
//! Every function body carries a buffer of literal records. For value
//! literals the code generator emits `moveh 0, R` (or `copyh`) and the
//! linker patches the `0` with a handle into the VM constant table.
//!
//! Function literals parse lazily: at the use site only the source
//! locator, the optional argument-name list and the expected delegate
//! type are recorded. After the enclosing function's main body has been
//! compiled, the resolver walks the buffer, compiles each body into a
//! fresh anonymous function and writes the resolved identity back into
//! the record for the linker to patch.

use quill_core::TypeId;

use crate::errors::CompileError;
use crate::lexer::Locator;
use crate::state::Compiler;

/// What a literal record stands for.
#[derive(Debug, Clone)]
pub enum LiteralValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// A deferred function or method literal.
    Func {
        /// Token position of the body's `{` (or of the argument list).
        locator: Locator,
        /// Explicit argument names, when the literal spelled them.
        arg_names: Option<Vec<String>>,
        /// `method` literals bind `this` and become methods of the
        /// current class; `function` literals are global.
        is_method: bool,
        /// The delegate type the literal must satisfy; supplies the
        /// signature of the generated function.
        delegate_type: TypeId,
        /// Owner/index of the compiled anonymous function, written back
        /// by the resolver.
        resolved: Option<(TypeId, usize)>,
    },
}

/// One entry in a function's literal buffer.
#[derive(Debug, Clone)]
pub struct LiteralRecord {
    pub value: LiteralValue,
    /// Offset of the operand word to patch (the `0` of `moveh 0, R`,
    /// or the method-index operand of `newdgm`).
    pub code_offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Compiler {
    /// Append a literal record to the function currently receiving code.
    pub(crate) fn add_literal(&mut self, record: LiteralRecord) -> usize {
        let func = self.out_func_record_mut();
        func.literals.push(record);
        func.literals.len() - 1
    }

    /// Compile every pending function literal of the given function.
    ///
    /// Called after the main body is complete so that literal bodies
    /// never interleave with their enclosing function's code. Nested
    /// function literals resolve recursively when the anonymous body
    /// itself finishes.
    pub(crate) fn resolve_function_literals(
        &mut self,
        class: TypeId,
        func: usize,
    ) -> Result<(), CompileError> {
        let count = self.registry.class(class).funcs[func].literals.len();
        for i in 0..count {
            let pending = {
                let record = &self.registry.class(class).funcs[func].literals[i];
                match &record.value {
                    LiteralValue::Func {
                        locator,
                        arg_names,
                        is_method,
                        delegate_type,
                        resolved: None,
                    } => Some((*locator, arg_names.clone(), *is_method, *delegate_type)),
                    _ => None,
                }
            };
            let Some((locator, arg_names, is_method, delegate_type)) = pending else {
                continue;
            };

            let saved = self.stream().save();
            self.stream().restore(locator);
            let identity =
                self.compile_anonymous_function(delegate_type, arg_names.as_deref(), is_method);
            self.stream().restore(saved);
            let identity = identity?;

            if let LiteralValue::Func { resolved, .. } =
                &mut self.registry.class_mut(class).funcs[func].literals[i].value
            {
                *resolved = Some(identity);
            }
        }
        Ok(())
    }
}
