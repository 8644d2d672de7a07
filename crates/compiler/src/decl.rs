//! Declaration parsing.
//!
//! Drives both compilation passes over the top-level declarations of a
//! unit: classes, interfaces, named delegates, cofunctions, functions,
//! aliases, `using`, `import` and global variables. In pass 1 only
//! signatures and layouts are recorded and function bodies are skipped
//! brace-balanced; in pass 2 bodies are matched against their pass-1
//! prototypes and compiled.

use quill_core::{
    REG_GLOBALS, REG_THIS, TYPE_ARRAY, TYPE_GLOBAL, TYPE_NULL, TypeFamily, TypeId, Opcode, Word,
};

use crate::errors::{CompileError, ErrorKind};
use crate::frame::{Slot, TypeInfo, Usage, Var};
use crate::lexer::{Kw, Sym, TokenKind};
use crate::registry::{ClassState, FuncRecord, FuncSig, FuncState};
use crate::state::{Compiler, Pass};

/// A parsed type specifier: `[const] [weak] T[\[\]] [&]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TypeSpec {
    pub(crate) type_id: TypeId,
    pub(crate) elem_type: TypeId,
    pub(crate) is_const: bool,
    pub(crate) is_ref: bool,
    pub(crate) is_weak: bool,
}

/// Declaration modifiers accepted before classes and functions.
#[derive(Debug, Clone, Copy, Default)]
struct Modifiers {
    strict: bool,
    native: bool,
    is_extern: bool,
    explicit: bool,
}

impl Compiler {
    // ----- type specifiers --------------------------------------------------

    /// Parse a type specifier if the cursor stands on one; otherwise
    /// leave the cursor untouched and return None.
    pub(crate) fn try_parse_type_spec(&mut self) -> Result<Option<TypeSpec>, CompileError> {
        let save = self.stream().save();
        let is_const = self.stream().eat_kw(Kw::Const);
        let is_weak = self.stream().eat_kw(Kw::Weak);

        let name = match self.stream().peek().kind.clone() {
            TokenKind::Ident(name) => name,
            _ => {
                self.stream().restore(save);
                return Ok(None);
            }
        };
        let Some(mut type_id) = self.find_type(&name) else {
            self.stream().restore(save);
            return Ok(None);
        };
        self.stream().advance();

        let mut elem_type = TYPE_NULL;
        if self.stream().is_sym(Sym::LBracket)
            && self.stream().peek2().kind == TokenKind::Sym(Sym::RBracket)
        {
            self.stream().advance();
            self.stream().advance();
            if type_id == TYPE_ARRAY {
                return Err(self.error(
                    ErrorKind::ArrayOfArray,
                    "arrays of arrays are not supported",
                ));
            }
            elem_type = type_id;
            type_id = TYPE_ARRAY;
        }

        let is_ref = self.stream().eat_sym(Sym::Amp);
        if is_weak && !is_ref {
            return Err(self.error(
                ErrorKind::WeakWithoutRef,
                "'weak' requires a reference declaration",
            ));
        }

        Ok(Some(TypeSpec {
            type_id,
            elem_type,
            is_const,
            is_ref,
            is_weak,
        }))
    }

    fn var_from_spec(&self, spec: TypeSpec, name: &str) -> Var {
        let mut var = Var::new(name, spec.type_id);
        var.elem_type = spec.elem_type;
        var.is_const = spec.is_const;
        var.is_ref = spec.is_ref;
        var.is_weak = spec.is_weak;
        var
    }

    // ----- top-level dispatch -----------------------------------------------

    /// One top-level declaration. Used by the driver for both passes.
    pub(crate) fn parse_declaration(&mut self) -> Result<(), CompileError> {
        // Collect leading doc tags.
        let mut doc = String::new();
        while let TokenKind::DocTag(text) = self.stream().peek().kind.clone() {
            self.stream().advance();
            if !doc.is_empty() {
                doc.push(' ');
            }
            doc.push_str(&text);
        }

        let mut mods = Modifiers::default();
        loop {
            if self.stream().eat_kw(Kw::Strict) {
                mods.strict = true;
            } else if self.stream().eat_kw(Kw::Native) {
                mods.native = true;
            } else if self.stream().eat_kw(Kw::Extern) {
                mods.is_extern = true;
            } else if self.stream().eat_kw(Kw::Explicit) {
                mods.explicit = true;
            } else {
                break;
            }
        }

        match self.stream().peek().kind.clone() {
            TokenKind::Kw(Kw::Class) => self.p_class(mods, doc),
            TokenKind::Kw(Kw::Interface) => self.p_interface(mods, doc),
            TokenKind::Kw(Kw::Delegate) => self.p_delegate_decl(doc),
            TokenKind::Kw(Kw::Cofunction) => self.p_function_decl(TYPE_GLOBAL, mods, doc, true),
            TokenKind::Kw(Kw::Function) | TokenKind::Kw(Kw::Method) => {
                self.p_function_decl(TYPE_GLOBAL, mods, doc, false)
            }
            TokenKind::Kw(Kw::Accessor) => self.p_function_decl(TYPE_GLOBAL, mods, doc, false),
            TokenKind::Kw(Kw::Alias) => self.p_alias(),
            TokenKind::Kw(Kw::Using) => self.p_using(),
            TokenKind::Kw(Kw::Import) => self.p_import_statement(),
            _ => {
                if let Some(spec) = self.try_parse_type_spec()? {
                    return self.p_global_var_decl(spec);
                }
                Err(self.error(
                    ErrorKind::UnexpectedToken,
                    "expected a declaration at file scope",
                ))
            }
        }
    }

    // ----- classes and interfaces -------------------------------------------

    fn p_class(&mut self, mods: Modifiers, doc: String) -> Result<(), CompileError> {
        self.stream().advance();
        let name = self.expect_ident("class name")?;

        // Forward declaration.
        if self.stream().eat_sym(Sym::Semicolon) {
            if self.pass == Pass::Precompile && self.find_type(&name).is_none() {
                self.create_type(&name, TYPE_GLOBAL, TypeFamily::Class, mods.native)?;
            }
            return Ok(());
        }

        let type_id = match self.find_type(&name) {
            Some(t) => {
                if self.pass == Pass::Precompile {
                    let class = self.registry.class(t);
                    if class.body_defined() {
                        return Err(self.error(
                            ErrorKind::IdentifierAlreadyDefined,
                            format!("class '{}' is already defined", name),
                        ));
                    }
                    if class.family != TypeFamily::Class
                        && class.family != TypeFamily::Undefined
                    {
                        return Err(self.error(
                            ErrorKind::FamilyMismatch,
                            format!("'{}' is already a {}", name, class.family),
                        ));
                    }
                }
                t
            }
            None => self.create_type(&name, TYPE_GLOBAL, TypeFamily::Class, mods.native)?,
        };

        if self.pass == Pass::Precompile {
            let class = self.registry.class_mut(type_id);
            class.family = TypeFamily::Class;
            class.strict = mods.strict;
            class.native = mods.native;
            class.is_extern = mods.is_extern;
            class.doc = doc;
            class.state = ClassState::BodyOpen;
        }

        // Optional interface inheritance.
        let mut base = None;
        if self.stream().eat_sym(Sym::Colon) {
            let base_name = self.expect_ident("interface name after ':'")?;
            let base_id = self.find_type(&base_name).ok_or_else(|| {
                CompileError::new(
                    ErrorKind::UndefinedIdentifier,
                    format!("undefined interface '{}'", base_name),
                )
            })?;
            if !self.registry.is_interface(base_id) {
                return Err(self.error(
                    ErrorKind::FamilyMismatch,
                    format!("'{}' is not an interface", base_name),
                ));
            }
            base = Some(base_id);
        }

        // Optional hybrid aggregation.
        let mut hybrid = None;
        if self.stream().eat_kw(Kw::Hybrid) {
            let hybrid_name = self.expect_ident("class name after 'hybrid'")?;
            let hybrid_id = self.find_type(&hybrid_name).ok_or_else(|| {
                CompileError::new(
                    ErrorKind::UndefinedIdentifier,
                    format!("undefined class '{}'", hybrid_name),
                )
            })?;
            hybrid = Some(hybrid_id);
        }

        if self.pass == Pass::Precompile {
            let class = self.registry.class_mut(type_id);
            class.base = base;
            class.hybrid_base = hybrid;
            class.has_vtable = base.is_some();
        }

        let prev_class = self.cur_class;
        self.cur_class = type_id;

        if self.pass == Pass::Precompile {
            if let Some(hybrid_id) = hybrid {
                self.p_hybrid_weave(type_id, hybrid_id)?;
            }
        }

        self.expect_sym(Sym::LBrace, "'{' after class header")?;
        while !self.stream().is_sym(Sym::RBrace) {
            if self.stream().at_end() {
                self.cur_class = prev_class;
                return Err(self.error(
                    ErrorKind::UnexpectedEndOfFile,
                    format!("unterminated class '{}'", name),
                ));
            }
            self.p_class_member(type_id)?;
        }
        self.expect_sym(Sym::RBrace, "'}'")?;
        self.cur_class = prev_class;

        if self.pass == Pass::Precompile {
            self.registry.class_mut(type_id).refresh_method_info();
            self.registry.class_mut(type_id).state = ClassState::BodyClosed;
            let class = self.registry.class(type_id);
            if !class.native
                && class.funcs.iter().any(|f| f.is_method)
                && !class.has_constructor()
            {
                return Err(self.error(
                    ErrorKind::ClassWithoutConstructor,
                    format!("class '{}' declares methods but no constructor", name),
                ));
            }
        }
        Ok(())
    }

    fn p_interface(&mut self, mods: Modifiers, doc: String) -> Result<(), CompileError> {
        self.stream().advance();
        let name = self.expect_ident("interface name")?;
        let type_id = match self.find_type(&name) {
            Some(t) => t,
            None => self.create_type(&name, TYPE_GLOBAL, TypeFamily::Interface, mods.native)?,
        };
        if self.pass == Pass::Precompile {
            let class = self.registry.class_mut(type_id);
            class.family = TypeFamily::Interface;
            class.strict = mods.strict;
            class.native_interface = mods.native;
            class.doc = doc;
            class.has_vtable = true;
            class.state = ClassState::BodyOpen;
        }

        let prev_class = self.cur_class;
        self.cur_class = type_id;
        self.expect_sym(Sym::LBrace, "'{' after interface header")?;
        while !self.stream().is_sym(Sym::RBrace) {
            if self.stream().at_end() {
                self.cur_class = prev_class;
                return Err(self.error(
                    ErrorKind::UnexpectedEndOfFile,
                    format!("unterminated interface '{}'", name),
                ));
            }
            self.p_class_member(type_id)?;
        }
        self.expect_sym(Sym::RBrace, "'}'")?;
        self.cur_class = prev_class;
        if self.pass == Pass::Precompile {
            self.registry.class_mut(type_id).state = ClassState::BodyClosed;
        }
        Ok(())
    }

    /// One member declaration inside a class or interface body.
    fn p_class_member(&mut self, class: TypeId) -> Result<(), CompileError> {
        let mut doc = String::new();
        while let TokenKind::DocTag(text) = self.stream().peek().kind.clone() {
            self.stream().advance();
            if !doc.is_empty() {
                doc.push(' ');
            }
            doc.push_str(&text);
        }

        let mut mods = Modifiers::default();
        loop {
            if self.stream().eat_kw(Kw::Strict) {
                mods.strict = true;
            } else if self.stream().eat_kw(Kw::Explicit) {
                mods.explicit = true;
            } else if self.stream().eat_kw(Kw::Native) {
                mods.native = true;
            } else {
                break;
            }
        }

        match self.stream().peek().kind.clone() {
            TokenKind::Kw(Kw::Method)
            | TokenKind::Kw(Kw::Function)
            | TokenKind::Kw(Kw::Accessor)
            | TokenKind::Kw(Kw::Cofunction) => {
                let cofunction = self.stream().is_kw(Kw::Cofunction);
                self.p_function_decl(class, mods, doc, cofunction)
            }
            _ => self.p_member_var_decl(class),
        }
    }

    /// A member variable: `T name;` or `const T name = <expr>;` (the
    /// latter lives in the global object under a mangled key).
    fn p_member_var_decl(&mut self, class: TypeId) -> Result<(), CompileError> {
        let spec = self.try_parse_type_spec()?.ok_or_else(|| {
            CompileError::new(
                ErrorKind::UnexpectedToken,
                "expected a member declaration",
            )
        })?;
        let name = self.expect_ident("member name")?;

        if spec.is_const && self.stream().is_sym(Sym::Assign) {
            // Class-qualified constant in the global object.
            let class_name = self.registry.type_name(class).to_string();
            let mangled = format!("{}::{}", class_name, name);
            if self.pass == Pass::Precompile {
                if self.registry.class(TYPE_GLOBAL).find_member(&mangled).is_some() {
                    return Err(self.error(
                        ErrorKind::IdentifierAlreadyDefined,
                        format!("constant '{}' is already defined", mangled),
                    ));
                }
                let var = self.var_from_spec(spec, &mangled);
                self.registry.class_mut(TYPE_GLOBAL).members.push(var);
                // Skip the initializer in pass 1.
                while !self.stream().is_sym(Sym::Semicolon) && !self.stream().at_end() {
                    self.stream().advance();
                }
            } else {
                self.stream().advance(); // =
                self.compile_global_initializer(&mangled)?;
            }
            return self.expect_sym(Sym::Semicolon, "';' after constant");
        }

        if self.pass == Pass::Precompile {
            if self.registry.class(class).find_member(&name).is_some() {
                return Err(self.error(
                    ErrorKind::IdentifierAlreadyDefined,
                    format!("member '{}' is already defined", name),
                ));
            }
            let var = self.var_from_spec(spec, &name);
            self.registry.class_mut(class).members.push(var);
        }
        self.expect_sym(Sym::Semicolon, "';' after member declaration")
    }

    // ----- functions --------------------------------------------------------

    /// A function, method, accessor, constructor, convertor or
    /// cofunction declaration, at file scope or inside a class.
    fn p_function_decl(
        &mut self,
        owner: TypeId,
        mods: Modifiers,
        doc: String,
        cofunction: bool,
    ) -> Result<(), CompileError> {
        let is_accessor = self.stream().is_kw(Kw::Accessor);
        let is_method_kw = self.stream().is_kw(Kw::Method);
        self.stream().advance(); // function/method/accessor/cofunction

        // Optional result type followed by the name; a constructor is a
        // method named like its class with no result type.
        let save = self.stream().save();
        let mut result_spec = self.try_parse_type_spec()?;
        let name = match self.stream().peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.stream().advance();
                name
            }
            _ => {
                // The "result type" token was actually the name.
                self.stream().restore(save);
                result_spec = None;
                self.expect_ident("function name")?
            }
        };
        if !self.stream().is_sym(Sym::LParen) {
            return Err(self.error(ErrorKind::UnexpectedToken, "expected '(' after function name"));
        }

        let owner_name = self.registry.type_name(owner).to_string();
        let is_ctor = is_method_kw && result_spec.is_none() && name == owner_name;
        let is_convertor = is_method_kw && name == "convertor";

        // Arguments.
        self.expect_sym(Sym::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.stream().is_sym(Sym::RParen) {
            loop {
                let spec = self.try_parse_type_spec()?.ok_or_else(|| {
                    CompileError::new(ErrorKind::UnexpectedToken, "expected argument type")
                })?;
                let arg_name = match self.stream().peek().kind.clone() {
                    TokenKind::Ident(n) => {
                        self.stream().advance();
                        n
                    }
                    _ => format!("arg{}", args.len()),
                };
                args.push(self.var_from_spec(spec, &arg_name));
                if !self.stream().eat_sym(Sym::Comma) {
                    break;
                }
            }
        }
        self.expect_sym(Sym::RParen, "')' after arguments")?;

        let result = result_spec.map(|spec| {
            let mut var = self.var_from_spec(spec, "");
            var.usage = Usage::Result;
            var
        });

        if is_accessor && self.pass == Pass::Precompile {
            // Two getters for one property with different result types
            // are forbidden.
            let clash = self.registry.class(owner).funcs.iter().any(|f| {
                f.is_accessor
                    && f.name == name
                    && f.args.is_empty()
                    && args.is_empty()
                    && match (&f.result, &result) {
                        (Some(a), Some(b)) => a.type_id != b.type_id,
                        _ => false,
                    }
            });
            if clash {
                return Err(self.error(
                    ErrorKind::AmbiguousFunctionCall,
                    format!("accessor '{}' already has a getter with a different type", name),
                ));
            }
        }

        let has_body = self.stream().is_sym(Sym::LBrace);

        if self.pass == Pass::Precompile {
            let exists = self
                .registry
                .class(owner)
                .funcs
                .iter()
                .any(|f| f.name == name && f.prototype_matches(&result, &args));
            if !exists {
                let index = self.registry.class(owner).funcs.len();
                let handle = self.alloc_func_handle();
                let mut record = FuncRecord::new(owner, index, name.clone());
                record.handle = Some(handle);
                record.result = result;
                record.args = args;
                record.is_method = is_method_kw || is_ctor || is_convertor || is_accessor;
                record.is_accessor = is_accessor;
                record.is_ctor = is_ctor;
                record.is_convertor = is_convertor;
                record.is_cofunction = cofunction;
                record.is_strict = mods.strict;
                record.is_explicit = mods.explicit;
                record.doc = doc;
                self.registry.class_mut(owner).funcs.push(record);

                // A cofunction also fixes its context type now, so the
                // signature is content-addressed exactly once.
                if cofunction {
                    let sig = {
                        let rec = &self.registry.class(owner).funcs[index];
                        FuncSig {
                            result: rec.result.clone(),
                            args: rec.args.clone(),
                        }
                    };
                    self.get_or_create_signature_type(TypeFamily::Thread, sig)?;
                }
            }
            if has_body {
                if self.stream().skip_braced_block().is_err() {
                    return Err(self.error(
                        ErrorKind::MismatchedBrace,
                        format!("unterminated body of '{}'", name),
                    ));
                }
                return Ok(());
            }
            return self.expect_sym(Sym::Semicolon, "';' after declaration");
        }

        // Pass 2: find the prototype and compile the body.
        if !has_body {
            return self.expect_sym(Sym::Semicolon, "';' after declaration");
        }
        let index = self
            .registry
            .class(owner)
            .funcs
            .iter()
            .position(|f| f.name == name && f.prototype_matches(&result, &args))
            .ok_or_else(|| {
                CompileError::new(
                    ErrorKind::PrototypeMismatch,
                    format!("definition of '{}' matches no declared prototype", name),
                )
            })?;
        if self.registry.class(owner).funcs[index].state != FuncState::Declared {
            return Err(self.error(
                ErrorKind::FunctionAlreadyDefined,
                format!("'{}' is already defined", name),
            ));
        }
        self.compile_function_body(owner, index)
    }

    /// Compile a function body from the cursor (standing on `{`).
    pub(crate) fn compile_function_body(
        &mut self,
        class: TypeId,
        func: usize,
    ) -> Result<(), CompileError> {
        let prev = (self.cur_class, self.cur_func, self.out_class, self.out_func);
        self.begin_function_body(class, func)?;

        let record = self.registry.class(class).funcs[func].clone();

        // Member-init tracking: constructors start with every member
        // uninitialized; other bodies see them initialized.
        let members_inited = !record.is_ctor;
        for member in &mut self.registry.classes[self.cur_class].members {
            member.inited = members_inited;
        }

        let terminated = self.parse_block()?;

        if !terminated {
            if record.has_result() && !record.is_cofunction {
                return Err(self.error(
                    ErrorKind::ReturnMissingValue,
                    format!("'{}' must return a value on all paths", record.name),
                ));
            }
            if record.is_ctor {
                self.check_members_initialized()?;
            }
            self.cg_unroll_to(record.args.len())?;
            self.emit(Opcode::Ret, &[]);
        }

        self.end_function_body();
        {
            let rec = &mut self.registry.classes[class].funcs[func];
            rec.state = FuncState::Defined;
            rec.returned = rec.returned || terminated;
        }

        // Leave members initialized for subsequent bodies.
        for member in &mut self.registry.classes[class].members {
            member.inited = true;
        }

        self.resolve_function_literals(class, func)?;

        (self.cur_class, self.cur_func, self.out_class, self.out_func) = prev;
        Ok(())
    }

    /// Build the anonymous function for a deferred literal and compile
    /// its body from the current cursor position.
    pub(crate) fn compile_anonymous_function(
        &mut self,
        delegate_type: TypeId,
        arg_names: Option<&[String]>,
        is_method: bool,
    ) -> Result<(TypeId, usize), CompileError> {
        let sig = self
            .registry
            .class(delegate_type)
            .signature
            .clone()
            .unwrap_or_default();

        if let Some(names) = arg_names {
            if names.len() != sig.args.len() {
                return Err(self.error(
                    ErrorKind::NoSuitableDelegate,
                    format!(
                        "function literal names {} arguments, delegate has {}",
                        names.len(),
                        sig.args.len()
                    ),
                ));
            }
        }

        let owner = if is_method { self.cur_class } else { TYPE_GLOBAL };
        let index = self.registry.class(owner).funcs.len();
        let handle = self.alloc_func_handle();
        let mut record = FuncRecord::new(owner, index, format!("__anon_{}", handle));
        record.handle = Some(handle);
        record.is_anonymous = true;
        record.is_method = is_method;
        record.result = sig.result.clone();
        record.args = sig
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                let mut arg = arg.clone();
                arg.name = match arg_names {
                    Some(names) => names[i].clone(),
                    None => format!("arg{}", i),
                };
                arg
            })
            .collect();
        self.registry.class_mut(owner).funcs.push(record);

        self.compile_function_body(owner, index)?;
        Ok((owner, index))
    }

    // ----- hybrid composition ------------------------------------------------

    /// Weave a hybrid base into a class: a hidden `base` member plus a
    /// delegate member per public method of the base class.
    fn p_hybrid_weave(&mut self, class: TypeId, hybrid_base: TypeId) -> Result<(), CompileError> {
        let mut base_member = Var::new("base", hybrid_base);
        base_member.hidden = true;
        self.registry.class_mut(class).members.push(base_member);

        let base_methods: Vec<(usize, FuncRecord)> = self
            .registry
            .class(hybrid_base)
            .funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_method && !f.is_ctor && !f.is_convertor && !f.is_anonymous)
            .map(|(i, f)| (i, f.clone()))
            .collect();

        let interface = self.registry.class(class).base;
        for (method_index, method) in base_methods {
            let sig = FuncSig {
                result: method.result.clone(),
                args: method.args.clone(),
            };
            let delegate_type = self.get_or_create_signature_type(TypeFamily::Delegate, sig)?;

            // A collision with an inherited interface method hides the
            // delegate member; dispatch goes through the v-table and the
            // linker patches the method slot.
            let collides = interface.is_some_and(|iface| {
                self.registry
                    .class(iface)
                    .funcs
                    .iter()
                    .any(|f| f.name == method.name && f.args.len() == method.args.len())
            });

            let mut member = Var::new(method.name.clone(), delegate_type);
            member.hidden = collides;
            let slot = self.registry.class(class).members.len();
            self.registry.class_mut(class).members.push(member);
            self.registry
                .class_mut(class)
                .hybrid_links
                .push((slot, method_index));

            // The interface-facing method record dispatches through the
            // delegate member.
            let index = self.registry.class(class).funcs.len();
            let handle = self.alloc_func_handle();
            let mut record = FuncRecord::new(class, index, method.name.clone());
            record.handle = Some(handle);
            record.is_method = true;
            record.result = method.result.clone();
            record.args = method.args.clone();
            record.hybrid_member = Some(slot);
            record.state = FuncState::Defined;
            self.registry.class_mut(class).funcs.push(record);
        }
        Ok(())
    }

    /// The `hybrid(expr);` constructor statement: store the aggregated
    /// object into the hidden `base` member and wire every delegate
    /// member to it.
    pub(crate) fn p_hybrid_init(&mut self) -> Result<(), CompileError> {
        self.stream().advance(); // hybrid
        let hybrid_base = match self.registry.class(self.cur_class).hybrid_base {
            Some(t) => t,
            None => {
                return Err(self.error(
                    ErrorKind::UndefinedIdentifier,
                    "'hybrid(...)' in a class without a hybrid base",
                ));
            }
        };
        self.expect_sym(Sym::LParen, "'(' after 'hybrid'")?;
        let (value, _) = self.parse_expression(None)?;
        self.expect_sym(Sym::RParen, "')'")?;
        self.expect_sym(Sym::Semicolon, "';'")?;

        let value = self.cg_auto_convert(value, TypeInfo::of(hybrid_base), false)?;
        let (base_reg_var, staged) = self.stage_in_register(value)?;
        let base_reg = self.reg_index(base_reg_var)?;

        let base_slot = self
            .registry
            .class(self.cur_class)
            .find_member("base")
            .ok_or_else(|| {
                CompileError::new(ErrorKind::FatalInternal, "hybrid base member missing")
            })?;
        self.emit(
            Opcode::MoveRM,
            &[base_reg as Word, REG_THIS as Word, base_slot as Word],
        );
        self.registry.classes[self.cur_class].members[base_slot].inited = true;

        let links = self.registry.class(self.cur_class).hybrid_links.clone();
        for (slot, method_index) in links {
            let delegate_type = self.registry.class(self.cur_class).members[slot].type_id;
            let dg =
                self.cg_new_delegate_method(delegate_type, hybrid_base, method_index, base_reg)?;
            let r = self.reg_index(dg)?;
            self.emit(Opcode::MoveRM, &[r as Word, REG_THIS as Word, slot as Word]);
            self.free_temp(dg);
            self.registry.classes[self.cur_class].members[slot].inited = true;
        }

        if staged {
            self.free_temp(base_reg_var);
        }
        self.free_temp(value);
        Ok(())
    }

    // ----- named delegates, aliases, using ----------------------------------

    /// `delegate [T] Name(args);`: a named delegate type. The canonical
    /// type is content-addressed; the name becomes an alias.
    fn p_delegate_decl(&mut self, _doc: String) -> Result<(), CompileError> {
        self.stream().advance();
        let save = self.stream().save();
        let mut result_spec = self.try_parse_type_spec()?;
        let name = match self.stream().peek().kind.clone() {
            TokenKind::Ident(n) => {
                self.stream().advance();
                n
            }
            _ => {
                self.stream().restore(save);
                result_spec = None;
                self.expect_ident("delegate name")?
            }
        };

        self.expect_sym(Sym::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.stream().is_sym(Sym::RParen) {
            loop {
                let spec = self.try_parse_type_spec()?.ok_or_else(|| {
                    CompileError::new(ErrorKind::UnexpectedToken, "expected argument type")
                })?;
                // Argument names are optional in delegate signatures.
                if let TokenKind::Ident(_) = self.stream().peek().kind {
                    self.stream().advance();
                }
                args.push(self.var_from_spec(spec, ""));
                if !self.stream().eat_sym(Sym::Comma) {
                    break;
                }
            }
        }
        self.expect_sym(Sym::RParen, "')'")?;
        self.expect_sym(Sym::Semicolon, "';' after delegate declaration")?;

        if self.pass == Pass::Precompile {
            let sig = FuncSig {
                result: result_spec.map(|spec| {
                    let mut v = self.var_from_spec(spec, "");
                    v.usage = Usage::Result;
                    v
                }),
                args,
            };
            let type_id = self.get_or_create_signature_type(TypeFamily::Delegate, sig)?;
            if self.registry.find_by_name(&name) != Some(type_id) {
                self.registry.add_alias(&name, type_id).map_err(|msg| {
                    self.error(ErrorKind::IdentifierAlreadyDefined, msg)
                })?;
            }
        }
        Ok(())
    }

    /// Content-addressed delegate/cofunction type lookup or creation.
    pub(crate) fn get_or_create_signature_type(
        &mut self,
        family: TypeFamily,
        sig: FuncSig,
    ) -> Result<TypeId, CompileError> {
        let name = self.registry.signature_name(family, &sig);
        if let Some(t) = self.registry.find_by_name(&name) {
            if self.registry.family(t) != family {
                return Err(self.error(
                    ErrorKind::FamilyMismatch,
                    format!("'{}' already exists with a different family", name),
                ));
            }
            return Ok(t);
        }
        let parent = if family == TypeFamily::Thread {
            self.cur_class
        } else {
            TYPE_GLOBAL
        };
        let t = self.create_type(&name, parent, family, false)?;
        self.registry.class_mut(t).signature = Some(sig);
        self.registry.class_mut(t).state = ClassState::BodyClosed;
        Ok(t)
    }

    /// `alias T name;`
    fn p_alias(&mut self) -> Result<(), CompileError> {
        self.stream().advance();
        let target = self.expect_ident("type name after 'alias'")?;
        let alias = self.expect_ident("alias name")?;
        self.expect_sym(Sym::Semicolon, "';' after alias")?;
        if self.pass == Pass::Precompile {
            let type_id = self.find_type(&target).ok_or_else(|| {
                CompileError::new(
                    ErrorKind::UndefinedIdentifier,
                    format!("undefined type '{}'", target),
                )
            })?;
            self.registry
                .add_alias(&alias, type_id)
                .map_err(|msg| self.error(ErrorKind::IdentifierAlreadyDefined, msg))?;
        }
        Ok(())
    }

    /// `using ClassName;`: add a class to the file's call-scope set.
    fn p_using(&mut self) -> Result<(), CompileError> {
        self.stream().advance();
        let name = self.expect_ident("class name after 'using'")?;
        self.expect_sym(Sym::Semicolon, "';' after 'using'")?;
        let type_id = self.find_type(&name).ok_or_else(|| {
            CompileError::new(
                ErrorKind::UndefinedIdentifier,
                format!("undefined class '{}'", name),
            )
        })?;
        let unit = self
            .units
            .last_mut()
            .ok_or_else(|| CompileError::new(ErrorKind::FatalInternal, "no unit"))?;
        if !unit.usings.contains(&type_id) {
            unit.usings.push(type_id);
        }
        Ok(())
    }

    // ----- globals -----------------------------------------------------------

    /// A global variable declaration; its initializer is appended to
    /// `__init` in pass 2, preserving declaration order.
    fn p_global_var_decl(&mut self, spec: TypeSpec) -> Result<(), CompileError> {
        loop {
            let name = self.expect_ident("variable name")?;
            if self.pass == Pass::Precompile {
                if self.registry.class(TYPE_GLOBAL).find_member(&name).is_some() {
                    return Err(self.error(
                        ErrorKind::IdentifierAlreadyDefined,
                        format!("global '{}' is already defined", name),
                    ));
                }
                let var = self.var_from_spec(spec, &name);
                self.registry.class_mut(TYPE_GLOBAL).members.push(var);
                // Skip any initializer in pass 1.
                let mut depth = 0usize;
                loop {
                    match &self.stream().peek().kind {
                        TokenKind::Eof => break,
                        TokenKind::Sym(Sym::LBrace) | TokenKind::Sym(Sym::LParen) => depth += 1,
                        TokenKind::Sym(Sym::RBrace) | TokenKind::Sym(Sym::RParen) => {
                            depth = depth.saturating_sub(1)
                        }
                        TokenKind::Sym(Sym::Comma) | TokenKind::Sym(Sym::Semicolon)
                            if depth == 0 =>
                        {
                            break;
                        }
                        _ => {}
                    }
                    self.stream().advance();
                }
            } else if self.stream().eat_sym(Sym::Assign) {
                self.compile_global_initializer(&name)?;
            }
            if !self.stream().eat_sym(Sym::Comma) {
                break;
            }
        }
        self.expect_sym(Sym::Semicolon, "';' after declaration")
    }

    /// Compile `= expr` for a global into the `__init` body.
    fn compile_global_initializer(&mut self, name: &str) -> Result<(), CompileError> {
        let slot = self
            .registry
            .class(TYPE_GLOBAL)
            .find_member(name)
            .ok_or_else(|| {
                CompileError::new(
                    ErrorKind::FatalInternal,
                    format!("global '{}' lost its slot", name),
                )
            })?;

        let prev = (self.cur_class, self.cur_func, self.out_class, self.out_func);
        self.out_class = TYPE_GLOBAL;
        self.out_func = self.init_func;
        self.cur_class = TYPE_GLOBAL;
        self.cur_func = self.init_func;
        // Top-level position: no function frame is live, so give the
        // initializer expression a clean one.
        self.vars.clear();
        self.locals.clear();
        self.regs.reset();
        self.stack.clear();

        let member_decl = self.registry.class(TYPE_GLOBAL).members[slot].clone();
        let mut target = member_decl;
        target.usage = Usage::Temp;
        target.slot = Slot::Member {
            object: REG_GLOBALS,
            member: slot,
        };
        // Allow the first assignment even for const globals.
        target.inited = false;
        let target = self.new_var(target);

        let (value, _) = self.parse_expression(Some(target))?;
        self.cg_move_var(value, target)?;
        self.free_temp(target);
        self.registry.classes[TYPE_GLOBAL].members[slot].inited = true;

        (self.cur_class, self.cur_func, self.out_class, self.out_func) = prev;
        Ok(())
    }
}
