//! The compiler-side type registry.
//!
//! Every type, including the primitives, has a [`ClassRecord`] whose
//! index in the registry equals its runtime `TypeId` (type creation is a
//! two-step handshake with the VM; see `state.rs`). Class records own
//! their member variables and functions in declaration order: member
//! indices are object slots, function indices are method slots.
//!
//! Delegate and cofunction types are content-addressed: their canonical
//! name is a structural signature over result and argument types, so
//! re-declaring the same signature yields the same `TypeId`.

use quill_core::{TYPE_FLOAT, TYPE_INT, TYPE_NULL, TYPE_STRING, TYPE_ARRAY, TypeFamily, TypeId};

use crate::frame::Var;
use crate::literals::LiteralRecord;

/// Function life-cycle: declared, then defined, then linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncState {
    Declared,
    Defined,
    Linked,
}

/// Class life-cycle: forwarded, then body-open, then body-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    Forwarded,
    BodyOpen,
    BodyClosed,
}

/// Cached method indices looked up often enough to precompute.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodInfo {
    pub default_ctor: Option<usize>,
    pub copy_ctor: Option<usize>,
    pub to_string: Option<usize>,
}

/// Result and argument descriptors of a delegate or cofunction type.
#[derive(Debug, Clone, Default)]
pub struct FuncSig {
    pub result: Option<Var>,
    pub args: Vec<Var>,
}

/// One function or method.
#[derive(Debug, Clone)]
pub struct FuncRecord {
    pub owner: TypeId,
    /// Index within the owner's function list; the method slot for
    /// class/interface families.
    pub index: usize,
    pub name: String,
    pub result: Option<Var>,
    pub args: Vec<Var>,

    pub is_method: bool,
    pub is_accessor: bool,
    pub is_ctor: bool,
    pub is_convertor: bool,
    pub is_cofunction: bool,
    pub is_explicit: bool,
    /// Disallows implicit conversions at call sites.
    pub is_strict: bool,
    pub is_anonymous: bool,

    pub code: Vec<quill_core::Word>,
    pub literals: Vec<LiteralRecord>,
    /// Registers the body used beyond the reserved ones.
    pub regs_used: usize,
    pub handle: Option<usize>,
    pub state: FuncState,
    /// Body emitted a return on every path so far.
    pub returned: bool,
    pub yielded: bool,
    /// Hybrid methods: the delegate member slot dispatch goes through.
    pub hybrid_member: Option<usize>,
    /// Optimization level captured when the body was compiled.
    pub opt_level: u8,
    pub doc: String,
}

impl FuncRecord {
    pub fn new(owner: TypeId, index: usize, name: impl Into<String>) -> Self {
        FuncRecord {
            owner,
            index,
            name: name.into(),
            result: None,
            args: Vec::new(),
            is_method: false,
            is_accessor: false,
            is_ctor: false,
            is_convertor: false,
            is_cofunction: false,
            is_explicit: false,
            is_strict: false,
            is_anonymous: false,
            code: Vec::new(),
            literals: Vec::new(),
            regs_used: 0,
            handle: None,
            state: FuncState::Declared,
            returned: false,
            yielded: false,
            hybrid_member: None,
            opt_level: 0,
            doc: String::new(),
        }
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Exact prototype equality: same argument types/modifiers and the
    /// same result type. Used to match a pass-2 definition against its
    /// pass-1 declaration.
    pub fn prototype_matches(&self, result: &Option<Var>, args: &[Var]) -> bool {
        if self.args.len() != args.len() {
            return false;
        }
        let result_matches = match (&self.result, result) {
            (None, None) => true,
            (Some(a), Some(b)) => a.type_id == b.type_id && a.elem_type == b.elem_type,
            _ => false,
        };
        result_matches
            && self
                .args
                .iter()
                .zip(args)
                .all(|(a, b)| {
                    a.type_id == b.type_id
                        && a.is_const == b.is_const
                        && a.is_ref == b.is_ref
                        && a.is_weak == b.is_weak
                        && a.elem_type == b.elem_type
                })
    }
}

/// One type record.
#[derive(Debug, Clone)]
pub struct ClassRecord {
    pub type_id: TypeId,
    pub name: String,
    pub aliases: Vec<String>,
    pub family: TypeFamily,

    pub native: bool,
    pub strict: bool,
    pub native_binding: bool,
    pub native_interface: bool,
    pub is_extern: bool,

    /// Lexical owner; nested cofunction types point at their enclosing
    /// class. 0 for top-level types.
    pub parent: TypeId,
    /// Inherited interface.
    pub base: Option<TypeId>,
    /// Class whose members are woven in by `hybrid`.
    pub hybrid_base: Option<TypeId>,

    /// Member variables in declaration order; indices are object slots.
    pub members: Vec<Var>,
    pub funcs: Vec<FuncRecord>,
    pub method_info: MethodInfo,
    pub has_vtable: bool,
    pub state: ClassState,
    pub doc: String,

    /// Delegate/thread families: the call signature.
    pub signature: Option<FuncSig>,
    /// Hybrid classes: (delegate member slot, base-class method index)
    /// pairs wired by the `hybrid(...)` constructor call and used for
    /// v-table patching at link.
    pub hybrid_links: Vec<(usize, usize)>,
}

impl ClassRecord {
    pub fn new(type_id: TypeId, name: impl Into<String>, parent: TypeId, family: TypeFamily) -> Self {
        ClassRecord {
            type_id,
            name: name.into(),
            aliases: Vec::new(),
            family,
            native: false,
            strict: false,
            native_binding: false,
            native_interface: false,
            is_extern: false,
            parent,
            base: None,
            hybrid_base: None,
            members: Vec::new(),
            funcs: Vec::new(),
            method_info: MethodInfo::default(),
            has_vtable: false,
            state: ClassState::Forwarded,
            doc: String::new(),
            signature: None,
            hybrid_links: Vec::new(),
        }
    }

    pub fn body_defined(&self) -> bool {
        self.state == ClassState::BodyClosed
    }

    /// Member slot by name.
    pub fn find_member(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name == name)
    }

    /// All function indices with the given name.
    pub fn funcs_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.funcs
            .iter()
            .enumerate()
            .filter(move |(_, f)| f.name == name)
            .map(|(i, _)| i)
    }

    pub fn has_constructor(&self) -> bool {
        self.funcs.iter().any(|f| f.is_ctor)
    }

    /// Recompute the cached ctor/convertor indices.
    pub fn refresh_method_info(&mut self) {
        let mut info = MethodInfo::default();
        for (i, f) in self.funcs.iter().enumerate() {
            if f.is_ctor && f.args.is_empty() && info.default_ctor.is_none() {
                info.default_ctor = Some(i);
            }
            if f.is_ctor
                && f.args.len() == 1
                && f.args[0].type_id == self.type_id
                && info.copy_ctor.is_none()
            {
                info.copy_ctor = Some(i);
            }
            if f.is_convertor
                && f.result.as_ref().is_some_and(|r| r.type_id == TYPE_STRING)
                && info.to_string.is_none()
            {
                info.to_string = Some(i);
            }
        }
        self.method_info = info;
    }
}

/// The class table. Index == TypeId is the central invariant, enforced
/// at creation time in `state.rs`.
#[derive(Debug, Default)]
pub struct Registry {
    pub classes: Vec<ClassRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class(&self, t: TypeId) -> &ClassRecord {
        &self.classes[t]
    }

    pub fn class_mut(&mut self, t: TypeId) -> &mut ClassRecord {
        &mut self.classes[t]
    }

    pub fn get(&self, t: TypeId) -> Option<&ClassRecord> {
        self.classes.get(t)
    }

    /// Match canonical name or any alias.
    pub fn find_by_name(&self, name: &str) -> Option<TypeId> {
        self.classes
            .iter()
            .position(|c| c.name == name || c.aliases.iter().any(|a| a == name))
    }

    /// True when any type makes `name` visible (canonical or alias).
    pub fn name_taken(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    pub fn family(&self, t: TypeId) -> TypeFamily {
        self.get(t).map(|c| c.family).unwrap_or(TypeFamily::Undefined)
    }

    /// `a` is `b`, or `a`'s base chain reaches `b`.
    pub fn is_subclass(&self, a: TypeId, b: TypeId) -> bool {
        let mut cur = a;
        loop {
            if cur == b {
                return true;
            }
            match self.get(cur).and_then(|c| c.base) {
                Some(base) => cur = base,
                None => return false,
            }
        }
    }

    pub fn is_interface(&self, t: TypeId) -> bool {
        self.family(t) == TypeFamily::Interface
    }

    pub fn is_class(&self, t: TypeId) -> bool {
        self.family(t) == TypeFamily::Class
    }

    /// Plain machine value: int or float.
    pub fn is_value(&self, t: TypeId) -> bool {
        t == TYPE_INT || t == TYPE_FLOAT
    }

    /// Can a value of this type be duplicated with `copy`?
    pub fn is_copyable(&self, t: TypeId) -> bool {
        if self.is_value(t) || t == TYPE_STRING || t == TYPE_ARRAY || t == quill_core::TYPE_VAR {
            return true;
        }
        match self.family(t) {
            TypeFamily::Class => {
                self.class(t).method_info.copy_ctor.is_some() || self.class(t).native
            }
            TypeFamily::Delegate | TypeFamily::Thread => true,
            _ => false,
        }
    }

    /// Register an extra name for a type. Fails on collision with any
    /// visible identifier.
    pub fn add_alias(&mut self, name: &str, t: TypeId) -> Result<(), String> {
        if self.name_taken(name) {
            return Err(format!("identifier '{}' is already defined", name));
        }
        self.classes[t].aliases.push(name.to_string());
        Ok(())
    }

    /// Canonical content-addressed name for a delegate or cofunction
    /// signature, e.g. `delegate int(int, string const ref)`.
    pub fn signature_name(&self, family: TypeFamily, sig: &FuncSig) -> String {
        let mut out = String::new();
        out.push_str(match family {
            TypeFamily::Thread => "cofunction ",
            _ => "delegate ",
        });
        match &sig.result {
            Some(r) => out.push_str(&self.type_label(r)),
            None => out.push_str("void"),
        }
        out.push('(');
        for (i, arg) in sig.args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.type_label(arg));
        }
        out.push(')');
        out
    }

    fn type_label(&self, var: &Var) -> String {
        let mut label = if var.type_id == TYPE_ARRAY && var.elem_type != TYPE_NULL {
            format!("{}[]", self.type_name(var.elem_type))
        } else {
            self.type_name(var.type_id).to_string()
        };
        if var.is_const {
            label.push_str(" const");
        }
        if var.is_weak {
            label.push_str(" weak");
        } else if var.is_ref {
            label.push_str(" ref");
        }
        label
    }

    pub fn type_name(&self, t: TypeId) -> &str {
        self.get(t).map(|c| c.name.as_str()).unwrap_or("<bad-type>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::TYPE_GLOBAL;

    fn registry_with_basics() -> Registry {
        let mut reg = Registry::new();
        for (i, (name, family)) in [
            ("null", TypeFamily::Undefined),
            ("var", TypeFamily::Undefined),
            ("int", TypeFamily::Integral),
            ("float", TypeFamily::Integral),
            ("string", TypeFamily::Class),
            ("array", TypeFamily::Class),
            ("global", TypeFamily::Class),
            ("__delegate", TypeFamily::Delegate),
            ("exception", TypeFamily::Interface),
            ("__thread", TypeFamily::Thread),
        ]
        .into_iter()
        .enumerate()
        {
            reg.classes.push(ClassRecord::new(i, name, TYPE_GLOBAL, family));
        }
        reg
    }

    #[test]
    fn test_find_by_name_and_alias() {
        let mut reg = registry_with_basics();
        assert_eq!(reg.find_by_name("int"), Some(TYPE_INT));
        reg.add_alias("bool", TYPE_INT).unwrap();
        assert_eq!(reg.find_by_name("bool"), Some(TYPE_INT));
        // Collision with a canonical name or an alias fails.
        assert!(reg.add_alias("float", TYPE_INT).is_err());
        assert!(reg.add_alias("bool", TYPE_FLOAT).is_err());
    }

    #[test]
    fn test_subclass_walks_base_chain() {
        let mut reg = registry_with_basics();
        let iface = reg.classes.len();
        reg.classes
            .push(ClassRecord::new(iface, "I", TYPE_GLOBAL, TypeFamily::Interface));
        let class = reg.classes.len();
        let mut rec = ClassRecord::new(class, "C", TYPE_GLOBAL, TypeFamily::Class);
        rec.base = Some(iface);
        reg.classes.push(rec);
        assert!(reg.is_subclass(class, iface));
        assert!(reg.is_subclass(class, class));
        assert!(!reg.is_subclass(iface, class));
    }

    #[test]
    fn test_signature_name_is_structural() {
        let reg = registry_with_basics();
        let mut sig = FuncSig::default();
        sig.result = Some(Var::result(TYPE_INT));
        let mut arg = Var::new("x", TYPE_STRING);
        arg.is_const = true;
        arg.is_ref = true;
        sig.args.push(arg);
        assert_eq!(
            reg.signature_name(TypeFamily::Delegate, &sig),
            "delegate int(string const ref)"
        );
        assert_eq!(
            reg.signature_name(TypeFamily::Thread, &sig),
            "cofunction int(string const ref)"
        );
    }

    #[test]
    fn test_prototype_matching_is_exact() {
        let mut a = FuncRecord::new(TYPE_GLOBAL, 0, "f");
        a.result = Some(Var::result(TYPE_INT));
        a.args.push(Var::new("x", TYPE_INT));
        assert!(a.prototype_matches(&Some(Var::result(TYPE_INT)), &[Var::new("y", TYPE_INT)]));
        assert!(!a.prototype_matches(&Some(Var::result(TYPE_FLOAT)), &[Var::new("y", TYPE_INT)]));
        assert!(!a.prototype_matches(&Some(Var::result(TYPE_INT)), &[]));
        let mut ref_arg = Var::new("y", TYPE_INT);
        ref_arg.is_ref = true;
        assert!(!a.prototype_matches(&Some(Var::result(TYPE_INT)), &[ref_arg]));
    }

    #[test]
    fn test_method_info_cache() {
        let mut rec = ClassRecord::new(10, "Box", TYPE_GLOBAL, TypeFamily::Class);
        let mut ctor = FuncRecord::new(10, 0, "Box");
        ctor.is_ctor = true;
        rec.funcs.push(ctor);
        let mut copy = FuncRecord::new(10, 1, "Box");
        copy.is_ctor = true;
        copy.args.push(Var::new("other", 10));
        rec.funcs.push(copy);
        rec.refresh_method_info();
        assert_eq!(rec.method_info.default_ctor, Some(0));
        assert_eq!(rec.method_info.copy_ctor, Some(1));
        assert_eq!(rec.method_info.to_string, None);
    }
}
