//! End-to-end compile scenarios.
//!
//! The VM interpreter lives with the host, so run-results are checked
//! structurally: which overload a call site bound to, which opcodes a
//! body emits, and what the registry and image carry after linking.

use quill_core::{ImageVm, Opcode, ProgramImage, TYPE_GLOBAL, TypeFamily, Word, instructions};
use quillc::{Compiler, ErrorKind, compile_to_image, parse_type_info, registry_summaries};

fn compiler() -> Compiler {
    Compiler::new(Box::new(ImageVm::new()), "").expect("compiler construction")
}

fn code_of<'a>(image: &'a ProgramImage, name: &str) -> &'a [Word] {
    let handle = image
        .find_function(TYPE_GLOBAL, name)
        .unwrap_or_else(|| panic!("function '{}' not linked", name));
    image.code_of(handle).expect("code slice")
}

fn opcodes(code: &[Word]) -> Vec<Opcode> {
    instructions(code).map(|(_, op)| op).collect()
}

fn has_op(code: &[Word], op: Opcode) -> bool {
    opcodes(code).contains(&op)
}

#[test]
fn test_overload_resolution_picks_exact_match() {
    let mut compiler = compiler();
    compiler
        .compile(
            "overload",
            "function int f(int x){ return x; }\n\
             function float f(float x){ return x; }\n\
             function int test(){ return f(1) + (int)f(2.5); }",
        )
        .unwrap();
    let image = compiler.link().unwrap();

    let globals = compiler.registry().class(TYPE_GLOBAL);
    let f_int = globals
        .funcs
        .iter()
        .find(|f| f.name == "f" && f.args[0].type_id == quill_core::TYPE_INT)
        .and_then(|f| f.handle)
        .unwrap();
    let f_float = globals
        .funcs
        .iter()
        .find(|f| f.name == "f" && f.args[0].type_id == quill_core::TYPE_FLOAT)
        .and_then(|f| f.handle)
        .unwrap();

    let code = code_of(&image, "test");
    let calls: Vec<usize> = instructions(code)
        .filter(|&(_, op)| op == Opcode::Calls)
        .map(|(at, _)| code[at + 1] as usize)
        .collect();
    assert_eq!(calls, vec![f_int, f_float]);
    // The cast back to int emits the float conversion.
    assert!(has_op(code, Opcode::Cvl));
    assert!(has_op(code, Opcode::AddL));
}

#[test]
fn test_constructor_conversion() {
    let mut compiler = compiler();
    compiler
        .compile(
            "box",
            "class Box { int v; method Box(int x){ v = x; } }\n\
             function int test(){ Box b = 42; return b.v; }",
        )
        .unwrap();
    let image = compiler.link().unwrap();

    let box_id = compiler.registry().find_by_name("Box").unwrap();
    let code = code_of(&image, "test");
    // The int literal goes through alloc + constructor call.
    let allocs: Vec<usize> = instructions(code)
        .filter(|&(_, op)| op == Opcode::Alloc)
        .map(|(at, _)| code[at + 1] as usize)
        .collect();
    assert!(allocs.contains(&box_id));
    assert!(has_op(code, Opcode::Callm));
}

#[test]
fn test_uninitialized_member_at_ctor_return_is_an_error() {
    let mut compiler = compiler();
    let err = compiler
        .compile(
            "bad",
            "class P { int a; int b; method P(int x){ if (x) { a = x; b = x; } else { a = x; } } }",
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UninitializedMember);
}

#[test]
fn test_member_init_joins_across_branches() {
    // Both paths initialize both members, so the constructor is fine.
    compile_to_image(
        "class P { int a; int b; method P(int x){ if (x) { a = 1; b = 2; } else { a = 3; b = 4; } } }",
    )
    .unwrap();
}

#[test]
fn test_clause_goto_unwinds_and_branches() {
    let mut compiler = compiler();
    compiler
        .compile(
            "clause",
            "function int test(){ int r=0; clause(int n){ { r=r+n; goto more(1); } \
             clause more: { if(n>0) goto more(n-1); } } return r; }",
        )
        .unwrap();
    let image = compiler.link().unwrap();
    let code = code_of(&image, "test");
    // Every goto pairs an unwind with a branch.
    assert!(has_op(code, Opcode::Br));
    // The gotos sit at clause depth, so the unwind count patched into
    // the popm/pop placeholders is zero and the peephole removed them.
    assert!(!has_op(code, Opcode::PopM));
}

#[test]
fn test_unresolved_clause_label() {
    let mut compiler = compiler();
    let err = compiler
        .compile(
            "bad",
            "function test(){ clause(int n){ goto nowhere(1); } }",
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnresolvedLabel);
}

#[test]
fn test_goto_outside_clause() {
    let mut compiler = compiler();
    let err = compiler
        .compile("bad", "function test(){ goto out(1); }")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::GotoWithoutContext);
}

#[test]
fn test_weak_reference_warns_but_compiles() {
    let mut compiler = compiler();
    compiler
        .compile(
            "weak",
            "function test(){ string s = \"x\"; weak string& w = s; s = \"y\"; }",
        )
        .unwrap();
    assert!(compiler.warning_count() >= 1);
    let mut saw_weak_warning = false;
    while let Some(message) = compiler.error_text() {
        if message.contains("weak reference may outlive") {
            saw_weak_warning = true;
        }
    }
    assert!(saw_weak_warning);
}

#[test]
fn test_cofunction_compiles_to_newctx_and_yield() {
    let mut compiler = compiler();
    compiler
        .compile(
            "gen",
            "cofunction int gen(int n){ for(int i=0;i<n;i=i+1) yield i; }\n\
             function int test(){ var g = gen(3); return g()+g()+g(); }",
        )
        .unwrap();
    let image = compiler.link().unwrap();

    // The cofunction's signature is content-addressed into a thread
    // family type.
    let thread_type = compiler.registry().find_by_name("cofunction int(int)");
    assert!(thread_type.is_some());
    assert_eq!(
        compiler.registry().family(thread_type.unwrap()),
        TypeFamily::Thread
    );

    let gen_code = code_of(&image, "gen");
    assert!(has_op(gen_code, Opcode::Yield));

    let test_code = code_of(&image, "test");
    assert!(has_op(test_code, Opcode::Newctx));
    // Dynamic calls through the var-typed context dispatch at runtime.
    let resumes = opcodes(test_code)
        .iter()
        .filter(|&&op| op == Opcode::CalldgR || op == Opcode::CalldgS)
        .count();
    assert_eq!(resumes, 3);
}

#[test]
fn test_hybrid_dispatch_through_delegate() {
    let mut compiler = compiler();
    compiler
        .compile(
            "hybrid",
            "interface I { method int f(); }\n\
             class B : I { method B(){} method int f(){ return 1; } }\n\
             class D : I hybrid B { method D(){ hybrid(new B()); } }\n\
             function int test(){ I x = new D(); return x.f(); }",
        )
        .unwrap();
    let image = compiler.link().unwrap();

    let d_id = compiler.registry().find_by_name("D").unwrap();
    let d = compiler.registry().class(d_id);
    // The weave added the hidden base member and a delegate member per
    // public method of B.
    let base_slot = d.find_member("base").unwrap();
    assert!(d.members[base_slot].hidden);
    let f_slot = d.find_member("f").unwrap();
    // f collides with the inherited interface method, so the delegate
    // member is hidden and dispatch goes through the v-table.
    assert!(d.members[f_slot].hidden);
    assert_eq!(d.hybrid_links, vec![(f_slot, 1)]);

    // The forwarding method body is a delegate call through the member.
    let stub = d.funcs.iter().find(|f| f.hybrid_member.is_some()).unwrap();
    let stub_code = image.code_of(stub.handle.unwrap()).unwrap();
    assert_eq!(
        stub_code,
        &[
            Opcode::CalldgM as Word,
            quill_core::REG_THIS as Word,
            f_slot as Word,
            Opcode::Ret as Word,
        ]
    );

    // D's constructor wires the delegates with bound-method creation.
    let ctor = d.funcs.iter().find(|f| f.is_ctor).unwrap();
    let ctor_code = image.code_of(ctor.handle.unwrap()).unwrap();
    assert!(opcodes(ctor_code).contains(&Opcode::Newdgm));
}

#[test]
fn test_switch_with_only_default_is_the_bare_block() {
    let image = compile_to_image(
        "function int test(){ int r=0; switch(r){ default: r=1; } return r; }",
    )
    .unwrap();
    let code = code_of(&image, "test");
    // No case labels means no comparisons were emitted.
    assert!(!has_op(code, Opcode::EqL));
    assert!(!has_op(code, Opcode::EqS));
}

#[test]
fn test_switch_dispatch_on_string() {
    let image = compile_to_image(
        "function int test(string s){ switch(s){ case \"a\": return 1; default: return 0; } }",
    )
    .unwrap();
    let code = code_of(&image, "test");
    assert!(has_op(code, Opcode::EqS));
}

#[test]
fn test_endless_for_compiles_to_back_branch() {
    let image =
        compile_to_image("function test(){ for(;;){ break; } }").unwrap();
    let code = code_of(&image, "test");
    // An unconditional backwards branch exists.
    let back_branch = instructions(code)
        .any(|(at, op)| op == Opcode::Br && code[at + 1] < 0);
    assert!(back_branch);
}

#[test]
fn test_new_array_emits_alloca() {
    let image = compile_to_image(
        "function test(int n){ int[] a = new array(0); int[] b = new array(n); }",
    )
    .unwrap();
    let code = code_of(&image, "test");
    let allocas: Vec<usize> = instructions(code)
        .filter(|&(_, op)| op == Opcode::Alloca)
        .map(|(at, _)| code[at + 1] as usize)
        .collect();
    assert_eq!(allocas, vec![quill_core::TYPE_INT, quill_core::TYPE_INT]);
}

#[test]
fn test_forward_use_across_pass_boundary() {
    // `a` calls `b` declared later in the unit; pass 1 makes it visible.
    compile_to_image(
        "function int a(){ return b(); }\n\
         function int b(){ return 1; }",
    )
    .unwrap();
}

#[test]
fn test_short_circuit_emits_skip() {
    let image = compile_to_image(
        "function int test(int a, int b){ return a && b; }",
    )
    .unwrap();
    let code = code_of(&image, "test");
    assert!(has_op(code, Opcode::TstEq));
}

#[test]
fn test_class_qualified_constant() {
    let mut compiler = compiler();
    compiler
        .compile(
            "consts",
            "class C { const int MAX = 10; method C(){} }\n\
             function int test(){ return C::MAX; }",
        )
        .unwrap();
    compiler.link().unwrap();
    // The constant lives in the global object under the mangled key.
    let globals = compiler.registry().class(TYPE_GLOBAL);
    assert!(globals.find_member("C::MAX").is_some());
}

#[test]
fn test_global_initializers_run_in_declaration_order() {
    let mut compiler = compiler();
    compiler
        .compile("globals", "int first = 1;\nint second = 2;")
        .unwrap();
    let image = compiler.link().unwrap();
    assert_eq!(image.globals.slot_of("first"), Some(0));
    assert_eq!(image.globals.slot_of("second"), Some(1));
    // __init allocates the global object and ends in ret.
    let init = image.init_function.unwrap();
    let init_code = image.code_of(init).unwrap();
    assert_eq!(init_code[0], Opcode::Alloc as Word);
    assert_eq!(*init_code.last().unwrap(), Opcode::Ret as Word);
}

#[test]
fn test_init_reopens_for_later_compiles() {
    let mut compiler = compiler();
    compiler.compile("one", "int a = 1;").unwrap();
    compiler.link().unwrap();
    compiler.compile("two", "int b = 2;").unwrap();
    let image = compiler.link().unwrap();
    assert_eq!(image.globals.slot_of("b"), Some(1));
    let init_code = image.code_of(image.init_function.unwrap()).unwrap();
    // Exactly one trailing ret; the reopen rewound the first one.
    let rets = init_code
        .iter()
        .filter(|&&w| w == Opcode::Ret as Word)
        .count();
    assert_eq!(rets, 1);
}

#[test]
fn test_delegate_type_is_content_addressed() {
    let mut compiler = compiler();
    compiler
        .compile(
            "delegates",
            "delegate int Op(int);\n\
             delegate int Op2(int);\n\
             function int apply(Op op, int x){ return op(x); }",
        )
        .unwrap();
    let reg = compiler.registry();
    // Both names alias the one structural type.
    assert_eq!(reg.find_by_name("Op"), reg.find_by_name("Op2"));
    let t = reg.find_by_name("delegate int(int)").unwrap();
    assert_eq!(reg.family(t), TypeFamily::Delegate);
}

#[test]
fn test_function_literal_compiles_after_enclosing_body() {
    let mut compiler = compiler();
    compiler
        .compile(
            "anon",
            "delegate int Op(int);\n\
             function int test(){ Op f = function(x){ return x + 1; }; return f(2); }",
        )
        .unwrap();
    let image = compiler.link().unwrap();
    // An anonymous function got its own entry and the call site loads
    // it as a constant.
    let anon = compiler
        .registry()
        .class(TYPE_GLOBAL)
        .funcs
        .iter()
        .find(|f| f.is_anonymous)
        .expect("anonymous function record");
    assert_eq!(anon.args.len(), 1);
    let test_code = code_of(&image, "test");
    assert!(has_op(test_code, Opcode::MovehR));
    assert!(has_op(test_code, Opcode::CalldgR) || has_op(test_code, Opcode::CalldgS));
}

#[test]
fn test_type_info_round_trip() {
    let mut compiler = compiler();
    compiler
        .compile(
            "shapes",
            "interface Shape { method int area(); }\n\
             class Square : Shape { int side; method Square(int s){ side = s; } \
              method int area(){ return side * side; } }",
        )
        .unwrap();
    let xml = compiler.type_info_xml();
    let parsed = parse_type_info(&xml).unwrap();
    assert_eq!(parsed, registry_summaries(compiler.registry()));
}

#[test]
fn test_multiple_errors_surface_with_resync() {
    let mut compiler = compiler();
    let result = compiler.compile(
        "bad",
        "function int a(){ return undefined_one(); }\n\
         function int b(){ return undefined_two(); }",
    );
    assert!(result.is_err());
    assert!(compiler.error_count() >= 2);
}

#[test]
fn test_ms_error_format() {
    let mut compiler = Compiler::new(Box::new(ImageVm::new()), "error-format=ms").unwrap();
    compiler.compile("unit", "function int f(){ return }").ok();
    let message = compiler.error_text().expect("queued message");
    assert!(message.starts_with("unit("), "got: {}", message);
    assert!(message.contains("): Error "));
}

#[test]
fn test_break_outside_loop() {
    let mut compiler = compiler();
    let err = compiler
        .compile("bad", "function test(){ break; }")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BreakWithoutContext);
}

#[test]
fn test_yield_outside_cofunction() {
    let mut compiler = compiler();
    let err = compiler
        .compile("bad", "function int test(){ yield 1; return 0; }")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::YieldOutsideCofunction);
}

#[test]
fn test_const_assignment_rejected() {
    let mut compiler = compiler();
    let err = compiler
        .compile("bad", "function test(){ const int x = 1; x = 2; }")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConstViolation);
}

#[test]
fn test_native_import_synthesizes_declaration() {
    let mut vm = ImageVm::new();
    vm.register_native(
        "runtime.counter",
        "native class counter { method counter(); method int next(); }",
    );
    let mut compiler = Compiler::new(Box::new(vm), "").unwrap();
    compiler
        .compile(
            "uses",
            "import runtime.counter;\n\
             function int test(){ counter c = new counter(); return c.next(); }",
        )
        .unwrap();
    let image = compiler.link().unwrap();
    let counter = compiler.registry().find_by_name("counter").unwrap();
    assert!(compiler.registry().class(counter).native);
    let code = code_of(&image, "test");
    // Native classes allocate with allocn and call with calln.
    assert!(has_op(code, Opcode::Allocn));
    assert!(has_op(code, Opcode::Calln));
}

#[test]
fn test_file_import_through_import_path() {
    let dir = tempfile::tempdir().unwrap();
    let lib_dir = dir.path().join("mylib");
    std::fs::create_dir_all(&lib_dir).unwrap();
    std::fs::write(lib_dir.join("util.ql"), "function int three(){ return 3; }").unwrap();

    let mut compiler = compiler();
    compiler.add_import_path("mylib", lib_dir);
    compiler
        .compile(
            "main",
            "import mylib.util;\nfunction int test(){ return three(); }",
        )
        .unwrap();
    compiler.link().unwrap();
    // The imported function is in the global scope now.
    assert!(
        compiler
            .registry()
            .class(TYPE_GLOBAL)
            .funcs
            .iter()
            .any(|f| f.name == "three")
    );
}

#[test]
fn test_compile_file_reads_through_the_loader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.ql");
    std::fs::write(&path, "function int main(){ return 0; }").unwrap();

    let mut compiler = compiler();
    compiler.compile_file(&path).unwrap();
    let image = compiler.link().unwrap();
    assert!(image.find_function(TYPE_GLOBAL, "main").is_some());
}

#[test]
fn test_import_disabled_is_an_error() {
    let mut compiler = Compiler::new(Box::new(ImageVm::new()), "allow-file-import=off").unwrap();
    let err = compiler.compile("main", "import some.module;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::ImportNotFound);
}

#[test]
fn test_compile_and_run_reaches_the_vm() {
    let mut compiler = compiler();
    // The storage-only host refuses to execute; reaching that refusal
    // means the wrapper compiled and linked.
    let err = compiler.compile_and_run("int x = 1;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::VmFailure);
}

#[test]
fn test_stack_balance_in_simple_calls() {
    // A call site pushes its arguments and pops them after the call.
    let image = compile_to_image(
        "function int id(int x){ return x; }\n\
         function int test(){ return id(7); }",
    )
    .unwrap();
    let code = code_of(&image, "test");
    let pushes = opcodes(code)
        .iter()
        .filter(|&&op| op == Opcode::PushR || op == Opcode::PushZ)
        .count();
    let mut pops = 0usize;
    for (at, op) in instructions(code) {
        match op {
            Opcode::Pop => pops += 1,
            Opcode::PopR => pops += 1,
            Opcode::PopM => pops += code[at + 1] as usize,
            _ => {}
        }
    }
    assert_eq!(pushes, pops);
}
