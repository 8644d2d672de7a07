//! The VM instruction set.
//!
//! Code is a flat sequence of `Word`s: an opcode word followed by its
//! operand words. Operand order is canonical: sources first, destination
//! last. Addressing modes are encoded in the opcode suffix:
//!
//! - `R`: register operand
//! - `S`: stack slot operand (index relative to the stack pointer)
//! - `M`: member operand (object register + member slot, two words)
//! - `A`: array element operand (array register + index register, two words)
//!
//! Branch operands are word offsets relative to the start of the branch
//! instruction; they may be negative.

use std::fmt;

/// One code word. Signed so branch offsets can point backwards.
pub type Word = i32;

/// Error returned when decoding an unknown opcode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadOpcode(pub Word);

impl fmt::Display for BadOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown opcode word {}", self.0)
    }
}

impl std::error::Error for BadOpcode {}

macro_rules! opcodes {
    ($( $name:ident = $code:literal, $mnemonic:literal, $operands:literal;)*) => {
        /// VM opcodes. Discriminants are the wire encoding and must never
        /// be renumbered.
        #[repr(i32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $name = $code, )*
        }

        impl Opcode {
            /// Assembly mnemonic, used by diagnostics and the disassembler.
            pub fn mnemonic(self) -> &'static str {
                match self { $( Opcode::$name => $mnemonic, )* }
            }

            /// Number of operand words following the opcode word.
            pub fn operand_count(self) -> usize {
                match self { $( Opcode::$name => $operands, )* }
            }
        }

        impl TryFrom<Word> for Opcode {
            type Error = BadOpcode;

            fn try_from(w: Word) -> Result<Self, BadOpcode> {
                match w {
                    $( $code => Ok(Opcode::$name), )*
                    _ => Err(BadOpcode(w)),
                }
            }
        }
    };
}

opcodes! {
    // Data movement: move (reference transfer), copy (value clone),
    // wref (weak reference). Source operand(s) first, destination last.
    MoveRR = 0, "move_rr", 2;
    MoveRS = 1, "move_rs", 2;
    MoveSR = 2, "move_sr", 2;
    MoveSS = 3, "move_ss", 2;
    MoveRM = 4, "move_rm", 3;
    MoveMR = 5, "move_mr", 3;
    MoveRA = 6, "move_ra", 3;
    MoveAR = 7, "move_ar", 3;
    CopyRR = 8, "copy_rr", 2;
    CopyRS = 9, "copy_rs", 2;
    CopySR = 10, "copy_sr", 2;
    CopySS = 11, "copy_ss", 2;
    CopyRM = 12, "copy_rm", 3;
    CopyMR = 13, "copy_mr", 3;
    CopyRA = 14, "copy_ra", 3;
    CopyAR = 15, "copy_ar", 3;
    WrefRR = 16, "wref_rr", 2;
    WrefRS = 17, "wref_rs", 2;
    WrefSR = 18, "wref_sr", 2;
    WrefSS = 19, "wref_ss", 2;
    WrefRM = 20, "wref_rm", 3;
    WrefMR = 21, "wref_mr", 3;
    WrefRA = 22, "wref_ra", 3;
    WrefAR = 23, "wref_ar", 3;

    // Literal loads. The handle operand is written as 0 at compile time
    // and patched by the linker.
    MovehR = 24, "moveh_r", 2;
    MovehS = 25, "moveh_s", 2;
    CopyhR = 26, "copyh_r", 2;
    CopyhS = 27, "copyh_s", 2;
    LdNull = 28, "ldnull", 1;

    // Stack.
    PushR = 29, "push_r", 1;
    PushZ = 30, "push_z", 0;
    Pop = 31, "pop", 0;
    PopM = 32, "popm", 1;
    PopR = 33, "pop_r", 1;

    // Arithmetic, dst <- dst op src. Suffix selects the static kind:
    // l = int, f = float, v = dynamic.
    AddL = 34, "addl", 2;
    AddF = 35, "addf", 2;
    AddV = 36, "addv", 2;
    SubL = 37, "subl", 2;
    SubF = 38, "subf", 2;
    SubV = 39, "subv", 2;
    MulL = 40, "mull", 2;
    MulF = 41, "mulf", 2;
    MulV = 42, "mulv", 2;
    DivL = 43, "divl", 2;
    DivF = 44, "divf", 2;
    DivV = 45, "divv", 2;
    ModL = 46, "modl", 2;
    ModF = 47, "modf", 2;
    ModV = 48, "modv", 2;
    StrAdd = 49, "stradd", 2;
    ArrAdd = 50, "arradd", 2;

    NegL = 51, "negl", 1;
    NegF = 52, "negf", 1;
    NegV = 53, "negv", 1;
    Not = 54, "not", 1;
    BNot = 55, "bnot", 1;
    IncR = 56, "inc", 1;
    DecR = 57, "dec", 1;

    AndL = 58, "andl", 2;
    OrL = 59, "orl", 2;
    XorL = 60, "xorl", 2;
    ShlL = 61, "shll", 2;
    ShrL = 62, "shrl", 2;

    // Comparison, (a, b, dst): dst <- a rel b as int 0/1.
    EqL = 63, "eql", 3;
    NeL = 64, "nel", 3;
    LtL = 65, "ltl", 3;
    LeL = 66, "lel", 3;
    GtL = 67, "gtl", 3;
    GeL = 68, "gel", 3;
    EqF = 69, "eqf", 3;
    NeF = 70, "nef", 3;
    LtF = 71, "ltf", 3;
    LeF = 72, "lef", 3;
    GtF = 73, "gtf", 3;
    GeF = 74, "gef", 3;
    EqS = 75, "eqs", 3;
    NeS = 76, "nes", 3;
    LtS = 77, "lts", 3;
    LeS = 78, "les", 3;
    GtS = 79, "gts", 3;
    GeS = 80, "ges", 3;
    EqV = 81, "eqv", 3;
    NeV = 82, "nev", 3;
    LtV = 83, "ltv", 3;
    LeV = 84, "lev", 3;
    GtV = 85, "gtv", 3;
    GeV = 86, "gev", 3;
    SameRef = 87, "sameref", 3;

    // Control flow. Branch operands are relative word offsets.
    Br = 88, "br", 1;
    TstEq = 89, "tsteq", 2;
    TstNe = 90, "tstne", 2;
    Ret = 91, "ret", 0;
    Yield = 92, "yield", 0;
    Throw = 93, "throw", 1;

    // Conversions and runtime checks.
    Rtchk = 94, "rtchk", 2;
    Cvf = 95, "cvf", 2;
    Cvl = 96, "cvl", 2;
    Dcvt = 97, "dcvt", 3;

    // Calls. The calls operand is a function handle patched by the
    // linker. The calldg group dispatches on the runtime value: a
    // delegate is invoked, a cofunction context is resumed.
    Calls = 98, "calls", 1;
    Callm = 99, "callm", 2;
    Calli = 100, "calli", 2;
    Calln = 101, "calln", 2;
    CalldgR = 102, "calldg_r", 1;
    CalldgS = 103, "calldg_s", 1;
    CalldgM = 104, "calldg_m", 2;
    CalldgA = 105, "calldg_a", 2;

    // Allocation.
    Alloc = 106, "alloc", 2;
    Allocn = 107, "allocn", 2;
    Alloci = 108, "alloci", 2;
    Alloca = 109, "alloca", 3;

    // Delegates and cofunction contexts.
    Newdg = 110, "newdg", 2;
    Newdgm = 111, "newdgm", 4;
    Newctx = 112, "newctx", 3;
    ResumeR = 113, "resume_r", 1;
    ResumeS = 114, "resume_s", 1;
    ResumeM = 115, "resume_m", 2;
    ResumeA = 116, "resume_a", 2;

    Nop = 117, "nop", 0;
    TypeOf = 118, "typeof", 2;

    // Debug hooks.
    Brk = 119, "brk", 0;
    Selftest = 120, "selftest", 0;
}

impl Opcode {
    /// Index of the relative-branch operand, if this opcode branches.
    pub fn branch_operand(self) -> Option<usize> {
        match self {
            Opcode::Br => Some(0),
            Opcode::TstEq | Opcode::TstNe => Some(1),
            _ => None,
        }
    }

    /// Total instruction length in words, including the opcode word.
    pub fn len(self) -> usize {
        1 + self.operand_count()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Iterate the instruction boundaries of a code buffer.
///
/// Yields `(offset, opcode)` pairs. Stops early on a malformed buffer;
/// the linker treats that as a fatal consistency error.
pub fn instructions(code: &[Word]) -> InstructionIter<'_> {
    InstructionIter { code, pos: 0 }
}

pub struct InstructionIter<'a> {
    code: &'a [Word],
    pos: usize,
}

impl Iterator for InstructionIter<'_> {
    type Item = (usize, Opcode);

    fn next(&mut self) -> Option<(usize, Opcode)> {
        if self.pos >= self.code.len() {
            return None;
        }
        let op = Opcode::try_from(self.code[self.pos]).ok()?;
        let at = self.pos;
        self.pos += op.len();
        if self.pos > self.code.len() {
            return None;
        }
        Some((at, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_opcodes() {
        for w in 0..=120 {
            let op = Opcode::try_from(w).expect("dense opcode numbering");
            assert_eq!(op as Word, w);
            assert!(!op.mnemonic().is_empty());
        }
        assert!(Opcode::try_from(121).is_err());
        assert!(Opcode::try_from(-1).is_err());
    }

    #[test]
    fn test_branch_operands() {
        assert_eq!(Opcode::Br.branch_operand(), Some(0));
        assert_eq!(Opcode::TstEq.branch_operand(), Some(1));
        assert_eq!(Opcode::MoveRR.branch_operand(), None);
    }

    #[test]
    fn test_instruction_iteration() {
        let code = vec![
            Opcode::MovehR as Word,
            0,
            5,
            Opcode::PushR as Word,
            5,
            Opcode::Calls as Word,
            3,
            Opcode::Ret as Word,
        ];
        let got: Vec<_> = instructions(&code).collect();
        assert_eq!(
            got,
            vec![
                (0, Opcode::MovehR),
                (3, Opcode::PushR),
                (5, Opcode::Calls),
                (7, Opcode::Ret),
            ]
        );
    }

    #[test]
    fn test_truncated_buffer_stops() {
        let code = vec![Opcode::MovehR as Word, 0];
        assert_eq!(instructions(&code).count(), 0);
    }
}
