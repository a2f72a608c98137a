//! Instruction identifiers and per-emission options.

use crate::reg::Reg;

/// A condition code, as used by `jcc`, `setcc` and `cmovcc`.
///
/// The discriminant is the hardware `cc` encoding added to the opcode base
/// (`0x70`/`0x0f80`/`0x0f90`/`0x0f40`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Overflow.
    O = 0,
    /// Not overflow.
    No = 1,
    /// Below (unsigned `<`).
    B = 2,
    /// Above or equal (unsigned `>=`).
    Ae = 3,
    /// Equal / zero.
    E = 4,
    /// Not equal / not zero.
    Ne = 5,
    /// Below or equal (unsigned `<=`).
    Be = 6,
    /// Above (unsigned `>`).
    A = 7,
    /// Sign.
    S = 8,
    /// Not sign.
    Ns = 9,
    /// Parity even.
    P = 10,
    /// Parity odd.
    Np = 11,
    /// Less (signed `<`).
    L = 12,
    /// Greater or equal (signed `>=`).
    Ge = 13,
    /// Less or equal (signed `<=`).
    Le = 14,
    /// Greater (signed `>`).
    G = 15,
}

impl Cond {
    /// The four-bit hardware encoding.
    #[must_use]
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// The inverse condition.
    #[must_use]
    pub fn invert(self) -> Self {
        // Conditions pair up even/odd.
        let enc = self.enc() ^ 1;
        [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Ae,
            Cond::E,
            Cond::Ne,
            Cond::Be,
            Cond::A,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Ge,
            Cond::Le,
            Cond::G,
        ][usize::from(enc)]
    }

    fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

/// A `REP`-family prefix for string instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rep {
    /// `F3`: `rep` / `repe`.
    Rep,
    /// `F2`: `repne`.
    Repne,
}

/// Per-emission options.
///
/// Most instructions need none of these; the typed assembler methods default
/// them. `mask`/`zeroing`/`broadcast` select AVX-512 EVEX features,
/// `force_short` pins a branch to its 2-byte rel8 form, and `rep` attaches a
/// repeat prefix to a string instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EmitOptions {
    /// Force the rel8 form of a branch. A forward branch registers a `Rel8`
    /// relocation site that fails at bind time if out of range.
    pub force_short: bool,
    /// Attach a repeat prefix (string instructions only).
    pub rep: Option<Rep>,
    /// The EVEX write-mask register (`k1`..`k7`).
    pub mask: Option<Reg>,
    /// EVEX zeroing-masking (`{z}`); requires `mask`.
    pub zeroing: bool,
    /// EVEX embedded broadcast of a memory operand.
    pub broadcast: bool,
}

impl EmitOptions {
    /// True if any AVX-512-only feature is requested.
    #[must_use]
    pub fn wants_evex(&self) -> bool {
        self.mask.is_some() || self.zeroing || self.broadcast
    }
}

macro_rules! inst_ids {
    ($($variant:ident => $name:literal,)+) => {
        /// An instruction identifier.
        ///
        /// Together with an operand list this selects exactly one encoder
        /// primitive through the dispatcher; see [`crate::Assembler::emit`].
        /// Conditional families carry their [`Cond`] directly.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum InstId {
            $(#[doc = concat!("`", $name, "`")] $variant,)+
            /// `jcc`: conditional jump.
            Jcc(Cond),
            /// `setcc`: set byte on condition.
            Setcc(Cond),
            /// `cmovcc`: conditional move.
            Cmovcc(Cond),
        }

        impl InstId {
            /// The base mnemonic, without condition-code suffixes.
            #[must_use]
            pub fn mnemonic(&self) -> &'static str {
                match self {
                    $(InstId::$variant => $name,)+
                    InstId::Jcc(_) => "jcc",
                    InstId::Setcc(_) => "setcc",
                    InstId::Cmovcc(_) => "cmovcc",
                }
            }
        }
    };
}

inst_ids! {
    // Data movement.
    Mov => "mov",
    Movzx => "movzx",
    Movsx => "movsx",
    Movsxd => "movsxd",
    Lea => "lea",
    Xchg => "xchg",
    Push => "push",
    Pop => "pop",
    // Integer ALU.
    Add => "add",
    Or => "or",
    Adc => "adc",
    Sbb => "sbb",
    And => "and",
    Sub => "sub",
    Xor => "xor",
    Cmp => "cmp",
    Test => "test",
    // Unary groups.
    Inc => "inc",
    Dec => "dec",
    Not => "not",
    Neg => "neg",
    Mul => "mul",
    Imul => "imul",
    Div => "div",
    Idiv => "idiv",
    // Shifts and rotates.
    Rol => "rol",
    Ror => "ror",
    Rcl => "rcl",
    Rcr => "rcr",
    Shl => "shl",
    Shr => "shr",
    Sar => "sar",
    // Bit manipulation.
    Bt => "bt",
    Bts => "bts",
    Btr => "btr",
    Btc => "btc",
    Bsf => "bsf",
    Bsr => "bsr",
    Popcnt => "popcnt",
    Lzcnt => "lzcnt",
    Tzcnt => "tzcnt",
    // Control flow.
    Jmp => "jmp",
    Call => "call",
    Ret => "ret",
    // Miscellaneous.
    Nop => "nop",
    Int3 => "int3",
    Ud2 => "ud2",
    Cpuid => "cpuid",
    Pause => "pause",
    Hlt => "hlt",
    Leave => "leave",
    Cwde => "cwde",
    Cdq => "cdq",
    Cdqe => "cdqe",
    Cqo => "cqo",
    // Fences.
    Mfence => "mfence",
    Lfence => "lfence",
    Sfence => "sfence",
    // String operations (b/w/l/q width suffixes).
    Movsb => "movsb",
    Movsw => "movsw",
    Movsl => "movsl",
    Movsq => "movsq",
    Stosb => "stosb",
    Stosw => "stosw",
    Stosl => "stosl",
    Stosq => "stosq",
    Lodsb => "lodsb",
    Lodsw => "lodsw",
    Lodsl => "lodsl",
    Lodsq => "lodsq",
    Scasb => "scasb",
    Scasw => "scasw",
    Scasl => "scasl",
    Scasq => "scasq",
    Cmpsb => "cmpsb",
    Cmpsw => "cmpsw",
    Cmpsl => "cmpsl",
    Cmpsq => "cmpsq",
    // SSE moves.
    Movaps => "movaps",
    Movups => "movups",
    Movapd => "movapd",
    Movupd => "movupd",
    Movdqa => "movdqa",
    Movdqu => "movdqu",
    Movss => "movss",
    Movsd => "movsd",
    Movd => "movd",
    Movq => "movq",
    // SSE arithmetic.
    Addps => "addps",
    Addpd => "addpd",
    Addss => "addss",
    Addsd => "addsd",
    Subps => "subps",
    Subpd => "subpd",
    Subss => "subss",
    Subsd => "subsd",
    Mulps => "mulps",
    Mulpd => "mulpd",
    Mulss => "mulss",
    Mulsd => "mulsd",
    Divps => "divps",
    Divpd => "divpd",
    Divss => "divss",
    Divsd => "divsd",
    Minps => "minps",
    Minpd => "minpd",
    Minss => "minss",
    Minsd => "minsd",
    Maxps => "maxps",
    Maxpd => "maxpd",
    Maxss => "maxss",
    Maxsd => "maxsd",
    Sqrtps => "sqrtps",
    Sqrtpd => "sqrtpd",
    Sqrtss => "sqrtss",
    Sqrtsd => "sqrtsd",
    // SSE logic.
    Andps => "andps",
    Andpd => "andpd",
    Orps => "orps",
    Orpd => "orpd",
    Xorps => "xorps",
    Xorpd => "xorpd",
    // SSE integer.
    Pand => "pand",
    Por => "por",
    Pxor => "pxor",
    Paddb => "paddb",
    Paddw => "paddw",
    Paddd => "paddd",
    Paddq => "paddq",
    Psubb => "psubb",
    Psubw => "psubw",
    Psubd => "psubd",
    Psubq => "psubq",
    // SSE compares, conversions, shuffles.
    Ucomiss => "ucomiss",
    Ucomisd => "ucomisd",
    Comiss => "comiss",
    Comisd => "comisd",
    Cvtsi2ss => "cvtsi2ss",
    Cvtsi2sd => "cvtsi2sd",
    Cvttss2si => "cvttss2si",
    Cvttsd2si => "cvttsd2si",
    Cvtss2sd => "cvtss2sd",
    Cvtsd2ss => "cvtsd2ss",
    Shufps => "shufps",
    Pshufd => "pshufd",
    // AVX / AVX-512.
    Vmovaps => "vmovaps",
    Vmovups => "vmovups",
    Vmovdqa => "vmovdqa",
    Vmovdqu => "vmovdqu",
    Vmovdqa32 => "vmovdqa32",
    Vmovdqa64 => "vmovdqa64",
    Vmovdqu32 => "vmovdqu32",
    Vmovdqu64 => "vmovdqu64",
    Vaddps => "vaddps",
    Vaddpd => "vaddpd",
    Vaddss => "vaddss",
    Vaddsd => "vaddsd",
    Vsubps => "vsubps",
    Vsubpd => "vsubpd",
    Vsubss => "vsubss",
    Vsubsd => "vsubsd",
    Vmulps => "vmulps",
    Vmulpd => "vmulpd",
    Vmulss => "vmulss",
    Vmulsd => "vmulsd",
    Vdivps => "vdivps",
    Vdivpd => "vdivpd",
    Vdivss => "vdivss",
    Vdivsd => "vdivsd",
    Vminps => "vminps",
    Vminpd => "vminpd",
    Vmaxps => "vmaxps",
    Vmaxpd => "vmaxpd",
    Vsqrtps => "vsqrtps",
    Vsqrtpd => "vsqrtpd",
    Vandps => "vandps",
    Vandpd => "vandpd",
    Vorps => "vorps",
    Vorpd => "vorpd",
    Vxorps => "vxorps",
    Vxorpd => "vxorpd",
    Vpand => "vpand",
    Vpor => "vpor",
    Vpxor => "vpxor",
    Vpaddb => "vpaddb",
    Vpaddw => "vpaddw",
    Vpaddd => "vpaddd",
    Vpaddq => "vpaddq",
    Vpsubb => "vpsubb",
    Vpsubw => "vpsubw",
    Vpsubd => "vpsubd",
    Vpsubq => "vpsubq",
    Vshufps => "vshufps",
    Vpshufd => "vpshufd",
    Vinsertf128 => "vinsertf128",
}

impl InstId {
    /// The full mnemonic, resolving condition-code families to their
    /// suffixed form (`je`, `setg`, `cmovl`, ...).
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            InstId::Jcc(cc) => format!("j{}", cc.suffix()),
            InstId::Setcc(cc) => format!("set{}", cc.suffix()),
            InstId::Cmovcc(cc) => format!("cmov{}", cc.suffix()),
            other => other.mnemonic().to_owned(),
        }
    }
}
