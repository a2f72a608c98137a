//! Memory operands.

use crate::buffer::{CodeBuffer, Label};
use crate::reg::{self, Reg, RegClass};

/// The scaling factor applied to the index register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scale {
    One,
    Two,
    Four,
    Eight,
}

impl Scale {
    /// Create a [`Scale`] from its multiplier (1, 2, 4 or 8).
    ///
    /// # Panics
    ///
    /// Panics on any other multiplier.
    #[must_use]
    pub fn new(mult: u8) -> Self {
        match mult {
            1 => Scale::One,
            2 => Scale::Two,
            4 => Scale::Four,
            8 => Scale::Eight,
            _ => panic!("invalid scale multiplier: {mult}"),
        }
    }

    /// The two-bit hardware encoding placed in the SIB byte.
    #[must_use]
    pub const fn enc(&self) -> u8 {
        match self {
            Scale::One => 0b00,
            Scale::Two => 0b01,
            Scale::Four => 0b10,
            Scale::Eight => 0b11,
        }
    }
}

/// The addressing shape of an [`Amode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AmodeKind {
    /// `[base + disp]`.
    Base { base: Reg },
    /// `[base? + index*scale + disp]`; always needs a SIB byte.
    BaseIndex {
        base: Option<Reg>,
        index: Reg,
        scale: Scale,
    },
    /// `[disp32]` with no registers.
    Abs,
    /// `[rip + disp]`, resolved against a label at bind time.
    RipRelative { target: Label },
}

/// How a memory operand maps onto ModR/M mode bits; useful for callers that
/// want to predict encoded size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModRmShape {
    /// `mod=00`, register base, no displacement bytes.
    BaseOnly,
    /// `mod=01`, register base plus 8-bit displacement.
    BaseDisp8,
    /// `mod=10`, register base plus 32-bit displacement.
    BaseDisp32,
    /// Any form requiring a SIB byte.
    Sib,
    /// `mod=00, r/m=101` with a label-patched 32-bit displacement.
    RipRelative,
}

/// An x86/x64 memory operand.
///
/// Built with the `Amode::base`/[`Amode::base_index`]/[`Amode::rip`]
/// constructors and refined with [`Amode::with_size`] and
/// [`Amode::with_seg`]. The access size informs operand-size prefix choice
/// for instructions whose only sized operand is memory; it never changes the
/// addressing-mode bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Amode {
    pub(crate) kind: AmodeKind,
    pub(crate) disp: i32,
    /// Access size in bytes; 0 when inferred from a register operand.
    pub(crate) size: u8,
    pub(crate) seg: Option<Reg>,
}

impl Amode {
    /// `[base + disp]`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not a general-purpose register.
    #[must_use]
    pub fn base(base: Reg, disp: i32) -> Self {
        assert_eq!(base.class(), RegClass::Gp, "memory base must be a GPR");
        Self {
            kind: AmodeKind::Base { base },
            disp,
            size: 0,
            seg: None,
        }
    }

    /// `[base + index*scale + disp]`.
    ///
    /// # Panics
    ///
    /// Panics if either register is not a GPR, or if `index` is `rsp` (the
    /// SIB encoding cannot express it; `r12` is fine).
    #[must_use]
    pub fn base_index(base: Reg, index: Reg, scale: Scale, disp: i32) -> Self {
        assert_eq!(base.class(), RegClass::Gp, "memory base must be a GPR");
        Self::index_only(index, scale, disp).with_base(base)
    }

    /// `[index*scale + disp]` with no base register.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a GPR or is `rsp`.
    #[must_use]
    pub fn index_only(index: Reg, scale: Scale, disp: i32) -> Self {
        assert_eq!(index.class(), RegClass::Gp, "memory index must be a GPR");
        assert!(
            index.is_virtual() || index.enc() != reg::enc::RSP,
            "rsp cannot be an index register"
        );
        Self {
            kind: AmodeKind::BaseIndex {
                base: None,
                index,
                scale,
            },
            disp,
            size: 0,
            seg: None,
        }
    }

    /// `[disp32]`: absolute addressing with no registers.
    #[must_use]
    pub fn abs(disp: i32) -> Self {
        Self {
            kind: AmodeKind::Abs,
            disp,
            size: 0,
            seg: None,
        }
    }

    /// `[rip + label + disp]`: RIP-relative addressing against a label. The
    /// 32-bit displacement field is patched when the label binds.
    #[must_use]
    pub fn rip(target: Label, disp: i32) -> Self {
        Self {
            kind: AmodeKind::RipRelative { target },
            disp,
            size: 0,
            seg: None,
        }
    }

    fn with_base(mut self, base: Reg) -> Self {
        match &mut self.kind {
            AmodeKind::BaseIndex { base: b, .. } => *b = Some(base),
            _ => unreachable!(),
        }
        self
    }

    /// Set the access size in bytes (1, 2, 4, 8, 16, 32 or 64).
    #[must_use]
    pub fn with_size(mut self, bytes: u8) -> Self {
        self.size = bytes;
        self
    }

    /// Apply a segment-override prefix.
    ///
    /// # Panics
    ///
    /// Panics if `seg` is not a segment register.
    #[must_use]
    pub fn with_seg(mut self, seg: Reg) -> Self {
        assert_eq!(seg.class(), RegClass::Seg, "segment override must be a segment register");
        self.seg = Some(seg);
        self
    }

    /// The access size in bytes, if one was set.
    #[must_use]
    pub fn size(&self) -> u8 {
        self.size
    }

    /// The displacement.
    #[must_use]
    pub fn disp(&self) -> i32 {
        self.disp
    }

    /// The registers referenced by this operand.
    pub(crate) fn regs(&self) -> impl Iterator<Item = Reg> {
        let (a, b) = match self.kind {
            AmodeKind::Base { base } => (Some(base), None),
            AmodeKind::BaseIndex { base, index, .. } => (base, Some(index)),
            AmodeKind::Abs | AmodeKind::RipRelative { .. } => (None, None),
        };
        a.into_iter().chain(b)
    }

    /// True if the address registers are 32-bit views, requiring the
    /// address-size override prefix in 64-bit mode.
    #[must_use]
    pub fn is_addr32(&self) -> bool {
        self.regs().next().is_some_and(|r| r.size_bits() == 32)
    }

    /// Classify how this operand maps onto ModR/M mode bits in 64-bit mode.
    #[must_use]
    pub fn mod_rm_shape(&self) -> ModRmShape {
        match self.kind {
            AmodeKind::Base { base } => {
                // rsp/r12 need SIB regardless of displacement.
                if !base.is_virtual() && base.enc3() == reg::enc::RSP {
                    ModRmShape::Sib
                } else if self.disp == 0 && (base.is_virtual() || base.enc3() != reg::enc::RBP) {
                    ModRmShape::BaseOnly
                } else if i8::try_from(self.disp).is_ok() {
                    ModRmShape::BaseDisp8
                } else {
                    ModRmShape::BaseDisp32
                }
            }
            AmodeKind::BaseIndex { .. } | AmodeKind::Abs => ModRmShape::Sib,
            AmodeKind::RipRelative { .. } => ModRmShape::RipRelative,
        }
    }

    fn render(&self) -> String {
        let mut inner = match self.kind {
            AmodeKind::Base { base } => base.name(),
            AmodeKind::BaseIndex { base, index, scale } => {
                let idx = format!("{}*{}", index.name(), 1u8 << scale.enc());
                match base {
                    Some(base) => format!("{} + {idx}", base.name()),
                    None => idx,
                }
            }
            AmodeKind::Abs => String::new(),
            AmodeKind::RipRelative { .. } => "rip".to_owned(),
        };
        if self.disp != 0 || inner.is_empty() {
            if inner.is_empty() {
                inner = format!("{:#x}", self.disp);
            } else if self.disp < 0 {
                inner = format!("{inner} - {:#x}", -i64::from(self.disp));
            } else {
                inner = format!("{inner} + {:#x}", self.disp);
            }
        }
        match self.seg {
            Some(seg) => format!("{}:[{inner}]", seg.name()),
            None => format!("[{inner}]"),
        }
    }
}

/// Renders the operand for diagnostics, e.g. `[rax + rcx*4 + 0x10]`.
impl std::fmt::Display for Amode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Emit the ModR/M, optional SIB, and displacement bytes for `mem` with
/// `enc_g` in the reg field. `bytes_at_end` is the count of immediate bytes
/// that will follow the displacement (RIP-relative displacements are relative
/// to the end of the instruction, so they pre-compensate for trailing bytes);
/// `evex_scaling` is the disp8*N factor for EVEX compressed displacements.
///
/// The caller has already validated registers and emitted all prefixes and
/// opcode bytes.
pub(crate) fn emit_modrm_sib_disp(
    buf: &mut CodeBuffer,
    enc_g: u8,
    mem: &Amode,
    bytes_at_end: u8,
    evex_scaling: Option<i8>,
    x86_mode: bool,
) {
    use crate::rex::{encode_modrm, encode_sib, Disp};

    match mem.kind {
        AmodeKind::Base { base } => {
            let enc_e = base.enc();
            let mut disp = Disp::new(mem.disp, evex_scaling);

            let enc_e_low3 = enc_e & 7;
            if enc_e_low3 == reg::enc::RSP {
                // Displacement from rsp/r12 is encoded with a SIB byte where
                // index and base are both 0b100: the index slot means "none"
                // and the base picks rsp (or r12 via REX.B).
                buf.put1(encode_modrm(disp.m0d(), enc_g & 7, 0b100));
                buf.put1(encode_sib(0, 0b100, 0b100));
                disp.emit(buf);
            } else {
                // [rbp]/[r13] with mod=00 would mean rip-relative (or disp32
                // in 32-bit mode), so force a zero disp8.
                if enc_e_low3 == reg::enc::RBP {
                    disp.force_immediate();
                }
                buf.put1(encode_modrm(disp.m0d(), enc_g & 7, enc_e_low3));
                disp.emit(buf);
            }
        }

        AmodeKind::BaseIndex { base, index, scale } => {
            let enc_index = index.enc();
            debug_assert!(enc_index != reg::enc::RSP);

            match base {
                Some(base) => {
                    let enc_base = base.enc();
                    let mut disp = Disp::new(mem.disp, evex_scaling);
                    // rbp/r13 as SIB base cannot use mod=00; force disp8.
                    if enc_base & 7 == reg::enc::RBP {
                        disp.force_immediate();
                    }
                    buf.put1(encode_modrm(disp.m0d(), enc_g & 7, 0b100));
                    buf.put1(encode_sib(scale.enc(), enc_index & 7, enc_base & 7));
                    disp.emit(buf);
                }
                None => {
                    // No base: mod=00, SIB base=101, disp32 always.
                    buf.put1(encode_modrm(0b00, enc_g & 7, 0b100));
                    buf.put1(encode_sib(scale.enc(), enc_index & 7, 0b101));
                    #[allow(clippy::cast_sign_loss)]
                    buf.put4(mem.disp as u32);
                }
            }
        }

        AmodeKind::Abs => {
            if x86_mode {
                // 32-bit mode: mod=00, r/m=101 is plain [disp32].
                buf.put1(encode_modrm(0b00, enc_g & 7, 0b101));
            } else {
                // 64-bit mode repurposes that encoding for rip-relative, so
                // absolute addressing goes through a base-less SIB.
                buf.put1(encode_modrm(0b00, enc_g & 7, 0b100));
                buf.put1(encode_sib(0, 0b100, 0b101));
            }
            #[allow(clippy::cast_sign_loss)]
            buf.put4(mem.disp as u32);
        }

        AmodeKind::RipRelative { target } => {
            buf.put1(encode_modrm(0b00, enc_g & 7, 0b101));
            let patch = buf.cur_offset();
            // The displacement is relative to the end of the instruction,
            // which is `bytes_at_end` past the end of this field; start the
            // field at the negated compensation plus any static addend and
            // let the label patch add the PC-relative part.
            let addend = mem.disp - i32::from(bytes_at_end);
            #[allow(clippy::cast_sign_loss)]
            buf.put4(addend as u32);
            // Infallible for Rel32 sites.
            buf.use_rel32_at(target, patch).unwrap();
        }
    }
}
