//! Register operands.
//!
//! A [`Reg`] is an immutable descriptor: a class, a hardware encoding, an
//! access width, and (for the legacy `ah`..`bh` bytes) a high-byte flag.
//! Registers with a negative encoding are *virtual* and participate only in
//! the ABI layer; the encoder rejects them.

use std::fmt;

/// The class of a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegClass {
    /// General-purpose registers (`rax`..`r15` and their narrower views).
    Gp,
    /// SSE/AVX/AVX-512 vector registers (`xmm`/`ymm`/`zmm`).
    Vec,
    /// AVX-512 write-mask registers (`k0`..`k7`).
    Mask,
    /// Segment registers (`es`..`gs`).
    Seg,
    /// x87 floating-point stack registers (`st0`..`st7`).
    St,
    /// MMX registers (`mm0`..`mm7`).
    Mm,
}

/// A register operand.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    class: RegClass,
    /// Hardware encoding; negative values denote virtual registers.
    enc: i16,
    /// Access width in bits.
    bits: u16,
    /// Set only for `ah`, `ch`, `dh`, `bh`.
    high_byte: bool,
}

impl Reg {
    /// Create a general-purpose register of the given width.
    #[must_use]
    pub const fn gp(bits: u16, enc: u8) -> Self {
        Self {
            class: RegClass::Gp,
            enc: enc as i16,
            bits,
            high_byte: false,
        }
    }

    /// Create a vector register of the given width (128, 256 or 512 bits).
    #[must_use]
    pub const fn vec(bits: u16, enc: u8) -> Self {
        Self {
            class: RegClass::Vec,
            enc: enc as i16,
            bits,
            high_byte: false,
        }
    }

    /// Create an AVX-512 write-mask register.
    #[must_use]
    pub const fn mask(enc: u8) -> Self {
        Self {
            class: RegClass::Mask,
            enc: enc as i16,
            bits: 64,
            high_byte: false,
        }
    }

    const fn seg(enc: u8) -> Self {
        Self {
            class: RegClass::Seg,
            enc: enc as i16,
            bits: 16,
            high_byte: false,
        }
    }

    const fn st(enc: u8) -> Self {
        Self {
            class: RegClass::St,
            enc: enc as i16,
            bits: 80,
            high_byte: false,
        }
    }

    const fn mm(enc: u8) -> Self {
        Self {
            class: RegClass::Mm,
            enc: enc as i16,
            bits: 64,
            high_byte: false,
        }
    }

    const fn gp_high(enc: u8) -> Self {
        Self {
            class: RegClass::Gp,
            enc: enc as i16,
            bits: 8,
            high_byte: true,
        }
    }

    /// Create a virtual register of the given class and width.
    ///
    /// Virtual registers carry a caller-chosen non-negative `id` (stored
    /// negated) and are only meaningful to the calling-convention and
    /// argument-assignment machinery; the encoder rejects them.
    #[must_use]
    pub const fn virt(class: RegClass, bits: u16, id: u16) -> Self {
        Self {
            class,
            enc: -1 - (id as i16),
            bits,
            high_byte: false,
        }
    }

    /// The register's class.
    #[must_use]
    pub const fn class(&self) -> RegClass {
        self.class
    }

    /// The access width in bits.
    #[must_use]
    pub const fn size_bits(&self) -> u16 {
        self.bits
    }

    /// True for virtual registers (negative encoding).
    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        self.enc < 0
    }

    /// The id of a virtual register, undoing the negation of [`Reg::virt`].
    #[must_use]
    pub fn virt_id(&self) -> Option<u16> {
        if self.enc < 0 {
            #[allow(clippy::cast_sign_loss)]
            let id = (-1 - self.enc) as u16;
            Some(id)
        } else {
            None
        }
    }

    /// Return the register's hardware encoding.
    ///
    /// # Panics
    ///
    /// Panics if the register is virtual; virtual registers must have been
    /// replaced by the ABI layer before they reach the encoder.
    #[must_use]
    pub fn enc(&self) -> u8 {
        assert!(self.enc >= 0, "virtual register reached the encoder");
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let enc = self.enc as u8;
        enc
    }

    /// The low three bits of the hardware encoding, as placed in ModR/M and
    /// SIB fields.
    #[must_use]
    pub fn enc3(&self) -> u8 {
        self.enc() & 7
    }

    /// True if encoding this register requires a REX/VEX/EVEX extension bit
    /// (hardware encoding 8 or above).
    #[must_use]
    pub fn needs_rex_extension(&self) -> bool {
        self.enc() >= 8
    }

    /// True for `ah`, `ch`, `dh`, `bh`.
    #[must_use]
    pub const fn is_high_byte(&self) -> bool {
        self.high_byte
    }

    /// True for `spl`, `bpl`, `sil`, `dil`: byte registers that are only
    /// addressable with a REX prefix present.
    #[must_use]
    pub fn is_uniform_byte(&self) -> bool {
        self.class == RegClass::Gp
            && self.bits == 8
            && !self.high_byte
            && (4..=7).contains(&self.enc())
    }

    /// Return the same register viewed at a different width.
    #[must_use]
    pub const fn with_size(&self, bits: u16) -> Self {
        Self {
            class: self.class,
            enc: self.enc,
            bits,
            high_byte: false,
        }
    }

    /// Return the register name, e.g. `rax` or `xmm13`.
    #[must_use]
    pub fn name(&self) -> String {
        if self.is_virtual() {
            return format!("v{}", -1 - self.enc);
        }
        let enc = self.enc();
        match self.class {
            RegClass::Gp => enc::gp_to_string(enc, self.bits, self.high_byte),
            RegClass::Vec => match self.bits {
                256 => format!("ymm{enc}"),
                512 => format!("zmm{enc}"),
                _ => format!("xmm{enc}"),
            },
            RegClass::Mask => format!("k{enc}"),
            RegClass::Seg => enc::SEG_NAMES[enc as usize].to_owned(),
            RegClass::St => format!("st{enc}"),
            RegClass::Mm => format!("mm{enc}"),
        }
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Hardware encodings for the general-purpose registers.
pub mod enc {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R8: u8 = 8;
    pub const R9: u8 = 9;
    pub const R10: u8 = 10;
    pub const R11: u8 = 11;
    pub const R12: u8 = 12;
    pub const R13: u8 = 13;
    pub const R14: u8 = 14;
    pub const R15: u8 = 15;

    const GP64: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    const GP32: [&str; 16] = [
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
        "r12d", "r13d", "r14d", "r15d",
    ];
    const GP16: [&str; 16] = [
        "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w",
        "r13w", "r14w", "r15w",
    ];
    const GP8: [&str; 16] = [
        "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
        "r13b", "r14b", "r15b",
    ];
    const GP8_HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];

    pub(super) const SEG_NAMES: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];

    /// Return the name of a GPR encoding at the given width.
    ///
    /// # Panics
    ///
    /// Panics on an encoding that is not a valid GPR.
    #[must_use]
    pub fn gp_to_string(enc: u8, bits: u16, high_byte: bool) -> String {
        let enc = usize::from(enc);
        if high_byte {
            return GP8_HIGH[enc - 4].to_owned();
        }
        match bits {
            8 => GP8[enc].to_owned(),
            16 => GP16[enc].to_owned(),
            32 => GP32[enc].to_owned(),
            _ => GP64[enc].to_owned(),
        }
    }
}

pub const RAX: Reg = Reg::gp(64, enc::RAX);
pub const RCX: Reg = Reg::gp(64, enc::RCX);
pub const RDX: Reg = Reg::gp(64, enc::RDX);
pub const RBX: Reg = Reg::gp(64, enc::RBX);
pub const RSP: Reg = Reg::gp(64, enc::RSP);
pub const RBP: Reg = Reg::gp(64, enc::RBP);
pub const RSI: Reg = Reg::gp(64, enc::RSI);
pub const RDI: Reg = Reg::gp(64, enc::RDI);
pub const R8: Reg = Reg::gp(64, enc::R8);
pub const R9: Reg = Reg::gp(64, enc::R9);
pub const R10: Reg = Reg::gp(64, enc::R10);
pub const R11: Reg = Reg::gp(64, enc::R11);
pub const R12: Reg = Reg::gp(64, enc::R12);
pub const R13: Reg = Reg::gp(64, enc::R13);
pub const R14: Reg = Reg::gp(64, enc::R14);
pub const R15: Reg = Reg::gp(64, enc::R15);

pub const EAX: Reg = Reg::gp(32, enc::RAX);
pub const ECX: Reg = Reg::gp(32, enc::RCX);
pub const EDX: Reg = Reg::gp(32, enc::RDX);
pub const EBX: Reg = Reg::gp(32, enc::RBX);
pub const ESP: Reg = Reg::gp(32, enc::RSP);
pub const EBP: Reg = Reg::gp(32, enc::RBP);
pub const ESI: Reg = Reg::gp(32, enc::RSI);
pub const EDI: Reg = Reg::gp(32, enc::RDI);
pub const R8D: Reg = Reg::gp(32, enc::R8);
pub const R9D: Reg = Reg::gp(32, enc::R9);
pub const R10D: Reg = Reg::gp(32, enc::R10);
pub const R11D: Reg = Reg::gp(32, enc::R11);
pub const R12D: Reg = Reg::gp(32, enc::R12);
pub const R13D: Reg = Reg::gp(32, enc::R13);
pub const R14D: Reg = Reg::gp(32, enc::R14);
pub const R15D: Reg = Reg::gp(32, enc::R15);

pub const AX: Reg = Reg::gp(16, enc::RAX);
pub const CX: Reg = Reg::gp(16, enc::RCX);
pub const DX: Reg = Reg::gp(16, enc::RDX);
pub const BX: Reg = Reg::gp(16, enc::RBX);
pub const SP: Reg = Reg::gp(16, enc::RSP);
pub const BP: Reg = Reg::gp(16, enc::RBP);
pub const SI: Reg = Reg::gp(16, enc::RSI);
pub const DI: Reg = Reg::gp(16, enc::RDI);

pub const AL: Reg = Reg::gp(8, enc::RAX);
pub const CL: Reg = Reg::gp(8, enc::RCX);
pub const DL: Reg = Reg::gp(8, enc::RDX);
pub const BL: Reg = Reg::gp(8, enc::RBX);
pub const SPL: Reg = Reg::gp(8, enc::RSP);
pub const BPL: Reg = Reg::gp(8, enc::RBP);
pub const SIL: Reg = Reg::gp(8, enc::RSI);
pub const DIL: Reg = Reg::gp(8, enc::RDI);
pub const R8B: Reg = Reg::gp(8, enc::R8);
pub const R9B: Reg = Reg::gp(8, enc::R9);
pub const R10B: Reg = Reg::gp(8, enc::R10);
pub const R11B: Reg = Reg::gp(8, enc::R11);
pub const R12B: Reg = Reg::gp(8, enc::R12);
pub const R13B: Reg = Reg::gp(8, enc::R13);
pub const R14B: Reg = Reg::gp(8, enc::R14);
pub const R15B: Reg = Reg::gp(8, enc::R15);

pub const AH: Reg = Reg::gp_high(4);
pub const CH: Reg = Reg::gp_high(5);
pub const DH: Reg = Reg::gp_high(6);
pub const BH: Reg = Reg::gp_high(7);

macro_rules! vec_regs {
    ($bits:expr; $($name:ident = $enc:expr),+ $(,)?) => {
        $(pub const $name: Reg = Reg::vec($bits, $enc);)+
    };
}

vec_regs!(128;
    XMM0 = 0, XMM1 = 1, XMM2 = 2, XMM3 = 3, XMM4 = 4, XMM5 = 5, XMM6 = 6, XMM7 = 7,
    XMM8 = 8, XMM9 = 9, XMM10 = 10, XMM11 = 11, XMM12 = 12, XMM13 = 13, XMM14 = 14, XMM15 = 15,
    XMM16 = 16, XMM17 = 17, XMM18 = 18, XMM19 = 19, XMM20 = 20, XMM21 = 21, XMM22 = 22,
    XMM23 = 23, XMM24 = 24, XMM25 = 25, XMM26 = 26, XMM27 = 27, XMM28 = 28, XMM29 = 29,
    XMM30 = 30, XMM31 = 31,
);
vec_regs!(256;
    YMM0 = 0, YMM1 = 1, YMM2 = 2, YMM3 = 3, YMM4 = 4, YMM5 = 5, YMM6 = 6, YMM7 = 7,
    YMM8 = 8, YMM9 = 9, YMM10 = 10, YMM11 = 11, YMM12 = 12, YMM13 = 13, YMM14 = 14, YMM15 = 15,
    YMM16 = 16, YMM17 = 17, YMM18 = 18, YMM19 = 19, YMM20 = 20, YMM21 = 21, YMM22 = 22,
    YMM23 = 23, YMM24 = 24, YMM25 = 25, YMM26 = 26, YMM27 = 27, YMM28 = 28, YMM29 = 29,
    YMM30 = 30, YMM31 = 31,
);
vec_regs!(512;
    ZMM0 = 0, ZMM1 = 1, ZMM2 = 2, ZMM3 = 3, ZMM4 = 4, ZMM5 = 5, ZMM6 = 6, ZMM7 = 7,
    ZMM8 = 8, ZMM9 = 9, ZMM10 = 10, ZMM11 = 11, ZMM12 = 12, ZMM13 = 13, ZMM14 = 14, ZMM15 = 15,
    ZMM16 = 16, ZMM17 = 17, ZMM18 = 18, ZMM19 = 19, ZMM20 = 20, ZMM21 = 21, ZMM22 = 22,
    ZMM23 = 23, ZMM24 = 24, ZMM25 = 25, ZMM26 = 26, ZMM27 = 27, ZMM28 = 28, ZMM29 = 29,
    ZMM30 = 30, ZMM31 = 31,
);

pub const K0: Reg = Reg::mask(0);
pub const K1: Reg = Reg::mask(1);
pub const K2: Reg = Reg::mask(2);
pub const K3: Reg = Reg::mask(3);
pub const K4: Reg = Reg::mask(4);
pub const K5: Reg = Reg::mask(5);
pub const K6: Reg = Reg::mask(6);
pub const K7: Reg = Reg::mask(7);

pub const ES: Reg = Reg::seg(0);
pub const CS: Reg = Reg::seg(1);
pub const SS: Reg = Reg::seg(2);
pub const DS: Reg = Reg::seg(3);
pub const FS: Reg = Reg::seg(4);
pub const GS: Reg = Reg::seg(5);

pub const ST0: Reg = Reg::st(0);
pub const ST1: Reg = Reg::st(1);
pub const ST2: Reg = Reg::st(2);
pub const ST3: Reg = Reg::st(3);
pub const ST4: Reg = Reg::st(4);
pub const ST5: Reg = Reg::st(5);
pub const ST6: Reg = Reg::st(6);
pub const ST7: Reg = Reg::st(7);

pub const MM0: Reg = Reg::mm(0);
pub const MM1: Reg = Reg::mm(1);
pub const MM2: Reg = Reg::mm(2);
pub const MM3: Reg = Reg::mm(3);
pub const MM4: Reg = Reg::mm(4);
pub const MM5: Reg = Reg::mm(5);
pub const MM6: Reg = Reg::mm(6);
pub const MM7: Reg = Reg::mm(7);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_and_bits() {
        assert_eq!(RAX.size_bits(), 64);
        assert_eq!(EAX.size_bits(), 32);
        assert_eq!(AX.size_bits(), 16);
        assert_eq!(AL.size_bits(), 8);
        assert_eq!(R8.enc(), 8);
        assert!(R8.needs_rex_extension());
        assert!(!RDI.needs_rex_extension());
        assert_eq!(R13.enc3(), 5);
    }

    #[test]
    fn byte_register_flavors() {
        assert!(AH.is_high_byte());
        assert!(!AL.is_high_byte());
        assert!(SIL.is_uniform_byte());
        assert!(!AH.is_uniform_byte());
        assert_eq!(AH.enc(), 4);
        assert_eq!(AH.name(), "ah");
        assert_eq!(SPL.name(), "spl");
    }

    #[test]
    fn virtual_registers() {
        let v = Reg::virt(RegClass::Gp, 64, 3);
        assert!(v.is_virtual());
        assert_eq!(v.virt_id(), Some(3));
        assert_eq!(v.name(), "v3");
    }

    #[test]
    fn vector_names() {
        assert_eq!(XMM13.name(), "xmm13");
        assert_eq!(YMM4.name(), "ymm4");
        assert_eq!(ZMM31.name(), "zmm31");
        assert_eq!(K5.name(), "k5");
    }
}
