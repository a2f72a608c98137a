//! Encoding logic shared by all legacy-prefixed (non-VEX/EVEX) instructions:
//! ModR/M and SIB bytes, displacement classification, and the REX prefix.

use crate::buffer::CodeBuffer;

/// Encode the ModR/M byte.
#[inline]
#[must_use]
pub fn encode_modrm(m0d: u8, enc_reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    debug_assert!(enc_reg_g < 8);
    debug_assert!(rm_e < 8);
    ((m0d & 3) << 6) | ((enc_reg_g & 7) << 3) | (rm_e & 7)
}

/// Encode the SIB byte (scale-index-base).
#[inline]
#[must_use]
pub fn encode_sib(scale: u8, enc_index: u8, enc_base: u8) -> u8 {
    debug_assert!(scale < 4);
    debug_assert!(enc_index < 8);
    debug_assert!(enc_base < 8);
    ((scale & 3) << 6) | ((enc_index & 7) << 3) | (enc_base & 7)
}

/// A small bit field recording a REX prefix specification:
/// - bit 0 set indicates REX.W must be 1;
/// - bit 1 set indicates the prefix must be emitted even when all of its
///   variable bits are zero (needed to address `spl`/`bpl`/`sil`/`dil`).
#[repr(transparent)]
#[derive(Clone, Copy, Debug)]
pub struct RexFlags(u8);

impl RexFlags {
    /// A REX prefix with the W bit set (64-bit operand size).
    #[inline]
    #[must_use]
    pub fn set_w() -> Self {
        Self(1)
    }

    /// A REX prefix with the W bit cleared.
    #[inline]
    #[must_use]
    pub fn clear_w() -> Self {
        Self(0)
    }

    /// True if the W bit is set.
    #[inline]
    #[must_use]
    pub fn has_w(self) -> bool {
        (self.0 & 1) != 0
    }

    /// Require that the prefix byte is emitted even if it would be `0x40`.
    #[inline]
    pub fn always_emit(&mut self) -> &mut Self {
        self.0 |= 2;
        self
    }

    /// True if the prefix must be emitted unconditionally.
    #[inline]
    #[must_use]
    pub fn must_always_emit(self) -> bool {
        (self.0 & 2) != 0
    }

    /// Force emission of the REX byte when a byte-width access names one of
    /// the "uniform byte" registers `spl`, `bpl`, `sil`, `dil` (encodings 4
    /// to 7), which are otherwise indistinguishable from `ah`..`bh`.
    pub fn always_emit_if_uniform_byte(&mut self, enc: u8) {
        if (4..=7).contains(&enc) {
            self.always_emit();
        }
    }

    fn byte(self, r: u8, x: u8, b: u8) -> u8 {
        let w: u8 = self.has_w().into();
        0x40 | (w << 3) | (r << 2) | (x << 1) | b
    }

    /// True if this specification will put a prefix byte in the stream for
    /// the given extension bits; used to detect high-byte conflicts before
    /// any byte is written.
    #[must_use]
    pub fn would_emit(self, enc_g: u8, enc_index: u8, enc_base: u8) -> bool {
        let byte = self.byte((enc_g >> 3) & 1, (enc_index >> 3) & 1, (enc_base >> 3) & 1);
        byte != 0x40 || self.must_always_emit()
    }

    /// Emit for an instruction with one register operand coded in the opcode
    /// byte or the r/m field; REX.R and REX.X are unused.
    #[inline]
    pub fn emit_one_op(self, buf: &mut CodeBuffer, enc_e: u8) {
        let rex = self.byte(0, 0, (enc_e >> 3) & 1);
        if rex != 0x40 || self.must_always_emit() {
            buf.put1(rex);
        }
    }

    /// Emit for a `reg, r/m-register` instruction.
    #[inline]
    pub fn emit_two_op(self, buf: &mut CodeBuffer, enc_g: u8, enc_e: u8) {
        let rex = self.byte((enc_g >> 3) & 1, 0, (enc_e >> 3) & 1);
        if rex != 0x40 || self.must_always_emit() {
            buf.put1(rex);
        }
    }

    /// Emit for a `reg, [base + index]` instruction.
    #[inline]
    pub fn emit_three_op(self, buf: &mut CodeBuffer, enc_g: u8, enc_index: u8, enc_base: u8) {
        let rex = self.byte((enc_g >> 3) & 1, (enc_index >> 3) & 1, (enc_base >> 3) & 1);
        if rex != 0x40 || self.must_always_emit() {
            buf.put1(rex);
        }
    }
}

/// A classified ModR/M displacement.
#[derive(Copy, Clone, Debug)]
pub enum Disp {
    None,
    Disp8(i8),
    Disp32(i32),
}

impl Disp {
    /// Classify the displacement `val` for encoding alongside ModR/M/SIB
    /// bytes.
    ///
    /// For EVEX instructions, `evex_scaling` is the `Some(N)` compressed
    /// displacement factor of Intel SDM Vol. 2A §2.7.5: an 8-bit displacement
    /// encodes `disp8 * N`, so `val` only compresses when divisible by `N`.
    #[must_use]
    pub fn new(val: i32, evex_scaling: Option<i8>) -> Disp {
        if val == 0 {
            return Disp::None;
        }
        match evex_scaling {
            Some(scaling) => {
                if val % i32::from(scaling) == 0 {
                    let scaled = val / i32::from(scaling);
                    if let Ok(scaled) = i8::try_from(scaled) {
                        return Disp::Disp8(scaled);
                    }
                }
                Disp::Disp32(val)
            }
            None => match i8::try_from(val) {
                Ok(val) => Disp::Disp8(val),
                Err(_) => Disp::Disp32(val),
            },
        }
    }

    /// Turn `Disp::None` into an explicit zero `disp8`; required when the
    /// base register's low bits collide with the mod=00 special encodings
    /// (`rbp`/`r13` bases).
    pub fn force_immediate(&mut self) {
        if let Disp::None = self {
            *self = Disp::Disp8(0);
        }
    }

    /// The two "mod" bits this displacement selects.
    #[must_use]
    pub fn m0d(self) -> u8 {
        match self {
            Disp::None => 0b00,
            Disp::Disp8(_) => 0b01,
            Disp::Disp32(_) => 0b10,
        }
    }

    /// Append the displacement bytes.
    pub fn emit(self, buf: &mut CodeBuffer) {
        #[allow(clippy::cast_sign_loss)]
        match self {
            Disp::None => {}
            Disp::Disp8(n) => buf.put1(n as u8),
            Disp::Disp32(n) => buf.put4(n as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modrm_and_sib_bytes() {
        assert_eq!(encode_modrm(0b11, 1, 0), 0xc8);
        assert_eq!(encode_modrm(0b00, 0, 0b101), 0x05);
        assert_eq!(encode_sib(0b10, 1, 0), 0x88);
    }

    #[test]
    fn rex_emission() {
        let mut buf = CodeBuffer::new();
        RexFlags::set_w().emit_two_op(&mut buf, 1, 0);
        assert_eq!(buf.data(), &[0x48]);

        let mut buf = CodeBuffer::new();
        RexFlags::clear_w().emit_two_op(&mut buf, 1, 0);
        assert!(buf.data().is_empty(), "0x40 with no flags is elided");

        let mut buf = CodeBuffer::new();
        RexFlags::clear_w().emit_two_op(&mut buf, 9, 0);
        assert_eq!(buf.data(), &[0x44], "REX.R for an extended reg operand");

        let mut buf = CodeBuffer::new();
        let mut rex = RexFlags::clear_w();
        rex.always_emit_if_uniform_byte(6); // sil
        rex.emit_two_op(&mut buf, 6, 0);
        assert_eq!(buf.data(), &[0x40]);
    }

    #[test]
    fn disp_classification() {
        assert!(matches!(Disp::new(0, None), Disp::None));
        assert!(matches!(Disp::new(127, None), Disp::Disp8(127)));
        assert!(matches!(Disp::new(128, None), Disp::Disp32(128)));
        assert!(matches!(Disp::new(-128, None), Disp::Disp8(-128)));

        // disp8*N compression: 640 = 10 * 64 for a 64-byte access.
        assert!(matches!(Disp::new(640, Some(64)), Disp::Disp8(10)));
        assert!(matches!(Disp::new(644, Some(64)), Disp::Disp32(644)));

        let mut d = Disp::new(0, None);
        d.force_immediate();
        assert!(matches!(d, Disp::Disp8(0)));
    }
}
