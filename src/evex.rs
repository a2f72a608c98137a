//! Encoding logic for EVEX-prefixed (AVX-512) instructions.

use crate::buffer::CodeBuffer;
use crate::vex::{OpcodeMap, Pp};

/// An EVEX prefix; always four bytes, the first being `0x62`.
pub struct EvexPrefix {
    byte1: u8,
    byte2: u8,
    byte3: u8,
}

/// EVEX register fields carry bit 3 of a 5-bit encoding inverted (and bit 4
/// in the primed fields, also inverted).
#[inline(always)]
fn invert_top_bit(enc: u8) -> u8 {
    (!(enc >> 3)) & 1
}

/// The `L'L` vector-length field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvexLength {
    L128 = 0b00,
    L256 = 0b01,
    L512 = 0b10,
}

//         ┌───┬───┬───┬───┬───┬───┬───┬───┐
// Byte 1: │ R │ X │ B │ R'│ 0 │ 0 │ m │ m │
//         ├───┼───┼───┼───┼───┼───┼───┼───┤
// Byte 2: │ W │ v │ v │ v │ v │ 1 │ p │ p │
//         ├───┼───┼───┼───┼───┼───┼───┼───┤
// Byte 3: │ z │ L'│ L │ b │ V'│ a │ a │ a │
//         └───┴───┴───┴───┴───┴───┴───┴───┘

impl EvexPrefix {
    /// Construct the prefix. `reg` and `vvvv` are 5-bit HW encodings,
    /// `(b, x)` the optional base/index encodings, `aaa` the write-mask
    /// register (`k0` means no masking), `z` selects zeroing-masking over
    /// merge-masking, and `broadcast` sets the embedded broadcast bit for
    /// memory operands.
    ///
    /// For a *register* r/m operand, `X` extends `B` to five bits: pass
    /// `(Some(enc), Some(enc >> 1))` so that `X` picks up bit 4 of the
    /// encoding.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        reg: u8,
        vvvv: u8,
        (b, x): (Option<u8>, Option<u8>),
        ll: EvexLength,
        pp: Pp,
        mmm: OpcodeMap,
        w: bool,
        aaa: u8,
        z: bool,
        broadcast: bool,
    ) -> Self {
        let r = invert_top_bit(reg);
        let r_prime = invert_top_bit(reg >> 1);
        let b = invert_top_bit(b.unwrap_or(0));
        let x = invert_top_bit(x.unwrap_or(0));
        let vvvv_value = !vvvv & 0b1111;
        let v_prime = !(vvvv >> 4) & 0b1;

        let byte1 = r << 7 | x << 6 | b << 5 | r_prime << 4 | mmm as u8;

        debug_assert!(vvvv <= 0b11111);
        let byte2 = u8::from(w) << 7 | vvvv_value << 3 | 0b100 | (pp as u8);

        debug_assert!(aaa <= 0b111);
        debug_assert!(
            !(z && aaa == 0),
            "zeroing-masking requires a mask register other than k0"
        );
        let byte3 = u8::from(z) << 7
            | (ll as u8) << 5
            | u8::from(broadcast) << 4
            | v_prime << 3
            | aaa;

        Self {
            byte1,
            byte2,
            byte3,
        }
    }

    /// Construct the prefix for a binary instruction (`vvvv` unused).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn two_op(
        reg: u8,
        (b, x): (Option<u8>, Option<u8>),
        ll: EvexLength,
        pp: Pp,
        mmm: OpcodeMap,
        w: bool,
        aaa: u8,
        z: bool,
        broadcast: bool,
    ) -> Self {
        Self::new(reg, 0, (b, x), ll, pp, mmm, w, aaa, z, broadcast)
    }

    /// Append the four prefix bytes.
    pub(crate) fn encode(&self, buf: &mut CodeBuffer) {
        buf.put1(0x62);
        buf.put1(self.byte1);
        buf.put1(self.byte2);
        buf.put1(self.byte3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(p: &EvexPrefix) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        p.encode(&mut buf);
        buf.data().to_vec()
    }

    #[test]
    fn unmasked_zmm() {
        // vaddps zmm0, zmm1, zmm2: 62 F1 74 48 58 C2.
        let p = EvexPrefix::new(
            0,
            1,
            (Some(2), None),
            EvexLength::L512,
            Pp::None,
            OpcodeMap::M0F,
            false,
            0,
            false,
            false,
        );
        assert_eq!(bytes(&p), vec![0x62, 0xf1, 0x74, 0x48]);
    }

    #[test]
    fn masked_zeroing() {
        // vaddps zmm0{k1}{z}, zmm1, zmm2: 62 F1 74 C9 58 C2.
        let p = EvexPrefix::new(
            0,
            1,
            (Some(2), None),
            EvexLength::L512,
            Pp::None,
            OpcodeMap::M0F,
            false,
            1,
            true,
            false,
        );
        assert_eq!(bytes(&p), vec![0x62, 0xf1, 0x74, 0xc9]);
    }

    #[test]
    fn high_registers_set_primed_bits() {
        // vaddps zmm24, zmm17, zmm26: 62 01 74 40 58 C2.
        let p = EvexPrefix::new(
            24,
            17,
            (Some(26), Some(26 >> 1)),
            EvexLength::L512,
            Pp::None,
            OpcodeMap::M0F,
            false,
            0,
            false,
            false,
        );
        assert_eq!(bytes(&p), vec![0x62, 0x01, 0x74, 0x40]);
    }

    #[test]
    fn broadcast_bit() {
        let p = EvexPrefix::new(
            0,
            1,
            (Some(0), None),
            EvexLength::L512,
            Pp::None,
            OpcodeMap::M0F,
            false,
            0,
            false,
            true,
        );
        assert_eq!(bytes(&p)[3], 0x58);
    }
}
