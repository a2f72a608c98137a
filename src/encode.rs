//! Mid-level encoder primitives.
//!
//! Everything here assumes the dispatcher has already matched an operand
//! shape; these helpers validate register constraints (mode, virtual
//! registers, high-byte/REX conflicts), choose and emit prefixes, and lay
//! down opcode, ModR/M, SIB, displacement and immediate bytes. All
//! validation happens before the first byte is written so that a failed
//! emission leaves the buffer untouched.

use crate::buffer::{CodeBuffer, Label};
use crate::error::{AsmResult, Error};
use crate::evex::{EvexLength, EvexPrefix};
use crate::inst::{EmitOptions, InstId};
use crate::mem::{emit_modrm_sib_disp, Amode, AmodeKind};
use crate::operand::Operand;
use crate::reg::{Reg, RegClass};
use crate::rex::{encode_modrm, RexFlags};
use crate::vex::{OpcodeMap, Pp, VexPrefix};

/// Operand size of an integer operation; selects the `0x66` prefix and,
/// together with the explicit W flag, the REX prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpSize {
    Byte,
    Word,
    Long,
    Quad,
}

impl OpSize {
    pub(crate) fn from_bits(bits: u16) -> Self {
        match bits {
            8 => OpSize::Byte,
            16 => OpSize::Word,
            32 => OpSize::Long,
            _ => OpSize::Quad,
        }
    }

    pub(crate) fn bits(self) -> u16 {
        match self {
            OpSize::Byte => 8,
            OpSize::Word => 16,
            OpSize::Long => 32,
            OpSize::Quad => 64,
        }
    }

    /// True for 64-bit operand size, which sets REX.W.
    pub(crate) fn is_quad(self) -> bool {
        self == OpSize::Quad
    }
}

/// A register-or-memory r/m operand.
#[derive(Clone, Copy)]
pub(crate) enum RegMem<'a> {
    Reg(Reg),
    Mem(&'a Amode),
}

/// The segment-override prefix byte for a segment register encoding.
fn seg_prefix(seg: Reg) -> u8 {
    const PREFIXES: [u8; 6] = [0x26, 0x2e, 0x36, 0x3e, 0x64, 0x65];
    PREFIXES[usize::from(seg.enc())]
}

/// Emit 1-3 opcode bytes, most significant first.
fn put_opcode(buf: &mut CodeBuffer, op: u32) {
    debug_assert!(op <= 0xff_ffff);
    if op > 0xffff {
        #[allow(clippy::cast_possible_truncation)]
        buf.put1((op >> 16) as u8);
    }
    if op > 0xff {
        #[allow(clippy::cast_possible_truncation)]
        buf.put1((op >> 8) as u8);
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.put1(op as u8);
}

/// One in-flight instruction emission: the buffer, the target mode, and the
/// mnemonic for error reporting.
pub(crate) struct Enc<'a> {
    pub buf: &'a mut CodeBuffer,
    pub x86: bool,
    pub inst: InstId,
}

impl Enc<'_> {
    pub(crate) fn size_err(&self, msg: impl Into<String>) -> Error {
        Error::InvalidOperandSize {
            inst: self.inst.mnemonic(),
            msg: msg.into(),
        }
    }

    pub(crate) fn combo_err(&self, msg: impl Into<String>) -> Error {
        Error::InvalidRegCombination {
            inst: self.inst.mnemonic(),
            msg: msg.into(),
        }
    }

    pub(crate) fn shape_err(&self, operands: &[Operand]) -> Error {
        Error::InvalidOperandShape {
            inst: self.inst.mnemonic(),
            shape: Operand::shape_of(operands),
        }
    }

    /// Per-register validity in the active mode.
    fn check_reg(&self, r: Reg) -> AsmResult<()> {
        if r.is_virtual() {
            return Err(Error::InvalidArgument(format!(
                "virtual register {r} cannot be encoded; resolve it through the ABI layer first"
            )));
        }
        if self.x86 {
            if r.needs_rex_extension() {
                return Err(self.combo_err(format!("{r} requires a REX prefix, unavailable in 32-bit mode")));
            }
            if r.class() == RegClass::Gp && r.size_bits() == 64 {
                return Err(self.size_err(format!("{r} is not addressable in 32-bit mode")));
            }
            if r.is_uniform_byte() {
                return Err(self.combo_err(format!("{r} is not addressable in 32-bit mode")));
            }
        }
        Ok(())
    }

    /// Validity of a vector register outside EVEX encodings, which cannot
    /// reach `xmm16`..`xmm31`.
    fn check_vec_non_evex(&self, r: Reg) -> AsmResult<()> {
        self.check_reg(r)?;
        if r.enc() >= 16 {
            return Err(self.combo_err(format!("{r} is only addressable with an EVEX prefix")));
        }
        Ok(())
    }

    /// Per-register validity in a legacy (non-VEX/EVEX) encoding.
    fn check_legacy_reg(&self, r: Reg) -> AsmResult<()> {
        match r.class() {
            RegClass::Vec => self.check_vec_non_evex(r),
            _ => self.check_reg(r),
        }
    }

    /// Validate the registers of a memory operand.
    fn check_mem(&self, mem: &Amode) -> AsmResult<()> {
        if self.x86 {
            if let AmodeKind::RipRelative { .. } = mem.kind {
                return Err(Error::InvalidArgument(
                    "rip-relative addressing requires 64-bit mode".to_owned(),
                ));
            }
        }
        let mut sizes = [None, None];
        for (i, r) in mem.regs().enumerate() {
            if r.is_virtual() {
                return Err(Error::InvalidArgument(format!(
                    "virtual register {r} cannot be encoded; resolve it through the ABI layer first"
                )));
            }
            if self.x86 {
                if r.needs_rex_extension() {
                    return Err(self.combo_err(format!("{r} requires a REX prefix, unavailable in 32-bit mode")));
                }
                if r.size_bits() != 32 {
                    return Err(self.size_err(format!("address register {r} must be 32-bit in 32-bit mode")));
                }
            } else if r.size_bits() != 64 && r.size_bits() != 32 {
                return Err(self.size_err(format!("address register {r} must be 32- or 64-bit")));
            }
            sizes[i.min(1)] = Some(r.size_bits());
        }
        if let [Some(a), Some(b)] = sizes {
            if a != b {
                return Err(self.size_err("base and index registers differ in width"));
            }
        }
        Ok(())
    }

    /// Compute the REX specification for the named registers and reject
    /// combinations that cannot carry one: a high-byte register together with
    /// REX.W, an extended register, or a uniform-byte register.
    fn rex_for(&self, w: bool, regs: &[Reg]) -> AsmResult<RexFlags> {
        debug_assert!(!(w && self.x86), "REX.W leaked into 32-bit mode");
        let mut rex = if w { RexFlags::set_w() } else { RexFlags::clear_w() };
        for r in regs {
            if r.is_uniform_byte() {
                rex.always_emit();
            }
        }
        let rex_needed = rex.has_w()
            || rex.must_always_emit()
            || regs.iter().any(|r| r.needs_rex_extension());
        if rex_needed && regs.iter().any(Reg::is_high_byte) {
            let high = regs.iter().find(|r| r.is_high_byte()).unwrap();
            return Err(self.combo_err(format!(
                "high-byte register {high} cannot be encoded in an instruction requiring REX"
            )));
        }
        Ok(rex)
    }

    /// Emit legacy prefixes in their canonical order: segment override,
    /// address-size override, operand-size override, mandatory prefix.
    fn legacy_prefixes(&mut self, mem: Option<&Amode>, size: OpSize, mandatory: Option<u8>) {
        if let Some(mem) = mem {
            if let Some(seg) = mem.seg {
                self.buf.put1(seg_prefix(seg));
            }
            if !self.x86 && mem.is_addr32() {
                self.buf.put1(0x67);
            }
        }
        if size == OpSize::Word {
            self.buf.put1(0x66);
        }
        if let Some(p) = mandatory {
            self.buf.put1(p);
        }
    }

    fn emit_rex_for_mem(&mut self, rex: RexFlags, enc_g: u8, mem: &Amode) {
        match mem.kind {
            AmodeKind::Base { base } => rex.emit_two_op(self.buf, enc_g, base.enc()),
            AmodeKind::BaseIndex { base, index, .. } => {
                let enc_base = base.map_or(0, |b| b.enc());
                rex.emit_three_op(self.buf, enc_g, index.enc(), enc_base);
            }
            AmodeKind::Abs | AmodeKind::RipRelative { .. } => {
                rex.emit_two_op(self.buf, enc_g, 0);
            }
        }
    }

    /// `opcode /r` with both operands in registers: `reg` in the reg field,
    /// `rm` in r/m with `mod=11`.
    pub(crate) fn legacy_rr(
        &mut self,
        opcode: u32,
        mandatory: Option<u8>,
        size: OpSize,
        w: bool,
        reg: Reg,
        rm: Reg,
    ) -> AsmResult<()> {
        self.check_legacy_reg(reg)?;
        self.check_legacy_reg(rm)?;
        let rex = self.rex_for(w, &[reg, rm])?;
        self.legacy_prefixes(None, size, mandatory);
        rex.emit_two_op(self.buf, reg.enc(), rm.enc());
        put_opcode(self.buf, opcode);
        self.buf.put1(encode_modrm(0b11, reg.enc3(), rm.enc3()));
        Ok(())
    }

    /// `opcode /r` with a memory r/m operand. `bytes_at_end` counts the
    /// immediate bytes the caller will append, for RIP-relative compensation.
    pub(crate) fn legacy_rm(
        &mut self,
        opcode: u32,
        mandatory: Option<u8>,
        size: OpSize,
        w: bool,
        reg: Reg,
        mem: &Amode,
        bytes_at_end: u8,
    ) -> AsmResult<()> {
        self.check_legacy_reg(reg)?;
        self.check_mem(mem)?;
        let mut regs: smallvec::SmallVec<[Reg; 3]> = smallvec::smallvec![reg];
        regs.extend(mem.regs());
        let rex = self.rex_for(w, &regs)?;
        self.legacy_prefixes(Some(mem), size, mandatory);
        self.emit_rex_for_mem(rex, reg.enc(), mem);
        put_opcode(self.buf, opcode);
        emit_modrm_sib_disp(self.buf, reg.enc(), mem, bytes_at_end, None, self.x86);
        Ok(())
    }

    /// `opcode /digit` with a register r/m operand.
    pub(crate) fn legacy_digit_r(
        &mut self,
        opcode: u32,
        mandatory: Option<u8>,
        size: OpSize,
        w: bool,
        digit: u8,
        rm: Reg,
    ) -> AsmResult<()> {
        debug_assert!(digit < 8);
        self.check_legacy_reg(rm)?;
        let rex = self.rex_for(w, &[rm])?;
        self.legacy_prefixes(None, size, mandatory);
        rex.emit_one_op(self.buf, rm.enc());
        put_opcode(self.buf, opcode);
        self.buf.put1(encode_modrm(0b11, digit, rm.enc3()));
        Ok(())
    }

    /// `opcode /digit` with a memory r/m operand.
    pub(crate) fn legacy_digit_m(
        &mut self,
        opcode: u32,
        mandatory: Option<u8>,
        size: OpSize,
        w: bool,
        digit: u8,
        mem: &Amode,
        bytes_at_end: u8,
    ) -> AsmResult<()> {
        debug_assert!(digit < 8);
        self.check_mem(mem)?;
        let regs: smallvec::SmallVec<[Reg; 2]> = mem.regs().collect();
        let rex = self.rex_for(w, &regs)?;
        self.legacy_prefixes(Some(mem), size, mandatory);
        self.emit_rex_for_mem(rex, digit, mem);
        put_opcode(self.buf, opcode);
        emit_modrm_sib_disp(self.buf, digit, mem, bytes_at_end, None, self.x86);
        Ok(())
    }

    /// An opcode with the register coded in its low three bits
    /// (`push`/`pop`/`mov r, imm` O-forms).
    pub(crate) fn legacy_o(
        &mut self,
        opcode: u8,
        size: OpSize,
        w: bool,
        reg: Reg,
    ) -> AsmResult<()> {
        self.check_legacy_reg(reg)?;
        let rex = self.rex_for(w, &[reg])?;
        self.legacy_prefixes(None, size, None);
        rex.emit_one_op(self.buf, reg.enc());
        self.buf.put1(opcode + reg.enc3());
        Ok(())
    }

    /// A bare opcode with no ModR/M byte, optionally behind a mandatory
    /// prefix (string ops, fences, `ret`, ...).
    pub(crate) fn plain(&mut self, opcode: u32, mandatory: Option<u8>, size: OpSize, w: bool) -> AsmResult<()> {
        if w && self.x86 {
            return Err(self.size_err("64-bit operation in 32-bit mode"));
        }
        self.legacy_prefixes(None, size, mandatory);
        if w {
            RexFlags::set_w().emit_one_op(self.buf, 0);
        }
        put_opcode(self.buf, opcode);
        Ok(())
    }

    /// Append an immediate of the given encoded width.
    pub(crate) fn put_imm(&mut self, value: i64, width: OpSize) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        match width {
            OpSize::Byte => self.buf.put1(value as u8),
            OpSize::Word => self.buf.put2(value as u16),
            OpSize::Long => self.buf.put4(value as u32),
            OpSize::Quad => self.buf.put8(value as u64),
        }
    }

    /// Emit a PC-relative branch, choosing between the short (rel8) and near
    /// (rel32) forms.
    ///
    /// Bound targets pick the short form whenever the displacement fits.
    /// Unbound targets default to the near form with a `Rel32` relocation
    /// site; `force_short` pins the rel8 form and registers a `Rel8` site
    /// that fails at bind time if the distance ends up too large.
    pub(crate) fn branch(
        &mut self,
        label: Label,
        short_opcode: &[u8],
        near_opcode: &[u8],
        force_short: bool,
    ) -> AsmResult<()> {
        let cur = i64::from(self.buf.cur_offset());
        match self.buf.label_offset(label) {
            Some(target) => {
                let disp8 = i64::from(target) - (cur + short_opcode.len() as i64 + 1);
                if let Ok(disp8) = i8::try_from(disp8) {
                    self.buf.put_bytes(short_opcode);
                    #[allow(clippy::cast_sign_loss)]
                    self.buf.put1(disp8 as u8);
                    return Ok(());
                }
                if force_short {
                    return Err(Error::Rel8OutOfRange { label, disp: disp8 });
                }
                let disp32 = i64::from(target) - (cur + near_opcode.len() as i64 + 4);
                let disp32 = i32::try_from(disp32).expect("branch displacement exceeds i32");
                self.buf.put_bytes(near_opcode);
                #[allow(clippy::cast_sign_loss)]
                self.buf.put4(disp32 as u32);
                Ok(())
            }
            None if force_short => {
                self.buf.put_bytes(short_opcode);
                let patch = self.buf.cur_offset();
                self.buf.put1(0);
                self.buf.use_rel8_at(label, patch)
            }
            None => {
                self.buf.put_bytes(near_opcode);
                let patch = self.buf.cur_offset();
                self.buf.put4(0);
                self.buf.use_rel32_at(label, patch)
            }
        }
    }

    /// Emit a VEX-encoded instruction. `vvvv` is the non-destructive source
    /// (`None` encodes as `0b1111`), `l` is the 128/256 length bit, and any
    /// trailing immediate is passed so memory forms can compensate
    /// RIP-relative displacements.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn vex_op(
        &mut self,
        opcode: u8,
        map: OpcodeMap,
        pp: Pp,
        w: bool,
        l: u8,
        reg: Reg,
        vvvv: Option<Reg>,
        rm: &RegMem<'_>,
        imm: Option<u8>,
    ) -> AsmResult<()> {
        self.check_vec_reg_operand(reg)?;
        if let Some(v) = vvvv {
            self.check_vec_reg_operand(v)?;
        }
        let vvvv_enc = vvvv.map_or(0, |v| v.enc());
        match rm {
            RegMem::Reg(r) => {
                self.check_vec_reg_operand(*r)?;
                let prefix =
                    VexPrefix::three_op(reg.enc(), vvvv_enc, (Some(r.enc()), None), l, pp, map, w);
                prefix.encode(self.buf);
                self.buf.put1(opcode);
                self.buf.put1(encode_modrm(0b11, reg.enc3(), r.enc3()));
            }
            RegMem::Mem(mem) => {
                self.check_mem(mem)?;
                let (b, x) = mem_extension_bits(mem);
                if let Some(seg) = mem.seg {
                    self.buf.put1(seg_prefix(seg));
                }
                if !self.x86 && mem.is_addr32() {
                    self.buf.put1(0x67);
                }
                let prefix = VexPrefix::three_op(reg.enc(), vvvv_enc, (b, x), l, pp, map, w);
                prefix.encode(self.buf);
                self.buf.put1(opcode);
                let trailing = u8::from(imm.is_some());
                emit_modrm_sib_disp(self.buf, reg.enc(), mem, trailing, None, self.x86);
            }
        }
        if let Some(imm) = imm {
            self.buf.put1(imm);
        }
        Ok(())
    }

    /// Emit an EVEX-encoded instruction. `disp_scale` is the disp8*N factor
    /// (the memory-access granularity in bytes); `opts` supplies the write
    /// mask, zeroing and broadcast selections.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn evex_op(
        &mut self,
        opcode: u8,
        map: OpcodeMap,
        pp: Pp,
        w: bool,
        len: EvexLength,
        reg: Reg,
        vvvv: Option<Reg>,
        rm: &RegMem<'_>,
        opts: &EmitOptions,
        disp_scale: i8,
        imm: Option<u8>,
    ) -> AsmResult<()> {
        self.check_reg(reg)?;
        if let Some(v) = vvvv {
            self.check_reg(v)?;
        }
        let aaa = match opts.mask {
            Some(k) => {
                if k.class() != RegClass::Mask {
                    return Err(Error::InvalidArgument(format!(
                        "{k} is not a write-mask register"
                    )));
                }
                if k.enc() == 0 {
                    return Err(Error::InvalidArgument(
                        "k0 cannot be selected as a write mask".to_owned(),
                    ));
                }
                k.enc()
            }
            None => 0,
        };
        if opts.zeroing && aaa == 0 {
            return Err(Error::InvalidArgument(
                "zeroing-masking requires a write mask".to_owned(),
            ));
        }
        if opts.broadcast && !matches!(rm, RegMem::Mem(_)) {
            return Err(Error::InvalidArgument(
                "embedded broadcast requires a memory operand".to_owned(),
            ));
        }
        let vvvv_enc = vvvv.map_or(0, |v| v.enc());
        match rm {
            RegMem::Reg(r) => {
                self.check_reg(*r)?;
                let prefix = EvexPrefix::new(
                    reg.enc(),
                    vvvv_enc,
                    (Some(r.enc()), Some(r.enc() >> 1)),
                    len,
                    pp,
                    map,
                    w,
                    aaa,
                    opts.zeroing,
                    false,
                );
                prefix.encode(self.buf);
                self.buf.put1(opcode);
                self.buf.put1(encode_modrm(0b11, reg.enc3(), r.enc3()));
            }
            RegMem::Mem(mem) => {
                self.check_mem(mem)?;
                if let Some(seg) = mem.seg {
                    self.buf.put1(seg_prefix(seg));
                }
                if !self.x86 && mem.is_addr32() {
                    self.buf.put1(0x67);
                }
                let (b, x) = mem_extension_bits(mem);
                let prefix = EvexPrefix::new(
                    reg.enc(),
                    vvvv_enc,
                    (b, x),
                    len,
                    pp,
                    map,
                    w,
                    aaa,
                    opts.zeroing,
                    opts.broadcast,
                );
                prefix.encode(self.buf);
                self.buf.put1(opcode);
                let trailing = u8::from(imm.is_some());
                emit_modrm_sib_disp(
                    self.buf,
                    reg.enc(),
                    mem,
                    trailing,
                    Some(disp_scale),
                    self.x86,
                );
            }
        }
        if let Some(imm) = imm {
            self.buf.put1(imm);
        }
        Ok(())
    }

    /// A vector register valid under VEX (or a GPR source); EVEX-only
    /// encodings are rejected here.
    fn check_vec_reg_operand(&self, r: Reg) -> AsmResult<()> {
        match r.class() {
            RegClass::Vec => self.check_vec_non_evex(r),
            _ => self.check_reg(r),
        }
    }
}

fn mem_extension_bits(mem: &Amode) -> (Option<u8>, Option<u8>) {
    match mem.kind {
        AmodeKind::Base { base } => (Some(base.enc()), None),
        AmodeKind::BaseIndex { base, index, .. } => {
            (Some(base.map_or(0, |b| b.enc())), Some(index.enc()))
        }
        AmodeKind::Abs | AmodeKind::RipRelative { .. } => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{AH, BH, R10, RAX, RBX, RCX, SIL};

    fn enc(buf: &mut CodeBuffer) -> Enc<'_> {
        Enc {
            buf,
            x86: false,
            inst: InstId::Mov,
        }
    }

    #[test]
    fn rr_with_and_without_rex() {
        let mut buf = CodeBuffer::new();
        // mov rax, rcx: 48 89 C8.
        enc(&mut buf)
            .legacy_rr(0x89, None, OpSize::Quad, true, RCX, RAX)
            .unwrap();
        assert_eq!(buf.data(), &[0x48, 0x89, 0xc8]);

        let mut buf = CodeBuffer::new();
        // mov ebx, r10d: 44 89 D3.
        enc(&mut buf)
            .legacy_rr(0x89, None, OpSize::Long, false, R10.with_size(32), RBX.with_size(32))
            .unwrap();
        assert_eq!(buf.data(), &[0x44, 0x89, 0xd3]);
    }

    #[test]
    fn high_byte_conflicts() {
        let mut buf = CodeBuffer::new();
        // mov ah, bh is fine: 88 FC.
        enc(&mut buf)
            .legacy_rr(0x88, None, OpSize::Byte, false, BH, AH)
            .unwrap();
        assert_eq!(buf.data(), &[0x88, 0xfc]);

        // mov sil, ah needs REX for sil, which ah cannot coexist with.
        let mut buf = CodeBuffer::new();
        let err = enc(&mut buf)
            .legacy_rr(0x88, None, OpSize::Byte, false, AH, SIL)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRegCombination { .. }));
        assert!(buf.data().is_empty(), "failed emission writes nothing");

        // mov r10b, ah likewise.
        let mut buf = CodeBuffer::new();
        let err = enc(&mut buf)
            .legacy_rr(0x88, None, OpSize::Byte, false, AH, R10.with_size(8))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRegCombination { .. }));
    }

    #[test]
    fn uniform_byte_forces_rex() {
        let mut buf = CodeBuffer::new();
        // mov sil, al: 40 88 C6.
        enc(&mut buf)
            .legacy_rr(0x88, None, OpSize::Byte, false, RAX.with_size(8), SIL)
            .unwrap();
        assert_eq!(buf.data(), &[0x40, 0x88, 0xc6]);
    }

    #[test]
    fn mode_32_rejects_extended_and_wide() {
        let mut buf = CodeBuffer::new();
        let mut e = Enc {
            buf: &mut buf,
            x86: true,
            inst: InstId::Mov,
        };
        assert!(matches!(
            e.legacy_rr(0x89, None, OpSize::Quad, false, RCX, RAX),
            Err(Error::InvalidOperandSize { .. })
        ));
        assert!(matches!(
            e.legacy_rr(0x89, None, OpSize::Long, false, R10.with_size(32), RAX.with_size(32)),
            Err(Error::InvalidRegCombination { .. })
        ));
    }
}
