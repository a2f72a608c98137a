//! The instruction dispatcher: one closed table from `(instruction id,
//! operand shape)` to an encoder primitive.
//!
//! Every arm validates widths before emitting; an unmatched shape is
//! `InvalidOperandShape` and a matched shape with a width violation is
//! `InvalidOperandSize`. The dispatcher never rewrites operands to make a
//! shape fit; in particular a width-mixed pair such as `mov r64, r32` is
//! rejected rather than implicitly promoted.

use crate::buffer::CodeBuffer;
use crate::encode::{Enc, OpSize, RegMem};
use crate::error::{AsmResult, Error};
use crate::evex::EvexLength;
use crate::imm::Imm;
use crate::inst::{Cond, EmitOptions, InstId, Rep};
use crate::mem::Amode;
use crate::operand::Operand;
use crate::reg::{Reg, RegClass};
use crate::vex::{OpcodeMap, Pp};

/// Encode one instruction into `buf`. This is the single entry point behind
/// [`crate::Assembler::emit`].
pub(crate) fn emit_inst(
    buf: &mut CodeBuffer,
    x86: bool,
    id: InstId,
    ops: &[Operand],
    opts: &EmitOptions,
) -> AsmResult<()> {
    let mut e = Enc { buf, x86, inst: id };
    use InstId as I;
    match id {
        // Integer ALU: opcode base and immediate-group digit.
        I::Add => alu(&mut e, 0x00, 0, ops),
        I::Or => alu(&mut e, 0x08, 1, ops),
        I::Adc => alu(&mut e, 0x10, 2, ops),
        I::Sbb => alu(&mut e, 0x18, 3, ops),
        I::And => alu(&mut e, 0x20, 4, ops),
        I::Sub => alu(&mut e, 0x28, 5, ops),
        I::Xor => alu(&mut e, 0x30, 6, ops),
        I::Cmp => alu(&mut e, 0x38, 7, ops),
        I::Test => test(&mut e, ops),

        I::Mov => mov(&mut e, ops),
        I::Movzx => widen(&mut e, ops, 0x0fb6, 0x0fb7, false),
        I::Movsx => widen(&mut e, ops, 0x0fbe, 0x0fbf, false),
        I::Movsxd => widen(&mut e, ops, 0, 0x63, true),
        I::Lea => lea(&mut e, ops),
        I::Xchg => xchg(&mut e, ops),
        I::Push => push_pop(&mut e, ops, true),
        I::Pop => push_pop(&mut e, ops, false),

        I::Inc => unary(&mut e, 0xfe, 0xff, 0, ops),
        I::Dec => unary(&mut e, 0xfe, 0xff, 1, ops),
        I::Not => unary(&mut e, 0xf6, 0xf7, 2, ops),
        I::Neg => unary(&mut e, 0xf6, 0xf7, 3, ops),
        I::Mul => unary(&mut e, 0xf6, 0xf7, 4, ops),
        I::Div => unary(&mut e, 0xf6, 0xf7, 6, ops),
        I::Idiv => unary(&mut e, 0xf6, 0xf7, 7, ops),
        I::Imul => imul(&mut e, ops),

        I::Rol => shift(&mut e, 0, ops),
        I::Ror => shift(&mut e, 1, ops),
        I::Rcl => shift(&mut e, 2, ops),
        I::Rcr => shift(&mut e, 3, ops),
        I::Shl => shift(&mut e, 4, ops),
        I::Shr => shift(&mut e, 5, ops),
        I::Sar => shift(&mut e, 7, ops),

        I::Bt => bit_test(&mut e, 0x0fa3, 4, ops),
        I::Bts => bit_test(&mut e, 0x0fab, 5, ops),
        I::Btr => bit_test(&mut e, 0x0fb3, 6, ops),
        I::Btc => bit_test(&mut e, 0x0fbb, 7, ops),
        I::Bsf => bit_scan(&mut e, 0x0fbc, None, ops),
        I::Bsr => bit_scan(&mut e, 0x0fbd, None, ops),
        I::Popcnt => bit_scan(&mut e, 0x0fb8, Some(0xf3), ops),
        I::Lzcnt => bit_scan(&mut e, 0x0fbd, Some(0xf3), ops),
        I::Tzcnt => bit_scan(&mut e, 0x0fbc, Some(0xf3), ops),

        I::Jmp => jmp(&mut e, ops, opts),
        I::Call => call(&mut e, ops),
        I::Ret => ret(&mut e, ops),
        I::Jcc(cc) => jcc(&mut e, cc, ops, opts),
        I::Setcc(cc) => setcc(&mut e, cc, ops),
        I::Cmovcc(cc) => cmovcc(&mut e, cc, ops),

        I::Nop => nullary(&mut e, 0x90, None, false, ops),
        I::Int3 => nullary(&mut e, 0xcc, None, false, ops),
        I::Ud2 => nullary(&mut e, 0x0f0b, None, false, ops),
        I::Cpuid => nullary(&mut e, 0x0fa2, None, false, ops),
        I::Pause => nullary(&mut e, 0x90, Some(0xf3), false, ops),
        I::Hlt => nullary(&mut e, 0xf4, None, false, ops),
        I::Leave => nullary(&mut e, 0xc9, None, false, ops),
        I::Cwde => nullary(&mut e, 0x98, None, false, ops),
        I::Cdqe => nullary(&mut e, 0x98, None, true, ops),
        I::Cdq => nullary(&mut e, 0x99, None, false, ops),
        I::Cqo => nullary(&mut e, 0x99, None, true, ops),
        I::Mfence => nullary(&mut e, 0x0f_aef0, None, false, ops),
        I::Lfence => nullary(&mut e, 0x0f_aee8, None, false, ops),
        I::Sfence => nullary(&mut e, 0x0f_aef8, None, false, ops),

        I::Movsb => string_op(&mut e, 0xa4, OpSize::Byte, ops, opts),
        I::Movsw => string_op(&mut e, 0xa5, OpSize::Word, ops, opts),
        I::Movsl => string_op(&mut e, 0xa5, OpSize::Long, ops, opts),
        I::Movsq => string_op(&mut e, 0xa5, OpSize::Quad, ops, opts),
        I::Stosb => string_op(&mut e, 0xaa, OpSize::Byte, ops, opts),
        I::Stosw => string_op(&mut e, 0xab, OpSize::Word, ops, opts),
        I::Stosl => string_op(&mut e, 0xab, OpSize::Long, ops, opts),
        I::Stosq => string_op(&mut e, 0xab, OpSize::Quad, ops, opts),
        I::Lodsb => string_op(&mut e, 0xac, OpSize::Byte, ops, opts),
        I::Lodsw => string_op(&mut e, 0xad, OpSize::Word, ops, opts),
        I::Lodsl => string_op(&mut e, 0xad, OpSize::Long, ops, opts),
        I::Lodsq => string_op(&mut e, 0xad, OpSize::Quad, ops, opts),
        I::Scasb => string_op(&mut e, 0xae, OpSize::Byte, ops, opts),
        I::Scasw => string_op(&mut e, 0xaf, OpSize::Word, ops, opts),
        I::Scasl => string_op(&mut e, 0xaf, OpSize::Long, ops, opts),
        I::Scasq => string_op(&mut e, 0xaf, OpSize::Quad, ops, opts),
        I::Cmpsb => string_op(&mut e, 0xa6, OpSize::Byte, ops, opts),
        I::Cmpsw => string_op(&mut e, 0xa7, OpSize::Word, ops, opts),
        I::Cmpsl => string_op(&mut e, 0xa7, OpSize::Long, ops, opts),
        I::Cmpsq => string_op(&mut e, 0xa7, OpSize::Quad, ops, opts),

        // SSE moves: load opcode / store opcode / mandatory prefix.
        I::Movaps => sse_mov(&mut e, 0x0f28, 0x0f29, None, ops),
        I::Movups => sse_mov(&mut e, 0x0f10, 0x0f11, None, ops),
        I::Movapd => sse_mov(&mut e, 0x0f28, 0x0f29, Some(0x66), ops),
        I::Movupd => sse_mov(&mut e, 0x0f10, 0x0f11, Some(0x66), ops),
        I::Movdqa => sse_mov(&mut e, 0x0f6f, 0x0f7f, Some(0x66), ops),
        I::Movdqu => sse_mov(&mut e, 0x0f6f, 0x0f7f, Some(0xf3), ops),
        I::Movss => sse_mov(&mut e, 0x0f10, 0x0f11, Some(0xf3), ops),
        I::Movsd => sse_mov(&mut e, 0x0f10, 0x0f11, Some(0xf2), ops),
        I::Movd => mov_d_q(&mut e, ops, false),
        I::Movq => mov_d_q(&mut e, ops, true),

        I::Addps => sse_rm(&mut e, 0x0f58, None, ops),
        I::Addpd => sse_rm(&mut e, 0x0f58, Some(0x66), ops),
        I::Addss => sse_rm(&mut e, 0x0f58, Some(0xf3), ops),
        I::Addsd => sse_rm(&mut e, 0x0f58, Some(0xf2), ops),
        I::Subps => sse_rm(&mut e, 0x0f5c, None, ops),
        I::Subpd => sse_rm(&mut e, 0x0f5c, Some(0x66), ops),
        I::Subss => sse_rm(&mut e, 0x0f5c, Some(0xf3), ops),
        I::Subsd => sse_rm(&mut e, 0x0f5c, Some(0xf2), ops),
        I::Mulps => sse_rm(&mut e, 0x0f59, None, ops),
        I::Mulpd => sse_rm(&mut e, 0x0f59, Some(0x66), ops),
        I::Mulss => sse_rm(&mut e, 0x0f59, Some(0xf3), ops),
        I::Mulsd => sse_rm(&mut e, 0x0f59, Some(0xf2), ops),
        I::Divps => sse_rm(&mut e, 0x0f5e, None, ops),
        I::Divpd => sse_rm(&mut e, 0x0f5e, Some(0x66), ops),
        I::Divss => sse_rm(&mut e, 0x0f5e, Some(0xf3), ops),
        I::Divsd => sse_rm(&mut e, 0x0f5e, Some(0xf2), ops),
        I::Minps => sse_rm(&mut e, 0x0f5d, None, ops),
        I::Minpd => sse_rm(&mut e, 0x0f5d, Some(0x66), ops),
        I::Minss => sse_rm(&mut e, 0x0f5d, Some(0xf3), ops),
        I::Minsd => sse_rm(&mut e, 0x0f5d, Some(0xf2), ops),
        I::Maxps => sse_rm(&mut e, 0x0f5f, None, ops),
        I::Maxpd => sse_rm(&mut e, 0x0f5f, Some(0x66), ops),
        I::Maxss => sse_rm(&mut e, 0x0f5f, Some(0xf3), ops),
        I::Maxsd => sse_rm(&mut e, 0x0f5f, Some(0xf2), ops),
        I::Sqrtps => sse_rm(&mut e, 0x0f51, None, ops),
        I::Sqrtpd => sse_rm(&mut e, 0x0f51, Some(0x66), ops),
        I::Sqrtss => sse_rm(&mut e, 0x0f51, Some(0xf3), ops),
        I::Sqrtsd => sse_rm(&mut e, 0x0f51, Some(0xf2), ops),
        I::Andps => sse_rm(&mut e, 0x0f54, None, ops),
        I::Andpd => sse_rm(&mut e, 0x0f54, Some(0x66), ops),
        I::Orps => sse_rm(&mut e, 0x0f56, None, ops),
        I::Orpd => sse_rm(&mut e, 0x0f56, Some(0x66), ops),
        I::Xorps => sse_rm(&mut e, 0x0f57, None, ops),
        I::Xorpd => sse_rm(&mut e, 0x0f57, Some(0x66), ops),
        I::Pand => sse_rm(&mut e, 0x0fdb, Some(0x66), ops),
        I::Por => sse_rm(&mut e, 0x0feb, Some(0x66), ops),
        I::Pxor => sse_rm(&mut e, 0x0fef, Some(0x66), ops),
        I::Paddb => sse_rm(&mut e, 0x0ffc, Some(0x66), ops),
        I::Paddw => sse_rm(&mut e, 0x0ffd, Some(0x66), ops),
        I::Paddd => sse_rm(&mut e, 0x0ffe, Some(0x66), ops),
        I::Paddq => sse_rm(&mut e, 0x0fd4, Some(0x66), ops),
        I::Psubb => sse_rm(&mut e, 0x0ff8, Some(0x66), ops),
        I::Psubw => sse_rm(&mut e, 0x0ff9, Some(0x66), ops),
        I::Psubd => sse_rm(&mut e, 0x0ffa, Some(0x66), ops),
        I::Psubq => sse_rm(&mut e, 0x0ffb, Some(0x66), ops),
        I::Ucomiss => sse_rm(&mut e, 0x0f2e, None, ops),
        I::Ucomisd => sse_rm(&mut e, 0x0f2e, Some(0x66), ops),
        I::Comiss => sse_rm(&mut e, 0x0f2f, None, ops),
        I::Comisd => sse_rm(&mut e, 0x0f2f, Some(0x66), ops),
        I::Cvtss2sd => sse_rm(&mut e, 0x0f5a, Some(0xf3), ops),
        I::Cvtsd2ss => sse_rm(&mut e, 0x0f5a, Some(0xf2), ops),
        I::Cvtsi2ss => cvt_int_to_fp(&mut e, Some(0xf3), ops),
        I::Cvtsi2sd => cvt_int_to_fp(&mut e, Some(0xf2), ops),
        I::Cvttss2si => cvt_fp_to_int(&mut e, Some(0xf3), ops),
        I::Cvttsd2si => cvt_fp_to_int(&mut e, Some(0xf2), ops),
        I::Shufps => sse_rm_imm(&mut e, 0x0fc6, None, ops),
        I::Pshufd => sse_rm_imm(&mut e, 0x0f70, Some(0x66), ops),

        // AVX / AVX-512 three-operand arithmetic.
        I::Vaddps => v3(&mut e, ops, opts, V3::packed(0x58, Pp::None, false, 4)),
        I::Vaddpd => v3(&mut e, ops, opts, V3::packed(0x58, Pp::P66, true, 8)),
        I::Vaddss => v3(&mut e, ops, opts, V3::scalar(0x58, Pp::PF3, false, 4)),
        I::Vaddsd => v3(&mut e, ops, opts, V3::scalar(0x58, Pp::PF2, true, 8)),
        I::Vsubps => v3(&mut e, ops, opts, V3::packed(0x5c, Pp::None, false, 4)),
        I::Vsubpd => v3(&mut e, ops, opts, V3::packed(0x5c, Pp::P66, true, 8)),
        I::Vsubss => v3(&mut e, ops, opts, V3::scalar(0x5c, Pp::PF3, false, 4)),
        I::Vsubsd => v3(&mut e, ops, opts, V3::scalar(0x5c, Pp::PF2, true, 8)),
        I::Vmulps => v3(&mut e, ops, opts, V3::packed(0x59, Pp::None, false, 4)),
        I::Vmulpd => v3(&mut e, ops, opts, V3::packed(0x59, Pp::P66, true, 8)),
        I::Vmulss => v3(&mut e, ops, opts, V3::scalar(0x59, Pp::PF3, false, 4)),
        I::Vmulsd => v3(&mut e, ops, opts, V3::scalar(0x59, Pp::PF2, true, 8)),
        I::Vdivps => v3(&mut e, ops, opts, V3::packed(0x5e, Pp::None, false, 4)),
        I::Vdivpd => v3(&mut e, ops, opts, V3::packed(0x5e, Pp::P66, true, 8)),
        I::Vdivss => v3(&mut e, ops, opts, V3::scalar(0x5e, Pp::PF3, false, 4)),
        I::Vdivsd => v3(&mut e, ops, opts, V3::scalar(0x5e, Pp::PF2, true, 8)),
        I::Vminps => v3(&mut e, ops, opts, V3::packed(0x5d, Pp::None, false, 4)),
        I::Vminpd => v3(&mut e, ops, opts, V3::packed(0x5d, Pp::P66, true, 8)),
        I::Vmaxps => v3(&mut e, ops, opts, V3::packed(0x5f, Pp::None, false, 4)),
        I::Vmaxpd => v3(&mut e, ops, opts, V3::packed(0x5f, Pp::P66, true, 8)),
        I::Vandps => v3(&mut e, ops, opts, V3::packed(0x54, Pp::None, false, 4)),
        I::Vandpd => v3(&mut e, ops, opts, V3::packed(0x54, Pp::P66, true, 8)),
        I::Vorps => v3(&mut e, ops, opts, V3::packed(0x56, Pp::None, false, 4)),
        I::Vorpd => v3(&mut e, ops, opts, V3::packed(0x56, Pp::P66, true, 8)),
        I::Vxorps => v3(&mut e, ops, opts, V3::packed(0x57, Pp::None, false, 4)),
        I::Vxorpd => v3(&mut e, ops, opts, V3::packed(0x57, Pp::P66, true, 8)),
        I::Vpand => v3(&mut e, ops, opts, V3::avx_only(0xdb, Pp::P66)),
        I::Vpor => v3(&mut e, ops, opts, V3::avx_only(0xeb, Pp::P66)),
        I::Vpxor => v3(&mut e, ops, opts, V3::avx_only(0xef, Pp::P66)),
        I::Vpaddb => v3(&mut e, ops, opts, V3::packed_nobcst(0xfc, Pp::P66, false)),
        I::Vpaddw => v3(&mut e, ops, opts, V3::packed_nobcst(0xfd, Pp::P66, false)),
        I::Vpaddd => v3(&mut e, ops, opts, V3::packed(0xfe, Pp::P66, false, 4)),
        I::Vpaddq => v3(&mut e, ops, opts, V3::packed(0xd4, Pp::P66, true, 8)),
        I::Vpsubb => v3(&mut e, ops, opts, V3::packed_nobcst(0xf8, Pp::P66, false)),
        I::Vpsubw => v3(&mut e, ops, opts, V3::packed_nobcst(0xf9, Pp::P66, false)),
        I::Vpsubd => v3(&mut e, ops, opts, V3::packed(0xfa, Pp::P66, false, 4)),
        I::Vpsubq => v3(&mut e, ops, opts, V3::packed(0xfb, Pp::P66, true, 8)),

        // AVX / AVX-512 two-operand forms.
        I::Vsqrtps => v2(&mut e, ops, opts, V3::packed(0x51, Pp::None, false, 4)),
        I::Vsqrtpd => v2(&mut e, ops, opts, V3::packed(0x51, Pp::P66, true, 8)),

        // Vector moves.
        I::Vmovaps => vmov(&mut e, ops, opts, VMov::vex_and_evex(0x28, 0x29, Pp::None, false)),
        I::Vmovups => vmov(&mut e, ops, opts, VMov::vex_and_evex(0x10, 0x11, Pp::None, false)),
        I::Vmovdqa => vmov(&mut e, ops, opts, VMov::vex_only(0x6f, 0x7f, Pp::P66)),
        I::Vmovdqu => vmov(&mut e, ops, opts, VMov::vex_only(0x6f, 0x7f, Pp::PF3)),
        I::Vmovdqa32 => vmov(&mut e, ops, opts, VMov::evex_only(0x6f, 0x7f, Pp::P66, false)),
        I::Vmovdqa64 => vmov(&mut e, ops, opts, VMov::evex_only(0x6f, 0x7f, Pp::P66, true)),
        I::Vmovdqu32 => vmov(&mut e, ops, opts, VMov::evex_only(0x6f, 0x7f, Pp::PF3, false)),
        I::Vmovdqu64 => vmov(&mut e, ops, opts, VMov::evex_only(0x6f, 0x7f, Pp::PF3, true)),

        // Shuffles and lane inserts.
        I::Vshufps => vshufps(&mut e, ops, opts),
        I::Vpshufd => vpshufd(&mut e, ops, opts),
        I::Vinsertf128 => vinsertf128(&mut e, ops),
    }
}

fn gp_pair_size(e: &Enc<'_>, a: Reg, b: Reg) -> AsmResult<OpSize> {
    if a.size_bits() != b.size_bits() {
        return Err(e.size_err(format!(
            "operand widths differ: {a} is {}-bit, {b} is {}-bit",
            a.size_bits(),
            b.size_bits()
        )));
    }
    Ok(OpSize::from_bits(a.size_bits()))
}

fn mem_op_size(e: &Enc<'_>, mem: &Amode) -> AsmResult<OpSize> {
    match mem.size() {
        0 => Err(e.size_err("memory operand needs an explicit size")),
        bytes => Ok(OpSize::from_bits(u16::from(bytes) * 8)),
    }
}

fn check_mem_matches(e: &Enc<'_>, mem: &Amode, size: OpSize) -> AsmResult<()> {
    if mem.size() != 0 && u16::from(mem.size()) * 8 != size.bits() {
        return Err(e.size_err(format!(
            "memory operand is {}-byte but the register operand is {}-bit",
            mem.size(),
            size.bits()
        )));
    }
    Ok(())
}

fn imm8_value(e: &Enc<'_>, imm: Imm) -> AsmResult<u8> {
    if !imm.fits_unsigned(8) {
        return Err(e.size_err(format!("immediate {imm} does not fit in 8 bits")));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = imm.value() as u8;
    Ok(value)
}

/// The widest immediate an ALU group-1 instruction can carry at `size`, and
/// the field width it encodes to.
fn check_group1_imm(e: &Enc<'_>, size: OpSize, imm: Imm) -> AsmResult<OpSize> {
    let ok = match size {
        OpSize::Byte => imm.fits_unsigned(8),
        OpSize::Word => imm.fits_unsigned(16),
        OpSize::Long => imm.fits_unsigned(32),
        // A 64-bit operation sign-extends its 32-bit field, so an unsigned
        // constant above `i32::MAX` would change meaning.
        OpSize::Quad => imm.fits_i32(),
    };
    if !ok {
        return Err(e.size_err(format!("immediate {imm} does not fit a {}-bit operation", size.bits())));
    }
    Ok(match size {
        OpSize::Byte => OpSize::Byte,
        OpSize::Word => OpSize::Word,
        OpSize::Long | OpSize::Quad => OpSize::Long,
    })
}

// --- Integer families -----------------------------------------------------

fn alu(e: &mut Enc<'_>, base: u32, digit: u8, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        // Register-to-register uses the MR form, `base+0`/`base+1` `/r`.
        [O::Gp(dst), O::Gp(src)] => {
            let size = gp_pair_size(e, dst, src)?;
            let (op, w) = pick_mr(base, size);
            e.legacy_rr(op, None, size, w, src, dst)
        }
        [O::Mem(ref mem), O::Gp(src)] => {
            let size = OpSize::from_bits(src.size_bits());
            check_mem_matches(e, mem, size)?;
            let (op, w) = pick_mr(base, size);
            e.legacy_rm(op, None, size, w, src, mem, 0)
        }
        [O::Gp(dst), O::Mem(ref mem)] => {
            let size = OpSize::from_bits(dst.size_bits());
            check_mem_matches(e, mem, size)?;
            let (op, w) = pick_rm(base, size);
            e.legacy_rm(op, None, size, w, dst, mem, 0)
        }
        [O::Gp(dst), O::Imm(imm)] => {
            let size = OpSize::from_bits(dst.size_bits());
            let field = check_group1_imm(e, size, imm)?;
            let (op, field) = group1_imm_opcode(size, imm, field);
            e.legacy_digit_r(op, None, size, size.is_quad(), digit, dst)?;
            e.put_imm(imm.value(), field);
            Ok(())
        }
        [O::Mem(ref mem), O::Imm(imm)] => {
            let size = mem_op_size(e, mem)?;
            let field = check_group1_imm(e, size, imm)?;
            let (op, field) = group1_imm_opcode(size, imm, field);
            e.legacy_digit_m(op, None, size, size.is_quad(), digit, mem, field_bytes(field))?;
            e.put_imm(imm.value(), field);
            Ok(())
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn pick_mr(base: u32, size: OpSize) -> (u32, bool) {
    match size {
        OpSize::Byte => (base, false),
        OpSize::Quad => (base + 1, true),
        _ => (base + 1, false),
    }
}

fn pick_rm(base: u32, size: OpSize) -> (u32, bool) {
    match size {
        OpSize::Byte => (base + 2, false),
        OpSize::Quad => (base + 3, true),
        _ => (base + 3, false),
    }
}

/// Choose between the sign-extended-imm8 short form (`83 /digit ib`) and the
/// full-width form (`80`/`81 /digit`).
fn group1_imm_opcode(size: OpSize, imm: Imm, field: OpSize) -> (u32, OpSize) {
    match size {
        OpSize::Byte => (0x80, OpSize::Byte),
        _ if imm.fits_i8() => (0x83, OpSize::Byte),
        _ => (0x81, field),
    }
}

fn field_bytes(field: OpSize) -> u8 {
    match field {
        OpSize::Byte => 1,
        OpSize::Word => 2,
        OpSize::Long => 4,
        OpSize::Quad => 8,
    }
}

fn test(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(dst), O::Gp(src)] => {
            let size = gp_pair_size(e, dst, src)?;
            let (op, w) = pick_mr(0x84, size);
            e.legacy_rr(op, None, size, w, src, dst)
        }
        [O::Mem(ref mem), O::Gp(src)] => {
            let size = OpSize::from_bits(src.size_bits());
            check_mem_matches(e, mem, size)?;
            let (op, w) = pick_mr(0x84, size);
            e.legacy_rm(op, None, size, w, src, mem, 0)
        }
        [O::Gp(dst), O::Imm(imm)] => {
            let size = OpSize::from_bits(dst.size_bits());
            let field = check_group1_imm(e, size, imm)?;
            let op = if size == OpSize::Byte { 0xf6 } else { 0xf7 };
            e.legacy_digit_r(op, None, size, size.is_quad(), 0, dst)?;
            e.put_imm(imm.value(), field);
            Ok(())
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn mov(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(dst), O::Gp(src)] => {
            let size = gp_pair_size(e, dst, src)?;
            let (op, w) = pick_mr(0x88, size);
            e.legacy_rr(op, None, size, w, src, dst)
        }
        [O::Mem(ref mem), O::Gp(src)] => {
            let size = OpSize::from_bits(src.size_bits());
            check_mem_matches(e, mem, size)?;
            let (op, w) = pick_mr(0x88, size);
            e.legacy_rm(op, None, size, w, src, mem, 0)
        }
        [O::Gp(dst), O::Mem(ref mem)] => {
            let size = OpSize::from_bits(dst.size_bits());
            check_mem_matches(e, mem, size)?;
            let (op, w) = pick_rm(0x88, size);
            e.legacy_rm(op, None, size, w, dst, mem, 0)
        }
        [O::Gp(dst), O::Imm(imm)] => mov_ri(e, dst, imm),
        [O::Mem(ref mem), O::Imm(imm)] => {
            let size = mem_op_size(e, mem)?;
            let field = check_group1_imm(e, size, imm)?;
            let op = if size == OpSize::Byte { 0xc6 } else { 0xc7 };
            e.legacy_digit_m(op, None, size, size.is_quad(), 0, mem, field_bytes(field))?;
            e.put_imm(imm.value(), field);
            Ok(())
        }
        [O::Gp(dst), O::Seg(seg)] => e.legacy_rr(0x8c, None, OpSize::Long, false, seg, dst),
        [O::Seg(seg), O::Gp(src)] => e.legacy_rr(0x8e, None, OpSize::Long, false, seg, src),
        _ => Err(e.shape_err(ops)),
    }
}

/// Materialize a constant in a register, choosing the shortest legal form:
/// the zero-extending 32-bit `mov` for unsigned-32 constants, the
/// sign-extended `C7 /0` for negative-but-i32 constants, and the full
/// `movabs` only past 32 bits.
fn mov_ri(e: &mut Enc<'_>, dst: Reg, imm: Imm) -> AsmResult<()> {
    match OpSize::from_bits(dst.size_bits()) {
        OpSize::Byte => {
            if !imm.fits_unsigned(8) {
                return Err(e.size_err(format!("immediate {imm} does not fit in 8 bits")));
            }
            e.legacy_o(0xb0, OpSize::Byte, false, dst)?;
            e.put_imm(imm.value(), OpSize::Byte);
            Ok(())
        }
        OpSize::Word => {
            if !imm.fits_unsigned(16) {
                return Err(e.size_err(format!("immediate {imm} does not fit in 16 bits")));
            }
            e.legacy_o(0xb8, OpSize::Word, false, dst)?;
            e.put_imm(imm.value(), OpSize::Word);
            Ok(())
        }
        OpSize::Long => {
            if !imm.fits_unsigned(32) {
                return Err(e.size_err(format!("immediate {imm} does not fit in 32 bits")));
            }
            e.legacy_o(0xb8, OpSize::Long, false, dst)?;
            e.put_imm(imm.value(), OpSize::Long);
            Ok(())
        }
        OpSize::Quad => {
            if imm.fits_u32() {
                // Writing the low 32 bits zero-extends; drop REX.W.
                e.legacy_o(0xb8, OpSize::Long, false, dst)?;
                e.put_imm(imm.value(), OpSize::Long);
            } else if imm.fits_i32() {
                e.legacy_digit_r(0xc7, None, OpSize::Quad, true, 0, dst)?;
                e.put_imm(imm.value(), OpSize::Long);
            } else {
                e.legacy_o(0xb8, OpSize::Quad, true, dst)?;
                e.put_imm(imm.value(), OpSize::Quad);
            }
            Ok(())
        }
    }
}

/// `movzx`/`movsx` (`byte_op`/`word_op` select the source width) and
/// `movsxd` (`dword` set).
fn widen(e: &mut Enc<'_>, ops: &[Operand], byte_op: u32, word_op: u32, dword: bool) -> AsmResult<()> {
    use Operand as O;
    let (dst, src_bits, rm): (Reg, u16, RegMem<'_>) = match ops {
        [O::Gp(dst), O::Gp(src)] => (*dst, src.size_bits(), RegMem::Reg(*src)),
        [O::Gp(dst), O::Mem(mem)] => {
            let bits = u16::from(mem.size()) * 8;
            if bits == 0 {
                return Err(e.size_err("memory operand needs an explicit size"));
            }
            (*dst, bits, RegMem::Mem(mem))
        }
        _ => return Err(e.shape_err(ops)),
    };
    let size = OpSize::from_bits(dst.size_bits());
    let op = match (dword, src_bits) {
        (true, 32) => {
            if size != OpSize::Quad {
                return Err(e.size_err("movsxd widens a 32-bit source into a 64-bit register"));
            }
            word_op
        }
        (false, 8) if dst.size_bits() > 8 => byte_op,
        (false, 16) if dst.size_bits() > 16 => word_op,
        _ => {
            return Err(e.size_err(format!(
                "cannot widen a {src_bits}-bit source into {dst}"
            )))
        }
    };
    match rm {
        RegMem::Reg(src) => e.legacy_rr(op, None, size, size.is_quad(), dst, src),
        RegMem::Mem(mem) => e.legacy_rm(op, None, size, size.is_quad(), dst, mem, 0),
    }
}

fn lea(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(dst), O::Mem(ref mem)] => {
            if dst.size_bits() == 8 {
                return Err(e.size_err("lea cannot target a byte register"));
            }
            let size = OpSize::from_bits(dst.size_bits());
            e.legacy_rm(0x8d, None, size, size.is_quad(), dst, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn xchg(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(a), O::Gp(b)] => {
            let size = gp_pair_size(e, a, b)?;
            let (op, w) = pick_mr(0x86, size);
            e.legacy_rr(op, None, size, w, b, a)
        }
        [O::Mem(ref mem), O::Gp(src)] | [O::Gp(src), O::Mem(ref mem)] => {
            let size = OpSize::from_bits(src.size_bits());
            check_mem_matches(e, mem, size)?;
            let (op, w) = pick_mr(0x86, size);
            e.legacy_rm(op, None, size, w, src, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn push_pop(e: &mut Enc<'_>, ops: &[Operand], push: bool) -> AsmResult<()> {
    use Operand as O;
    let native = if e.x86 { 32 } else { 64 };
    match *ops {
        [O::Gp(reg)] => {
            let bits = reg.size_bits();
            if bits != native && bits != 16 {
                return Err(e.size_err(format!(
                    "push/pop operates on {native}-bit or 16-bit registers, got {reg}"
                )));
            }
            // Operand size defaults to the stack width; no REX.W needed.
            let size = if bits == 16 { OpSize::Word } else { OpSize::Long };
            e.legacy_o(if push { 0x50 } else { 0x58 }, size, false, reg)
        }
        [O::Imm(imm)] if push => {
            if imm.fits_i8() {
                e.plain(0x6a, None, OpSize::Long, false)?;
                e.put_imm(imm.value(), OpSize::Byte);
            } else if imm.fits_i32() {
                e.plain(0x68, None, OpSize::Long, false)?;
                e.put_imm(imm.value(), OpSize::Long);
            } else {
                return Err(e.size_err(format!("immediate {imm} does not fit in 32 bits")));
            }
            Ok(())
        }
        [O::Mem(ref mem)] => {
            if push {
                e.legacy_digit_m(0xff, None, OpSize::Long, false, 6, mem, 0)
            } else {
                e.legacy_digit_m(0x8f, None, OpSize::Long, false, 0, mem, 0)
            }
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn unary(e: &mut Enc<'_>, byte_op: u32, wide_op: u32, digit: u8, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(reg)] => {
            let size = OpSize::from_bits(reg.size_bits());
            let op = if size == OpSize::Byte { byte_op } else { wide_op };
            e.legacy_digit_r(op, None, size, size.is_quad(), digit, reg)
        }
        [O::Mem(ref mem)] => {
            let size = mem_op_size(e, mem)?;
            let op = if size == OpSize::Byte { byte_op } else { wide_op };
            e.legacy_digit_m(op, None, size, size.is_quad(), digit, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn imul(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        // One-operand form: rdx:rax <- rax * r/m.
        [O::Gp(_)] | [O::Mem(_)] => unary(e, 0xf6, 0xf7, 5, ops),
        [O::Gp(dst), O::Gp(src)] => {
            let size = gp_pair_size(e, dst, src)?;
            if size == OpSize::Byte {
                return Err(e.size_err("two-operand imul has no byte form"));
            }
            e.legacy_rr(0x0faf, None, size, size.is_quad(), dst, src)
        }
        [O::Gp(dst), O::Mem(ref mem)] => {
            let size = OpSize::from_bits(dst.size_bits());
            if size == OpSize::Byte {
                return Err(e.size_err("two-operand imul has no byte form"));
            }
            check_mem_matches(e, mem, size)?;
            e.legacy_rm(0x0faf, None, size, size.is_quad(), dst, mem, 0)
        }
        [O::Gp(dst), O::Gp(src), O::Imm(imm)] => {
            let size = gp_pair_size(e, dst, src)?;
            if size == OpSize::Byte {
                return Err(e.size_err("three-operand imul has no byte form"));
            }
            let field = check_group1_imm(e, size, imm)?;
            let (op, field) = if imm.fits_i8() {
                (0x6b, OpSize::Byte)
            } else {
                (0x69, field)
            };
            e.legacy_rr(op, None, size, size.is_quad(), dst, src)?;
            e.put_imm(imm.value(), field);
            Ok(())
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn shift(e: &mut Enc<'_>, digit: u8, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(reg), O::Imm(imm)] => {
            let size = OpSize::from_bits(reg.size_bits());
            let count = imm8_value(e, imm)?;
            if count == 1 {
                let op = if size == OpSize::Byte { 0xd0 } else { 0xd1 };
                e.legacy_digit_r(op, None, size, size.is_quad(), digit, reg)
            } else {
                let op = if size == OpSize::Byte { 0xc0 } else { 0xc1 };
                e.legacy_digit_r(op, None, size, size.is_quad(), digit, reg)?;
                e.buf.put1(count);
                Ok(())
            }
        }
        [O::Mem(ref mem), O::Imm(imm)] => {
            let size = mem_op_size(e, mem)?;
            let count = imm8_value(e, imm)?;
            if count == 1 {
                let op = if size == OpSize::Byte { 0xd0 } else { 0xd1 };
                e.legacy_digit_m(op, None, size, size.is_quad(), digit, mem, 0)
            } else {
                let op = if size == OpSize::Byte { 0xc0 } else { 0xc1 };
                e.legacy_digit_m(op, None, size, size.is_quad(), digit, mem, 1)?;
                e.buf.put1(count);
                Ok(())
            }
        }
        [O::Gp(reg), O::Gp(count)] => {
            if count.size_bits() != 8 || count.enc3() != 1 || count.needs_rex_extension() {
                return Err(e.size_err(format!("shift count register must be cl, got {count}")));
            }
            let size = OpSize::from_bits(reg.size_bits());
            let op = if size == OpSize::Byte { 0xd2 } else { 0xd3 };
            e.legacy_digit_r(op, None, size, size.is_quad(), digit, reg)
        }
        [O::Mem(ref mem), O::Gp(count)] => {
            if count.size_bits() != 8 || count.enc3() != 1 || count.needs_rex_extension() {
                return Err(e.size_err(format!("shift count register must be cl, got {count}")));
            }
            let size = mem_op_size(e, mem)?;
            let op = if size == OpSize::Byte { 0xd2 } else { 0xd3 };
            e.legacy_digit_m(op, None, size, size.is_quad(), digit, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn bit_test(e: &mut Enc<'_>, mr_op: u32, imm_digit: u8, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(dst), O::Gp(src)] => {
            let size = gp_pair_size(e, dst, src)?;
            if size == OpSize::Byte {
                return Err(e.size_err("bit tests have no byte form"));
            }
            e.legacy_rr(mr_op, None, size, size.is_quad(), src, dst)
        }
        [O::Mem(ref mem), O::Gp(src)] => {
            let size = OpSize::from_bits(src.size_bits());
            if size == OpSize::Byte {
                return Err(e.size_err("bit tests have no byte form"));
            }
            e.legacy_rm(mr_op, None, size, size.is_quad(), src, mem, 0)
        }
        [O::Gp(dst), O::Imm(imm)] => {
            let size = OpSize::from_bits(dst.size_bits());
            if size == OpSize::Byte {
                return Err(e.size_err("bit tests have no byte form"));
            }
            let bit = imm8_value(e, imm)?;
            e.legacy_digit_r(0x0fba, None, size, size.is_quad(), imm_digit, dst)?;
            e.buf.put1(bit);
            Ok(())
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn bit_scan(e: &mut Enc<'_>, op: u32, mandatory: Option<u8>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(dst), O::Gp(src)] => {
            let size = gp_pair_size(e, dst, src)?;
            if size == OpSize::Byte {
                return Err(e.size_err("bit scans have no byte form"));
            }
            e.legacy_rr(op, mandatory, size, size.is_quad(), dst, src)
        }
        [O::Gp(dst), O::Mem(ref mem)] => {
            let size = OpSize::from_bits(dst.size_bits());
            if size == OpSize::Byte {
                return Err(e.size_err("bit scans have no byte form"));
            }
            check_mem_matches(e, mem, size)?;
            e.legacy_rm(op, mandatory, size, size.is_quad(), dst, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

// --- Control flow ---------------------------------------------------------

fn jmp(e: &mut Enc<'_>, ops: &[Operand], opts: &EmitOptions) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::LabelRef(label)] => e.branch(label, &[0xeb], &[0xe9], opts.force_short),
        [O::Gp(reg)] => {
            indirect_target_size(e, reg)?;
            e.legacy_digit_r(0xff, None, OpSize::Long, false, 4, reg)
        }
        [O::Mem(ref mem)] => e.legacy_digit_m(0xff, None, OpSize::Long, false, 4, mem, 0),
        _ => Err(e.shape_err(ops)),
    }
}

fn call(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        // There is no short form of call; `force_short` does not apply.
        [O::LabelRef(label)] => e.branch(label, &[0xe8], &[0xe8], false),
        [O::Gp(reg)] => {
            indirect_target_size(e, reg)?;
            e.legacy_digit_r(0xff, None, OpSize::Long, false, 2, reg)
        }
        [O::Mem(ref mem)] => e.legacy_digit_m(0xff, None, OpSize::Long, false, 2, mem, 0),
        _ => Err(e.shape_err(ops)),
    }
}

/// A `call`/`jmp` through a register must use the native width.
fn indirect_target_size(e: &Enc<'_>, reg: Reg) -> AsmResult<()> {
    let native = if e.x86 { 32 } else { 64 };
    if reg.size_bits() != native {
        return Err(e.size_err(format!("indirect target must be a {native}-bit register")));
    }
    Ok(())
}

fn ret(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [] => e.plain(0xc3, None, OpSize::Long, false),
        [O::Imm(imm)] => {
            if !imm.fits_unsigned(16) {
                return Err(e.size_err(format!("ret pops at most 0xffff bytes, got {imm}")));
            }
            e.plain(0xc2, None, OpSize::Long, false)?;
            e.put_imm(imm.value(), OpSize::Word);
            Ok(())
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn jcc(e: &mut Enc<'_>, cc: Cond, ops: &[Operand], opts: &EmitOptions) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::LabelRef(label)] => e.branch(
            label,
            &[0x70 + cc.enc()],
            &[0x0f, 0x80 + cc.enc()],
            opts.force_short,
        ),
        _ => Err(e.shape_err(ops)),
    }
}

fn setcc(e: &mut Enc<'_>, cc: Cond, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    let op = 0x0f90 + u32::from(cc.enc());
    match *ops {
        [O::Gp(reg)] => {
            if reg.size_bits() != 8 {
                return Err(e.size_err("setcc writes a byte register"));
            }
            e.legacy_digit_r(op, None, OpSize::Byte, false, 0, reg)
        }
        [O::Mem(ref mem)] => {
            if mem.size() > 1 {
                return Err(e.size_err("setcc writes a single byte"));
            }
            e.legacy_digit_m(op, None, OpSize::Byte, false, 0, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn cmovcc(e: &mut Enc<'_>, cc: Cond, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    let op = 0x0f40 + u32::from(cc.enc());
    match *ops {
        [O::Gp(dst), O::Gp(src)] => {
            let size = gp_pair_size(e, dst, src)?;
            if size == OpSize::Byte {
                return Err(e.size_err("cmovcc has no byte form"));
            }
            e.legacy_rr(op, None, size, size.is_quad(), dst, src)
        }
        [O::Gp(dst), O::Mem(ref mem)] => {
            let size = OpSize::from_bits(dst.size_bits());
            if size == OpSize::Byte {
                return Err(e.size_err("cmovcc has no byte form"));
            }
            check_mem_matches(e, mem, size)?;
            e.legacy_rm(op, None, size, size.is_quad(), dst, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

// --- No-operand and string instructions -----------------------------------

fn nullary(
    e: &mut Enc<'_>,
    opcode: u32,
    mandatory: Option<u8>,
    w: bool,
    ops: &[Operand],
) -> AsmResult<()> {
    if !ops.is_empty() {
        return Err(e.shape_err(ops));
    }
    e.plain(opcode, mandatory, OpSize::Long, w)
}

fn string_op(
    e: &mut Enc<'_>,
    opcode: u32,
    size: OpSize,
    ops: &[Operand],
    opts: &EmitOptions,
) -> AsmResult<()> {
    if !ops.is_empty() {
        return Err(e.shape_err(ops));
    }
    if size.is_quad() && e.x86 {
        return Err(e.size_err("64-bit string operation in 32-bit mode"));
    }
    // The repeat prefix precedes all other prefix bytes.
    if let Some(rep) = opts.rep {
        e.buf.put1(match rep {
            Rep::Rep => 0xf3,
            Rep::Repne => 0xf2,
        });
    }
    e.plain(opcode, None, size, size.is_quad())
}

// --- SSE ------------------------------------------------------------------

fn check_vec128(e: &Enc<'_>, r: Reg) -> AsmResult<()> {
    if r.class() != RegClass::Vec || r.size_bits() != 128 {
        return Err(e.size_err(format!("{r} must be an xmm register here")));
    }
    Ok(())
}

fn sse_mov(
    e: &mut Enc<'_>,
    load_op: u32,
    store_op: u32,
    mandatory: Option<u8>,
    ops: &[Operand],
) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Vec(dst), O::Vec(src)] => {
            check_vec128(e, dst)?;
            check_vec128(e, src)?;
            e.legacy_rr(load_op, mandatory, OpSize::Long, false, dst, src)
        }
        [O::Vec(dst), O::Mem(ref mem)] => {
            check_vec128(e, dst)?;
            e.legacy_rm(load_op, mandatory, OpSize::Long, false, dst, mem, 0)
        }
        [O::Mem(ref mem), O::Vec(src)] => {
            check_vec128(e, src)?;
            e.legacy_rm(store_op, mandatory, OpSize::Long, false, src, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn sse_rm(e: &mut Enc<'_>, op: u32, mandatory: Option<u8>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Vec(dst), O::Vec(src)] => {
            check_vec128(e, dst)?;
            check_vec128(e, src)?;
            e.legacy_rr(op, mandatory, OpSize::Long, false, dst, src)
        }
        [O::Vec(dst), O::Mem(ref mem)] => {
            check_vec128(e, dst)?;
            e.legacy_rm(op, mandatory, OpSize::Long, false, dst, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn sse_rm_imm(e: &mut Enc<'_>, op: u32, mandatory: Option<u8>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Vec(dst), O::Vec(src), O::Imm(imm)] => {
            check_vec128(e, dst)?;
            check_vec128(e, src)?;
            let imm = imm8_value(e, imm)?;
            e.legacy_rr(op, mandatory, OpSize::Long, false, dst, src)?;
            e.buf.put1(imm);
            Ok(())
        }
        _ => Err(e.shape_err(ops)),
    }
}

/// `movd`/`movq` between GPRs and vector registers, plus the `movq`
/// xmm-to-xmm form.
fn mov_d_q(e: &mut Enc<'_>, ops: &[Operand], quad: bool) -> AsmResult<()> {
    use Operand as O;
    let gp_bits = if quad { 64 } else { 32 };
    match *ops {
        [O::Vec(dst), O::Gp(src)] => {
            check_vec128(e, dst)?;
            if src.size_bits() != gp_bits {
                return Err(e.size_err(format!("{} expects a {gp_bits}-bit source", e.inst.mnemonic())));
            }
            e.legacy_rr(0x0f6e, Some(0x66), OpSize::Long, quad, dst, src)
        }
        [O::Gp(dst), O::Vec(src)] => {
            check_vec128(e, src)?;
            if dst.size_bits() != gp_bits {
                return Err(e.size_err(format!("{} expects a {gp_bits}-bit destination", e.inst.mnemonic())));
            }
            e.legacy_rr(0x0f7e, Some(0x66), OpSize::Long, quad, src, dst)
        }
        [O::Vec(dst), O::Vec(src)] if quad => {
            check_vec128(e, dst)?;
            check_vec128(e, src)?;
            e.legacy_rr(0x0f7e, Some(0xf3), OpSize::Long, false, dst, src)
        }
        [O::Vec(dst), O::Mem(ref mem)] if quad => {
            check_vec128(e, dst)?;
            e.legacy_rm(0x0f7e, Some(0xf3), OpSize::Long, false, dst, mem, 0)
        }
        [O::Mem(ref mem), O::Vec(src)] if quad => {
            check_vec128(e, src)?;
            e.legacy_rm(0x0fd6, Some(0x66), OpSize::Long, false, src, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn cvt_int_to_fp(e: &mut Enc<'_>, mandatory: Option<u8>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Vec(dst), O::Gp(src)] => {
            check_vec128(e, dst)?;
            let w = match src.size_bits() {
                32 => false,
                64 => true,
                _ => return Err(e.size_err("conversion source must be a 32- or 64-bit register")),
            };
            e.legacy_rr(0x0f2a, mandatory, OpSize::Long, w, dst, src)
        }
        [O::Vec(dst), O::Mem(ref mem)] => {
            check_vec128(e, dst)?;
            let w = match mem.size() {
                4 => false,
                8 => true,
                _ => return Err(e.size_err("conversion source must be 4 or 8 bytes")),
            };
            e.legacy_rm(0x0f2a, mandatory, OpSize::Long, w, dst, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

fn cvt_fp_to_int(e: &mut Enc<'_>, mandatory: Option<u8>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    match *ops {
        [O::Gp(dst), O::Vec(src)] => {
            check_vec128(e, src)?;
            let w = match dst.size_bits() {
                32 => false,
                64 => true,
                _ => return Err(e.size_err("conversion target must be a 32- or 64-bit register")),
            };
            e.legacy_rr(0x0f2c, mandatory, OpSize::Long, w, dst, src)
        }
        [O::Gp(dst), O::Mem(ref mem)] => {
            let w = match dst.size_bits() {
                32 => false,
                64 => true,
                _ => return Err(e.size_err("conversion target must be a 32- or 64-bit register")),
            };
            e.legacy_rm(0x0f2c, mandatory, OpSize::Long, w, dst, mem, 0)
        }
        _ => Err(e.shape_err(ops)),
    }
}

// --- AVX / AVX-512 --------------------------------------------------------

/// Parameters of a VEX/EVEX-encodable operation.
struct V3 {
    op: u8,
    pp: Pp,
    map: OpcodeMap,
    /// The EVEX W bit (VEX encodings here are all WIG).
    evex_w: bool,
    /// Scalar (ss/sd) operation: operands are always xmm, length ignored.
    scalar: bool,
    /// Element size for embedded broadcast and scalar disp8*N; `None`
    /// forbids broadcast.
    bcst_elem: Option<i8>,
    /// Whether an EVEX form exists at all.
    evex_ok: bool,
}

impl V3 {
    fn packed(op: u8, pp: Pp, evex_w: bool, elem: i8) -> Self {
        V3 {
            op,
            pp,
            map: OpcodeMap::M0F,
            evex_w,
            scalar: false,
            bcst_elem: Some(elem),
            evex_ok: true,
        }
    }

    fn packed_nobcst(op: u8, pp: Pp, evex_w: bool) -> Self {
        V3 {
            op,
            pp,
            map: OpcodeMap::M0F,
            evex_w,
            scalar: false,
            bcst_elem: None,
            evex_ok: true,
        }
    }

    fn scalar(op: u8, pp: Pp, evex_w: bool, elem: i8) -> Self {
        V3 {
            op,
            pp,
            map: OpcodeMap::M0F,
            evex_w,
            scalar: true,
            bcst_elem: Some(elem),
            evex_ok: true,
        }
    }

    /// An operation with no EVEX encoding under this mnemonic (the AVX-512
    /// form is a differently-named instruction, e.g. `vpand` vs `vpandd`).
    fn avx_only(op: u8, pp: Pp) -> Self {
        V3 {
            op,
            pp,
            map: OpcodeMap::M0F,
            evex_w: false,
            scalar: false,
            bcst_elem: None,
            evex_ok: false,
        }
    }
}

fn evex_len_for(bits: u16) -> EvexLength {
    match bits {
        512 => EvexLength::L512,
        256 => EvexLength::L256,
        _ => EvexLength::L128,
    }
}

/// Whether this operand set must use the EVEX encoding: a 512-bit width, an
/// extended (`xmm16`+) register, or an explicitly requested EVEX feature.
fn needs_evex(width: u16, regs: &[Reg], opts: &EmitOptions) -> bool {
    width == 512 || opts.wants_evex() || regs.iter().any(|r| !r.is_virtual() && r.enc() >= 16)
}

fn check_vec_width(e: &Enc<'_>, r: Reg, width: u16) -> AsmResult<()> {
    if r.class() != RegClass::Vec {
        return Err(e.size_err(format!("{r} must be a vector register")));
    }
    if r.size_bits() != width {
        return Err(e.size_err(format!(
            "operand widths differ: {r} is {}-bit, expected {width}-bit",
            r.size_bits()
        )));
    }
    Ok(())
}

/// Dispatch a three-operand (`dst, src1, src2/mem`) vector operation to its
/// VEX or EVEX encoding.
fn v3(e: &mut Enc<'_>, ops: &[Operand], opts: &EmitOptions, p: V3) -> AsmResult<()> {
    use Operand as O;
    let (dst, src1, rm): (Reg, Reg, RegMem<'_>) = match ops {
        [O::Vec(dst), O::Vec(src1), O::Vec(src2)] => (*dst, *src1, RegMem::Reg(*src2)),
        [O::Vec(dst), O::Vec(src1), O::Mem(mem)] => (*dst, *src1, RegMem::Mem(mem)),
        _ => return Err(e.shape_err(ops)),
    };
    let width = if p.scalar { 128 } else { dst.size_bits() };
    check_vec_width(e, dst, width)?;
    check_vec_width(e, src1, width)?;
    let mut regs = smallvec::SmallVec::<[Reg; 3]>::from_slice(&[dst, src1]);
    if let RegMem::Reg(r) = rm {
        check_vec_width(e, r, width)?;
        regs.push(r);
    }
    vex_or_evex(e, opts, &p, width, &regs, dst, Some(src1), &rm, None)
}

/// Two-operand (`dst, src/mem`) form; `vvvv` is unused.
fn v2(e: &mut Enc<'_>, ops: &[Operand], opts: &EmitOptions, p: V3) -> AsmResult<()> {
    use Operand as O;
    let (dst, rm): (Reg, RegMem<'_>) = match ops {
        [O::Vec(dst), O::Vec(src)] => (*dst, RegMem::Reg(*src)),
        [O::Vec(dst), O::Mem(mem)] => (*dst, RegMem::Mem(mem)),
        _ => return Err(e.shape_err(ops)),
    };
    let width = dst.size_bits();
    let mut regs = smallvec::SmallVec::<[Reg; 2]>::from_slice(&[dst]);
    if let RegMem::Reg(r) = rm {
        check_vec_width(e, r, width)?;
        regs.push(r);
    }
    vex_or_evex(e, opts, &p, width, &regs, dst, None, &rm, None)
}

#[allow(clippy::too_many_arguments)]
fn vex_or_evex(
    e: &mut Enc<'_>,
    opts: &EmitOptions,
    p: &V3,
    width: u16,
    regs: &[Reg],
    reg: Reg,
    vvvv: Option<Reg>,
    rm: &RegMem<'_>,
    imm: Option<u8>,
) -> AsmResult<()> {
    if needs_evex(width, regs, opts) {
        if !p.evex_ok {
            return Err(e.combo_err(format!(
                "{} has no EVEX form; it cannot use 512-bit, extended or masked operands",
                e.inst.mnemonic()
            )));
        }
        if p.scalar && opts.broadcast {
            return Err(Error::InvalidArgument(
                "embedded broadcast does not apply to scalar operations".to_owned(),
            ));
        }
        let scale = if opts.broadcast || p.scalar {
            match p.bcst_elem {
                Some(elem) => elem,
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "{} does not support embedded broadcast",
                        e.inst.mnemonic()
                    )))
                }
            }
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let full = (width / 8) as i8;
            full
        };
        let len = if p.scalar {
            EvexLength::L128
        } else {
            evex_len_for(width)
        };
        e.evex_op(p.op, p.map, p.pp, p.evex_w, len, reg, vvvv, rm, opts, scale, imm)
    } else {
        let l = u8::from(width == 256);
        e.vex_op(p.op, p.map, p.pp, false, l, reg, vvvv, rm, imm)
    }
}

/// Parameters of a vector move family.
struct VMov {
    load_op: u8,
    store_op: u8,
    pp: Pp,
    evex_w: bool,
    vex_ok: bool,
    evex_ok: bool,
}

impl VMov {
    fn vex_and_evex(load_op: u8, store_op: u8, pp: Pp, evex_w: bool) -> Self {
        VMov { load_op, store_op, pp, evex_w, vex_ok: true, evex_ok: true }
    }

    fn vex_only(load_op: u8, store_op: u8, pp: Pp) -> Self {
        VMov { load_op, store_op, pp, evex_w: false, vex_ok: true, evex_ok: false }
    }

    fn evex_only(load_op: u8, store_op: u8, pp: Pp, evex_w: bool) -> Self {
        VMov { load_op, store_op, pp, evex_w, vex_ok: false, evex_ok: true }
    }
}

fn vmov(e: &mut Enc<'_>, ops: &[Operand], opts: &EmitOptions, p: VMov) -> AsmResult<()> {
    use Operand as O;
    let (op, reg, rm, is_store): (u8, Reg, RegMem<'_>, bool) = match ops {
        [O::Vec(dst), O::Vec(src)] => (p.load_op, *dst, RegMem::Reg(*src), false),
        [O::Vec(dst), O::Mem(mem)] => (p.load_op, *dst, RegMem::Mem(mem), false),
        [O::Mem(mem), O::Vec(src)] => (p.store_op, *src, RegMem::Mem(mem), true),
        _ => return Err(e.shape_err(ops)),
    };
    let width = reg.size_bits();
    let mut regs = smallvec::SmallVec::<[Reg; 2]>::from_slice(&[reg]);
    if let RegMem::Reg(r) = rm {
        check_vec_width(e, r, width)?;
        regs.push(r);
    }
    if opts.broadcast {
        return Err(Error::InvalidArgument(format!(
            "{} does not support embedded broadcast",
            e.inst.mnemonic()
        )));
    }
    if is_store && opts.zeroing {
        return Err(Error::InvalidArgument(
            "zeroing-masking cannot apply to a store".to_owned(),
        ));
    }
    let use_evex = !p.vex_ok || needs_evex(width, &regs, opts);
    if use_evex {
        if !p.evex_ok {
            return Err(e.combo_err(format!(
                "{} has no EVEX form; use its element-typed variant for 512-bit or masked moves",
                e.inst.mnemonic()
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let scale = (width / 8) as i8;
        e.evex_op(
            op,
            OpcodeMap::M0F,
            p.pp,
            p.evex_w,
            evex_len_for(width),
            reg,
            None,
            &rm,
            opts,
            scale,
            None,
        )
    } else {
        let l = u8::from(width == 256);
        e.vex_op(op, OpcodeMap::M0F, p.pp, false, l, reg, None, &rm, None)
    }
}

fn vshufps(e: &mut Enc<'_>, ops: &[Operand], opts: &EmitOptions) -> AsmResult<()> {
    use Operand as O;
    let (dst, src1, rm, imm): (Reg, Reg, RegMem<'_>, Imm) = match ops {
        [O::Vec(dst), O::Vec(src1), O::Vec(src2), O::Imm(imm)] => {
            (*dst, *src1, RegMem::Reg(*src2), *imm)
        }
        [O::Vec(dst), O::Vec(src1), O::Mem(mem), O::Imm(imm)] => {
            (*dst, *src1, RegMem::Mem(mem), *imm)
        }
        _ => return Err(e.shape_err(ops)),
    };
    let width = dst.size_bits();
    check_vec_width(e, src1, width)?;
    let mut regs = smallvec::SmallVec::<[Reg; 3]>::from_slice(&[dst, src1]);
    if let RegMem::Reg(r) = rm {
        check_vec_width(e, r, width)?;
        regs.push(r);
    }
    let imm = imm8_value(e, imm)?;
    let p = V3::packed(0xc6, Pp::None, false, 4);
    vex_or_evex(e, opts, &p, width, &regs, dst, Some(src1), &rm, Some(imm))
}

fn vpshufd(e: &mut Enc<'_>, ops: &[Operand], opts: &EmitOptions) -> AsmResult<()> {
    use Operand as O;
    let (dst, rm, imm): (Reg, RegMem<'_>, Imm) = match ops {
        [O::Vec(dst), O::Vec(src), O::Imm(imm)] => (*dst, RegMem::Reg(*src), *imm),
        [O::Vec(dst), O::Mem(mem), O::Imm(imm)] => (*dst, RegMem::Mem(mem), *imm),
        _ => return Err(e.shape_err(ops)),
    };
    let width = dst.size_bits();
    let mut regs = smallvec::SmallVec::<[Reg; 2]>::from_slice(&[dst]);
    if let RegMem::Reg(r) = rm {
        check_vec_width(e, r, width)?;
        regs.push(r);
    }
    let imm = imm8_value(e, imm)?;
    let p = V3::packed(0x70, Pp::P66, false, 4);
    vex_or_evex(e, opts, &p, width, &regs, dst, None, &rm, Some(imm))
}

fn vinsertf128(e: &mut Enc<'_>, ops: &[Operand]) -> AsmResult<()> {
    use Operand as O;
    let (dst, src1, rm, imm): (Reg, Reg, RegMem<'_>, Imm) = match ops {
        [O::Vec(dst), O::Vec(src1), O::Vec(src2), O::Imm(imm)] => {
            check_vec_width(e, *src2, 128)?;
            (*dst, *src1, RegMem::Reg(*src2), *imm)
        }
        [O::Vec(dst), O::Vec(src1), O::Mem(mem), O::Imm(imm)] => {
            (*dst, *src1, RegMem::Mem(mem), *imm)
        }
        _ => return Err(e.shape_err(ops)),
    };
    check_vec_width(e, dst, 256)?;
    check_vec_width(e, src1, 256)?;
    let imm = imm8_value(e, imm)?;
    if !imm8_lane(imm) {
        return Err(e.size_err("lane selector must be 0 or 1"));
    }
    e.vex_op(0x18, OpcodeMap::M0F3A, Pp::P66, false, 1, dst, Some(src1), &rm, Some(imm))
}

fn imm8_lane(imm: u8) -> bool {
    imm <= 1
}
