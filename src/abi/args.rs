//! Mapping typed signatures onto registers and stack slots.

use log::trace;
use smallvec::SmallVec;

use super::{Arch, CallConv, Environment, TypeId};
use crate::error::{AsmResult, Error};
use crate::reg::enc;

/// Where one argument or return value lives after resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncValue {
    /// A general-purpose register, by hardware encoding.
    GpReg(u8),
    /// A vector register, by hardware encoding and width in bits.
    VecReg(u8, u16),
    /// An AVX-512 mask register.
    MaskReg(u8),
    /// An x87 stack register (32-bit float returns).
    StReg(u8),
    /// A stack slot at this byte offset from the stack pointer at entry to
    /// the callee's shadow/argument area.
    Stack(i32),
    /// A pointer to the value, passed in a general-purpose register slot
    /// (Win64 wide-vector arguments).
    IndirectReg(u8),
    /// A pointer to the value, passed in a stack slot.
    IndirectStack(i32),
}

impl FuncValue {
    /// True if the value is carried directly or indirectly in a register.
    #[must_use]
    pub fn is_reg(&self) -> bool {
        matches!(
            self,
            FuncValue::GpReg(_)
                | FuncValue::VecReg(..)
                | FuncValue::MaskReg(_)
                | FuncValue::StReg(_)
                | FuncValue::IndirectReg(_)
        )
    }

    /// The stack offset, for the stack-resident variants.
    #[must_use]
    pub fn stack_offset(&self) -> Option<i32> {
        match self {
            FuncValue::Stack(off) | FuncValue::IndirectStack(off) => Some(*off),
            _ => None,
        }
    }
}

/// A typed function signature to resolve.
#[derive(Clone, Debug)]
pub struct FuncSignature {
    pub call_conv: CallConv,
    pub ret: TypeId,
    pub args: Vec<TypeId>,
    /// The index of the first variadic argument, if the function is variadic.
    pub va_index: Option<u32>,
}

impl FuncSignature {
    /// Create a signature with no variadic arguments.
    #[must_use]
    pub fn new(call_conv: CallConv, ret: TypeId, args: Vec<TypeId>) -> Self {
        Self {
            call_conv,
            ret,
            args,
            va_index: None,
        }
    }

    /// Mark the signature variadic starting at `index`.
    #[must_use]
    pub fn with_va_index(mut self, index: u32) -> Self {
        self.va_index = Some(index);
        self
    }
}

/// A fully resolved signature: one [`FuncValue`] per argument and return
/// slot, plus the convention's frame parameters.
#[derive(Clone, Debug)]
pub struct FuncDetail {
    /// The resolved convention (never one of the collapsing 32-bit ids in
    /// 64-bit mode).
    pub call_conv: CallConv,
    pub args: Vec<FuncValue>,
    /// Return placements; two entries for 32-bit `eax:edx` splits.
    pub rets: SmallVec<[FuncValue; 2]>,
    /// Bytes of stack consumed by arguments, including any shadow space.
    pub stack_args_size: u32,
    /// Bytes the caller reserves for callee register spills (Win64: 32).
    pub shadow_space: u32,
    /// Bytes below the stack pointer a leaf may use (SysV: 128).
    pub red_zone_size: u32,
    /// Natural stack alignment at a call site.
    pub stack_align: u32,
    /// True if the callee pops the stack arguments (`stdcall` family).
    pub callee_pops: bool,
    /// Bitmask of GP registers assigned to arguments or returns.
    pub used_gp: u16,
    /// Bitmask of vector registers assigned to arguments or returns.
    pub used_vec: u32,
    /// Bitmask of GP registers the callee must preserve.
    pub preserved_gp: u16,
    /// Bitmask of vector registers the callee must preserve.
    pub preserved_vec: u32,
}

impl FuncDetail {
    /// Bytes needed to save one preserved register of each group.
    #[must_use]
    pub fn reg_save_size(arch: Arch) -> (u32, u32, u32) {
        let gp = u32::from(arch.bits()) / 8;
        (gp, 16, 8)
    }
}

const SYSV_GP_ORDER: [u8; 6] = [enc::RDI, enc::RSI, enc::RDX, enc::RCX, enc::R8, enc::R9];
const WIN64_GP_ORDER: [u8; 4] = [enc::RCX, enc::RDX, enc::R8, enc::R9];

const SYSV_PRESERVED_GP: u16 =
    bit(enc::RBX) | bit(enc::RBP) | bit(enc::R12) | bit(enc::R13) | bit(enc::R14) | bit(enc::R15);
const WIN64_PRESERVED_GP: u16 = SYSV_PRESERVED_GP | bit(enc::RSI) | bit(enc::RDI);
/// Win64 preserves `xmm6`..`xmm15`.
const WIN64_PRESERVED_VEC: u32 = 0b1111_1111_1100_0000;
const X86_PRESERVED_GP: u16 = bit(enc::RBX) | bit(enc::RBP) | bit(enc::RSI) | bit(enc::RDI);

const fn bit(enc: u8) -> u16 {
    1 << enc
}

fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Resolve `sig` against `env`, producing per-slot placements.
///
/// # Errors
///
/// [`Error::InvalidArgument`] for convention ids foreign to the architecture
/// or types a convention cannot carry.
pub fn resolve(sig: &FuncSignature, env: &Environment) -> AsmResult<FuncDetail> {
    let call_conv = sig.call_conv.resolve(env)?;
    let detail = match env.arch {
        Arch::X64 => resolve_x64(sig, call_conv)?,
        Arch::X86 => resolve_x86(sig, call_conv)?,
    };
    trace!(
        "resolved {call_conv:?} signature: {} args, stack {} bytes",
        detail.args.len(),
        detail.stack_args_size
    );
    Ok(detail)
}

fn resolve_x64(sig: &FuncSignature, call_conv: CallConv) -> AsmResult<FuncDetail> {
    let windows_style = matches!(call_conv, CallConv::X64Windows | CallConv::VectorCall);
    let (gp_order, vec_slots): (&[u8], usize) = match call_conv {
        CallConv::X64SystemV => (&SYSV_GP_ORDER, 8),
        CallConv::X64Windows => (&WIN64_GP_ORDER, 4),
        CallConv::VectorCall => (&WIN64_GP_ORDER, 6),
        _ => unreachable!("32-bit ids collapse during CallConv::resolve"),
    };
    let shadow_space = if windows_style { 32 } else { 0 };
    let red_zone_size = if windows_style { 0 } else { 128 };

    let mut detail = FuncDetail {
        call_conv,
        args: Vec::with_capacity(sig.args.len()),
        rets: SmallVec::new(),
        stack_args_size: 0,
        shadow_space,
        red_zone_size,
        stack_align: 16,
        callee_pops: false,
        used_gp: 0,
        used_vec: 0,
        preserved_gp: if windows_style {
            WIN64_PRESERVED_GP
        } else {
            SYSV_PRESERVED_GP
        },
        preserved_vec: if windows_style { WIN64_PRESERVED_VEC } else { 0 },
    };

    // Return slot.
    match sig.ret {
        TypeId::Void => {}
        ty if ty.is_int() => {
            detail.rets.push(FuncValue::GpReg(enc::RAX));
            detail.used_gp |= bit(enc::RAX);
        }
        TypeId::F32 | TypeId::F64 => {
            detail.rets.push(FuncValue::VecReg(0, 128));
            detail.used_vec |= 1;
        }
        TypeId::F80 => {
            if windows_style {
                return Err(Error::InvalidArgument(
                    "the Windows x64 conventions cannot return an 80-bit float".to_owned(),
                ));
            }
            detail.rets.push(FuncValue::StReg(0));
        }
        ty => {
            let bits = ty.vec_bits().expect("remaining types are vectors");
            detail.rets.push(FuncValue::VecReg(0, bits));
            detail.used_vec |= 1;
        }
    }

    let mut next_gp = 0usize;
    let mut next_vec = 0usize;
    let mut next_stack = shadow_space;

    for (i, &ty) in sig.args.iter().enumerate() {
        let is_vararg = sig.va_index.is_some_and(|va| i as u32 >= va);
        let value = if windows_style {
            // Win64: one shared sequence of numbered slots.
            let slot = next_gp;
            next_gp += 1;
            next_vec = next_gp;
            if ty.is_int() {
                if slot < gp_order.len() {
                    FuncValue::GpReg(gp_order[slot])
                } else {
                    win64_stack_slot(&mut next_stack)
                }
            } else if ty.is_float() {
                if ty == TypeId::F80 {
                    return Err(Error::InvalidArgument(
                        "the Windows x64 conventions cannot pass an 80-bit float".to_owned(),
                    ));
                }
                if is_vararg {
                    // Variadic floats travel in the integer slot so the
                    // callee can spill them without knowing the types.
                    if slot < gp_order.len() {
                        FuncValue::GpReg(gp_order[slot])
                    } else {
                        win64_stack_slot(&mut next_stack)
                    }
                } else if slot < vec_slots {
                    #[allow(clippy::cast_possible_truncation)]
                    let value = FuncValue::VecReg(slot as u8, 128);
                    value
                } else {
                    win64_stack_slot(&mut next_stack)
                }
            } else if ty.is_vec() {
                let bits = ty.vec_bits().unwrap();
                // Vectorcall passes vectors by value in its six slots;
                // plain Win64 passes anything wider than 64 bits
                // indirectly.
                if call_conv == CallConv::VectorCall && slot < vec_slots && !is_vararg {
                    #[allow(clippy::cast_possible_truncation)]
                    let value = FuncValue::VecReg(slot as u8, bits);
                    value
                } else if slot < gp_order.len() {
                    FuncValue::IndirectReg(gp_order[slot])
                } else {
                    let slot = win64_stack_slot(&mut next_stack);
                    match slot {
                        FuncValue::Stack(off) => FuncValue::IndirectStack(off),
                        _ => unreachable!(),
                    }
                }
            } else {
                return Err(Error::InvalidArgument(format!(
                    "type {ty:?} cannot be passed as an argument"
                )));
            }
        } else {
            // SysV: separate GP and vector orders.
            if ty.is_int() {
                if next_gp < gp_order.len() {
                    let reg = gp_order[next_gp];
                    next_gp += 1;
                    FuncValue::GpReg(reg)
                } else {
                    sysv_stack_slot(&mut next_stack, ty)
                }
            } else if ty.is_float() || ty.is_vec() {
                if ty == TypeId::F80 {
                    // Extended floats always travel on the stack.
                    sysv_stack_slot(&mut next_stack, ty)
                } else if next_vec < vec_slots {
                    let bits = ty.vec_bits().unwrap_or(128);
                    #[allow(clippy::cast_possible_truncation)]
                    let value = FuncValue::VecReg(next_vec as u8, bits);
                    next_vec += 1;
                    value
                } else {
                    sysv_stack_slot(&mut next_stack, ty)
                }
            } else {
                return Err(Error::InvalidArgument(format!(
                    "type {ty:?} cannot be passed as an argument"
                )));
            }
        };
        mark_used(&mut detail, &value);
        detail.args.push(value);
    }

    detail.stack_args_size = next_stack;
    Ok(detail)
}

fn win64_stack_slot(next_stack: &mut u32) -> FuncValue {
    let off = *next_stack;
    *next_stack += 8;
    FuncValue::Stack(i32::try_from(off).unwrap())
}

fn sysv_stack_slot(next_stack: &mut u32, ty: TypeId) -> FuncValue {
    let size = ty.size_bytes(Arch::X64);
    // Every slot is at least 8 bytes; wider arguments land at their natural
    // alignment.
    let align = size.next_power_of_two().max(8);
    let off = round_up(*next_stack, align);
    *next_stack = off + size.max(8);
    FuncValue::Stack(i32::try_from(off).unwrap())
}

fn resolve_x86(sig: &FuncSignature, call_conv: CallConv) -> AsmResult<FuncDetail> {
    let reg_order: &[u8] = match call_conv {
        CallConv::FastCall => &[enc::RCX, enc::RDX],
        CallConv::ThisCall => &[enc::RCX],
        CallConv::RegParm(1) => &[enc::RAX],
        CallConv::RegParm(2) => &[enc::RAX, enc::RDX],
        CallConv::RegParm(3) => &[enc::RAX, enc::RDX, enc::RCX],
        _ => &[],
    };

    let mut detail = FuncDetail {
        call_conv,
        args: Vec::with_capacity(sig.args.len()),
        rets: SmallVec::new(),
        stack_args_size: 0,
        shadow_space: 0,
        red_zone_size: 0,
        stack_align: 16,
        callee_pops: call_conv.callee_pops_stack(),
        used_gp: 0,
        used_vec: 0,
        preserved_gp: X86_PRESERVED_GP,
        preserved_vec: 0,
    };

    match sig.ret {
        TypeId::Void => {}
        TypeId::I64 | TypeId::U64 => {
            // 64-bit results split across eax:edx.
            detail.rets.push(FuncValue::GpReg(enc::RAX));
            detail.rets.push(FuncValue::GpReg(enc::RDX));
            detail.used_gp |= bit(enc::RAX) | bit(enc::RDX);
        }
        ty if ty.is_int() => {
            detail.rets.push(FuncValue::GpReg(enc::RAX));
            detail.used_gp |= bit(enc::RAX);
        }
        ty if ty.is_float() => {
            detail.rets.push(FuncValue::StReg(0));
        }
        ty => {
            let bits = ty.vec_bits().expect("remaining types are vectors");
            detail.rets.push(FuncValue::VecReg(0, bits));
            detail.used_vec |= 1;
        }
    }

    let mut next_reg = 0usize;
    let mut next_stack = 0u32;
    for (i, &ty) in sig.args.iter().enumerate() {
        let reg_eligible = ty.is_int()
            && ty.size_bytes(Arch::X86) <= 4
            && sig.va_index.map_or(true, |va| (i as u32) < va)
            && (call_conv != CallConv::ThisCall || i == 0);
        let value = if reg_eligible && next_reg < reg_order.len() {
            let reg = reg_order[next_reg];
            next_reg += 1;
            FuncValue::GpReg(reg)
        } else {
            let size = ty.size_bytes(Arch::X86);
            let off = round_up(next_stack, 4);
            next_stack = off + round_up(size.max(4), 4);
            FuncValue::Stack(i32::try_from(off).unwrap())
        };
        mark_used(&mut detail, &value);
        detail.args.push(value);
    }

    detail.stack_args_size = next_stack;
    Ok(detail)
}

fn mark_used(detail: &mut FuncDetail, value: &FuncValue) {
    match value {
        FuncValue::GpReg(r) | FuncValue::IndirectReg(r) => detail.used_gp |= bit(*r),
        FuncValue::VecReg(r, _) => detail.used_vec |= 1 << r,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Platform;

    fn sysv_env() -> Environment {
        Environment::new(Arch::X64, Platform::Linux)
    }

    fn win_env() -> Environment {
        Environment::new(Arch::X64, Platform::Windows)
    }

    #[test]
    fn sysv_three_ints() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::I64,
            vec![TypeId::I64, TypeId::I64, TypeId::I64],
        );
        let d = resolve(&sig, &sysv_env()).unwrap();
        assert_eq!(d.args[0], FuncValue::GpReg(enc::RDI));
        assert_eq!(d.args[1], FuncValue::GpReg(enc::RSI));
        assert_eq!(d.args[2], FuncValue::GpReg(enc::RDX));
        assert_eq!(d.rets[0], FuncValue::GpReg(enc::RAX));
        assert_eq!(d.stack_args_size, 0);
        assert_eq!(d.red_zone_size, 128);
    }

    #[test]
    fn win64_three_ints() {
        let sig = FuncSignature::new(
            CallConv::CDecl,
            TypeId::I64,
            vec![TypeId::I64, TypeId::I64, TypeId::I64],
        );
        let d = resolve(&sig, &win_env()).unwrap();
        assert_eq!(d.call_conv, CallConv::X64Windows);
        assert_eq!(d.args[0], FuncValue::GpReg(enc::RCX));
        assert_eq!(d.args[1], FuncValue::GpReg(enc::RDX));
        assert_eq!(d.args[2], FuncValue::GpReg(enc::R8));
        assert_eq!(d.rets[0], FuncValue::GpReg(enc::RAX));
        assert_eq!(d.stack_args_size, 32, "shadow space counts");
        assert_eq!(d.shadow_space, 32);
    }

    #[test]
    fn win64_shared_slots() {
        // Win64 slot sharing: a float in position 1 consumes xmm1, and the
        // int in position 2 consumes r8.
        let sig = FuncSignature::new(
            CallConv::X64Windows,
            TypeId::Void,
            vec![TypeId::I64, TypeId::F64, TypeId::I64],
        );
        let d = resolve(&sig, &win_env()).unwrap();
        assert_eq!(d.args[0], FuncValue::GpReg(enc::RCX));
        assert_eq!(d.args[1], FuncValue::VecReg(1, 128));
        assert_eq!(d.args[2], FuncValue::GpReg(enc::R8));
    }

    #[test]
    fn sysv_separate_orders() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::Void,
            vec![TypeId::I64, TypeId::F64, TypeId::I64],
        );
        let d = resolve(&sig, &sysv_env()).unwrap();
        assert_eq!(d.args[0], FuncValue::GpReg(enc::RDI));
        assert_eq!(d.args[1], FuncValue::VecReg(0, 128));
        assert_eq!(d.args[2], FuncValue::GpReg(enc::RSI));
    }

    #[test]
    fn win64_wide_vectors_go_indirect() {
        let sig = FuncSignature::new(
            CallConv::X64Windows,
            TypeId::Void,
            vec![TypeId::V256, TypeId::I64, TypeId::V128, TypeId::V128, TypeId::V128],
        );
        let d = resolve(&sig, &win_env()).unwrap();
        assert_eq!(d.args[0], FuncValue::IndirectReg(enc::RCX));
        assert_eq!(d.args[1], FuncValue::GpReg(enc::RDX));
        assert_eq!(d.args[2], FuncValue::IndirectReg(enc::R8));
        assert_eq!(d.args[3], FuncValue::IndirectReg(enc::R9));
        assert_eq!(d.args[4], FuncValue::IndirectStack(32));
    }

    #[test]
    fn vectorcall_passes_vectors_by_value() {
        let sig = FuncSignature::new(
            CallConv::VectorCall,
            TypeId::Void,
            vec![TypeId::V256, TypeId::V128, TypeId::F32],
        );
        let d = resolve(&sig, &win_env()).unwrap();
        assert_eq!(d.args[0], FuncValue::VecReg(0, 256));
        assert_eq!(d.args[1], FuncValue::VecReg(1, 128));
        assert_eq!(d.args[2], FuncValue::VecReg(2, 128));
    }

    #[test]
    fn sysv_stack_overflow_args() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::Void,
            vec![TypeId::I64; 8],
        );
        let d = resolve(&sig, &sysv_env()).unwrap();
        assert_eq!(d.args[5], FuncValue::GpReg(enc::R9));
        assert_eq!(d.args[6], FuncValue::Stack(0));
        assert_eq!(d.args[7], FuncValue::Stack(8));
        assert_eq!(d.stack_args_size, 16);
    }

    #[test]
    fn counting_invariant() {
        let sig = FuncSignature::new(
            CallConv::X64Windows,
            TypeId::F64,
            vec![
                TypeId::I32,
                TypeId::F32,
                TypeId::V128,
                TypeId::I64,
                TypeId::F64,
                TypeId::I8,
                TypeId::V256,
            ],
        );
        let d = resolve(&sig, &win_env()).unwrap();
        assert_eq!(d.args.len(), sig.args.len());
        // Stack offsets are at or past the shadow space and strictly
        // increasing.
        let mut last = -1i64;
        for arg in &d.args {
            if let Some(off) = arg.stack_offset() {
                assert!(off >= 32);
                assert!(i64::from(off) > last);
                last = i64::from(off);
            }
        }
        // No register is assigned twice.
        let regs: Vec<_> = d
            .args
            .iter()
            .filter(|a| a.is_reg())
            .collect();
        for (i, a) in regs.iter().enumerate() {
            for b in &regs[i + 1..] {
                assert_ne!(a, b, "two arguments share a register");
            }
        }
    }

    #[test]
    fn x86_cdecl_and_fastcall() {
        let x86 = Environment::new(Arch::X86, Platform::Linux);
        let sig = FuncSignature::new(CallConv::CDecl, TypeId::I64, vec![TypeId::I32, TypeId::I32]);
        let d = resolve(&sig, &x86).unwrap();
        assert_eq!(d.args[0], FuncValue::Stack(0));
        assert_eq!(d.args[1], FuncValue::Stack(4));
        assert_eq!(d.rets.as_slice(), &[FuncValue::GpReg(enc::RAX), FuncValue::GpReg(enc::RDX)]);
        assert!(!d.callee_pops);

        let sig = FuncSignature::new(
            CallConv::FastCall,
            TypeId::Void,
            vec![TypeId::I32, TypeId::I32, TypeId::I32],
        );
        let d = resolve(&sig, &x86).unwrap();
        assert_eq!(d.args[0], FuncValue::GpReg(enc::RCX));
        assert_eq!(d.args[1], FuncValue::GpReg(enc::RDX));
        assert_eq!(d.args[2], FuncValue::Stack(0));
        assert!(d.callee_pops);
    }

    #[test]
    fn x87_return_in_32_bit_mode() {
        let x86 = Environment::new(Arch::X86, Platform::Linux);
        let sig = FuncSignature::new(CallConv::CDecl, TypeId::F80, vec![]);
        let d = resolve(&sig, &x86).unwrap();
        assert_eq!(d.rets[0], FuncValue::StReg(0));
    }
}
