//! Calling-convention resolution, function frames, and argument moves.
//!
//! This layer maps typed signatures onto the register/stack placements of a
//! target convention ([`args`]), synthesizes prologues and epilogues
//! ([`frame`]), and schedules clobber-free argument shuffles ([`moves`]).
//! It is the only part of the crate where virtual registers are meaningful.

pub mod args;
pub mod frame;
pub mod moves;

use crate::error::{AsmResult, Error};

/// The target instruction-set architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// 64-bit x86-64.
    X64,
}

impl Arch {
    /// The native register width in bits.
    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            Arch::X86 => 32,
            Arch::X64 => 64,
        }
    }
}

/// The target operating system, as far as calling conventions care.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Bsd,
    Other,
}

impl Platform {
    fn is_windows(self) -> bool {
        self == Platform::Windows
    }
}

/// The environment an assembler targets: architecture, platform, and the
/// default calling convention for frame/argument helpers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Environment {
    pub arch: Arch,
    pub platform: Platform,
    pub call_conv: CallConv,
}

impl Environment {
    /// Create an environment with the platform's default calling convention.
    #[must_use]
    pub fn new(arch: Arch, platform: Platform) -> Self {
        let call_conv = match arch {
            Arch::X86 => CallConv::CDecl,
            Arch::X64 if platform.is_windows() => CallConv::X64Windows,
            Arch::X64 => CallConv::X64SystemV,
        };
        Self {
            arch,
            platform,
            call_conv,
        }
    }

    /// Override the default calling convention.
    #[must_use]
    pub fn with_call_conv(mut self, call_conv: CallConv) -> Self {
        self.call_conv = call_conv;
        self
    }
}

/// A calling-convention identifier.
///
/// The 32-bit ids (`CDecl`..`RegParm`) collapse to the platform's 64-bit
/// convention when resolved against a 64-bit environment; see
/// [`CallConv::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    /// Caller-cleaned stack arguments (the 32-bit default).
    CDecl,
    /// Callee-cleaned stack arguments.
    StdCall,
    /// `this` in `ecx`, callee-cleaned.
    ThisCall,
    /// First two integer arguments in `ecx`/`edx`, callee-cleaned.
    FastCall,
    /// GCC `regparm(n)`: first `n` integer arguments in
    /// `eax`/`edx`/`ecx`.
    RegParm(u8),
    /// The System V AMD64 ABI (Linux, macOS, BSD).
    X64SystemV,
    /// The Microsoft x64 ABI.
    X64Windows,
    /// Microsoft `__vectorcall`: the x64 ABI with six vector slots.
    VectorCall,
}

impl CallConv {
    /// Resolve a convention id against an environment, collapsing the 32-bit
    /// ids to the platform convention in 64-bit mode.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for ids that do not exist on the target
    /// architecture (e.g. `X64SystemV` in 32-bit mode, `regparm(4)`).
    pub fn resolve(self, env: &Environment) -> AsmResult<CallConv> {
        match (env.arch, self) {
            (Arch::X64, CallConv::CDecl | CallConv::StdCall | CallConv::ThisCall | CallConv::FastCall | CallConv::RegParm(_)) => {
                Ok(if env.platform.is_windows() {
                    CallConv::X64Windows
                } else {
                    CallConv::X64SystemV
                })
            }
            (Arch::X64, cc @ (CallConv::X64SystemV | CallConv::X64Windows | CallConv::VectorCall)) => Ok(cc),
            (Arch::X86, CallConv::RegParm(n)) if n == 0 || n > 3 => Err(Error::InvalidArgument(
                format!("regparm({n}) is out of range; 1 to 3 registers are available"),
            )),
            (Arch::X86, cc @ (CallConv::CDecl | CallConv::StdCall | CallConv::ThisCall | CallConv::FastCall | CallConv::RegParm(_))) => Ok(cc),
            (Arch::X86, cc) => Err(Error::InvalidArgument(format!(
                "calling convention {cc:?} does not exist in 32-bit mode"
            ))),
        }
    }

    /// True if the callee pops its stack arguments on return.
    #[must_use]
    pub fn callee_pops_stack(self) -> bool {
        matches!(self, CallConv::StdCall | CallConv::ThisCall | CallConv::FastCall)
    }
}

/// The type of an argument or return value, as consumed from the host type
/// system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeId {
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// A pointer-sized signed integer.
    IntPtr,
    /// A pointer-sized unsigned integer (also used for raw pointers).
    UIntPtr,
    F32,
    F64,
    /// The x87 80-bit extended float.
    F80,
    V128,
    V256,
    V512,
}

impl TypeId {
    /// The size of a value of this type, in bytes.
    #[must_use]
    pub fn size_bytes(self, arch: Arch) -> u32 {
        match self {
            TypeId::Void => 0,
            TypeId::I8 | TypeId::U8 => 1,
            TypeId::I16 | TypeId::U16 => 2,
            TypeId::I32 | TypeId::U32 | TypeId::F32 => 4,
            TypeId::I64 | TypeId::U64 | TypeId::F64 => 8,
            TypeId::IntPtr | TypeId::UIntPtr => u32::from(arch.bits()) / 8,
            TypeId::F80 => 10,
            TypeId::V128 => 16,
            TypeId::V256 => 32,
            TypeId::V512 => 64,
        }
    }

    /// True for the integer (and pointer) types.
    #[must_use]
    pub fn is_int(self) -> bool {
        matches!(
            self,
            TypeId::I8
                | TypeId::U8
                | TypeId::I16
                | TypeId::U16
                | TypeId::I32
                | TypeId::U32
                | TypeId::I64
                | TypeId::U64
                | TypeId::IntPtr
                | TypeId::UIntPtr
        )
    }

    /// True for the scalar floating-point types.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, TypeId::F32 | TypeId::F64 | TypeId::F80)
    }

    /// True for the vector types.
    #[must_use]
    pub fn is_vec(self) -> bool {
        matches!(self, TypeId::V128 | TypeId::V256 | TypeId::V512)
    }

    /// The vector width in bits, for vector types.
    #[must_use]
    pub fn vec_bits(self) -> Option<u16> {
        match self {
            TypeId::V128 => Some(128),
            TypeId::V256 => Some(256),
            TypeId::V512 => Some(512),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventions_collapse_in_64_bit_mode() {
        let linux = Environment::new(Arch::X64, Platform::Linux);
        let windows = Environment::new(Arch::X64, Platform::Windows);
        assert_eq!(CallConv::CDecl.resolve(&linux).unwrap(), CallConv::X64SystemV);
        assert_eq!(CallConv::FastCall.resolve(&windows).unwrap(), CallConv::X64Windows);
        assert_eq!(CallConv::VectorCall.resolve(&windows).unwrap(), CallConv::VectorCall);
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let x86 = Environment::new(Arch::X86, Platform::Linux);
        assert!(CallConv::X64SystemV.resolve(&x86).is_err());
        assert!(CallConv::RegParm(4).resolve(&x86).is_err());
        assert!(CallConv::RegParm(2).resolve(&x86).is_ok());
    }

    #[test]
    fn type_queries() {
        assert!(TypeId::I32.is_int());
        assert!(TypeId::F64.is_float());
        assert!(TypeId::V256.is_vec());
        assert_eq!(TypeId::IntPtr.size_bytes(Arch::X86), 4);
        assert_eq!(TypeId::IntPtr.size_bytes(Arch::X64), 8);
        assert_eq!(TypeId::V512.size_bytes(Arch::X64), 64);
    }
}
