//! A runtime x86/x86-64 machine-code assembler.
//!
//! Callers build instruction streams programmatically - one [`Assembler`]
//! method per mnemonic family, or the polymorphic [`Assembler::emit`] - and
//! receive a relocatable buffer of raw machine code, with the stream
//! starting at offset 0. The encoder covers the legacy, REX, VEX and EVEX
//! encodings; labels resolve forward references with automatic rel8/rel32
//! selection; and the [`abi`] layer resolves typed signatures onto the
//! System V and Windows x64 calling conventions, synthesizing prologues,
//! epilogues and clobber-free argument shuffles.
//!
//! ```
//! use assembler_x64::{Assembler, Environment, Arch, Platform, Cond};
//! use assembler_x64::reg::{RAX, RCX};
//!
//! // u64 popcount-by-loop: fn(rcx: u64) -> u64.
//! let mut asm = Assembler::new(Environment::new(Arch::X64, Platform::Linux));
//! let (head, done) = (asm.new_label(), asm.new_label());
//! asm.xor(RAX, RAX).unwrap();
//! asm.bind(head).unwrap();
//! asm.test(RCX, RCX).unwrap();
//! asm.jcc(Cond::E, done).unwrap();
//! asm.lea(RAX, assembler_x64::Amode::base(RAX, 1)).unwrap();
//! // clear the lowest set bit: rcx &= rcx - 1
//! asm.lea(assembler_x64::reg::RDX, assembler_x64::Amode::base(RCX, -1)).unwrap();
//! asm.and(RCX, assembler_x64::reg::RDX).unwrap();
//! asm.jmp(head).unwrap();
//! asm.bind(done).unwrap();
//! asm.ret().unwrap();
//! let code = asm.finalize().unwrap();
//! assert!(!code.is_empty());
//! ```
//!
//! The assembler validates user input and reports [`Error`]s instead of
//! panicking; a failed emission leaves the buffer untouched. It does not
//! verify the *semantics* of the instruction stream, map executable pages,
//! or emit object-file framing - those belong to the host.

pub mod abi;
mod asm;
mod buffer;
mod builder;
mod dispatch;
mod encode;
mod error;
mod evex;
mod imm;
mod inst;
mod mem;
mod operand;
pub mod reg;
mod rex;
mod vex;

pub use abi::{Arch, CallConv, Environment, Platform, TypeId};
pub use asm::Assembler;
pub use buffer::{CodeBuffer, Label, RelocKind};
pub use builder::{AlignMode, CodeBuilder, Node};
pub use error::{AsmResult, Error};
pub use evex::{EvexLength, EvexPrefix};
pub use imm::{Imm, ImmWidth};
pub use inst::{Cond, EmitOptions, InstId, Rep};
pub use mem::{Amode, ModRmShape, Scale};
pub use operand::{Operand, OperandKind};
pub use reg::{Reg, RegClass};
pub use rex::{encode_modrm, encode_sib, Disp, RexFlags};
pub use vex::{OpcodeMap, Pp, VexPrefix};
