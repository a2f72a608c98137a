//! Function-frame synthesis: prologue and epilogue emission.

use log::trace;
use smallvec::SmallVec;

use super::{args::FuncDetail, Arch, Environment};
use crate::error::{AsmResult, Error};
use crate::reg::{Reg, RegClass};

/// The narrow capability the frame emitter needs from an assembler.
///
/// The frame code never constructs addressing modes or immediates beyond
/// these six operations, so a test double that records calls is a complete
/// stand-in; [`crate::Assembler`] implements this against the real encoder.
pub trait FrameSink {
    fn push(&mut self, reg: Reg) -> AsmResult<()>;
    fn pop(&mut self, reg: Reg) -> AsmResult<()>;
    fn mov_rr(&mut self, dst: Reg, src: Reg) -> AsmResult<()>;
    fn sub_ri(&mut self, reg: Reg, imm: i32) -> AsmResult<()>;
    fn add_ri(&mut self, reg: Reg, imm: i32) -> AsmResult<()>;
    fn ret(&mut self) -> AsmResult<()>;
}

/// A resolved function frame: which registers to preserve, how much local
/// stack to reserve, and the alignment policy.
#[derive(Clone, Debug)]
pub struct FuncFrame {
    arch: Arch,
    preserve_fp: bool,
    /// Callee-saved registers to push, in declared order.
    preserved: SmallVec<[Reg; 8]>,
    local_size: u32,
    stack_align: u32,
    /// Red-zone bytes usable without adjusting the stack pointer (SysV
    /// leaves).
    red_zone: u32,
    /// GP registers the argument mover may clobber.
    scratch_gp: u16,
    /// Vector registers the argument mover may clobber.
    scratch_vec: u32,
}

impl FuncFrame {
    /// Start a frame description for an environment.
    #[must_use]
    pub fn new(env: &Environment) -> Self {
        Self {
            arch: env.arch,
            preserve_fp: true,
            preserved: SmallVec::new(),
            local_size: 0,
            stack_align: 16,
            red_zone: 0,
            scratch_gp: 0,
            scratch_vec: 0,
        }
    }

    /// Start a frame for a resolved signature: the red zone and alignment
    /// come from the convention.
    #[must_use]
    pub fn for_detail(env: &Environment, detail: &FuncDetail) -> Self {
        let mut frame = Self::new(env);
        frame.stack_align = detail.stack_align;
        frame
    }

    /// Add a callee-saved register to push in the prologue. Pushes happen in
    /// the order declared here.
    ///
    /// # Panics
    ///
    /// Panics on a non-GP register; vector preservation requires stack
    /// stores, which the frame emitter does not synthesize.
    pub fn add_preserved(&mut self, reg: Reg) -> &mut Self {
        assert_eq!(
            reg.class(),
            RegClass::Gp,
            "only GP registers are preserved by push/pop"
        );
        self.preserved.push(reg.with_size(self.arch.bits()));
        self
    }

    /// Reserve `bytes` of local stack.
    pub fn set_local_size(&mut self, bytes: u32) -> &mut Self {
        self.local_size = bytes;
        self
    }

    /// Skip the `push rbp; mov rbp, rsp` pair (leaf functions).
    pub fn omit_frame_pointer(&mut self) -> &mut Self {
        self.preserve_fp = false;
        self
    }

    /// Allow the first `bytes` of locals to live in the red zone below the
    /// stack pointer (SysV leaf functions; 128 bytes).
    pub fn set_red_zone(&mut self, bytes: u32) -> &mut Self {
        self.red_zone = bytes;
        self
    }

    /// Mark a register as clobberable scratch for the argument mover.
    pub fn add_scratch(&mut self, reg: Reg) -> &mut Self {
        match reg.class() {
            RegClass::Gp => self.scratch_gp |= 1 << reg.enc(),
            RegClass::Vec => self.scratch_vec |= 1 << reg.enc(),
            _ => {}
        }
        self
    }

    pub(crate) fn scratch_mask(&self, class: RegClass) -> u32 {
        match class {
            RegClass::Gp => u32::from(self.scratch_gp),
            RegClass::Vec => self.scratch_vec,
            _ => 0,
        }
    }

    pub(crate) fn arch(&self) -> Arch {
        self.arch
    }

    fn sp(&self) -> Reg {
        crate::reg::RSP.with_size(self.arch.bits())
    }

    fn fp(&self) -> Reg {
        crate::reg::RBP.with_size(self.arch.bits())
    }

    fn push_bytes(&self) -> u32 {
        let slot = u32::from(self.arch.bits()) / 8;
        let count = self.preserved.len() as u32 + u32::from(self.preserve_fp);
        count * slot
    }

    /// The padding needed so the stack pointer is aligned after the return
    /// address and all pushes.
    #[must_use]
    pub fn alignment_pad(&self) -> u32 {
        let ra = u32::from(self.arch.bits()) / 8;
        (self.stack_align - ((self.push_bytes() + ra) % self.stack_align)) % self.stack_align
    }

    /// Total stack-pointer adjustment the prologue performs (pad + locals),
    /// after red-zone elision. The alignment pad only exists when there is a
    /// local allocation to pad.
    #[must_use]
    pub fn allocated_size(&self) -> u32 {
        let local = if self.local_size <= self.red_zone {
            0
        } else {
            self.local_size
        };
        if local == 0 {
            0
        } else {
            local + self.alignment_pad()
        }
    }
}

/// Synthesize a prologue:
///
/// ```text
/// push rbp                  ; if the frame pointer is preserved
/// mov  rbp, rsp
/// push <callee-saved>...    ; in declared order
/// sub  rsp, pad + locals    ; if nonzero
/// ```
///
/// # Errors
///
/// Propagates encoder errors from the sink and rejects frames whose
/// adjustment exceeds `i32`.
pub fn emit_prologue(frame: &FuncFrame, sink: &mut impl FrameSink) -> AsmResult<()> {
    if frame.preserve_fp {
        sink.push(frame.fp())?;
        sink.mov_rr(frame.fp(), frame.sp())?;
    }
    for &reg in &frame.preserved {
        sink.push(reg)?;
    }
    let alloc = frame.allocated_size();
    if alloc > 0 {
        let alloc = i32::try_from(alloc)
            .map_err(|_| Error::InvalidState("frame allocation exceeds i32".to_owned()))?;
        sink.sub_ri(frame.sp(), alloc)?;
    }
    trace!(
        "prologue: {} pushes, {alloc} bytes allocated",
        frame.preserved.len()
    );
    Ok(())
}

/// Synthesize the matching epilogue: deallocate, pop in reverse order,
/// restore the frame pointer, `ret`.
///
/// # Errors
///
/// Propagates encoder errors from the sink.
pub fn emit_epilogue(frame: &FuncFrame, sink: &mut impl FrameSink) -> AsmResult<()> {
    let alloc = frame.allocated_size();
    if alloc > 0 {
        let alloc = i32::try_from(alloc)
            .map_err(|_| Error::InvalidState("frame allocation exceeds i32".to_owned()))?;
        sink.add_ri(frame.sp(), alloc)?;
    }
    for &reg in frame.preserved.iter().rev() {
        sink.pop(reg)?;
    }
    if frame.preserve_fp {
        sink.pop(frame.fp())?;
    }
    sink.ret()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Platform;
    use crate::reg::{R12, RBX};

    /// A sink that records calls instead of encoding them.
    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl FrameSink for Recorder {
        fn push(&mut self, reg: Reg) -> AsmResult<()> {
            self.0.push(format!("push {reg}"));
            Ok(())
        }
        fn pop(&mut self, reg: Reg) -> AsmResult<()> {
            self.0.push(format!("pop {reg}"));
            Ok(())
        }
        fn mov_rr(&mut self, dst: Reg, src: Reg) -> AsmResult<()> {
            self.0.push(format!("mov {dst}, {src}"));
            Ok(())
        }
        fn sub_ri(&mut self, reg: Reg, imm: i32) -> AsmResult<()> {
            self.0.push(format!("sub {reg}, {imm}"));
            Ok(())
        }
        fn add_ri(&mut self, reg: Reg, imm: i32) -> AsmResult<()> {
            self.0.push(format!("add {reg}, {imm}"));
            Ok(())
        }
        fn ret(&mut self) -> AsmResult<()> {
            self.0.push("ret".to_owned());
            Ok(())
        }
    }

    fn env() -> Environment {
        Environment::new(Arch::X64, Platform::Windows)
    }

    #[test]
    fn win64_two_preserved_locals_48() {
        // Two preserved GPRs and 48 bytes of locals: the three pushes plus
        // the return address already total 32 mod 16 == 0, so no pad.
        let mut frame = FuncFrame::new(&env());
        frame.add_preserved(RBX).add_preserved(R12).set_local_size(48);
        assert_eq!(frame.alignment_pad(), 0);

        let mut sink = Recorder::default();
        emit_prologue(&frame, &mut sink).unwrap();
        assert_eq!(
            sink.0,
            vec![
                "push rbp",
                "mov rbp, rsp",
                "push rbx",
                "push r12",
                "sub rsp, 48",
            ]
        );

        let mut sink = Recorder::default();
        emit_epilogue(&frame, &mut sink).unwrap();
        assert_eq!(
            sink.0,
            vec!["add rsp, 48", "pop r12", "pop rbx", "pop rbp", "ret"]
        );
    }

    #[test]
    fn odd_push_count_gets_padded() {
        // One preserved register: fp + rbx + return address = 24 bytes,
        // needing 8 bytes of pad to restore 16-byte alignment.
        let mut frame = FuncFrame::new(&env());
        frame.add_preserved(RBX).set_local_size(16);
        assert_eq!(frame.alignment_pad(), 8);
        assert_eq!(frame.allocated_size(), 24);
    }

    #[test]
    fn leaf_red_zone_elides_allocation() {
        let linux = Environment::new(Arch::X64, Platform::Linux);
        let mut frame = FuncFrame::new(&linux);
        frame.omit_frame_pointer().set_red_zone(128).set_local_size(96);
        assert_eq!(frame.allocated_size(), 0);

        let mut sink = Recorder::default();
        emit_prologue(&frame, &mut sink).unwrap();
        assert!(sink.0.is_empty(), "leaf prologue is empty");
        let mut sink = Recorder::default();
        emit_epilogue(&frame, &mut sink).unwrap();
        assert_eq!(sink.0, vec!["ret"]);
    }

    #[test]
    fn x86_frames_use_32_bit_registers() {
        let x86 = Environment::new(Arch::X86, Platform::Linux);
        let mut frame = FuncFrame::new(&x86);
        frame.set_local_size(8);
        let mut sink = Recorder::default();
        emit_prologue(&frame, &mut sink).unwrap();
        assert_eq!(sink.0[0], "push ebp");
        assert_eq!(sink.0[1], "mov ebp, esp");
    }
}
