//! The assembler: the user-facing surface tying the buffer, dispatcher and
//! ABI helpers together.

use crate::abi::frame::{self, FrameSink, FuncFrame};
use crate::abi::moves::{self, FuncArgsAssignment, MoveSink};
use crate::abi::args::FuncDetail;
use crate::abi::{Arch, Environment};
use crate::buffer::{CodeBuffer, Label};
use crate::dispatch;
use crate::error::AsmResult;
use crate::inst::{Cond, EmitOptions, InstId, Rep};
use crate::mem::Amode;
use crate::operand::Operand;
use crate::reg::{Reg, RegClass};

/// A runtime x86/x86-64 assembler.
///
/// An assembler exclusively owns its code buffer, label table and relocation
/// table; the instruction stream starts at offset 0 of the buffer returned
/// by [`Assembler::finalize`].
///
/// ```
/// use assembler_x64::{Assembler, Environment, Arch, Platform};
/// use assembler_x64::reg::{RAX, RCX};
///
/// let mut asm = Assembler::new(Environment::new(Arch::X64, Platform::Linux));
/// asm.mov(RAX, RCX).unwrap();
/// asm.ret().unwrap();
/// assert_eq!(asm.finalize().unwrap(), vec![0x48, 0x89, 0xc8, 0xc3]);
/// ```
pub struct Assembler {
    env: Environment,
    buf: CodeBuffer,
}

macro_rules! fwd0 {
    ($($(#[$doc:meta])* $name:ident => $id:expr;)+) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self) -> AsmResult<()> {
                self.emit($id, &[])
            }
        )+
    };
}

macro_rules! fwd1 {
    ($($(#[$doc:meta])* $name:ident => $id:expr;)+) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, op: impl Into<Operand>) -> AsmResult<()> {
                self.emit($id, &[op.into()])
            }
        )+
    };
}

macro_rules! fwd2 {
    ($($(#[$doc:meta])* $name:ident => $id:expr;)+) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> AsmResult<()> {
                self.emit($id, &[dst.into(), src.into()])
            }
        )+
    };
}

macro_rules! fwd3 {
    ($($(#[$doc:meta])* $name:ident => $id:expr;)+) => {
        $(
            $(#[$doc])*
            pub fn $name(
                &mut self,
                dst: impl Into<Operand>,
                a: impl Into<Operand>,
                b: impl Into<Operand>,
            ) -> AsmResult<()> {
                self.emit($id, &[dst.into(), a.into(), b.into()])
            }
        )+
    };
}

impl Assembler {
    /// Create an assembler targeting `env`.
    #[must_use]
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            buf: CodeBuffer::new(),
        }
    }

    /// The environment this assembler targets.
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Emit one instruction through the dispatcher.
    ///
    /// # Errors
    ///
    /// Any of the shape/size/combination errors of the dispatcher; the
    /// buffer is unchanged on error.
    pub fn emit(&mut self, id: InstId, operands: &[Operand]) -> AsmResult<()> {
        self.emit_with(id, operands, &EmitOptions::default())
    }

    /// Emit one instruction with explicit [`EmitOptions`] (short-branch
    /// forcing, REP prefixes, AVX-512 masking).
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn emit_with(
        &mut self,
        id: InstId,
        operands: &[Operand],
        opts: &EmitOptions,
    ) -> AsmResult<()> {
        dispatch::emit_inst(&mut self.buf, self.env.arch == Arch::X86, id, operands, opts)
    }

    // --- Labels -----------------------------------------------------------

    /// Allocate a fresh unbound label.
    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    /// Allocate a fresh unbound label with a diagnostic name.
    pub fn new_named_label(&mut self, name: &str) -> Label {
        self.buf.new_named_label(name)
    }

    /// Bind `label` to the current offset, patching all pending references.
    ///
    /// # Errors
    ///
    /// See [`CodeBuffer::bind`].
    pub fn bind(&mut self, label: Label) -> AsmResult<()> {
        self.buf.bind(label)
    }

    /// The offset `label` is bound to, if bound.
    #[must_use]
    pub fn offset_of(&self, label: Label) -> Option<u32> {
        self.buf.label_offset(label)
    }

    // --- Buffer -----------------------------------------------------------

    /// The bytes emitted so far.
    #[must_use]
    pub fn code_bytes(&self) -> &[u8] {
        self.buf.data()
    }

    /// The current emission offset.
    #[must_use]
    pub fn current_offset(&self) -> u32 {
        self.buf.cur_offset()
    }

    /// NOP-pad to an alignment boundary.
    pub fn align(&mut self, align: u32) {
        self.buf.align(align);
    }

    /// Zero-pad to an alignment boundary (for embedded data).
    pub fn align_data(&mut self, align: u32) {
        self.buf.align_data(align);
    }

    /// Append raw bytes with no instruction decoding.
    pub fn embed(&mut self, bytes: &[u8]) {
        self.buf.put_bytes(bytes);
    }

    /// Finish assembly, checking that no relocation is left unresolved.
    ///
    /// # Errors
    ///
    /// [`crate::Error::UnboundLabel`] if any label with recorded uses was
    /// never bound.
    pub fn finalize(self) -> AsmResult<Vec<u8>> {
        self.buf.finalize()
    }

    // --- Branches ---------------------------------------------------------

    /// `jmp` to a label, register or memory target.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn jmp(&mut self, target: impl Into<Operand>) -> AsmResult<()> {
        self.emit(InstId::Jmp, &[target.into()])
    }

    /// `jmp` to a label, forcing the 2-byte rel8 form. A forward reference
    /// fails at bind time if it ends up out of range.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`] and [`crate::Error::Rel8OutOfRange`].
    pub fn jmp_short(&mut self, label: Label) -> AsmResult<()> {
        let opts = EmitOptions {
            force_short: true,
            ..EmitOptions::default()
        };
        self.emit_with(InstId::Jmp, &[label.into()], &opts)
    }

    /// Conditional jump to a label.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn jcc(&mut self, cc: Cond, label: Label) -> AsmResult<()> {
        self.emit(InstId::Jcc(cc), &[label.into()])
    }

    /// Conditional jump forced to its 2-byte rel8 form.
    ///
    /// # Errors
    ///
    /// See [`Assembler::jmp_short`].
    pub fn jcc_short(&mut self, cc: Cond, label: Label) -> AsmResult<()> {
        let opts = EmitOptions {
            force_short: true,
            ..EmitOptions::default()
        };
        self.emit_with(InstId::Jcc(cc), &[label.into()], &opts)
    }

    /// `call` a label, register or memory target.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn call(&mut self, target: impl Into<Operand>) -> AsmResult<()> {
        self.emit(InstId::Call, &[target.into()])
    }

    /// `ret` popping `bytes` of stack arguments.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn ret_imm(&mut self, bytes: u16) -> AsmResult<()> {
        self.emit(InstId::Ret, &[i64::from(bytes).into()])
    }

    /// Set a byte on condition.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn setcc(&mut self, cc: Cond, dst: impl Into<Operand>) -> AsmResult<()> {
        self.emit(InstId::Setcc(cc), &[dst.into()])
    }

    /// Conditional move.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn cmovcc(
        &mut self,
        cc: Cond,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> AsmResult<()> {
        self.emit(InstId::Cmovcc(cc), &[dst.into(), src.into()])
    }

    /// A string instruction under a repeat prefix, e.g.
    /// `rep(Rep::Rep, InstId::Movsq)`.
    ///
    /// # Errors
    ///
    /// See [`Assembler::emit`].
    pub fn rep(&mut self, rep: Rep, id: InstId) -> AsmResult<()> {
        let opts = EmitOptions {
            rep: Some(rep),
            ..EmitOptions::default()
        };
        self.emit_with(id, &[], &opts)
    }

    fwd2! {
        /// Move between registers, memory and immediates.
        mov => InstId::Mov;
        /// Zero-extending move from a narrower source.
        movzx => InstId::Movzx;
        /// Sign-extending move from a narrower source.
        movsx => InstId::Movsx;
        /// Sign-extending move from a 32-bit source to a 64-bit register.
        movsxd => InstId::Movsxd;
        /// Load effective address.
        lea => InstId::Lea;
        /// Exchange two operands.
        xchg => InstId::Xchg;
        add => InstId::Add;
        or => InstId::Or;
        adc => InstId::Adc;
        sbb => InstId::Sbb;
        and => InstId::And;
        sub => InstId::Sub;
        xor => InstId::Xor;
        cmp => InstId::Cmp;
        test => InstId::Test;
        /// Two-operand `imul`.
        imul => InstId::Imul;
        rol => InstId::Rol;
        ror => InstId::Ror;
        rcl => InstId::Rcl;
        rcr => InstId::Rcr;
        shl => InstId::Shl;
        shr => InstId::Shr;
        sar => InstId::Sar;
        bt => InstId::Bt;
        bts => InstId::Bts;
        btr => InstId::Btr;
        btc => InstId::Btc;
        bsf => InstId::Bsf;
        bsr => InstId::Bsr;
        popcnt => InstId::Popcnt;
        lzcnt => InstId::Lzcnt;
        tzcnt => InstId::Tzcnt;
        movaps => InstId::Movaps;
        movups => InstId::Movups;
        movapd => InstId::Movapd;
        movupd => InstId::Movupd;
        movdqa => InstId::Movdqa;
        movdqu => InstId::Movdqu;
        movss => InstId::Movss;
        movsd => InstId::Movsd;
        movd => InstId::Movd;
        movq => InstId::Movq;
        addps => InstId::Addps;
        addpd => InstId::Addpd;
        addss => InstId::Addss;
        addsd => InstId::Addsd;
        subps => InstId::Subps;
        subpd => InstId::Subpd;
        subss => InstId::Subss;
        subsd => InstId::Subsd;
        mulps => InstId::Mulps;
        mulpd => InstId::Mulpd;
        mulss => InstId::Mulss;
        mulsd => InstId::Mulsd;
        divps => InstId::Divps;
        divpd => InstId::Divpd;
        divss => InstId::Divss;
        divsd => InstId::Divsd;
        sqrtss => InstId::Sqrtss;
        sqrtsd => InstId::Sqrtsd;
        andps => InstId::Andps;
        andpd => InstId::Andpd;
        orps => InstId::Orps;
        orpd => InstId::Orpd;
        xorps => InstId::Xorps;
        xorpd => InstId::Xorpd;
        pand => InstId::Pand;
        por => InstId::Por;
        pxor => InstId::Pxor;
        ucomiss => InstId::Ucomiss;
        ucomisd => InstId::Ucomisd;
        cvtsi2ss => InstId::Cvtsi2ss;
        cvtsi2sd => InstId::Cvtsi2sd;
        cvttss2si => InstId::Cvttss2si;
        cvttsd2si => InstId::Cvttsd2si;
        cvtss2sd => InstId::Cvtss2sd;
        cvtsd2ss => InstId::Cvtsd2ss;
        /// EVEX-capable whole-register move (use [`Assembler::emit_with`]
        /// for masked forms).
        vmovaps => InstId::Vmovaps;
        vmovups => InstId::Vmovups;
        vmovdqa => InstId::Vmovdqa;
        vmovdqu => InstId::Vmovdqu;
        vsqrtps => InstId::Vsqrtps;
        vsqrtpd => InstId::Vsqrtpd;
    }

    fwd3! {
        vaddps => InstId::Vaddps;
        vaddpd => InstId::Vaddpd;
        vaddss => InstId::Vaddss;
        vaddsd => InstId::Vaddsd;
        vsubps => InstId::Vsubps;
        vsubpd => InstId::Vsubpd;
        vmulps => InstId::Vmulps;
        vmulpd => InstId::Vmulpd;
        vdivps => InstId::Vdivps;
        vdivpd => InstId::Vdivpd;
        vandps => InstId::Vandps;
        vorps => InstId::Vorps;
        vxorps => InstId::Vxorps;
        vxorpd => InstId::Vxorpd;
        vpand => InstId::Vpand;
        vpor => InstId::Vpor;
        vpxor => InstId::Vpxor;
        vpaddd => InstId::Vpaddd;
        vpaddq => InstId::Vpaddq;
        vpsubd => InstId::Vpsubd;
        vpsubq => InstId::Vpsubq;
    }

    fwd1! {
        inc => InstId::Inc;
        dec => InstId::Dec;
        not => InstId::Not;
        neg => InstId::Neg;
        /// One-operand widening multiply (`rdx:rax <- rax * src`).
        mul => InstId::Mul;
        div => InstId::Div;
        idiv => InstId::Idiv;
        push => InstId::Push;
        pop => InstId::Pop;
    }

    fwd0! {
        /// Return with no stack adjustment.
        ret => InstId::Ret;
        nop => InstId::Nop;
        int3 => InstId::Int3;
        ud2 => InstId::Ud2;
        cpuid => InstId::Cpuid;
        pause => InstId::Pause;
        hlt => InstId::Hlt;
        leave => InstId::Leave;
        cwde => InstId::Cwde;
        cdqe => InstId::Cdqe;
        cdq => InstId::Cdq;
        cqo => InstId::Cqo;
        mfence => InstId::Mfence;
        lfence => InstId::Lfence;
        sfence => InstId::Sfence;
        movsb => InstId::Movsb;
        movsw => InstId::Movsw;
        movsl => InstId::Movsl;
        movsq => InstId::Movsq;
        stosb => InstId::Stosb;
        stosw => InstId::Stosw;
        stosl => InstId::Stosl;
        stosq => InstId::Stosq;
        lodsb => InstId::Lodsb;
        lodsq => InstId::Lodsq;
        scasb => InstId::Scasb;
        scasq => InstId::Scasq;
        cmpsb => InstId::Cmpsb;
        cmpsq => InstId::Cmpsq;
    }

    // --- Frame and argument helpers ----------------------------------------

    /// Emit the prologue for a resolved frame.
    ///
    /// # Errors
    ///
    /// See [`frame::emit_prologue`].
    pub fn emit_prologue(&mut self, frame: &FuncFrame) -> AsmResult<()> {
        frame::emit_prologue(frame, self)
    }

    /// Emit the epilogue for a resolved frame, including `ret`.
    ///
    /// # Errors
    ///
    /// See [`frame::emit_epilogue`].
    pub fn emit_epilogue(&mut self, frame: &FuncFrame) -> AsmResult<()> {
        frame::emit_epilogue(frame, self)
    }

    /// Emit the clobber-free move schedule taking every argument from its
    /// `assigned` location to its resolved placement.
    ///
    /// # Errors
    ///
    /// See [`moves::emit_args_assignment`].
    pub fn emit_args_assignment(
        &mut self,
        frame: &FuncFrame,
        assigned: &FuncArgsAssignment,
        detail: &FuncDetail,
    ) -> AsmResult<()> {
        moves::emit_args_assignment(frame, assigned, detail, self)
    }
}

impl FrameSink for Assembler {
    fn push(&mut self, reg: Reg) -> AsmResult<()> {
        self.push(reg)
    }

    fn pop(&mut self, reg: Reg) -> AsmResult<()> {
        self.pop(reg)
    }

    fn mov_rr(&mut self, dst: Reg, src: Reg) -> AsmResult<()> {
        self.mov(dst, src)
    }

    fn sub_ri(&mut self, reg: Reg, imm: i32) -> AsmResult<()> {
        self.sub(reg, i64::from(imm))
    }

    fn add_ri(&mut self, reg: Reg, imm: i32) -> AsmResult<()> {
        self.add(reg, i64::from(imm))
    }

    fn ret(&mut self) -> AsmResult<()> {
        Assembler::ret(self)
    }
}

impl MoveSink for Assembler {
    fn mov_rr(&mut self, dst: Reg, src: Reg) -> AsmResult<()> {
        match dst.class() {
            RegClass::Vec => self.vec_mov(dst, src.into()),
            _ => self.mov(dst, src),
        }
    }

    fn xchg_rr(&mut self, a: Reg, b: Reg) -> AsmResult<()> {
        self.xchg(a, b)
    }

    fn load(&mut self, dst: Reg, src: Amode) -> AsmResult<()> {
        match dst.class() {
            RegClass::Vec => self.vec_mov(dst, src.into()),
            _ => self.mov(dst, src),
        }
    }

    fn store(&mut self, dst: Amode, src: Reg) -> AsmResult<()> {
        match src.class() {
            RegClass::Vec => {
                let id = if src.size_bits() == 128 {
                    InstId::Movups
                } else {
                    InstId::Vmovups
                };
                self.emit(id, &[dst.into(), src.into()])
            }
            _ => self.mov(dst, src),
        }
    }

    fn lea(&mut self, dst: Reg, src: Amode) -> AsmResult<()> {
        self.lea(dst, src)
    }
}

impl Assembler {
    /// An unaligned vector move sized by the destination register.
    fn vec_mov(&mut self, dst: Reg, src: Operand) -> AsmResult<()> {
        let id = if dst.size_bits() == 128 {
            InstId::Movups
        } else {
            InstId::Vmovups
        };
        self.emit(id, &[dst.into(), src])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Platform;
    use crate::reg::{EAX, R12, RAX, RBX, RCX, RSP};

    fn asm() -> Assembler {
        Assembler::new(Environment::new(Arch::X64, Platform::Linux))
    }

    #[test]
    fn forward_branch_then_bind() {
        let mut a = asm();
        let label = a.new_label();
        a.jmp(label).unwrap();
        a.nop().unwrap();
        a.nop().unwrap();
        a.nop().unwrap();
        a.bind(label).unwrap();
        let code = a.finalize().unwrap();
        assert_eq!(code, vec![0xe9, 0x03, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn backward_branch_picks_short_form() {
        let mut a = asm();
        let top = a.new_label();
        a.bind(top).unwrap();
        a.dec(RCX).unwrap();
        a.jcc(Cond::Ne, top).unwrap();
        let code = a.finalize().unwrap();
        // dec rcx = 48 ff c9; jne -5 = 75 fb.
        assert_eq!(code, vec![0x48, 0xff, 0xc9, 0x75, 0xfb]);
    }

    #[test]
    fn offset_of_reports_bound_position() {
        let mut a = asm();
        let label = a.new_label();
        a.nop().unwrap();
        let before = a.current_offset();
        a.bind(label).unwrap();
        assert_eq!(a.offset_of(label), Some(before));
    }

    #[test]
    fn align_and_offset_law() {
        let mut a = asm();
        a.nop().unwrap();
        for k in [2u32, 4, 8, 16, 32, 64] {
            a.align(k);
            assert_eq!(a.current_offset() % k, 0);
        }
    }

    #[test]
    fn prologue_epilogue_bytes() {
        // The Win64 frame from the module contract: rbx + r12 preserved and
        // 48 bytes of locals.
        let env = Environment::new(Arch::X64, Platform::Windows);
        let mut a = Assembler::new(env);
        let mut frame = FuncFrame::new(&env);
        frame
            .add_preserved(RBX)
            .add_preserved(R12)
            .set_local_size(48);
        a.emit_prologue(&frame).unwrap();
        assert_eq!(
            a.code_bytes(),
            // push rbp; mov rbp, rsp; push rbx; push r12; sub rsp, 48.
            &[0x55, 0x48, 0x89, 0xe5, 0x53, 0x41, 0x54, 0x48, 0x83, 0xec, 0x30]
        );
        a.emit_epilogue(&frame).unwrap();
        let tail = &a.code_bytes()[11..];
        // add rsp, 48; pop r12; pop rbx; pop rbp; ret.
        assert_eq!(tail, &[0x48, 0x83, 0xc4, 0x30, 0x41, 0x5c, 0x5b, 0x5d, 0xc3]);
    }

    #[test]
    fn emission_is_all_or_nothing() {
        let mut a = asm();
        a.mov(RAX, RCX).unwrap();
        let len = a.current_offset();
        assert!(a.mov(RAX, EAX).is_err());
        assert_eq!(a.current_offset(), len, "failed emission left bytes behind");
    }

    #[test]
    fn stack_slot_moves_encode() {
        let mut a = asm();
        MoveSink::store(&mut a, Amode::base(RSP, 8).with_size(8), RAX).unwrap();
        MoveSink::load(&mut a, RAX, Amode::base(RSP, 8).with_size(8)).unwrap();
        assert_eq!(
            a.code_bytes(),
            // mov [rsp+8], rax; mov rax, [rsp+8].
            &[0x48, 0x89, 0x44, 0x24, 0x08, 0x48, 0x8b, 0x44, 0x24, 0x08]
        );
    }
}
