//! Check emitted bytes against a known-good disassembler: every encoding the
//! dispatcher accepts must decode back to the same mnemonic and operands.

use capstone::arch::{x86, BuildsCapstone, BuildsCapstoneSyntax};
use capstone::Capstone;

use assembler_x64::reg::{
    AL, CL, EAX, ECX, R10, R12, R9, RAX, RBP, RCX, RDI, RDX, RSI, RSP, XMM0, XMM1, XMM13, XMM7,
    YMM1, YMM2, YMM4, ZMM1, ZMM2, ZMM3,
};
use assembler_x64::{
    Amode, Arch, Assembler, Cond, Environment, Imm, InstId, Platform, Scale,
};

fn disassemble_one(code: &[u8]) -> String {
    let cs = Capstone::new()
        .x86()
        .mode(x86::ArchMode::Mode64)
        .syntax(x86::ArchSyntax::Intel)
        .detail(false)
        .build()
        .expect("failed to create Capstone object");
    let insts = cs.disasm_all(code, 0x0).expect("failed to disassemble");
    assert_eq!(insts.len(), 1, "not a single instruction: {code:02x?}");
    let inst = insts.first().unwrap();
    assert_eq!(
        inst.len(),
        code.len(),
        "extra bytes not disassembled: {code:02x?}"
    );
    match inst.op_str() {
        Some(ops) if !ops.is_empty() => format!("{} {ops}", inst.mnemonic().unwrap()),
        _ => inst.mnemonic().unwrap().to_owned(),
    }
}

fn check(expected: &str, build: impl FnOnce(&mut Assembler)) {
    let mut asm = Assembler::new(Environment::new(Arch::X64, Platform::Linux));
    build(&mut asm);
    let code = asm.finalize().unwrap();
    assert_eq!(disassemble_one(&code), expected, "bytes: {code:02x?}");
}

#[test]
fn gp_moves_and_alu() {
    check("mov rax, rcx", |a| a.mov(RAX, RCX).unwrap());
    check("mov r10, r9", |a| a.mov(R10, R9).unwrap());
    check("xor eax, eax", |a| a.xor(EAX, EAX).unwrap());
    check("add rax, 0x7f", |a| a.add(RAX, Imm::new(0x7f)).unwrap());
    check("sub rsp, 0x30", |a| a.sub(RSP, Imm::new(48)).unwrap());
    check("cmp ecx, eax", |a| a.cmp(ECX, EAX).unwrap());
    check("movabs rax, 0x1122334455667788", |a| {
        a.mov(RAX, Imm::new(0x1122_3344_5566_7788)).unwrap();
    });
    check("test al, cl", |a| a.test(AL, CL).unwrap());
    check("imul rdx, rsi", |a| a.imul(RDX, RSI).unwrap());
}

#[test]
fn memory_operands() {
    check("mov rax, qword ptr [rsp]", |a| {
        a.mov(RAX, Amode::base(RSP, 0)).unwrap();
    });
    check("mov rax, qword ptr [rbp]", |a| {
        a.mov(RAX, Amode::base(RBP, 0)).unwrap();
    });
    check("mov rax, qword ptr [rcx + rdi*4 + 0x10]", |a| {
        a.mov(RAX, Amode::base_index(RCX, RDI, Scale::Four, 0x10))
            .unwrap();
    });
    check("lea rax, [rcx + 0x20]", |a| {
        a.lea(RAX, Amode::base(RCX, 0x20)).unwrap();
    });
    check("mov qword ptr [r12], rdx", |a| {
        a.mov(Amode::base(R12, 0), RDX).unwrap();
    });
    check("mov byte ptr [rax], 0x7f", |a| {
        a.mov(Amode::base(RAX, 0).with_size(1), Imm::new(0x7f)).unwrap();
    });
}

#[test]
fn stack_and_flow() {
    check("push r12", |a| a.push(R12).unwrap());
    check("pop rbp", |a| a.pop(RBP).unwrap());
    check("ret", |a| a.ret().unwrap());
    check("ret 0x10", |a| a.ret_imm(16).unwrap());
    check("call rax", |a| a.call(RAX).unwrap());
    check("jmp rcx", |a| a.jmp(RCX).unwrap());
    check("sete al", |a| a.setcc(Cond::E, AL).unwrap());
    check("cmovl rax, rcx", |a| a.cmovcc(Cond::L, RAX, RCX).unwrap());
}

#[test]
fn string_ops_and_misc() {
    check("movsq qword ptr [rdi], qword ptr [rsi]", |a| {
        a.movsq().unwrap();
    });
    check("rep stosq qword ptr [rdi], rax", |a| {
        a.rep(assembler_x64::Rep::Rep, InstId::Stosq).unwrap();
    });
    check("mfence", |a| a.mfence().unwrap());
    check("cpuid", |a| a.cpuid().unwrap());
    check("cqo", |a| a.cqo().unwrap());
    check("ud2", |a| a.ud2().unwrap());
}

#[test]
fn sse_and_avx() {
    check("addss xmm0, xmm1", |a| a.addss(XMM0, XMM1).unwrap());
    check("pxor xmm0, xmm13", |a| a.pxor(XMM0, XMM13).unwrap());
    check("movaps xmm7, xmmword ptr [rax]", |a| {
        a.movaps(XMM7, Amode::base(RAX, 0)).unwrap();
    });
    check("movd xmm0, eax", |a| a.movd(XMM0, EAX).unwrap());
    check("cvtsi2sd xmm0, rax", |a| a.cvtsi2sd(XMM0, RAX).unwrap());
    check("vaddps ymm2, ymm4, ymm1", |a| {
        a.vaddps(YMM2, YMM4, YMM1).unwrap();
    });
    check("vpxor xmm0, xmm1, xmm13", |a| {
        a.vpxor(XMM0, XMM1, XMM13).unwrap();
    });
    check("vmovups ymmword ptr [rax], ymm1", |a| {
        a.vmovups(Amode::base(RAX, 0), YMM1).unwrap();
    });
}

#[test]
fn avx512() {
    check("vaddps zmm1, zmm2, zmm3", |a| {
        a.vaddps(ZMM1, ZMM2, ZMM3).unwrap();
    });
    check("vmovups zmm1, zmmword ptr [rax + 0x40]", |a| {
        a.vmovups(ZMM1, Amode::base(RAX, 0x40)).unwrap();
    });
}

#[test]
fn three_operand_imul() {
    check("imul rdx, rsi, 0x10", |a| {
        a.emit(
            InstId::Imul,
            &[RDX.into(), RSI.into(), Imm::new(0x10).into()],
        )
        .unwrap();
    });
}
