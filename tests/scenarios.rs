//! End-to-end scenarios exercising the assembler surface: golden byte
//! sequences, label patching, calling-convention resolution and frame
//! synthesis working together.

use assembler_x64::abi::args::{resolve, FuncSignature, FuncValue};
use assembler_x64::abi::frame::FuncFrame;
use assembler_x64::reg::{self, enc, EAX, R12, RAX, RBP, RBX, RCX, RSP};
use assembler_x64::{
    Amode, Arch, Assembler, CallConv, Cond, Environment, Error, Imm, Platform, TypeId,
};

fn x64() -> Assembler {
    Assembler::new(Environment::new(Arch::X64, Platform::Linux))
}

#[test]
fn mov_register_to_register() {
    let mut asm = x64();
    asm.mov(RAX, RCX).unwrap();
    assert_eq!(asm.finalize().unwrap(), [0x48, 0x89, 0xc8]);
}

#[test]
fn movabs_full_width_constant() {
    let mut asm = x64();
    asm.mov(RAX, Imm::new(0x1122_3344_5566_7788)).unwrap();
    assert_eq!(
        asm.finalize().unwrap(),
        [0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    );
}

#[test]
fn canonical_zeroing_idiom() {
    // The 32-bit form must win over a REX-prefixed 64-bit xor.
    let mut asm = x64();
    asm.xor(EAX, EAX).unwrap();
    assert_eq!(asm.finalize().unwrap(), [0x31, 0xc0]);
}

#[test]
fn forward_branch_bind_and_patch() {
    let mut asm = x64();
    let label = asm.new_label();
    asm.jmp(label).unwrap();
    assert_eq!(asm.code_bytes(), [0xe9, 0x00, 0x00, 0x00, 0x00]);
    asm.nop().unwrap();
    asm.nop().unwrap();
    asm.nop().unwrap();
    asm.bind(label).unwrap();
    assert_eq!(asm.offset_of(label), Some(8));
    let code = asm.finalize().unwrap();
    assert_eq!(&code[1..5], [0x03, 0x00, 0x00, 0x00]);
}

#[test]
fn sysv_and_win64_integer_signature() {
    let sig = FuncSignature::new(
        CallConv::CDecl,
        TypeId::I64,
        vec![TypeId::I64, TypeId::I64, TypeId::I64],
    );

    let linux = Environment::new(Arch::X64, Platform::Linux);
    let d = resolve(&sig, &linux).unwrap();
    assert_eq!(d.args[0], FuncValue::GpReg(enc::RDI));
    assert_eq!(d.args[1], FuncValue::GpReg(enc::RSI));
    assert_eq!(d.args[2], FuncValue::GpReg(enc::RDX));
    assert_eq!(d.rets[0], FuncValue::GpReg(enc::RAX));
    assert_eq!(d.stack_args_size, 0);

    let windows = Environment::new(Arch::X64, Platform::Windows);
    let d = resolve(&sig, &windows).unwrap();
    assert_eq!(d.args[0], FuncValue::GpReg(enc::RCX));
    assert_eq!(d.args[1], FuncValue::GpReg(enc::RDX));
    assert_eq!(d.args[2], FuncValue::GpReg(enc::R8));
    assert_eq!(d.rets[0], FuncValue::GpReg(enc::RAX));
    assert_eq!(d.stack_args_size, 32);
}

#[test]
fn win64_frame_with_two_preserved_registers() {
    let env = Environment::new(Arch::X64, Platform::Windows);
    let mut asm = Assembler::new(env);
    let mut frame = FuncFrame::new(&env);
    frame
        .add_preserved(RBX)
        .add_preserved(R12)
        .set_local_size(48);
    // (3 pushes * 8 + 8 for the return address) % 16 == 0: no pad added.
    assert_eq!(frame.alignment_pad(), 0);
    asm.emit_prologue(&frame).unwrap();
    assert_eq!(
        asm.code_bytes(),
        [0x55, 0x48, 0x89, 0xe5, 0x53, 0x41, 0x54, 0x48, 0x83, 0xec, 0x30]
    );
}

#[test]
fn mov_imm_boundary_forms() {
    let cases: [(i64, Vec<u8>); 6] = [
        (-1, vec![0x48, 0xc7, 0xc0, 0xff, 0xff, 0xff, 0xff]),
        (0, vec![0xb8, 0x00, 0x00, 0x00, 0x00]),
        (0x7fff_ffff, vec![0xb8, 0xff, 0xff, 0xff, 0x7f]),
        (0x8000_0000, vec![0xb8, 0x00, 0x00, 0x00, 0x80]),
        (0xffff_ffff, vec![0xb8, 0xff, 0xff, 0xff, 0xff]),
        (
            0x1_0000_0000,
            vec![0x48, 0xb8, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
        ),
    ];
    for (value, expected) in cases {
        let mut asm = x64();
        asm.mov(RAX, Imm::new(value)).unwrap();
        assert_eq!(asm.finalize().unwrap(), expected, "mov rax, {value:#x}");
    }
}

#[test]
fn add_imm8_imm32_boundary() {
    let cases: [(i64, usize); 4] = [(127, 4), (128, 7), (-128, 4), (-129, 7)];
    for (value, len) in cases {
        let mut asm = x64();
        asm.add(RAX, Imm::new(value)).unwrap();
        assert_eq!(asm.code_bytes().len(), len, "add rax, {value}");
    }
}

#[test]
fn backward_jump_short_near_boundary() {
    // A jump landing exactly -128 from its end still fits the short form.
    let mut asm = x64();
    let top = asm.new_label();
    asm.bind(top).unwrap();
    for _ in 0..126 {
        asm.nop().unwrap();
    }
    asm.jmp(top).unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(&code[126..], [0xeb, 0x80], "disp == -128 takes 2 bytes");

    // One more byte of distance forces the near form.
    let mut asm = x64();
    let top = asm.new_label();
    asm.bind(top).unwrap();
    for _ in 0..127 {
        asm.nop().unwrap();
    }
    asm.jmp(top).unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(
        &code[127..],
        [0xe9, 0x7c, 0xff, 0xff, 0xff],
        "disp == -132 from the near end"
    );

    // Forward by +127 from the end of the short form.
    let mut asm = x64();
    let fwd = asm.new_label();
    asm.jmp_short(fwd).unwrap();
    for _ in 0..127 {
        asm.nop().unwrap();
    }
    asm.bind(fwd).unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(&code[..2], [0xeb, 0x7f]);
}

#[test]
fn forced_short_out_of_range_fails_at_bind() {
    let mut asm = x64();
    let fwd = asm.new_label();
    asm.jmp_short(fwd).unwrap();
    for _ in 0..200 {
        asm.nop().unwrap();
    }
    let err = asm.bind(fwd).unwrap_err();
    assert!(matches!(err, Error::Rel8OutOfRange { .. }));
}

#[test]
fn rbp_and_rsp_addressing_special_cases() {
    // [rbp] and [rbp + 0] both force mod=01 with a zero disp8.
    let mut a1 = x64();
    a1.mov(RAX, Amode::base(RBP, 0)).unwrap();
    let mut a2 = x64();
    a2.mov(RAX, Amode::base(RBP, 0)).unwrap();
    assert_eq!(a1.code_bytes(), a2.code_bytes());
    assert_eq!(a1.code_bytes(), [0x48, 0x8b, 0x45, 0x00]);

    // [rsp] always takes a SIB byte.
    let mut asm = x64();
    asm.mov(RAX, Amode::base(RSP, 0)).unwrap();
    assert_eq!(asm.code_bytes(), [0x48, 0x8b, 0x04, 0x24]);
}

#[test]
fn rip_relative_forward_patch() {
    let mut asm = x64();
    let constant = asm.new_named_label("constant");
    // lea rax, [rip + constant]: 7 bytes ending at offset 7.
    asm.lea(RAX, Amode::rip(constant, 0)).unwrap();
    asm.ret().unwrap();
    asm.align_data(8);
    asm.bind(constant).unwrap();
    asm.embed(&0x1234_5678_u64.to_le_bytes());
    let code = asm.finalize().unwrap();
    assert_eq!(&code[..3], [0x48, 0x8d, 0x05]);
    let disp = i32::from_le_bytes(code[3..7].try_into().unwrap());
    assert_eq!(disp, 8 - 7, "target minus the end of the instruction");
}

#[test]
fn unbound_label_is_fatal_at_finalize() {
    let mut asm = x64();
    let label = asm.new_label();
    asm.jmp(label).unwrap();
    assert!(matches!(
        asm.finalize(),
        Err(Error::UnboundLabel { .. })
    ));
}

#[test]
fn loop_with_labels_runs_through_the_whole_surface() {
    // memset(rdi, sil, rdx) in the SysV convention, with an aligned loop.
    let mut asm = x64();
    let head = asm.new_named_label("head");
    let done = asm.new_named_label("done");

    asm.test(reg::RDX, reg::RDX).unwrap();
    asm.jcc(Cond::E, done).unwrap();
    asm.xor(reg::ECX, reg::ECX).unwrap();
    asm.align(16);
    asm.bind(head).unwrap();
    asm.mov(
        Amode::base_index(reg::RDI, RCX, assembler_x64::Scale::One, 0).with_size(1),
        reg::SIL,
    )
    .unwrap();
    asm.add(RCX, Imm::new(1)).unwrap();
    asm.cmp(RCX, reg::RDX).unwrap();
    asm.jcc_short(Cond::B, head).unwrap();
    asm.bind(done).unwrap();
    asm.ret().unwrap();

    let head_offset = asm.offset_of(head).unwrap();
    assert_eq!(head_offset % 16, 0, "the loop head is on its alignment boundary");
    let code = asm.finalize().unwrap();
    assert!(code.len() > head_offset as usize);
}
