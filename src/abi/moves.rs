//! Clobber-free argument shuffling.
//!
//! Given where each logical argument currently lives and where the resolved
//! convention wants it, this module computes a move schedule over the
//! register-to-register dependency graph: moves whose destination is not a
//! pending source go first, and each remaining cycle is broken with a
//! frame-designated scratch register or, for GP registers, `xchg` pairs.

use log::trace;
use smallvec::SmallVec;

use super::args::{FuncDetail, FuncValue};
use super::frame::FuncFrame;
use crate::error::{AsmResult, Error};
use crate::mem::Amode;
use crate::reg::{Reg, RegClass};

/// The capability the mover needs from an assembler; implemented by
/// [`crate::Assembler`] and by the symbolic register-file model in tests.
pub trait MoveSink {
    fn mov_rr(&mut self, dst: Reg, src: Reg) -> AsmResult<()>;
    fn xchg_rr(&mut self, a: Reg, b: Reg) -> AsmResult<()>;
    fn load(&mut self, dst: Reg, src: Amode) -> AsmResult<()>;
    fn store(&mut self, dst: Amode, src: Reg) -> AsmResult<()>;
    fn lea(&mut self, dst: Reg, src: Amode) -> AsmResult<()>;
}

/// Where each logical argument currently lives, parallel to the target
/// [`FuncDetail::args`].
#[derive(Clone, Debug, Default)]
pub struct FuncArgsAssignment {
    args: Vec<FuncValue>,
}

impl FuncArgsAssignment {
    /// Describe the current locations, one per logical argument.
    #[must_use]
    pub fn new(args: Vec<FuncValue>) -> Self {
        Self { args }
    }

    /// The recorded locations.
    #[must_use]
    pub fn args(&self) -> &[FuncValue] {
        &self.args
    }
}

#[derive(Clone, Copy, Debug)]
struct Edge {
    src: u8,
    dst: u8,
    bits: u16,
}

#[derive(Clone, Copy, Debug)]
enum Deferred {
    /// `dst <- [sp + off]`.
    Load { dst: Reg, off: i32 },
    /// `dst <- &[sp + off]` (indirect argument pointer).
    Lea { dst: Reg, off: i32 },
    /// `[sp + dst_off] <- &[sp + src_off]`, via scratch.
    LeaStore { src_off: i32, dst_off: i32 },
    /// `[sp + dst_off] <- [sp + src_off]`, via scratch.
    StackCopy { src_off: i32, dst_off: i32, bits: u16 },
}

/// Emit the moves that take every argument from its `assigned` location to
/// its `detail` placement without clobbering a yet-unread source.
///
/// # Errors
///
/// [`Error::InvalidState`] when the schedule cannot be produced: mismatched
/// argument counts, two arguments targeting one register, an irreducible
/// non-GP cycle with no scratch register in the frame, or an indirect
/// argument whose value is not stack-resident.
pub fn emit_args_assignment(
    frame: &FuncFrame,
    assigned: &FuncArgsAssignment,
    detail: &FuncDetail,
    sink: &mut impl MoveSink,
) -> AsmResult<()> {
    if assigned.args.len() != detail.args.len() {
        return Err(Error::InvalidState(format!(
            "assignment describes {} arguments but the signature has {}",
            assigned.args.len(),
            detail.args.len()
        )));
    }
    let gp_bits = frame.arch().bits();
    let sp = crate::reg::RSP.with_size(gp_bits);

    let mut gp_edges: Vec<Edge> = Vec::new();
    let mut vec_edges: Vec<Edge> = Vec::new();
    let mut stores: SmallVec<[(Reg, i32); 4]> = SmallVec::new();
    let mut deferred: SmallVec<[Deferred; 4]> = SmallVec::new();

    for (index, (src, dst)) in assigned.args.iter().zip(&detail.args).enumerate() {
        match (*src, *dst) {
            (a, b) if a == b => {}
            (FuncValue::GpReg(s), FuncValue::GpReg(d)) => {
                gp_edges.push(Edge { src: s, dst: d, bits: gp_bits });
            }
            (FuncValue::VecReg(s, w1), FuncValue::VecReg(d, w2)) => {
                if s != d {
                    vec_edges.push(Edge { src: s, dst: d, bits: w1.max(w2) });
                }
            }
            (FuncValue::GpReg(s), FuncValue::Stack(off)) => {
                stores.push((Reg::gp(gp_bits, s), off));
            }
            (FuncValue::VecReg(s, w), FuncValue::Stack(off)) => {
                stores.push((Reg::vec(w, s), off));
            }
            (FuncValue::Stack(off), FuncValue::GpReg(d)) => {
                deferred.push(Deferred::Load { dst: Reg::gp(gp_bits, d), off });
            }
            (FuncValue::Stack(off), FuncValue::VecReg(d, w)) => {
                deferred.push(Deferred::Load { dst: Reg::vec(w, d), off });
            }
            (FuncValue::Stack(off), FuncValue::IndirectReg(d)) => {
                deferred.push(Deferred::Lea { dst: Reg::gp(gp_bits, d), off });
            }
            (FuncValue::Stack(src_off), FuncValue::IndirectStack(dst_off)) => {
                deferred.push(Deferred::LeaStore { src_off, dst_off });
            }
            (FuncValue::Stack(src_off), FuncValue::Stack(dst_off)) => {
                deferred.push(Deferred::StackCopy { src_off, dst_off, bits: gp_bits });
            }
            (_, FuncValue::IndirectReg(_) | FuncValue::IndirectStack(_)) => {
                return Err(Error::InvalidState(format!(
                    "argument {index} is passed indirectly and must be stack-resident first"
                )));
            }
            (a, b) => {
                return Err(Error::InvalidState(format!(
                    "argument {index}: no move from {a:?} to {b:?}"
                )));
            }
        }
    }

    check_unique_destinations(&gp_edges)?;
    check_unique_destinations(&vec_edges)?;

    // Registers the scheduler may not use as scratch: anything still
    // carrying or receiving a value.
    let mut busy_gp: u32 = 0;
    let mut busy_vec: u32 = 0;
    for edge in &gp_edges {
        busy_gp |= 1 << edge.src | 1 << edge.dst;
    }
    for edge in &vec_edges {
        busy_vec |= 1 << edge.src | 1 << edge.dst;
    }
    for d in &deferred {
        if let Deferred::Load { dst, .. } | Deferred::Lea { dst, .. } = d {
            match dst.class() {
                RegClass::Gp => busy_gp |= 1 << dst.enc(),
                RegClass::Vec => busy_vec |= 1 << dst.enc(),
                _ => {}
            }
        }
    }

    // Phase 1: register-to-stack stores; they only read registers.
    for (reg, off) in stores {
        sink.store(slot(sp, off, reg.size_bits()), reg)?;
    }

    // Phase 2: the parallel register moves, per class.
    let gp_scratch = pick_scratch(frame, RegClass::Gp, busy_gp);
    let vec_scratch = pick_scratch(frame, RegClass::Vec, busy_vec);
    schedule_class(gp_edges, RegClass::Gp, gp_bits, gp_scratch, sink)?;
    schedule_class(vec_edges, RegClass::Vec, gp_bits, vec_scratch, sink)?;

    // Phase 3: stack-to-register loads and indirect-pointer synthesis; every
    // register source has been consumed by now.
    for d in deferred {
        match d {
            Deferred::Load { dst, off } => sink.load(dst, slot(sp, off, dst.size_bits()))?,
            Deferred::Lea { dst, off } => sink.lea(dst, slot(sp, off, 0))?,
            Deferred::LeaStore { src_off, dst_off } => {
                let scratch = gp_scratch.ok_or_else(|| {
                    Error::InvalidState(
                        "an indirect stack argument needs a scratch register".to_owned(),
                    )
                })?;
                let scratch = Reg::gp(gp_bits, scratch);
                sink.lea(scratch, slot(sp, src_off, 0))?;
                sink.store(slot(sp, dst_off, gp_bits), scratch)?;
            }
            Deferred::StackCopy { src_off, dst_off, bits } => {
                let scratch = gp_scratch.ok_or_else(|| {
                    Error::InvalidState("a stack-to-stack move needs a scratch register".to_owned())
                })?;
                let scratch = Reg::gp(bits, scratch);
                sink.load(scratch, slot(sp, src_off, bits))?;
                sink.store(slot(sp, dst_off, bits), scratch)?;
            }
        }
    }
    Ok(())
}

fn slot(sp: Reg, off: i32, bits: u16) -> Amode {
    #[allow(clippy::cast_possible_truncation)]
    let bytes = (bits / 8) as u8;
    Amode::base(sp, off).with_size(bytes)
}

fn check_unique_destinations(edges: &[Edge]) -> AsmResult<()> {
    for (i, a) in edges.iter().enumerate() {
        for b in &edges[i + 1..] {
            if a.dst == b.dst {
                return Err(Error::InvalidState(format!(
                    "two arguments target the same register (encoding {})",
                    a.dst
                )));
            }
        }
    }
    Ok(())
}

fn pick_scratch(frame: &FuncFrame, class: RegClass, busy: u32) -> Option<u8> {
    let mask = frame.scratch_mask(class) & !busy;
    if mask == 0 {
        None
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let enc = mask.trailing_zeros() as u8;
        Some(enc)
    }
}

fn make_reg(class: RegClass, bits: u16, enc: u8) -> Reg {
    match class {
        RegClass::Gp => Reg::gp(bits, enc),
        _ => Reg::vec(bits, enc),
    }
}

fn schedule_class(
    mut edges: Vec<Edge>,
    class: RegClass,
    gp_bits: u16,
    scratch: Option<u8>,
    sink: &mut impl MoveSink,
) -> AsmResult<()> {
    let width = |edge: &Edge| if class == RegClass::Gp { gp_bits } else { edge.bits };

    // Emit every move whose destination is no pending source; repeat until a
    // fixpoint. What remains is a union of disjoint cycles.
    loop {
        let mut progressed = false;
        let mut i = 0;
        while i < edges.len() {
            let edge = edges[i];
            let dst_is_live_source = edges
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && other.src == edge.dst);
            if dst_is_live_source {
                i += 1;
            } else {
                let bits = width(&edge);
                sink.mov_rr(make_reg(class, bits, edge.dst), make_reg(class, bits, edge.src))?;
                edges.swap_remove(i);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    while let Some(first) = edges.first().copied() {
        // Walk the cycle d1 <- d2 <- ... <- dk <- d1.
        let mut cycle: Vec<Edge> = vec![first];
        loop {
            let tail = cycle.last().unwrap().src;
            if tail == first.dst {
                break;
            }
            let next = edges
                .iter()
                .find(|e| e.dst == tail)
                .copied()
                .expect("remaining edges form closed cycles");
            cycle.push(next);
        }
        trace!("breaking a {}-register {class:?} cycle", cycle.len());

        if let Some(scratch) = scratch {
            let bits = cycle.iter().map(width).max().unwrap();
            let t = make_reg(class, bits, scratch);
            sink.mov_rr(t, make_reg(class, bits, first.dst))?;
            for pair in 0..cycle.len() - 1 {
                let e = cycle[pair];
                let bits = width(&e);
                sink.mov_rr(make_reg(class, bits, e.dst), make_reg(class, bits, e.src))?;
            }
            let last = cycle.last().unwrap();
            sink.mov_rr(make_reg(class, width(last), last.dst), t)?;
        } else if class == RegClass::Gp {
            // No scratch: a chain of exchanges rotates the cycle in place.
            for e in cycle.iter().take(cycle.len() - 1) {
                sink.xchg_rr(
                    make_reg(class, gp_bits, e.dst),
                    make_reg(class, gp_bits, e.src),
                )?;
            }
        } else {
            return Err(Error::InvalidState(
                "a vector-register cycle needs a scratch register".to_owned(),
            ));
        }
        edges.retain(|e| !cycle.iter().any(|c| c.dst == e.dst));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::args::{resolve, FuncSignature};
    use crate::abi::{Arch, CallConv, Environment, Platform, TypeId};
    use crate::reg::enc;
    use std::collections::HashMap;

    /// A symbolic register file: every location holds a symbol, and moves
    /// copy symbols around. Verifying the mover means checking that each
    /// target location ends up holding the symbol its source held before the
    /// sequence began.
    #[derive(Default)]
    struct SymbolicFile {
        values: HashMap<String, String>,
        ops: Vec<String>,
    }

    impl SymbolicFile {
        fn set(&mut self, loc: &str, sym: &str) {
            self.values.insert(loc.to_owned(), sym.to_owned());
        }

        fn get(&self, loc: &str) -> String {
            self.values
                .get(loc)
                .unwrap_or_else(|| panic!("read of undefined location {loc}"))
                .clone()
        }

        fn key_reg(reg: Reg) -> String {
            // Widths do not change identity in the model.
            match reg.class() {
                RegClass::Gp => format!("gp{}", reg.enc()),
                _ => format!("vec{}", reg.enc()),
            }
        }

        fn key_mem(mem: &Amode) -> String {
            // The mover only builds [rsp + off] operands.
            format!("stack{}", mem.disp())
        }
    }

    impl MoveSink for SymbolicFile {
        fn mov_rr(&mut self, dst: Reg, src: Reg) -> AsmResult<()> {
            let v = self.get(&Self::key_reg(src));
            self.set(&Self::key_reg(dst), &v);
            self.ops.push(format!("mov {dst}, {src}"));
            Ok(())
        }
        fn xchg_rr(&mut self, a: Reg, b: Reg) -> AsmResult<()> {
            let va = self.get(&Self::key_reg(a));
            let vb = self.get(&Self::key_reg(b));
            self.set(&Self::key_reg(a), &vb);
            self.set(&Self::key_reg(b), &va);
            self.ops.push(format!("xchg {a}, {b}"));
            Ok(())
        }
        fn load(&mut self, dst: Reg, src: Amode) -> AsmResult<()> {
            let v = self.get(&Self::key_mem(&src));
            self.set(&Self::key_reg(dst), &v);
            self.ops.push(format!("load {dst}"));
            Ok(())
        }
        fn store(&mut self, dst: Amode, src: Reg) -> AsmResult<()> {
            let v = self.get(&Self::key_reg(src));
            self.set(&Self::key_mem(&dst), &v);
            self.ops.push(format!("store {src}"));
            Ok(())
        }
        fn lea(&mut self, dst: Reg, src: Amode) -> AsmResult<()> {
            let v = format!("&{}", Self::key_mem(&src));
            self.set(&Self::key_reg(dst), &v);
            self.ops.push(format!("lea {dst}"));
            Ok(())
        }
    }

    fn env() -> Environment {
        Environment::new(Arch::X64, Platform::Linux)
    }

    fn loc_key(v: &FuncValue) -> String {
        match v {
            FuncValue::GpReg(e) | FuncValue::IndirectReg(e) => format!("gp{e}"),
            FuncValue::VecReg(e, _) => format!("vec{e}"),
            FuncValue::Stack(off) | FuncValue::IndirectStack(off) => format!("stack{off}"),
            _ => unreachable!(),
        }
    }

    /// Seed the model, run the mover, and check the semantic property: every
    /// target holds the symbol its source held at the start.
    fn run(frame: &FuncFrame, srcs: Vec<FuncValue>, detail: &FuncDetail) -> SymbolicFile {
        let mut file = SymbolicFile::default();
        for (i, src) in srcs.iter().enumerate() {
            file.set(&loc_key(src), &format!("a{i}"));
        }
        let assigned = FuncArgsAssignment::new(srcs);
        emit_args_assignment(frame, &assigned, detail, &mut file).unwrap();
        for (i, dst) in detail.args.iter().enumerate() {
            match dst {
                FuncValue::IndirectReg(_) | FuncValue::IndirectStack(_) => {}
                _ => assert_eq!(
                    file.get(&loc_key(dst)),
                    format!("a{i}"),
                    "argument {i} lost its value; ops: {:?}",
                    file.ops
                ),
            }
        }
        file
    }

    #[test]
    fn swap_is_resolved_with_xchg_without_scratch() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::Void,
            vec![TypeId::I64, TypeId::I64],
        );
        let detail = resolve(&sig, &env()).unwrap();
        let frame = FuncFrame::new(&env());
        // Sources are the target registers, crossed.
        let srcs = vec![FuncValue::GpReg(enc::RSI), FuncValue::GpReg(enc::RDI)];
        let file = run(&frame, srcs, &detail);
        assert!(file.ops.iter().any(|op| op.starts_with("xchg")));
    }

    #[test]
    fn swap_uses_scratch_when_available() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::Void,
            vec![TypeId::I64, TypeId::I64],
        );
        let detail = resolve(&sig, &env()).unwrap();
        let mut frame = FuncFrame::new(&env());
        frame.add_scratch(crate::reg::RAX);
        let srcs = vec![FuncValue::GpReg(enc::RSI), FuncValue::GpReg(enc::RDI)];
        let file = run(&frame, srcs, &detail);
        assert!(file.ops.iter().all(|op| !op.starts_with("xchg")));
        assert_eq!(file.ops.len(), 3);
    }

    #[test]
    fn three_cycle_rotation() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::Void,
            vec![TypeId::I64, TypeId::I64, TypeId::I64],
        );
        let detail = resolve(&sig, &env()).unwrap();
        let frame = FuncFrame::new(&env());
        // rdi <- rsi <- rdx <- rdi.
        let srcs = vec![
            FuncValue::GpReg(enc::RSI),
            FuncValue::GpReg(enc::RDX),
            FuncValue::GpReg(enc::RDI),
        ];
        run(&frame, srcs, &detail);
    }

    #[test]
    fn chain_is_ordered_before_overwrite() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::Void,
            vec![TypeId::I64, TypeId::I64],
        );
        let detail = resolve(&sig, &env()).unwrap();
        let frame = FuncFrame::new(&env());
        // arg0: rsi -> rdi, arg1: rdx -> rsi. The rsi value must move first.
        let srcs = vec![FuncValue::GpReg(enc::RSI), FuncValue::GpReg(enc::RDX)];
        let file = run(&frame, srcs, &detail);
        assert_eq!(file.ops, vec!["mov rdi, rsi", "mov rsi, rdx"]);
    }

    #[test]
    fn vector_cycle_without_scratch_fails() {
        let sig = FuncSignature::new(
            CallConv::X64SystemV,
            TypeId::Void,
            vec![TypeId::F64, TypeId::F64],
        );
        let detail = resolve(&sig, &env()).unwrap();
        let frame = FuncFrame::new(&env());
        let srcs = vec![FuncValue::VecReg(1, 128), FuncValue::VecReg(0, 128)];
        let mut file = SymbolicFile::default();
        file.set("vec0", "a1");
        file.set("vec1", "a0");
        let assigned = FuncArgsAssignment::new(srcs);
        let err = emit_args_assignment(&frame, &assigned, &detail, &mut file).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn stack_traffic_and_loads() {
        // Seven integer args on SysV: six registers plus one stack slot.
        let sig = FuncSignature::new(CallConv::X64SystemV, TypeId::Void, vec![TypeId::I64; 7]);
        let detail = resolve(&sig, &env()).unwrap();
        let mut frame = FuncFrame::new(&env());
        frame.add_scratch(crate::reg::RAX);
        // All seven currently live on the stack at offsets 64, 72, ...
        let srcs: Vec<FuncValue> = (0..7).map(|i| FuncValue::Stack(64 + 8 * i)).collect();
        let file = run(&frame, srcs, &detail);
        // Six loads into registers and one stack-to-stack copy via scratch.
        assert_eq!(
            file.ops.iter().filter(|op| op.starts_with("load")).count(),
            7
        );
        assert_eq!(
            file.ops.iter().filter(|op| op.starts_with("store")).count(),
            1
        );
    }

    #[test]
    fn indirect_pointer_synthesis() {
        let win = Environment::new(Arch::X64, Platform::Windows);
        let sig = FuncSignature::new(CallConv::X64Windows, TypeId::Void, vec![TypeId::V256]);
        let detail = resolve(&sig, &win).unwrap();
        let frame = FuncFrame::new(&win);
        let srcs = vec![FuncValue::Stack(64)];
        let mut file = SymbolicFile::default();
        file.set("stack64", "a0");
        let assigned = FuncArgsAssignment::new(srcs);
        emit_args_assignment(&frame, &assigned, &detail, &mut file).unwrap();
        assert_eq!(file.get("gp1"), "&stack64", "rcx holds the pointer");
    }

    #[test]
    fn register_source_for_indirect_arg_is_rejected() {
        let win = Environment::new(Arch::X64, Platform::Windows);
        let sig = FuncSignature::new(CallConv::X64Windows, TypeId::Void, vec![TypeId::V256]);
        let detail = resolve(&sig, &win).unwrap();
        let frame = FuncFrame::new(&win);
        let assigned = FuncArgsAssignment::new(vec![FuncValue::VecReg(5, 256)]);
        let mut file = SymbolicFile::default();
        let err = emit_args_assignment(&frame, &assigned, &detail, &mut file).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
