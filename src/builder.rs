//! Deferred emission: an in-memory list of labeled instructions replayed
//! through the dispatcher.
//!
//! A [`CodeBuilder`] records nodes instead of encoding immediately, which is
//! useful when the instruction stream is assembled out of order or needs a
//! late pass before bytes exist. Labels allocated by the builder live in the
//! builder's own namespace and are mapped one-to-one onto assembler labels
//! during [`CodeBuilder::serialize`].

use log::trace;
use smallvec::SmallVec;

use crate::asm::Assembler;
use crate::buffer::Label;
use crate::error::{AsmResult, Error};
use crate::inst::{EmitOptions, InstId};
use crate::mem::Amode;
use crate::operand::Operand;

/// Whether an alignment node pads with NOPs (code) or zeros (data).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignMode {
    Code,
    Data,
}

/// One deferred node.
#[derive(Clone, Debug)]
pub enum Node {
    /// Bind a builder label here.
    Label(Label),
    /// Align the buffer.
    Align(AlignMode, u32),
    /// Raw bytes, emitted without instruction decoding.
    EmbedData(Vec<u8>),
    /// An instruction to dispatch.
    Inst {
        id: InstId,
        operands: SmallVec<[Operand; 4]>,
        opts: EmitOptions,
    },
    /// An annotation carried through serialization; emits nothing.
    Comment(String),
    /// A no-op marker separating logical sections; emits nothing.
    Sentinel,
}

/// A deferred instruction stream.
#[derive(Default)]
pub struct CodeBuilder {
    nodes: Vec<Node>,
    labels: u32,
}

impl CodeBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a label in the builder's namespace. It is only meaningful to
    /// nodes recorded in this builder.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels);
        self.labels += 1;
        label
    }

    /// Record an instruction.
    pub fn inst(&mut self, id: InstId, operands: &[Operand]) -> &mut Self {
        self.inst_with(id, operands, EmitOptions::default())
    }

    /// Record an instruction with explicit options.
    pub fn inst_with(&mut self, id: InstId, operands: &[Operand], opts: EmitOptions) -> &mut Self {
        self.nodes.push(Node::Inst {
            id,
            operands: SmallVec::from_slice(operands),
            opts,
        });
        self
    }

    /// Record a label binding.
    pub fn label(&mut self, label: Label) -> &mut Self {
        self.nodes.push(Node::Label(label));
        self
    }

    /// Record an alignment point.
    pub fn align(&mut self, mode: AlignMode, align: u32) -> &mut Self {
        self.nodes.push(Node::Align(mode, align));
        self
    }

    /// Record raw data bytes.
    pub fn embed(&mut self, bytes: &[u8]) -> &mut Self {
        self.nodes.push(Node::EmbedData(bytes.to_vec()));
        self
    }

    /// Record a comment node.
    pub fn comment(&mut self, text: &str) -> &mut Self {
        self.nodes.push(Node::Comment(text.to_owned()));
        self
    }

    /// Record a sentinel node.
    pub fn sentinel(&mut self) -> &mut Self {
        self.nodes.push(Node::Sentinel);
        self
    }

    /// The recorded nodes.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Replay every node through `asm`, in order.
    ///
    /// Builder labels are mapped one-to-one onto freshly allocated assembler
    /// labels; label references inside operands (branch targets and
    /// RIP-relative memory operands) are rewritten to the mapped labels.
    ///
    /// # Errors
    ///
    /// Any dispatcher or label error, plus [`Error::InvalidState`] for an
    /// operand referencing a label foreign to this builder.
    pub fn serialize(&self, asm: &mut Assembler) -> AsmResult<()> {
        let map: Vec<Label> = (0..self.labels).map(|_| asm.new_label()).collect();
        let remap = |label: Label| -> AsmResult<Label> {
            map.get(label.index() as usize).copied().ok_or_else(|| {
                Error::InvalidState(format!("{label} was not allocated by this builder"))
            })
        };
        for node in &self.nodes {
            match node {
                Node::Label(label) => asm.bind(remap(*label)?)?,
                Node::Align(AlignMode::Code, n) => asm.align(*n),
                Node::Align(AlignMode::Data, n) => asm.align_data(*n),
                Node::EmbedData(bytes) => asm.embed(bytes),
                Node::Inst { id, operands, opts } => {
                    let mut mapped: SmallVec<[Operand; 4]> = SmallVec::with_capacity(operands.len());
                    for op in operands {
                        mapped.push(match op {
                            Operand::LabelRef(l) => Operand::LabelRef(remap(*l)?),
                            Operand::Mem(mem) => Operand::Mem(remap_mem(*mem, &remap)?),
                            other => *other,
                        });
                    }
                    asm.emit_with(*id, &mapped, opts)?;
                }
                Node::Comment(text) => trace!("; {text}"),
                Node::Sentinel => {}
            }
        }
        Ok(())
    }
}

fn remap_mem(
    mem: Amode,
    remap: &impl Fn(Label) -> AsmResult<Label>,
) -> AsmResult<Amode> {
    use crate::mem::AmodeKind;
    Ok(match mem.kind {
        AmodeKind::RipRelative { target } => Amode {
            kind: AmodeKind::RipRelative {
                target: remap(target)?,
            },
            ..mem
        },
        _ => mem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Arch, Environment, Platform};
    use crate::reg::{RAX, RCX};

    fn asm() -> Assembler {
        Assembler::new(Environment::new(Arch::X64, Platform::Linux))
    }

    #[test]
    fn replay_preserves_order_and_labels() {
        let mut b = CodeBuilder::new();
        let skip = b.new_label();
        b.inst(InstId::Jmp, &[skip.into()])
            .comment("skipped payload")
            .embed(&[0xde, 0xad])
            .label(skip)
            .inst(InstId::Mov, &[RAX.into(), RCX.into()])
            .sentinel()
            .inst(InstId::Ret, &[]);

        let mut a = asm();
        b.serialize(&mut a).unwrap();
        let code = a.finalize().unwrap();
        // jmp +2; dead bytes; mov rax, rcx; ret.
        assert_eq!(
            code,
            vec![0xe9, 0x02, 0x00, 0x00, 0x00, 0xde, 0xad, 0x48, 0x89, 0xc8, 0xc3]
        );
    }

    #[test]
    fn data_alignment_pads_with_zeros() {
        let mut b = CodeBuilder::new();
        b.inst(InstId::Nop, &[])
            .align(AlignMode::Data, 4)
            .embed(&[0xff]);
        let mut a = asm();
        b.serialize(&mut a).unwrap();
        assert_eq!(a.code_bytes(), &[0x90, 0x00, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn code_alignment_pads_with_nops() {
        let mut b = CodeBuilder::new();
        b.inst(InstId::Ret, &[]).align(AlignMode::Code, 4);
        let mut a = asm();
        b.serialize(&mut a).unwrap();
        assert_eq!(a.code_bytes(), &[0xc3, 0x0f, 0x1f, 0x00]);
    }

    #[test]
    fn foreign_labels_are_rejected() {
        let mut other = asm();
        let foreign = other.new_label();
        let mut b = CodeBuilder::new();
        b.inst(InstId::Jmp, &[foreign.into()]);
        let mut a = asm();
        assert!(matches!(
            b.serialize(&mut a),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn builder_serializes_twice() {
        // A builder is immutable during serialize; replaying into two
        // assemblers yields identical bytes.
        let mut b = CodeBuilder::new();
        let l = b.new_label();
        b.label(l).inst(InstId::Dec, &[RCX.into()]).inst(
            InstId::Jcc(crate::inst::Cond::Ne),
            &[l.into()],
        );
        let mut a1 = asm();
        let mut a2 = asm();
        b.serialize(&mut a1).unwrap();
        b.serialize(&mut a2).unwrap();
        assert_eq!(a1.finalize().unwrap(), a2.finalize().unwrap());
    }
}
