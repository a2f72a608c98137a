//! Errors produced while assembling.

use crate::buffer::Label;

/// A convenient alias for all assembler results.
pub type AsmResult<T> = Result<T, Error>;

/// An error surfaced to the caller of the assembler.
///
/// Every fallible operation in this crate reports one of these kinds; none of
/// them is recovered internally. Emission is all-or-nothing at instruction
/// granularity: when an error is returned the code buffer is unchanged.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The dispatcher has no encoding for this combination of instruction and
    /// operand kinds.
    #[error("invalid operand shape: {inst} {shape}")]
    InvalidOperandShape {
        /// The mnemonic of the rejected instruction.
        inst: &'static str,
        /// A rendering of the operand kinds, e.g. `(gp64, imm)`.
        shape: String,
    },

    /// The operand kinds matched an encoding but a width constraint is
    /// violated, e.g. a 32/64-bit register pair or an immediate that does not
    /// fit the widest encodable form.
    #[error("invalid operand size: {inst}: {msg}")]
    InvalidOperandSize {
        /// The mnemonic of the rejected instruction.
        inst: &'static str,
        /// What exactly is out of range or mismatched.
        msg: String,
    },

    /// Registers that cannot be encoded together, e.g. a high-byte register
    /// (`ah`..`bh`) in an instruction that requires a REX prefix, or an
    /// extended register in 32-bit mode.
    #[error("invalid register combination: {inst}: {msg}")]
    InvalidRegCombination {
        /// The mnemonic of the rejected instruction.
        inst: &'static str,
        /// Which registers conflict.
        msg: String,
    },

    /// A forced short branch whose displacement does not fit in `i8` at bind
    /// time.
    #[error("rel8 displacement out of range for {label}: {disp}")]
    Rel8OutOfRange {
        /// The label the branch targets.
        label: Label,
        /// The displacement that failed to fit.
        disp: i64,
    },

    /// `finalize` was called while relocation sites are still pending against
    /// an unbound label.
    #[error("unbound label: {label}")]
    UnboundLabel {
        /// The first label found with pending sites.
        label: Label,
    },

    /// The frame or argument-assignment resolver could not produce a valid
    /// schedule, or a label was manipulated out of order (e.g. bound twice).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An argument outside the supported domain, e.g. a calling convention id
    /// that does not exist for the active architecture.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
