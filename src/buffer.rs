//! The code buffer: byte emission, labels, and relocation patching.
//!
//! The buffer is an append-only little-endian byte vector. Labels are
//! allocated from an arena owned by the buffer and referenced by id, so
//! relocation sites never hold pointers into the label table; a site is
//! `(label, kind, patch offset)` and is consumed when the label binds.

use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

use crate::error::{AsmResult, Error};

/// A label id, allocated by [`CodeBuffer::new_label`].
///
/// A label starts unbound; [`CodeBuffer::bind`] pins it to the buffer offset
/// current at bind time. Binding is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

impl Label {
    /// The label's id, stable across buffer growth.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// The width of a PC-relative relocation site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    /// A signed 8-bit displacement; the displacement base is `patch + 1`.
    Rel8,
    /// A signed 32-bit displacement; the displacement base is `patch + 4`.
    Rel32,
}

#[derive(Clone, Copy, Debug)]
struct Fixup {
    kind: RelocKind,
    /// Offset of the displacement field inside the buffer.
    patch: u32,
}

#[derive(Default)]
struct LabelRecord {
    offset: Option<u32>,
    name: Option<String>,
}

/// An append-only machine-code buffer with label and relocation support.
#[derive(Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
    labels: Vec<LabelRecord>,
    pending: FxHashMap<Label, SmallVec<[Fixup; 2]>>,
}

/// The Intel-recommended multi-byte NOP sequences, by length (1 to 9 bytes);
/// see Intel SDM Vol. 2B, the `NOP` entry.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0f, 0x1f, 0x00],
    &[0x0f, 0x1f, 0x40, 0x00],
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
    &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

impl CodeBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add 1 byte.
    pub fn put1(&mut self, v: u8) {
        self.data.push(v);
    }

    /// Add 2 bytes, little-endian.
    pub fn put2(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Add 4 bytes, little-endian.
    pub fn put4(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Add 8 bytes, little-endian.
    pub fn put8(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Add raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// The current offset; equal to the PC-relative offset from origin zero.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has grown past `u32::MAX` bytes.
    #[must_use]
    pub fn cur_offset(&self) -> u32 {
        u32::try_from(self.data.len()).expect("code buffer exceeds 4 GiB")
    }

    /// The bytes emitted so far.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pad with NOP sequences until the offset is a multiple of `align`,
    /// which must be a power of two no larger than 64. Never shrinks.
    pub fn align(&mut self, align: u32) {
        let mut pad = self.padding_for(align);
        while pad > 0 {
            let n = pad.min(NOPS.len());
            self.data.extend_from_slice(NOPS[n - 1]);
            pad -= n;
        }
    }

    /// Pad with zero bytes until the offset is a multiple of `align`; for
    /// data embedded in the instruction stream.
    pub fn align_data(&mut self, align: u32) {
        let pad = self.padding_for(align);
        self.data.resize(self.data.len() + pad, 0);
    }

    fn padding_for(&self, align: u32) -> usize {
        assert!(
            align.is_power_of_two() && align <= 64,
            "alignment must be a power of two <= 64, got {align}"
        );
        let rem = self.cur_offset() % align;
        if rem == 0 {
            0
        } else {
            (align - rem) as usize
        }
    }

    /// Overwrite the byte at `at` with a signed 8-bit value.
    pub fn patch_i8(&mut self, at: u32, v: i8) {
        #[allow(clippy::cast_sign_loss)]
        {
            self.data[at as usize] = v as u8;
        }
    }

    /// Overwrite the 4 bytes at `at` with a signed 32-bit little-endian value.
    pub fn patch_i32(&mut self, at: u32, v: i32) {
        let at = at as usize;
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Allocate a fresh unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(u32::try_from(self.labels.len()).expect("label arena overflow"));
        self.labels.push(LabelRecord::default());
        label
    }

    /// Allocate a fresh unbound label carrying a name for diagnostics.
    pub fn new_named_label(&mut self, name: &str) -> Label {
        let label = self.new_label();
        self.labels[label.0 as usize].name = Some(name.to_owned());
        label
    }

    /// The name given to `label` at allocation, if any.
    #[must_use]
    pub fn label_name(&self, label: Label) -> Option<&str> {
        self.labels[label.0 as usize].name.as_deref()
    }

    /// The offset `label` is bound to, or `None` while unbound.
    #[must_use]
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels[label.0 as usize].offset
    }

    /// Bind `label` to the current offset and patch every pending relocation
    /// site that references it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the label is already bound.
    /// - [`Error::Rel8OutOfRange`] if any pending `Rel8` site is further than
    ///   an `i8` displacement away. No site is patched in that case.
    pub fn bind(&mut self, label: Label) -> AsmResult<()> {
        if self.labels[label.0 as usize].offset.is_some() {
            return Err(Error::InvalidState(format!("{label} is already bound")));
        }
        let target = self.cur_offset();
        trace!("bind {label} at {target:#x}");

        let Some(fixups) = self.pending.remove(&label) else {
            self.labels[label.0 as usize].offset = Some(target);
            return Ok(());
        };
        // Validate every rel8 site before patching anything, so a failed bind
        // leaves the buffer bytes and the label state untouched.
        let out_of_range = fixups.iter().find_map(|fixup| match fixup.kind {
            RelocKind::Rel8 => {
                let disp = i64::from(target) - i64::from(fixup.patch + 1);
                i8::try_from(disp).is_err().then_some(disp)
            }
            RelocKind::Rel32 => None,
        });
        if let Some(disp) = out_of_range {
            self.pending.insert(label, fixups);
            return Err(Error::Rel8OutOfRange { label, disp });
        }
        self.labels[label.0 as usize].offset = Some(target);
        for fixup in fixups {
            self.patch_fixup(label, target, fixup);
        }
        Ok(())
    }

    fn patch_fixup(&mut self, label: Label, target: u32, fixup: Fixup) {
        let disp = i64::from(target) - i64::from(fixup.patch) - i64::from(fixup.width());
        trace!(
            "patch {label}: {:?} at {:#x} <- {disp}",
            fixup.kind,
            fixup.patch
        );
        match fixup.kind {
            RelocKind::Rel8 => {
                #[allow(clippy::cast_possible_truncation)]
                self.patch_i8(fixup.patch, disp as i8);
            }
            RelocKind::Rel32 => {
                // The placeholder may carry a pre-existing addend (e.g. the
                // negative compensation for trailing immediate bytes of a
                // RIP-relative form); add rather than overwrite.
                let at = fixup.patch as usize;
                let addend = i32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
                #[allow(clippy::cast_possible_truncation)]
                self.patch_i32(fixup.patch, (disp as i32).wrapping_add(addend));
            }
        }
    }

    /// Register a `Rel8` site at `patch` referencing `label`, or patch it
    /// immediately if the label is already bound.
    ///
    /// # Errors
    ///
    /// [`Error::Rel8OutOfRange`] if the label is bound and out of range.
    pub fn use_rel8_at(&mut self, label: Label, patch: u32) -> AsmResult<()> {
        self.use_label_at(label, Fixup { kind: RelocKind::Rel8, patch })
    }

    /// Register a `Rel32` site at `patch` referencing `label`, or patch it
    /// immediately if the label is already bound. Any value already present
    /// in the 32-bit field acts as an addend.
    ///
    /// # Errors
    ///
    /// Currently infallible for `Rel32`; returns a result for symmetry with
    /// [`CodeBuffer::use_rel8_at`].
    pub fn use_rel32_at(&mut self, label: Label, patch: u32) -> AsmResult<()> {
        self.use_label_at(label, Fixup { kind: RelocKind::Rel32, patch })
    }

    fn use_label_at(&mut self, label: Label, fixup: Fixup) -> AsmResult<()> {
        match self.labels[label.0 as usize].offset {
            Some(target) => {
                if let RelocKind::Rel8 = fixup.kind {
                    let disp = i64::from(target) - i64::from(fixup.patch + 1);
                    if i8::try_from(disp).is_err() {
                        return Err(Error::Rel8OutOfRange { label, disp });
                    }
                }
                self.patch_fixup(label, target, fixup);
                Ok(())
            }
            None => {
                self.pending.entry(label).or_default().push(fixup);
                Ok(())
            }
        }
    }

    /// True if no relocation site is pending.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consume the buffer, returning the finished machine code.
    ///
    /// # Errors
    ///
    /// [`Error::UnboundLabel`] if any relocation site is still pending.
    pub fn finalize(self) -> AsmResult<Vec<u8>> {
        if !self.pending.is_empty() {
            // Report the lowest-numbered offender for determinism.
            let label = *self.pending.keys().min_by_key(|l| l.0).unwrap();
            return Err(Error::UnboundLabel { label });
        }
        Ok(self.data)
    }
}

impl Fixup {
    fn width(&self) -> u8 {
        match self.kind {
            RelocKind::Rel8 => 1,
            RelocKind::Rel32 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_writers() {
        let mut buf = CodeBuffer::new();
        buf.put1(0x01);
        buf.put2(0x0302);
        buf.put4(0x0706_0504);
        buf.put8(0x0f0e_0d0c_0b0a_0908);
        assert_eq!(
            buf.data(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
                0x0f]
        );
    }

    #[test]
    fn align_pads_with_nops() {
        let mut buf = CodeBuffer::new();
        buf.put1(0xc3);
        buf.align(16);
        assert_eq!(buf.cur_offset() % 16, 0);
        assert_eq!(buf.cur_offset(), 16);
        // 15 bytes of padding: a 9-byte NOP then a 6-byte NOP.
        assert_eq!(&buf.data()[1..4], &[0x66, 0x0f, 0x1f]);
        buf.align(16);
        assert_eq!(buf.cur_offset(), 16, "align never grows when already aligned");
    }

    #[test]
    fn align_data_pads_with_zeros() {
        let mut buf = CodeBuffer::new();
        buf.put_bytes(&[0xaa; 3]);
        buf.align_data(8);
        assert_eq!(buf.data(), &[0xaa, 0xaa, 0xaa, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn bind_patches_forward_rel32() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.put1(0xe9);
        let patch = buf.cur_offset();
        buf.put4(0);
        buf.use_rel32_at(label, patch).unwrap();
        buf.put_bytes(&[0x90, 0x90, 0x90]);
        buf.bind(label).unwrap();
        assert_eq!(buf.label_offset(label), Some(8));
        assert_eq!(&buf.data()[1..5], &[0x03, 0x00, 0x00, 0x00]);
        let code = buf.finalize().unwrap();
        assert_eq!(code.len(), 8);
    }

    #[test]
    fn backward_reference_patches_immediately() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.bind(label).unwrap();
        buf.put_bytes(&[0x90, 0x90]);
        buf.put1(0xeb);
        let patch = buf.cur_offset();
        buf.put1(0);
        buf.use_rel8_at(label, patch).unwrap();
        // disp = 0 - (3 + 1) = -4
        assert_eq!(buf.data()[3], 0xfc);
    }

    #[test]
    fn rel8_out_of_range_at_bind() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.put1(0xeb);
        let patch = buf.cur_offset();
        buf.put1(0);
        buf.use_rel8_at(label, patch).unwrap();
        for _ in 0..200 {
            buf.put1(0x90);
        }
        let err = buf.bind(label).unwrap_err();
        assert!(matches!(err, Error::Rel8OutOfRange { .. }));
        // A failed bind leaves the label unbound and the site pending.
        assert_eq!(buf.label_offset(label), None);
        assert!(!buf.is_resolved());
    }

    #[test]
    fn finalize_rejects_pending_sites() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.put1(0xe9);
        let patch = buf.cur_offset();
        buf.put4(0);
        buf.use_rel32_at(label, patch).unwrap();
        assert_eq!(buf.finalize().unwrap_err(), Error::UnboundLabel { label });
    }

    #[test]
    fn double_bind_is_rejected() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_named_label("loop_head");
        buf.bind(label).unwrap();
        assert!(matches!(buf.bind(label), Err(Error::InvalidState(_))));
        assert_eq!(buf.label_name(label), Some("loop_head"));
    }
}
