//! Byte-level snapshot delta codec.
//!
//! A patch is `varint(target_len)` followed by zero or more operations, each
//! `varint(copy_len) varint(literal_len) literal_bytes`. Copies take bytes
//! from the base at the current position; literals replace them. Whatever
//! remains after the last operation is copied from the base, so identical
//! buffers encode to the length prefix alone.

use crate::wire::{WireError, WireReader, WireWriter};

/// Matching runs shorter than this are folded into the surrounding literal,
/// since a new operation header costs at least two bytes.
const MIN_COPY_RUN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("malformed patch: {0}")]
    Wire(#[from] WireError),
    #[error("patch copies past the end of the base ({base_len} bytes)")]
    BaseOverrun { base_len: usize },
    #[error("patch produces more than the declared {declared} bytes")]
    TargetOverrun { declared: usize },
    #[error("declared target length {declared} cannot be produced from this base and patch")]
    ImpossibleLength { declared: u64 },
}

#[inline]
fn same(base: &[u8], target: &[u8], index: usize) -> bool {
    base.get(index) == Some(&target[index])
}

pub fn diff(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = WireWriter::with_capacity(16);
    out.varint(target.len() as u64);

    let mut pos = 0;
    while pos < target.len() {
        let copy_start = pos;
        while pos < target.len() && same(base, target, pos) {
            pos += 1;
        }
        if pos == target.len() {
            break;
        }

        let literal_start = pos;
        let mut literal_end = pos;
        while pos < target.len() {
            if !same(base, target, pos) {
                pos += 1;
                literal_end = pos;
                continue;
            }
            let run_start = pos;
            while pos < target.len() && same(base, target, pos) {
                pos += 1;
            }
            if pos - run_start >= MIN_COPY_RUN || pos == target.len() {
                pos = run_start;
                break;
            }
            literal_end = pos;
        }

        out.varint((literal_start - copy_start) as u64);
        out.varint((literal_end - literal_start) as u64);
        out.bytes(&target[literal_start..literal_end]);
        pos = literal_end;
    }

    out.finish()
}

pub fn apply(base: &[u8], patch: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut reader = WireReader::new(patch);
    let declared = reader.varint()?;

    // every output byte comes from either the base or a literal in the patch
    let limit = (base.len() + reader.remaining()) as u64;
    if declared > limit {
        return Err(DeltaError::ImpossibleLength { declared });
    }
    let target_len = declared as usize;
    let mut out = Vec::with_capacity(target_len);

    while !reader.is_empty() {
        let copy = reader.varint()? as usize;
        copy_from_base(base, &mut out, copy, target_len)?;

        let literal_len = reader.varint()? as usize;
        let literal = reader.take(literal_len)?;
        if out.len() + literal.len() > target_len {
            return Err(DeltaError::TargetOverrun { declared: target_len });
        }
        out.extend_from_slice(literal);
    }

    let rest = target_len - out.len();
    copy_from_base(base, &mut out, rest, target_len)?;
    Ok(out)
}

fn copy_from_base(
    base: &[u8],
    out: &mut Vec<u8>,
    count: usize,
    target_len: usize,
) -> Result<(), DeltaError> {
    let start = out.len();
    let end = start
        .checked_add(count)
        .ok_or(DeltaError::TargetOverrun { declared: target_len })?;
    if end > target_len {
        return Err(DeltaError::TargetOverrun { declared: target_len });
    }
    let chunk = base.get(start..end).ok_or(DeltaError::BaseOverrun {
        base_len: base.len(),
    })?;
    out.extend_from_slice(chunk);
    Ok(())
}
