//! External merge sort over fixed-width 64-bit integer files.
//!
//! Ported from `external_sort.cc`: a chunk-sort-spill pass followed by a
//! k-way merge keyed on `(value, chunk_id)` so the merge is stable even
//! when values repeat across chunks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::debug;

use crate::error::{Error, Result};
use crate::file::BlockFile;

const VALUE_SIZE: usize = 8;

/// One candidate value drawn from a chunk's merge cursor. Ordered so that
/// `BinaryHeap` (a max-heap) yields the smallest `(value, chunk_id)` pair
/// first, via `Reverse` semantics baked into `Ord`.
#[derive(Eq, PartialEq)]
struct Candidate {
    value: u64,
    chunk_id: usize,
    position: u64,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .value
            .cmp(&self.value)
            .then_with(|| other.chunk_id.cmp(&self.chunk_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn read_value(file: &mut dyn BlockFile, offset: u64) -> Result<u64> {
    let mut buf = [0u8; VALUE_SIZE];
    file.read_block(offset, VALUE_SIZE, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_value(file: &mut dyn BlockFile, offset: u64, value: u64) -> Result<()> {
    file.write_block(&value.to_le_bytes(), offset, VALUE_SIZE)
}

/// Sorts `n_values` little-endian `u64`s from `input` into `output`,
/// never holding more than `mem_budget_bytes` worth of values in memory
/// at once.
///
/// `input` must already hold at least `n_values * 8` bytes; `output` is
/// resized to exactly that size. `make_chunk_file` is called once per
/// chunk spilled during the first pass and must return a fresh, distinct
/// scratch file each time (the caller typically backs this with
/// `FileSystem::make_temporary_file`).
pub fn external_sort(
    input: &mut dyn BlockFile,
    n_values: u64,
    output: &mut dyn BlockFile,
    mem_budget_bytes: usize,
    mut make_chunk_file: impl FnMut() -> Result<Box<dyn BlockFile>>,
) -> Result<()> {
    if mem_budget_bytes < VALUE_SIZE {
        return Err(Error::Precondition(
            "mem_budget_bytes must hold at least one value".into(),
        ));
    }
    let total_bytes = n_values * VALUE_SIZE as u64;
    if input.size() < total_bytes {
        return Err(Error::Precondition("input file shorter than n_values".into()));
    }
    output.resize(total_bytes)?;
    if n_values == 0 {
        return Ok(());
    }

    let values_per_chunk = (mem_budget_bytes / VALUE_SIZE) as u64;
    let values_per_chunk = values_per_chunk.max(1);

    // Pass 1: read, sort, and spill fixed-size chunks.
    let mut chunks: Vec<(Box<dyn BlockFile>, u64)> = Vec::new();
    let mut offset = 0u64;
    while offset < total_bytes {
        let remaining = n_values - offset / VALUE_SIZE as u64;
        let this_chunk = remaining.min(values_per_chunk);
        let mut buf = Vec::with_capacity(this_chunk as usize);
        for i in 0..this_chunk {
            buf.push(read_value(input, offset + i * VALUE_SIZE as u64)?);
        }
        buf.sort_unstable();

        let mut chunk_file = make_chunk_file()?;
        chunk_file.resize(this_chunk * VALUE_SIZE as u64)?;
        for (i, v) in buf.iter().enumerate() {
            write_value(chunk_file.as_mut(), i as u64 * VALUE_SIZE as u64, *v)?;
        }
        debug!("spilled chunk of {} values", this_chunk);
        chunks.push((chunk_file, this_chunk));
        offset += this_chunk * VALUE_SIZE as u64;
    }

    // Pass 2: k-way merge via a min-heap over one cursor per chunk.
    let mut heap = BinaryHeap::with_capacity(chunks.len());
    let mut remaining_in_chunk: Vec<u64> = chunks.iter().map(|(_, n)| *n).collect();
    for (chunk_id, (chunk_file, n)) in chunks.iter_mut().enumerate() {
        if *n > 0 {
            let value = read_value(chunk_file.as_mut(), 0)?;
            heap.push(Candidate {
                value,
                chunk_id,
                position: 0,
            });
        }
    }

    let mut out_offset = 0u64;
    while let Some(Candidate {
        value,
        chunk_id,
        position,
    }) = heap.pop()
    {
        write_value(output, out_offset, value)?;
        out_offset += VALUE_SIZE as u64;

        let next_position = position + 1;
        remaining_in_chunk[chunk_id] -= 1;
        if remaining_in_chunk[chunk_id] > 0 {
            let (chunk_file, _) = &mut chunks[chunk_id];
            let next_value =
                read_value(chunk_file.as_mut(), next_position * VALUE_SIZE as u64)?;
            heap.push(Candidate {
                value: next_value,
                chunk_id,
                position: next_position,
            });
        }
    }

    debug!("external sort merged {} chunks, {} values", chunks.len(), n_values);
    Ok(())
}
