//! Basic block discovery
//!
//! Splits an instruction sequence at jump/branch targets and branch
//! fall-throughs, then links the blocks through their successors and
//! predecessors.

use std::collections::{BTreeMap, BTreeSet};

use tendril_vm::Insn;
use tracing::debug;

use crate::builder::BuildError;

/// A basic block: a maximal straight-line run of instructions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock<'a> {
    /// Index of the first instruction
    pub start: usize,
    /// The instructions of this block
    pub insns: &'a [Insn],
    /// Start offsets of predecessor blocks, in block order
    pub prev: Vec<usize>,
    /// Start offsets of successor blocks. For a branch the taken target
    /// comes first and the fall-through second.
    pub next: Vec<usize>,
}

impl<'a> BasicBlock<'a> {
    /// The instruction that decides where control goes next: the first
    /// jump, branch or return, or else the last instruction
    pub fn terminator(&self) -> Option<&'a Insn> {
        self.live_insns().last()
    }

    /// Instructions up to and including the terminator. Anything after an
    /// unconditional jump or return in the same block is unreachable.
    pub fn live_insns(&self) -> &'a [Insn] {
        live_prefix(self.insns)
    }
}

fn live_prefix(insns: &[Insn]) -> &[Insn] {
    match insns
        .iter()
        .position(|insn| matches!(insn, Insn::Jump(_) | Insn::Branch(_) | Insn::Return))
    {
        Some(end) => &insns[..=end],
        None => insns,
    }
}

/// Sorted block boundaries: `0`, every jump/branch target, and the
/// instruction after every branch
pub fn targets(insns: &[Insn]) -> Result<Vec<usize>, BuildError> {
    let mut targets = BTreeSet::new();

    if !insns.is_empty() {
        targets.insert(0);
    }

    for (index, insn) in insns.iter().enumerate() {
        if let Some(target) = insn.target() {
            if target >= insns.len() {
                return Err(BuildError::InvalidTarget { at: index, target, len: insns.len() });
            }
            targets.insert(target);
            // Branches may fall through; a branch that ends the method has
            // nowhere to fall through to
            if matches!(insn, Insn::Branch(_)) && index + 1 < insns.len() {
                targets.insert(index + 1);
            }
        }
    }

    Ok(targets.into_iter().collect())
}

/// Partition `insns` into basic blocks keyed by start offset
pub fn basic_blocks(insns: &[Insn]) -> Result<BTreeMap<usize, BasicBlock<'_>>, BuildError> {
    let targets = targets(insns)?;
    let mut blocks = BTreeMap::new();

    for (index, &start) in targets.iter().enumerate() {
        let end = targets.get(index + 1).copied().unwrap_or(insns.len());
        let block_insns = &insns[start..end];

        let mut next = Vec::new();
        if let Some(last) = live_prefix(block_insns).last() {
            if let Some(target) = last.target() {
                next.push(target);
            }
            if !matches!(last, Insn::Jump(_) | Insn::Return) {
                if let Some(&following) = targets.get(index + 1) {
                    next.push(following);
                }
            }
        }

        blocks.insert(
            start,
            BasicBlock { start, insns: block_insns, prev: Vec::new(), next },
        );
    }

    // Invert successor lists into predecessor lists
    let edges: Vec<(usize, usize)> = blocks
        .values()
        .flat_map(|block| block.next.iter().map(move |&n| (block.start, n)))
        .collect();
    for (from, to) in edges {
        if let Some(block) = blocks.get_mut(&to) {
            block.prev.push(from);
        }
    }

    debug!(blocks = blocks.len(), insns = insns.len(), "found basic blocks");
    Ok(blocks)
}
