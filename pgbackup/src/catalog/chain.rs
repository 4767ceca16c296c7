//! Parent-chain traversal over an enumerated catalog (§4.1, §8 invariant
//! 2: "every non-FULL backup's ancestor chain terminates in an intact FULL
//! backup, or the backup is ORPHAN").

use crate::model::{Backup, BackupMode};

/// The three-way outcome of walking a backup's ancestor chain to its root
/// (Testable Property 2: "return one of {broken, intact-with-invalid,
/// intact-all-ok} plus the witness").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// A parent link is missing (or points nowhere) before a FULL ancestor
    /// was reached. `witness` is the index where the walk stopped.
    Broken { witness: usize },
    /// The chain reaches an intact FULL root, but at least one ancestor
    /// along the way has a non-{OK,DONE} status. `witness` is the oldest
    /// (closest-to-root) such ancestor.
    IntactWithInvalid { chain: Vec<usize>, witness: usize },
    /// The chain reaches a FULL root and every node on it is OK or DONE.
    IntactAllOk { chain: Vec<usize> },
}

impl ChainOutcome {
    /// The walked indices, child-to-root, regardless of which intact
    /// variant this is. `None` for `Broken`.
    pub fn chain(&self) -> Option<&[usize]> {
        match self {
            ChainOutcome::Broken { .. } => None,
            ChainOutcome::IntactWithInvalid { chain, .. } => Some(chain),
            ChainOutcome::IntactAllOk { chain } => Some(chain),
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, ChainOutcome::Broken { .. })
    }
}

/// Walk from `start` through `parent` links, collecting indices from the
/// child outward (`start` first, terminal FULL last), continuing through
/// non-intact ancestors rather than stopping at the first one — the walk
/// only gives up when a link is missing. Tracks the oldest (last-visited)
/// non-{OK,DONE} node as the witness for `IntactWithInvalid`.
pub fn scan_parent_chain(backups: &[Backup], start: usize) -> ChainOutcome {
    let mut chain = Vec::new();
    let mut invalid_witness: Option<usize> = None;
    let mut current = start;
    loop {
        if !backups[current].status.is_intact() {
            invalid_witness = Some(current);
        }
        chain.push(current);
        if backups[current].backup_mode == BackupMode::Full {
            return match invalid_witness {
                Some(witness) => ChainOutcome::IntactWithInvalid { chain, witness },
                None => ChainOutcome::IntactAllOk { chain },
            };
        }
        current = match backups[current].parent {
            Some(p) => p,
            None => return ChainOutcome::Broken { witness: current },
        };
    }
}

/// The nearest ancestor (including `start` itself) whose mode is FULL:
/// walk parent links until a node with no further parent, then return it
/// only if its mode is FULL (§4.1 chain-queries (a)) — status is not
/// consulted here, only link continuity and terminal mode.
pub fn find_parent_full(backups: &[Backup], start: usize) -> Option<usize> {
    let mut current = start;
    loop {
        match backups[current].parent {
            Some(p) => current = p,
            None => {
                return (backups[current].backup_mode == BackupMode::Full).then_some(current);
            }
        }
    }
}

/// Is `candidate` a (strict) ancestor of `child` through the resolved
/// parent links?
pub fn is_parent(backups: &[Backup], child: usize, candidate: usize) -> bool {
    let mut current = child;
    while let Some(parent) = backups[current].parent {
        if parent == candidate {
            return true;
        }
        current = parent;
    }
    false
}

/// A backup is "prolific" (§4.1: ineligible for certain retention
/// operations without `--force`) if more than one OK/DONE catalog entry
/// names it as its *direct* parent (chain-queries (d) — not a transitive
/// ancestor count).
pub fn is_prolific(backups: &[Backup], candidate: usize) -> bool {
    (0..backups.len())
        .filter(|&i| i != candidate && backups[i].status.is_intact() && backups[i].parent == Some(candidate))
        .count()
        > 1
}
