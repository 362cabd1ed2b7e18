//! Parallel move resolution.
//!
//! At every control-flow join and call site the register allocator hands us
//! an unordered set of location-to-location assignments which must behave
//! as if they all executed simultaneously: no assignment may observe
//! another's result. This module turns that set into an ordered
//! [MoveSchedule] of plain copies and exchanges which a sequential machine
//! can execute.
//!
//! The dependency structure between moves forms a graph (move *a* must run
//! before move *b* if *b*'s destination is *a*'s source); cycles in that
//! graph cannot be serialised with copies alone and are broken with swaps.
//! Cycle detection uses a `pending` mark per move during a bounded
//! recursive traversal: recursion depth is limited by the number of live
//! locations at one program point, so plain function recursion suffices.
//!
//! The cycle tie-break is deliberately greedy and fixed: the first detected
//! pending blocker becomes the swap point. This is not a minimum-swap
//! policy and must not be "improved" silently: downstream code-size
//! accounting assumes the current ordering.

use crate::log::{self, Verbosity};
use moxloc::Location;
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

/// One source/destination assignment, plus the transient state the resolver
/// threads through its traversal.
#[derive(Clone, Debug)]
struct MoveOperands {
    src: Location,
    dst: Location,
    state: MoveState,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum MoveState {
    /// Not yet scheduled.
    Unresolved,
    /// Currently being resolved: any other move that finds this one
    /// blocking it has found a cycle.
    Pending,
    /// Scheduled, or proven redundant.
    Eliminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Move,
    Swap,
}

/// One step of a resolved schedule. For [OpKind::Swap], `src` and `dst`
/// name the two locations whose contents are exchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledOp {
    pub kind: OpKind,
    pub src: Location,
    pub dst: Location,
}

impl Display for ScheduledOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            OpKind::Move => write!(f, "{} <- {}", self.dst, self.src),
            OpKind::Swap => write!(f, "swap {}, {}", self.dst, self.src),
        }
    }
}

/// An ordered, cycle-free move sequence. Created once per program point and
/// never mutated afterwards; there is no nop kind because redundant moves
/// are eliminated before they reach the schedule.
#[derive(Debug)]
pub struct MoveSchedule {
    // Move sets are per-program-point and rarely exceed a handful of
    // entries.
    ops: SmallVec<[ScheduledOp; 8]>,
}

impl MoveSchedule {
    pub fn ops(&self) -> &[ScheduledOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledOp> {
        self.ops.iter()
    }
}

impl Display for MoveSchedule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

/// An unordered parallel move set under construction.
pub struct ParallelMoves {
    moves: Vec<MoveOperands>,
}

impl Default for ParallelMoves {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelMoves {
    pub fn new() -> Self {
        Self { moves: Vec::new() }
    }

    /// Add the assignment `dst <- src`.
    ///
    /// A pair-to-pair assignment is split into its two halves here, so the
    /// resolver core only ever sees scalar endpoints on both sides of a
    /// potential swap.
    pub fn add(&mut self, src: Location, dst: Location) {
        if let (Location::Pair(src_lo, src_hi), Location::Pair(dst_lo, dst_hi)) = (&src, &dst) {
            self.add((**src_lo).clone(), (**dst_lo).clone());
            self.add((**src_hi).clone(), (**dst_hi).clone());
            return;
        }
        self.moves.push(MoveOperands {
            src,
            dst,
            state: MoveState::Unresolved,
        });
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Resolve this move set into an ordered [MoveSchedule].
    ///
    /// # Panics
    ///
    /// If two moves have overlapping destinations. That is a bug in the
    /// caller (the set is not a parallel move), not a recoverable
    /// condition.
    pub fn resolve(mut self) -> MoveSchedule {
        for i in 0..self.moves.len() {
            for j in 0..i {
                assert!(
                    !self.moves[i].dst.overlaps(&self.moves[j].dst),
                    "parallel move has overlapping destinations {} and {}",
                    self.moves[j].dst,
                    self.moves[i].dst,
                );
            }
        }

        // Moves that are already in place need no operation at all.
        for m in &mut self.moves {
            if m.src == m.dst {
                m.state = MoveState::Eliminated;
            }
        }

        let mut ops = SmallVec::new();

        // Main pass: everything except constant-sourced moves. Constants
        // never block another move, and deferring them keeps scratch
        // resources free for as long as possible.
        for i in 0..self.moves.len() {
            if self.moves[i].state == MoveState::Unresolved && !self.moves[i].src.is_const() {
                self.perform_move(i, &mut ops);
            }
        }

        // Constant-sourced moves last, in their original order.
        for i in 0..self.moves.len() {
            if self.moves[i].state != MoveState::Eliminated {
                let m = &mut self.moves[i];
                assert!(m.src.is_const());
                ops.push(ScheduledOp {
                    kind: OpKind::Move,
                    src: m.src.clone(),
                    dst: m.dst.clone(),
                });
                m.state = MoveState::Eliminated;
            }
        }

        // The core safety invariant: a pending mark must never survive
        // resolution.
        assert!(self
            .moves
            .iter()
            .all(|m| m.state == MoveState::Eliminated));

        let schedule = MoveSchedule { ops };
        if !schedule.is_empty() {
            log::log(Verbosity::Codegen, &format!("move schedule:\n{schedule}"));
        }
        schedule
    }

    /// Schedule move `i`, first recursively scheduling every move that
    /// must execute before it (i.e. whose source `i`'s destination would
    /// clobber).
    fn perform_move(&mut self, i: usize, ops: &mut SmallVec<[ScheduledOp; 8]>) {
        assert_eq!(self.moves[i].state, MoveState::Unresolved);
        // Mark this move pending so that recursive resolution below can
        // detect when it has looped back to us.
        self.moves[i].state = MoveState::Pending;
        let dst = self.moves[i].dst.clone();

        for j in 0..self.moves.len() {
            if j == i {
                continue;
            }
            if self.moves[j].state == MoveState::Unresolved && self.moves[j].src.overlaps(&dst) {
                self.perform_move(j, ops);
            }
        }

        // All blockers are resolved; we no longer need to be observable as
        // pending, and must not be once we return.
        self.moves[i].state = MoveState::Unresolved;

        // A swap performed during the recursion may have already delivered
        // our value (rewriting our source in the process).
        if self.moves[i].src == dst {
            self.moves[i].state = MoveState::Eliminated;
            return;
        }

        // If a move further up the recursion still wants our destination,
        // we are inside a cycle: break it with a swap instead of a copy.
        let in_cycle = self.moves.iter().enumerate().any(|(j, m)| {
            j != i
                && m.state == MoveState::Pending
                && (m.src.overlaps(&dst) || m.dst.overlaps(&dst))
        });
        let src = self.moves[i].src.clone();
        if in_cycle {
            // The allocator splits wide values before they get here, so a
            // swap endpoint can never be a pair.
            assert!(!matches!(src, Location::Pair(..)) && !matches!(dst, Location::Pair(..)));
            ops.push(ScheduledOp {
                kind: OpKind::Swap,
                src: src.clone(),
                dst: dst.clone(),
            });
            self.moves[i].state = MoveState::Eliminated;
            // The swap exchanged the contents of `src` and `dst`: any
            // other move reading either location must now read the other.
            for m in &mut self.moves {
                if m.state == MoveState::Eliminated {
                    continue;
                }
                if m.src == src {
                    m.src = dst.clone();
                } else if m.src == dst {
                    m.src = src.clone();
                }
            }
        } else {
            ops.push(ScheduledOp {
                kind: OpKind::Move,
                src,
                dst,
            });
            self.moves[i].state = MoveState::Eliminated;
        }
    }
}
