//! Move schedule emission.
//!
//! This module lowers a resolved [MoveSchedule] into primitive copy/load/
//! store/exchange operations on an [AsmBackend]. It has no understanding of
//! instruction encodings, which are hidden behind the trait; backends (e.g.
//! x64) implement it to append real machine operations to their instruction
//! stream.
//!
//! The only interesting decision made here is scratch allocation. Several
//! schedule steps (stack-to-stack copies, constant stores, most swaps) need
//! temporary storage, and a register is only safe to borrow if no
//! not-yet-executed step still depends on its contents. When no register is
//! safe, we spill one to a dedicated scratch stack cell around the single
//! operation that needs it: acquire, use, release, never held across
//! operations.

use crate::{
    moves::{MoveSchedule, OpKind},
    CompilationError,
};
use moxloc::{FpReg, GpReg, Location, SlotWidth, StackSlot};
use strum::EnumCount;
use vob::Vob;

/// The primitive operations a machine backend must provide. Every other
/// copy shape (stack-to-stack, constant-to-stack, swaps) is decomposed onto
/// these by [MoveEmitter].
pub trait AsmBackend {
    fn copy_reg(&mut self, src: GpReg, dst: GpReg) -> Result<(), CompilationError>;
    fn copy_fpu(&mut self, src: FpReg, dst: FpReg) -> Result<(), CompilationError>;
    fn spill(&mut self, src: GpReg, dst: StackSlot) -> Result<(), CompilationError>;
    fn unspill(&mut self, src: StackSlot, dst: GpReg) -> Result<(), CompilationError>;
    fn spill_fpu(&mut self, src: FpReg, dst: StackSlot) -> Result<(), CompilationError>;
    fn unspill_fpu(&mut self, src: StackSlot, dst: FpReg) -> Result<(), CompilationError>;
    fn move_const(&mut self, c: i64, dst: GpReg) -> Result<(), CompilationError>;
    /// Exchange a register's contents with a stack slot's, in place.
    fn exchange(&mut self, reg: GpReg, slot: StackSlot) -> Result<(), CompilationError>;
}

/// The per-architecture register/stack budget the emitter works within.
/// Passed explicitly (rather than read from process-wide state) so that
/// configurations are testable and reproducible.
pub struct MachineSpec {
    /// Scratch candidates, in preference order. Must not contain stack base
    /// registers.
    pub scratch_gp: &'static [GpReg],
    pub scratch_fp: &'static [FpReg],
    /// Globally reserved registers (e.g. an argument-descriptor register
    /// held live across an intrinsic fast path): never borrowed as scratch.
    pub reserved: Vec<GpReg>,
    /// The dedicated cells a general purpose register is saved to when
    /// every candidate is blocked. A stack-to-stack swap holds two
    /// scratches at once, so two concurrently spilled registers need two
    /// distinct cells or the second save overwrites the first.
    pub gp_spill_cells: [StackSlot; 2],
    /// As `gp_spill_cells`, for floating point registers.
    pub fp_spill_cells: [StackSlot; 2],
}

/// A borrowed scratch register. If `spilled` is set, the register's real
/// contents are parked in that [MachineSpec] spill cell and must be
/// restored on release.
struct ScratchGp {
    reg: GpReg,
    spilled: Option<StackSlot>,
}

struct ScratchFp {
    reg: FpReg,
    spilled: Option<StackSlot>,
}

pub struct MoveEmitter<'a, AB: AsmBackend> {
    spec: &'a MachineSpec,
    be: &'a mut AB,
    /// How many spilled scratches of each class are currently held;
    /// indexes the next free spill cell.
    gp_spills: usize,
    fp_spills: usize,
}

impl<'a, AB: AsmBackend> MoveEmitter<'a, AB> {
    pub fn new(spec: &'a MachineSpec, be: &'a mut AB) -> Self {
        Self {
            spec,
            be,
            gp_spills: 0,
            fp_spills: 0,
        }
    }

    /// Emit `schedule` onto the backend.
    pub fn emit(&mut self, schedule: &MoveSchedule) -> Result<(), CompilationError> {
        for i in 0..schedule.len() {
            let op = &schedule.ops()[i];
            match op.kind {
                OpKind::Move => self.emit_move(&op.src, &op.dst, schedule, i)?,
                OpKind::Swap => self.emit_swap(&op.src, &op.dst, schedule, i)?,
            }
        }
        Ok(())
    }

    fn emit_move(
        &mut self,
        src: &Location,
        dst: &Location,
        schedule: &MoveSchedule,
        i: usize,
    ) -> Result<(), CompilationError> {
        match (src, dst) {
            (Location::Reg(s), Location::Reg(d)) => self.be.copy_reg(*s, *d),
            (Location::Reg(s), Location::Stack(d)) => self.be.spill(*s, *d),
            (Location::Stack(s), Location::Reg(d)) => self.be.unspill(*s, *d),
            (Location::FpuReg(s), Location::FpuReg(d)) => self.be.copy_fpu(*s, *d),
            (Location::FpuReg(s), Location::Stack(d)) => self.be.spill_fpu(*s, *d),
            (Location::Stack(s), Location::FpuReg(d)) => self.be.unspill_fpu(*s, *d),
            (Location::Stack(s), Location::Stack(d)) => match d.width {
                SlotWidth::Word => {
                    let t = self.acquire_gp(schedule, i, &[])?;
                    self.be.unspill(*s, t.reg)?;
                    self.be.spill(t.reg, *d)?;
                    self.release_gp(t)
                }
                SlotWidth::Double | SlotWidth::Quad => {
                    let t = self.acquire_fp(schedule, i, &[])?;
                    self.be.unspill_fpu(*s, t.reg)?;
                    self.be.spill_fpu(t.reg, *d)?;
                    self.release_fp(t)
                }
            },
            (Location::Const(c), Location::Reg(d)) => self.be.move_const(*c, *d),
            (Location::Const(c), Location::Stack(d)) => {
                let t = self.acquire_gp(schedule, i, &[])?;
                self.be.move_const(*c, t.reg)?;
                self.be.spill(t.reg, *d)?;
                self.release_gp(t)
            }
            // The resolver splits pair assignments before scheduling, and
            // the allocator produces no other shapes.
            (src, dst) => unreachable!("unsupported move {src} -> {dst}"),
        }
    }

    fn emit_swap(
        &mut self,
        src: &Location,
        dst: &Location,
        schedule: &MoveSchedule,
        i: usize,
    ) -> Result<(), CompilationError> {
        match (src, dst) {
            (Location::Reg(a), Location::Reg(b)) => {
                let t = self.acquire_gp(schedule, i, &[*a, *b])?;
                self.be.copy_reg(*a, t.reg)?;
                self.be.copy_reg(*b, *a)?;
                self.be.copy_reg(t.reg, *b)?;
                self.release_gp(t)
            }
            (Location::FpuReg(a), Location::FpuReg(b)) => {
                let t = self.acquire_fp(schedule, i, &[*a, *b])?;
                self.be.copy_fpu(*a, t.reg)?;
                self.be.copy_fpu(*b, *a)?;
                self.be.copy_fpu(t.reg, *b)?;
                self.release_fp(t)
            }
            // A register/stack exchange goes through the register itself:
            // no scratch needed.
            (Location::Reg(r), Location::Stack(s)) | (Location::Stack(s), Location::Reg(r)) => {
                self.be.exchange(*r, *s)
            }
            (Location::Stack(a), Location::Stack(b)) => {
                // Both values are in flight at once, so two scratch
                // locations are held for the duration of the four
                // load/stores.
                assert_eq!(a.width, b.width);
                match a.width {
                    SlotWidth::Word => {
                        let t1 = self.acquire_gp(schedule, i, &[])?;
                        let t2 = self.acquire_gp(schedule, i, &[t1.reg])?;
                        self.be.unspill(*a, t1.reg)?;
                        self.be.unspill(*b, t2.reg)?;
                        self.be.spill(t1.reg, *b)?;
                        self.be.spill(t2.reg, *a)?;
                        self.release_gp(t2)?;
                        self.release_gp(t1)
                    }
                    SlotWidth::Double | SlotWidth::Quad => {
                        let t1 = self.acquire_fp(schedule, i, &[])?;
                        let t2 = self.acquire_fp(schedule, i, &[t1.reg])?;
                        self.be.unspill_fpu(*a, t1.reg)?;
                        self.be.unspill_fpu(*b, t2.reg)?;
                        self.be.spill_fpu(t1.reg, *b)?;
                        self.be.spill_fpu(t2.reg, *a)?;
                        self.release_fp(t2)?;
                        self.release_fp(t1)
                    }
                }
            }
            (src, dst) => unreachable!("unsupported swap {src} <-> {dst}"),
        }
    }

    /// The general purpose registers that operations `i..` still depend on:
    /// the source of any remaining op, the destination of any remaining
    /// plain move, and the base register of any stack slot any remaining op
    /// addresses. A remaining swap's *destination register* is
    /// deliberately not blocked.
    fn blocked_gp(&self, schedule: &MoveSchedule, i: usize) -> Vob {
        let mut blocked = Vob::from_elem(false, GpReg::COUNT);
        for op in &schedule.ops()[i..] {
            mark_gp(&op.src, &mut blocked);
            if op.kind == OpKind::Move {
                mark_gp(&op.dst, &mut blocked);
            } else {
                mark_gp_bases(&op.dst, &mut blocked);
            }
        }
        blocked
    }

    fn blocked_fp(&self, schedule: &MoveSchedule, i: usize) -> Vob {
        let mut blocked = Vob::from_elem(false, FpReg::COUNT);
        for op in &schedule.ops()[i..] {
            mark_fp(&op.src, &mut blocked);
            if op.kind == OpKind::Move {
                mark_fp(&op.dst, &mut blocked);
            }
        }
        blocked
    }

    /// Borrow a general purpose register for the single operation at
    /// schedule position `i`, spilling one if every candidate is blocked.
    ///
    /// # Panics
    ///
    /// If the [MachineSpec] leaves no candidate at all: the architecture
    /// budget guarantees scratch by construction, so that is a fatal
    /// configuration error.
    fn acquire_gp(
        &mut self,
        schedule: &MoveSchedule,
        i: usize,
        exclude: &[GpReg],
    ) -> Result<ScratchGp, CompilationError> {
        let usable = |r: &GpReg| !exclude.contains(r) && !self.spec.reserved.contains(r);
        let blocked = self.blocked_gp(schedule, i);
        if let Some(reg) = self
            .spec
            .scratch_gp
            .iter()
            .filter(|r| usable(r))
            .find(|r| !blocked[**r as usize])
        {
            return Ok(ScratchGp {
                reg: *reg,
                spilled: None,
            });
        }
        // Every candidate is live: park one in the next free cell for the
        // duration of this one operation. Each concurrently held scratch
        // gets its own cell, so a second spill cannot clobber the first's
        // saved value.
        let reg = *self
            .spec
            .scratch_gp
            .iter()
            .find(|r| usable(r))
            .unwrap_or_else(|| panic!("machine spec provides no scratch register"));
        let cell = *self
            .spec
            .gp_spill_cells
            .get(self.gp_spills)
            .unwrap_or_else(|| panic!("machine spec provides no free spill cell"));
        self.gp_spills += 1;
        self.be.spill(reg, cell)?;
        Ok(ScratchGp {
            reg,
            spilled: Some(cell),
        })
    }

    fn release_gp(&mut self, s: ScratchGp) -> Result<(), CompilationError> {
        if let Some(cell) = s.spilled {
            self.be.unspill(cell, s.reg)?;
            self.gp_spills -= 1;
        }
        Ok(())
    }

    fn acquire_fp(
        &mut self,
        schedule: &MoveSchedule,
        i: usize,
        exclude: &[FpReg],
    ) -> Result<ScratchFp, CompilationError> {
        let blocked = self.blocked_fp(schedule, i);
        if let Some(reg) = self
            .spec
            .scratch_fp
            .iter()
            .filter(|r| !exclude.contains(r))
            .find(|r| !blocked[**r as usize])
        {
            return Ok(ScratchFp {
                reg: *reg,
                spilled: None,
            });
        }
        let reg = *self
            .spec
            .scratch_fp
            .iter()
            .find(|r| !exclude.contains(r))
            .unwrap_or_else(|| panic!("machine spec provides no scratch fpu register"));
        let cell = *self
            .spec
            .fp_spill_cells
            .get(self.fp_spills)
            .unwrap_or_else(|| panic!("machine spec provides no free fpu spill cell"));
        self.fp_spills += 1;
        self.be.spill_fpu(reg, cell)?;
        Ok(ScratchFp {
            reg,
            spilled: Some(cell),
        })
    }

    fn release_fp(&mut self, s: ScratchFp) -> Result<(), CompilationError> {
        if let Some(cell) = s.spilled {
            self.be.unspill_fpu(cell, s.reg)?;
            self.fp_spills -= 1;
        }
        Ok(())
    }
}

fn mark_gp(loc: &Location, blocked: &mut Vob) {
    match loc {
        Location::Reg(r) => {
            blocked.set(*r as usize, true);
        }
        Location::Stack(s) => {
            blocked.set(s.base as usize, true);
        }
        Location::Pair(lo, hi) => {
            mark_gp(lo, blocked);
            mark_gp(hi, blocked);
        }
        Location::FpuReg(_) | Location::Const(_) => (),
    }
}

/// Like [mark_gp], but only marks registers a stack operand addresses
/// through, not value registers.
fn mark_gp_bases(loc: &Location, blocked: &mut Vob) {
    match loc {
        Location::Stack(s) => {
            blocked.set(s.base as usize, true);
        }
        Location::Pair(lo, hi) => {
            mark_gp_bases(lo, blocked);
            mark_gp_bases(hi, blocked);
        }
        Location::Reg(_) | Location::FpuReg(_) | Location::Const(_) => (),
    }
}

fn mark_fp(loc: &Location, blocked: &mut Vob) {
    match loc {
        Location::FpuReg(r) => {
            blocked.set(*r as usize, true);
        }
        Location::Pair(lo, hi) => {
            mark_fp(lo, blocked);
            mark_fp(hi, blocked);
        }
        Location::Reg(_) | Location::Stack(_) | Location::Const(_) => (),
    }
}
