//! x64 register budget for the move emitter.

use crate::emit::MachineSpec;
use moxloc::{FpReg, GpReg, SlotWidth, StackSlot};

/// General purpose scratch candidates, in preference order. High registers
/// first: they are the least likely to be argument/return registers, so
/// borrowing them rarely collides with in-flight call setup. `rsp` and `rbp`
/// are frame plumbing and never candidates.
pub(crate) static SCRATCH_GP_REGS: [GpReg; 14] = [
    GpReg::R15,
    GpReg::R14,
    GpReg::R13,
    GpReg::R12,
    GpReg::R11,
    GpReg::R10,
    GpReg::R9,
    GpReg::R8,
    GpReg::RDI,
    GpReg::RSI,
    GpReg::RBX,
    GpReg::RDX,
    GpReg::RCX,
    GpReg::RAX,
];

/// Floating point scratch candidates.
pub(crate) static SCRATCH_FP_REGS: [FpReg; 16] = [
    FpReg::XMM0,
    FpReg::XMM1,
    FpReg::XMM2,
    FpReg::XMM3,
    FpReg::XMM4,
    FpReg::XMM5,
    FpReg::XMM6,
    FpReg::XMM7,
    FpReg::XMM8,
    FpReg::XMM9,
    FpReg::XMM10,
    FpReg::XMM11,
    FpReg::XMM12,
    FpReg::XMM13,
    FpReg::XMM14,
    FpReg::XMM15,
];

/// The x64 [MachineSpec]. The spill cells sit in the red zone below `rsp`:
/// the emitter runs at a point where no signal-safe code touches the frame,
/// and the cells are torn down before the next real stack operation. Two
/// cells per register class, since a stack-to-stack swap can hold two
/// spilled scratches at once. The floating point cells are quad-sized so a
/// split 128 bit value's halves fit.
pub fn machine_spec() -> MachineSpec {
    MachineSpec {
        scratch_gp: &SCRATCH_GP_REGS,
        scratch_fp: &SCRATCH_FP_REGS,
        reserved: Vec::new(),
        gp_spill_cells: [
            StackSlot::new(GpReg::RSP, -8, SlotWidth::Word),
            StackSlot::new(GpReg::RSP, -16, SlotWidth::Word),
        ],
        fp_spill_cells: [
            StackSlot::new(GpReg::RSP, -32, SlotWidth::Quad),
            StackSlot::new(GpReg::RSP, -48, SlotWidth::Quad),
        ],
    }
}
