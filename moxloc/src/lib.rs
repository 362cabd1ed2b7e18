//! The mox location model: a description of where a single value lives at one
//! program point. This is the leaf vocabulary shared by the register
//! allocator's consumers (the move resolver, the schedule emitter, and the
//! deopt info builder).
//!
//! Note that mox's backend currently only targets 64 bit architectures. Once
//! we support others, the register sets and slot widths here will need to
//! become per-architecture.
#[cfg(not(target_arch = "x86_64"))]
compile_error!("The location model currently only supports x86_64.");

use std::fmt::{self, Display, Formatter};
use strum::EnumCount;

/// A general purpose register. The `repr` values are also the DWARF-free
/// internal numbering: they are semantically irrelevant but must stay
/// consecutive or register tables will waste space.
#[derive(Clone, Copy, Debug, EnumCount, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GpReg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Display for GpReg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            GpReg::RAX => "rax",
            GpReg::RCX => "rcx",
            GpReg::RDX => "rdx",
            GpReg::RBX => "rbx",
            GpReg::RSP => "rsp",
            GpReg::RBP => "rbp",
            GpReg::RSI => "rsi",
            GpReg::RDI => "rdi",
            GpReg::R8 => "r8",
            GpReg::R9 => "r9",
            GpReg::R10 => "r10",
            GpReg::R11 => "r11",
            GpReg::R12 => "r12",
            GpReg::R13 => "r13",
            GpReg::R14 => "r14",
            GpReg::R15 => "r15",
        };
        write!(f, "{s}")
    }
}

/// A floating point register.
#[derive(Clone, Copy, Debug, EnumCount, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FpReg {
    XMM0 = 0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

impl Display for FpReg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", *self as u8)
    }
}

/// The width of a stack slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotWidth {
    /// One machine word (8 bytes).
    Word,
    /// A double precision float (8 bytes).
    Double,
    /// Two machine words (16 bytes), e.g. a split 128 bit value.
    Quad,
}

impl SlotWidth {
    pub fn byte_size(&self) -> u32 {
        match self {
            SlotWidth::Word | SlotWidth::Double => 8,
            SlotWidth::Quad => 16,
        }
    }
}

/// A stack slot `off` bytes from the base register `base`. Whether `off` is
/// "above" or "below" the base is a frame-layout convention owned by the
/// code that assigned the slot: two slots are the same storage iff their
/// byte ranges intersect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub base: GpReg,
    pub off: i32,
    pub width: SlotWidth,
}

impl StackSlot {
    pub fn new(base: GpReg, off: i32, width: SlotWidth) -> Self {
        Self { base, off, width }
    }

    /// Do `self` and `other` share any bytes?
    pub fn overlaps(&self, other: &StackSlot) -> bool {
        if self.base != other.base {
            return false;
        }
        let a_end = self.off + i32::try_from(self.width.byte_size()).unwrap();
        let b_end = other.off + i32::try_from(other.width.byte_size()).unwrap();
        self.off < b_end && other.off < a_end
    }
}

impl Display for StackSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let w = match self.width {
            SlotWidth::Word => "w",
            SlotWidth::Double => "d",
            SlotWidth::Quad => "q",
        };
        write!(f, "[{}{:+}]{}", self.base, self.off, w)
    }
}

/// Where one value lives. Immutable; equality is structural. The kind set is
/// closed and matched exhaustively on the hot path, so this is deliberately
/// a plain tagged union rather than anything trait-shaped.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// The value is in a general purpose register.
    Reg(GpReg),
    /// The value is in a floating point register.
    FpuReg(FpReg),
    /// The value is in a stack slot.
    Stack(StackSlot),
    /// The value is a compile-time constant.
    Const(i64),
    /// A wide value split across two sub-locations (low half first).
    Pair(Box<Location>, Box<Location>),
}

impl Location {
    pub fn stack(base: GpReg, off: i32, width: SlotWidth) -> Self {
        Location::Stack(StackSlot::new(base, off, width))
    }

    pub fn pair(lo: Location, hi: Location) -> Self {
        Location::Pair(Box::new(lo), Box::new(hi))
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Location::Const(_))
    }

    /// Does writing to `self` change what a read of `other` observes (or
    /// vice versa)? A [Location::Pair] aliases each of its halves; stack
    /// slots alias by byte range; everything else aliases by equality.
    /// Constants never alias anything, themselves included.
    pub fn overlaps(&self, other: &Location) -> bool {
        match (self, other) {
            (Location::Pair(lo, hi), _) => lo.overlaps(other) || hi.overlaps(other),
            (_, Location::Pair(lo, hi)) => self.overlaps(lo) || self.overlaps(hi),
            (Location::Stack(a), Location::Stack(b)) => a.overlaps(b),
            (Location::Const(_), _) | (_, Location::Const(_)) => false,
            (a, b) => a == b,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Location::Reg(r) => write!(f, "{r}"),
            Location::FpuReg(r) => write!(f, "{r}"),
            Location::Stack(s) => write!(f, "{s}"),
            Location::Const(c) => write!(f, "#{c}"),
            Location::Pair(lo, hi) => write!(f, "({lo}, {hi})"),
        }
    }
}
