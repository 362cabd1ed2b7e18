//! Deoptimization info construction.
//!
//! When optimized code must be abandoned mid-flight, the runtime rebuilds
//! the unoptimized frames the optimizer collapsed away (one per inlining
//! level) and resumes interpretation with identical observable state. A
//! [DeoptInfo] is the recipe for that rebuild: an ordered list of
//! [DeoptInstr]s, one per unoptimized stack slot, telling the unwinder
//! where each slot's value comes from in the optimized frame.
//!
//! The layout of each rebuilt frame (pp, pc-marker, caller-fp, return
//! address, then values) mirrors the unoptimized code generator's frame
//! convention: this module treats that layout as a fixed external contract.
//!
//! Blobs are interned in a [DeoptTable]: many call sites in one function
//! produce structurally identical descriptors, and sharing them keeps the
//! metadata cost of aggressive inlining acceptable.

use crate::{
    env::{BoundValue, DeoptId, Environment, FuncIdx, Functions, MatIdx, Materialization},
    log::{self, Verbosity},
};
use index_vec::{define_index_type, IndexVec};
use moxloc::{GpReg, Location};
use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
};

define_index_type! {
    /// An index into a [DeoptTable].
    pub struct DeoptInfoIdx = u32;
}

/// Slots occupied by one rebuilt frame's header: pp, pc-marker, caller-fp,
/// return address.
pub const FRAME_HEADER_SLOTS: usize = 4;

/// Slots occupied by the outermost frame's native caller linkage.
pub const NATIVE_LINKAGE_SLOTS: usize = 4;

/// One deopt instruction. Every variant except [DeoptInstr::MaterializeObject]
/// fills exactly one unoptimized stack slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeoptInstr {
    /// Prefix entry: rebuild a heap object of class `class_id`. The field
    /// values follow as the first value slots of the innermost frame, one
    /// per entry of `field_offsets`, each to be stored at its byte offset
    /// within the object. Consumes no slot itself.
    MaterializeObject {
        class_id: u32,
        field_offsets: Vec<u32>,
    },
    /// Copy the value at `loc` in the optimized frame into this slot.
    Value { loc: Location },
    /// Store a pointer to the `mat`th materialized object into this slot.
    MaterializedRef { mat: MatIdx },
    /// The constant pool pointer of `func`.
    ConstPoolPtr { func: FuncIdx },
    /// A marker identifying `func` as the frame executing above this slot.
    PcMarker { func: FuncIdx },
    /// The frame pointer linking to the next rebuilt frame.
    CallerFp,
    /// The resumption address within `func`, identified by `deopt_id`.
    RetAddr { func: FuncIdx, deopt_id: DeoptId },
    /// The native caller's constant pool pointer, recovered from the
    /// optimized frame being torn down.
    CallerPp,
    /// The native caller's return address, likewise recovered.
    CallerRetAddr,
}

/// A complete recipe for rebuilding the unoptimized frames of one deopt
/// point. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeoptInfo {
    instrs: Vec<DeoptInstr>,
    /// The index in `instrs` of the first slot-filling instruction; entries
    /// before it are the materialization prefix.
    frame_start: usize,
    /// The total number of unoptimized stack slots the instructions fill.
    frame_height: usize,
}

impl DeoptInfo {
    pub fn instrs(&self) -> &[DeoptInstr] {
        &self.instrs
    }

    pub fn frame_start(&self) -> usize {
        self.frame_start
    }

    pub fn frame_height(&self) -> usize {
        self.frame_height
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Render with function names resolved via `funcs`.
    pub fn display<'a>(&'a self, funcs: &'a Functions) -> DeoptInfoDisplay<'a> {
        DeoptInfoDisplay { info: self, funcs }
    }
}

pub struct DeoptInfoDisplay<'a> {
    info: &'a DeoptInfo,
    funcs: &'a Functions,
}

impl Display for DeoptInfoDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let fname = |fidx: &FuncIdx| self.funcs[*fidx].name();
        let mut slot = 0;
        for instr in &self.info.instrs {
            match instr {
                DeoptInstr::MaterializeObject {
                    class_id,
                    field_offsets,
                } => writeln!(f, " mat class={class_id} offs={field_offsets:?}")?,
                slotted => {
                    write!(f, "{slot:3}: ")?;
                    slot += 1;
                    match slotted {
                        DeoptInstr::Value { loc } => writeln!(f, "copy {loc}")?,
                        DeoptInstr::MaterializedRef { mat } => {
                            writeln!(f, "obj@{}", mat.index())?
                        }
                        DeoptInstr::ConstPoolPtr { func } => writeln!(f, "pp {}", fname(func))?,
                        DeoptInstr::PcMarker { func } => {
                            writeln!(f, "pc-marker {}", fname(func))?
                        }
                        DeoptInstr::CallerFp => writeln!(f, "caller-fp")?,
                        DeoptInstr::RetAddr { func, deopt_id } => {
                            writeln!(f, "ret-addr {} deopt_id={deopt_id}", fname(func))?
                        }
                        DeoptInstr::CallerPp => writeln!(f, "caller-pp")?,
                        DeoptInstr::CallerRetAddr => writeln!(f, "caller-ret-addr")?,
                        DeoptInstr::MaterializeObject { .. } => unreachable!(),
                    }
                }
            }
        }
        Ok(())
    }
}

/// The intern table for one function's deopt blobs. Append-only; owned by
/// the compiling thread.
pub struct DeoptTable {
    infos: IndexVec<DeoptInfoIdx, DeoptInfo>,
    dedup: HashMap<DeoptInfo, DeoptInfoIdx>,
}

impl DeoptTable {
    pub fn new() -> Self {
        Self {
            infos: IndexVec::new(),
            dedup: HashMap::new(),
        }
    }

    /// Intern `info`, returning the index of an existing structurally
    /// identical blob if one was registered before.
    fn register(&mut self, info: DeoptInfo) -> DeoptInfoIdx {
        if let Some(idx) = self.dedup.get(&info) {
            return *idx;
        }
        let idx = self.infos.push(info.clone());
        self.dedup.insert(info, idx);
        idx
    }

    pub fn get(&self, idx: DeoptInfoIdx) -> &DeoptInfo {
        &self.infos[idx]
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

impl Default for DeoptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the [DeoptInfo] for one deopt point.
pub struct DeoptInfoBuilder {
    instrs: Vec<DeoptInstr>,
    slot_ix: usize,
    /// The optimized frame's height in words. Frame-pointer-relative reads
    /// below the frame are bugs in the allocator's bookkeeping; we check
    /// them here because this is the last point with enough context to.
    compiled_frame_height: usize,
}

impl DeoptInfoBuilder {
    /// Build and intern the deopt info for the chain rooted at `innermost`.
    ///
    /// `innermost` of `None` means the optimizer proved the program point
    /// unreachable at deopt time; an empty blob is interned so the call
    /// site still gets a valid index. `mats` are the objects to rebuild
    /// before any frame slot can reference them; `compiled_frame_height` is
    /// the optimized frame's size in words.
    pub fn build(
        innermost: Option<&Environment>,
        mats: &[Materialization],
        compiled_frame_height: usize,
        funcs: &Functions,
        table: &mut DeoptTable,
    ) -> DeoptInfoIdx {
        let Some(inner) = innermost else {
            return table.register(DeoptInfo {
                instrs: Vec::new(),
                frame_start: 0,
                frame_height: 0,
            });
        };

        let mat_args = mats.iter().map(|m| m.fields().len()).sum::<usize>();
        let height = unopt_height(inner, mat_args);

        let mut b = DeoptInfoBuilder {
            instrs: Vec::new(),
            slot_ix: 0,
            compiled_frame_height,
        };

        // The materialization prefix fills no slots: the unwinder executes
        // it in full before laying out any frame, so no frame slot can see
        // a half-built object.
        for m in mats {
            b.instrs.push(DeoptInstr::MaterializeObject {
                class_id: m.class_id(),
                field_offsets: m.fields().iter().map(|(off, _)| *off).collect(),
            });
        }
        let frame_start = b.instrs.len();

        b.slot(DeoptInstr::ConstPoolPtr { func: inner.func() });
        b.slot(DeoptInstr::PcMarker { func: inner.func() });
        b.slot(DeoptInstr::CallerFp);
        b.slot(DeoptInstr::RetAddr {
            func: inner.func(),
            deopt_id: inner.deopt_id(),
        });

        // Materialization field sources sit on the innermost frame's
        // expression stack, so a GC scan during object rebuild finds them.
        for m in mats {
            for (_, v) in m.fields() {
                b.copy(v);
            }
        }

        b.frame_values(inner);

        let mut prev = inner;
        while let Some(outer) = prev.outer() {
            b.slot(DeoptInstr::ConstPoolPtr { func: outer.func() });
            // The pc-marker names the frame that was executing above this
            // one, i.e. the more inlined callee.
            b.slot(DeoptInstr::PcMarker { func: prev.func() });
            b.slot(DeoptInstr::CallerFp);
            // On deopt the call into the inlined frame has already
            // happened, so this frame resumes after it.
            b.slot(DeoptInstr::RetAddr {
                func: outer.func(),
                deopt_id: outer.deopt_id().to_deopt_after(),
            });

            // The callee's incoming parameters are this frame's outgoing
            // arguments. Inlining may have rewritten them, so they must be
            // read from the callee's own bindings.
            for i in (0..prev.fixed_param_count()).rev() {
                b.copy(prev.value_at(i));
            }

            b.frame_values(outer);
            prev = outer;
        }

        // The outermost frame's caller is native code: its linkage is
        // recovered from the optimized frame being torn down.
        b.slot(DeoptInstr::CallerPp);
        b.slot(DeoptInstr::PcMarker { func: prev.func() });
        b.slot(DeoptInstr::CallerFp);
        b.slot(DeoptInstr::CallerRetAddr);

        for i in (0..prev.fixed_param_count()).rev() {
            b.copy(prev.value_at(i));
        }

        assert_eq!(b.slot_ix, height);
        let info = DeoptInfo {
            instrs: b.instrs,
            frame_start,
            frame_height: height,
        };
        log::log(
            Verbosity::Codegen,
            &format!("deopt info:\n{}", info.display(funcs)),
        );
        table.register(info)
    }

    fn slot(&mut self, instr: DeoptInstr) {
        debug_assert!(!matches!(instr, DeoptInstr::MaterializeObject { .. }));
        self.instrs.push(instr);
        self.slot_ix += 1;
    }

    fn copy(&mut self, v: &BoundValue) {
        match v {
            BoundValue::Loc(loc) => {
                self.check_in_frame(loc);
                self.slot(DeoptInstr::Value { loc: loc.clone() });
            }
            BoundValue::Materialized(mat) => self.slot(DeoptInstr::MaterializedRef { mat: *mat }),
        }
    }

    /// Emit one frame's locals and expression stack, innermost value first.
    /// Incoming parameters are skipped: they are emitted as the caller's
    /// outgoing arguments (or, for the outermost frame, after the native
    /// linkage).
    fn frame_values(&mut self, e: &Environment) {
        for i in (e.fixed_param_count()..e.len()).rev() {
            self.copy(e.value_at(i));
        }
    }

    fn check_in_frame(&self, loc: &Location) {
        match loc {
            Location::Stack(s) if s.base == GpReg::RBP && s.off < 0 => {
                let limit = i32::try_from(self.compiled_frame_height * 8).unwrap();
                assert!(
                    s.off >= -limit,
                    "deopt read below the compiled frame: {loc}"
                );
            }
            Location::Pair(lo, hi) => {
                self.check_in_frame(lo);
                self.check_in_frame(hi);
            }
            _ => (),
        }
    }
}

/// The unoptimized stack height the chain rooted at `innermost` rebuilds
/// to, computed independently of emission order: per frame a header plus
/// every binding (each binding fills exactly one slot, either as a local or
/// as an argument/parameter), plus the native linkage and materialization
/// arguments.
fn unopt_height(innermost: &Environment, mat_args: usize) -> usize {
    let mut n = NATIVE_LINKAGE_SLOTS + mat_args;
    let mut e = Some(innermost);
    while let Some(cur) = e {
        n += FRAME_HEADER_SLOTS + cur.len();
        e = cur.outer();
    }
    n
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::env::Function;
    use moxloc::SlotWidth;

    fn reg(r: GpReg) -> BoundValue {
        BoundValue::Loc(Location::Reg(r))
    }

    fn funcs(names: &[&str]) -> Functions {
        names.iter().map(|n| Function::new(n)).collect()
    }

    /// One frame: two parameters and one local.
    fn single_env() -> Environment {
        Environment::new(
            FuncIdx::from(0usize),
            DeoptId::new(10),
            2,
            vec![reg(GpReg::RDI), reg(GpReg::RSI), reg(GpReg::RAX)],
            None,
        )
    }

    /// `outer` calls `inner` with one argument; inlining rewrote the
    /// argument's binding in the inner frame (rax) away from what the
    /// outer frame still holds for the same logical value (rcx).
    fn inlined_env() -> Environment {
        let outer = Environment::new(
            FuncIdx::from(0usize),
            DeoptId::new(6),
            1,
            vec![reg(GpReg::RCX), reg(GpReg::RDX)],
            None,
        );
        Environment::new(
            FuncIdx::from(1usize),
            DeoptId::new(20),
            1,
            vec![reg(GpReg::RAX), reg(GpReg::RBX)],
            Some(Box::new(outer)),
        )
    }

    fn count<F: Fn(&DeoptInstr) -> bool>(info: &DeoptInfo, f: F) -> usize {
        info.instrs().iter().filter(|i| f(i)).count()
    }

    #[test]
    fn empty_point() {
        let mut table = DeoptTable::new();
        let idx = DeoptInfoBuilder::build(None, &[], 0, &funcs(&[]), &mut table);
        let info = table.get(idx);
        assert!(info.is_empty());
        assert_eq!(info.frame_height(), 0);
    }

    #[test]
    fn single_frame_layout() {
        let mut table = DeoptTable::new();
        let fs = funcs(&["main"]);
        let env = single_env();
        let idx = DeoptInfoBuilder::build(Some(&env), &[], 8, &fs, &mut table);
        let info = table.get(idx);

        // One frame of 3 bindings: 4 header + 3 values + 4 native linkage.
        assert_eq!(info.frame_height(), 11);
        assert_eq!(info.instrs().len(), 11);
        assert_eq!(info.frame_start(), 0);

        let f0 = FuncIdx::from(0usize);
        assert_eq!(info.instrs()[0], DeoptInstr::ConstPoolPtr { func: f0 });
        assert_eq!(info.instrs()[1], DeoptInstr::PcMarker { func: f0 });
        assert_eq!(info.instrs()[2], DeoptInstr::CallerFp);
        assert_eq!(
            info.instrs()[3],
            DeoptInstr::RetAddr {
                func: f0,
                deopt_id: DeoptId::new(10)
            }
        );
        // The only local.
        assert_eq!(
            info.instrs()[4],
            DeoptInstr::Value {
                loc: Location::Reg(GpReg::RAX)
            }
        );
        // Incoming parameters in descending index order, after the native
        // linkage.
        assert_eq!(
            info.instrs()[9],
            DeoptInstr::Value {
                loc: Location::Reg(GpReg::RSI)
            }
        );
        assert_eq!(
            info.instrs()[10],
            DeoptInstr::Value {
                loc: Location::Reg(GpReg::RDI)
            }
        );
    }

    #[test]
    fn inlined_argument_provenance() {
        let mut table = DeoptTable::new();
        let fs = funcs(&["outer", "inner"]);
        let env = inlined_env();
        let idx = DeoptInfoBuilder::build(Some(&env), &[], 8, &fs, &mut table);
        let info = table.get(idx);

        // Two frames of 2 bindings each: 2 * (4 + 2) + 4.
        assert_eq!(info.frame_height(), 16);

        let f0 = FuncIdx::from(0usize);
        let f1 = FuncIdx::from(1usize);
        // Innermost frame header names the inner function with its own
        // deopt id.
        assert_eq!(
            info.instrs()[3],
            DeoptInstr::RetAddr {
                func: f1,
                deopt_id: DeoptId::new(20)
            }
        );
        // The outer frame resumes after the inlined call.
        assert_eq!(info.instrs()[6], DeoptInstr::PcMarker { func: f1 });
        assert_eq!(
            info.instrs()[8],
            DeoptInstr::RetAddr {
                func: f0,
                deopt_id: DeoptId::new(7)
            }
        );
        // The outgoing argument comes from the inner frame's binding (rax),
        // not the outer frame's stale one (rcx).
        assert_eq!(
            info.instrs()[9],
            DeoptInstr::Value {
                loc: Location::Reg(GpReg::RAX)
            }
        );
        // rcx appears exactly once: as the outermost incoming parameter at
        // the very end.
        assert_eq!(
            count(info, |i| *i
                == DeoptInstr::Value {
                    loc: Location::Reg(GpReg::RCX)
                }),
            1
        );
        assert_eq!(
            info.instrs()[15],
            DeoptInstr::Value {
                loc: Location::Reg(GpReg::RCX)
            }
        );
    }

    #[test]
    fn slot_monotonicity_deep_chain() {
        // Depth 3: each frame contributes one pc-marker, caller-fp and
        // return address, and the native linkage one more of each.
        let mut table = DeoptTable::new();
        let fs = funcs(&["a", "b", "c"]);
        let e0 = Environment::new(FuncIdx::from(0usize), DeoptId::new(2), 0, vec![], None);
        let e1 = Environment::new(
            FuncIdx::from(1usize),
            DeoptId::new(4),
            0,
            vec![reg(GpReg::RDX)],
            Some(Box::new(e0)),
        );
        let e2 = Environment::new(
            FuncIdx::from(2usize),
            DeoptId::new(8),
            0,
            vec![reg(GpReg::RAX), reg(GpReg::RBX)],
            Some(Box::new(e1)),
        );
        let idx = DeoptInfoBuilder::build(Some(&e2), &[], 8, &fs, &mut table);
        let info = table.get(idx);

        assert_eq!(info.frame_height(), 3 * 4 + 3 + 4);
        assert_eq!(info.instrs().len(), info.frame_height());
        assert_eq!(count(info, |i| matches!(i, DeoptInstr::PcMarker { .. })), 4);
        assert_eq!(count(info, |i| matches!(i, DeoptInstr::CallerFp)), 4);
        assert_eq!(
            count(info, |i| matches!(
                i,
                DeoptInstr::RetAddr { .. } | DeoptInstr::CallerRetAddr
            )),
            4
        );
    }

    #[test]
    fn materialization_prefix() {
        let mut table = DeoptTable::new();
        let fs = funcs(&["main"]);
        let mats = vec![Materialization::new(
            17,
            vec![(8, reg(GpReg::RDX)), (16, BoundValue::Materialized(MatIdx::from(0usize)))],
        )];
        let env = single_env();
        let idx = DeoptInfoBuilder::build(Some(&env), &mats, 8, &fs, &mut table);
        let info = table.get(idx);

        // The prefix fills no slots but shifts frame_start. The field
        // offsets must survive into the blob, in field order, or the
        // unwinder cannot place the values within the rebuilt object.
        assert_eq!(
            info.instrs()[0],
            DeoptInstr::MaterializeObject {
                class_id: 17,
                field_offsets: vec![8, 16]
            }
        );
        assert_eq!(info.frame_start(), 1);
        assert_eq!(info.frame_height(), 11 + 2);
        // Field sources sit directly after the innermost header.
        assert_eq!(
            info.instrs()[5],
            DeoptInstr::Value {
                loc: Location::Reg(GpReg::RDX)
            }
        );
        assert_eq!(
            info.instrs()[6],
            DeoptInstr::MaterializedRef {
                mat: MatIdx::from(0usize)
            }
        );
    }

    #[test]
    fn table_dedup() {
        let mut table = DeoptTable::new();
        let fs = funcs(&["outer", "inner"]);
        let e1 = inlined_env();
        let e2 = inlined_env();
        let i1 = DeoptInfoBuilder::build(Some(&e1), &[], 8, &fs, &mut table);
        let i2 = DeoptInfoBuilder::build(Some(&e2), &[], 8, &fs, &mut table);
        assert_eq!(i1, i2);
        assert_eq!(table.len(), 1);

        let i3 = DeoptInfoBuilder::build(Some(&single_env()), &[], 8, &fs, &mut table);
        assert_ne!(i1, i3);
        assert_eq!(table.len(), 2);
    }

    #[test]
    #[should_panic]
    fn read_below_compiled_frame() {
        let mut table = DeoptTable::new();
        let fs = funcs(&["main"]);
        let env = Environment::new(
            FuncIdx::from(0usize),
            DeoptId::new(0),
            0,
            vec![BoundValue::Loc(Location::stack(
                GpReg::RBP,
                -64,
                SlotWidth::Word,
            ))],
            None,
        );
        DeoptInfoBuilder::build(Some(&env), &[], 2, &fs, &mut table);
    }
}
