//! Environments: per-program-point snapshots of one logical call frame.
//!
//! The optimizer records an [Environment] at every instruction that can
//! trigger deoptimization. Inlining chains them: the innermost frame links
//! outward to its (less inlined) callers via `outer`. This crate only reads
//! them; they are created and owned by the thread compiling one function.

use index_vec::{define_index_type, IndexVec};
use moxloc::Location;

define_index_type! {
    /// An index identifying a function within one compilation session.
    pub struct FuncIdx = u32;
}

define_index_type! {
    /// An index into the materialization list of one deopt point.
    pub struct MatIdx = u32;
}

/// A deopt identifier. Identifiers are allocated in before/after pairs: the
/// "before" id is even and tags the state on entry to an instruction, the
/// odd "after" id tags the state once the instruction has taken effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeoptId(u32);

impl DeoptId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The id tagging the state after the instruction this id names. Used
    /// for the return address of a frame that called into an inlined frame:
    /// on deopt the call has already happened.
    pub fn to_deopt_after(self) -> DeoptId {
        debug_assert_eq!(self.0 % 2, 0);
        DeoptId(self.0 + 1)
    }
}

impl std::fmt::Display for DeoptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compilation-session metadata for one function.
pub struct Function {
    name: String,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// All functions known to one compilation session.
pub type Functions = IndexVec<FuncIdx, Function>;

/// Where a live value can be recovered from at deopt time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BoundValue {
    /// The value is in a [Location] assigned by the register allocator.
    Loc(Location),
    /// The value was unboxed/decomposed during optimized execution and must
    /// be rebuilt as a heap object before the unoptimized frame can refer
    /// to it.
    Materialized(MatIdx),
}

/// A heap object to rebuild at deopt time from its decomposed fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Materialization {
    class_id: u32,
    /// `(byte offset within the object, source)` per field.
    fields: Vec<(u32, BoundValue)>,
}

impl Materialization {
    pub fn new(class_id: u32, fields: Vec<(u32, BoundValue)>) -> Self {
        Self { class_id, fields }
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn fields(&self) -> &[(u32, BoundValue)] {
        &self.fields
    }
}

/// One logical (possibly inlined) call frame at one program point.
///
/// The first `fixed_param_count` bindings are the frame's incoming
/// parameters; the rest are its locals and expression stack, innermost
/// last. Outgoing arguments of an inlined call are *not* bound here: they
/// are the inlined frame's incoming parameters, read from the inlined
/// frame's own bindings.
pub struct Environment {
    func: FuncIdx,
    deopt_id: DeoptId,
    fixed_param_count: usize,
    values: Vec<BoundValue>,
    outer: Option<Box<Environment>>,
}

impl Environment {
    pub fn new(
        func: FuncIdx,
        deopt_id: DeoptId,
        fixed_param_count: usize,
        values: Vec<BoundValue>,
        outer: Option<Box<Environment>>,
    ) -> Self {
        assert!(fixed_param_count <= values.len());
        Self {
            func,
            deopt_id,
            fixed_param_count,
            values,
            outer,
        }
    }

    pub fn func(&self) -> FuncIdx {
        self.func
    }

    pub fn deopt_id(&self) -> DeoptId {
        self.deopt_id
    }

    pub fn fixed_param_count(&self) -> usize {
        self.fixed_param_count
    }

    /// The number of live bindings in this frame, parameters included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_at(&self, i: usize) -> &BoundValue {
        &self.values[i]
    }

    pub fn outer(&self) -> Option<&Environment> {
        self.outer.as_deref()
    }

    /// The depth of the chain starting at `self` (1 if not inlined).
    pub fn depth(&self) -> usize {
        let mut d = 1;
        let mut e = self;
        while let Some(outer) = e.outer() {
            d += 1;
            e = outer;
        }
        d
    }
}
