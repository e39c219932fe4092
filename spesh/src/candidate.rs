//! Call targets, their candidates, and inline caches.
//!
//! Interpreter threads read a call target's candidate list and inline caches without taking a
//! lock: both are [AppendOnly] lists, whose elements are fully populated before they are
//! published. A candidate's optimized body is published with a single [OnceLock] write, so a
//! reader sees either the logging body or the finished optimized body.

use crate::{
    append_only::AppendOnly,
    bytecode::{Bytecode, Handler, Opcode, RegKind},
    callsite::{tuple_to_string, CallsiteShape, ObservedType, TypeId, TypeTuple},
    deopt::{DeoptKind, DeoptPoint, Materialization},
    errors::SpeshError,
    stats::{CallTargetStats, LogEntry},
    value::Value,
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock, Weak,
    },
};

/// How many dispatch programs one inline cache holds before the site is considered megamorphic.
pub const INLINE_CACHE_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CallTargetId(pub u32);

impl fmt::Display for CallTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a candidate was planned from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum PlanKind {
    /// Specialized on the callsite shape alone.
    #[strum(to_string = "certain")]
    Certain,
    /// Specialized on one exact observed type tuple.
    #[strum(to_string = "observed")]
    Observed,
    /// Specialized on types common to several observed type tuples.
    #[strum(to_string = "derived")]
    Derived,
}

/// A check that a dispatch program makes on one argument.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchCheck {
    /// The argument is an instance of the type.
    Type(TypeId),
    /// The argument is an instance of some type.
    Concrete,
    /// The argument is the type object of the type.
    TypeObject(TypeId),
    /// The argument is this integer.
    LiteralInt(i64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgramGuard {
    /// The index of the argument at the dispatch's callsite.
    pub arg: u16,
    pub check: DispatchCheck,
}

impl ProgramGuard {
    pub fn matches(&self, args: &[Value]) -> bool {
        let Some(v) = args.get(usize::from(self.arg)) else {
            return false;
        };
        match (&self.check, v) {
            (DispatchCheck::Type(ty), Value::Obj(o)) => o.concrete && o.ty == *ty,
            (DispatchCheck::Concrete, Value::Obj(o)) => o.concrete,
            (DispatchCheck::Concrete, Value::Int(_) | Value::Num(_) | Value::Str(_)) => true,
            (DispatchCheck::TypeObject(ty), Value::Obj(o)) => !o.concrete && o.ty == *ty,
            (DispatchCheck::LiteralInt(x), Value::Int(y)) => x == y,
            _ => false,
        }
    }
}

/// What a dispatch program produces once its guards pass.
#[derive(Clone, Debug)]
pub enum DispatchResult {
    /// A constant value.
    Constant(Value),
    /// The argument at this index.
    CaptureArg(u16),
    /// The result of invoking this call target with the dispatch's arguments.
    Invoke(Weak<CallTarget>),
}

/// One resolution of a dynamic dispatch, as cached in an inline cache.
#[derive(Clone, Debug)]
pub struct DispatchProgram {
    pub guards: Vec<ProgramGuard>,
    pub result: DispatchResult,
}

impl DispatchProgram {
    pub fn matches(&self, args: &[Value]) -> bool {
        self.guards.iter().all(|g| g.matches(args))
    }
}

/// A dispatch site's inline cache.
pub(crate) struct InlineCache {
    /// The generic offset of the `dispatch_o` instruction.
    pub(crate) offset: u32,
    pub(crate) programs: AppendOnly<Arc<DispatchProgram>>,
}

/// Something a candidate's bytecode refers to by spesh slot index.
#[derive(Clone, Debug)]
pub enum SpeshSlot {
    /// A constant, loaded by `sp_getspeshslot`.
    Value(Value),
    /// The target of `sp_fastinvoke_o`.
    CallTarget(Weak<CallTarget>),
    /// The inline cache that `sp_dispatch_o` consults, identified by the call target owning it
    /// and the generic offset of its dispatch.
    InlineCache(Weak<CallTarget>, u32),
}

impl SpeshSlot {
    /// Do `self` and `other` refer to the same thing?
    pub fn same_as(&self, other: &SpeshSlot) -> bool {
        match (self, other) {
            (SpeshSlot::Value(x), SpeshSlot::Value(y)) => x == y,
            (SpeshSlot::CallTarget(x), SpeshSlot::CallTarget(y)) => x.ptr_eq(y),
            (SpeshSlot::InlineCache(x, xo), SpeshSlot::InlineCache(y, yo)) => {
                x.ptr_eq(y) && xo == yo
            }
            _ => false,
        }
    }
}

/// A call target whose code was inlined into a candidate.
#[derive(Clone, Debug)]
pub struct InlineRecord {
    pub call_target: Weak<CallTarget>,
    pub name: Arc<str>,
    /// The inlinee's lexical names, which occupy the caller's lexicals from `lexicals_start`.
    pub lexical_names: Arc<[Arc<str>]>,
    /// The first of the caller's registers that the inlinee's registers were mapped to.
    pub locals_start: u16,
    pub lexicals_start: u16,
    /// The specialized offsets at which the inlined code starts and ends.
    pub start: u32,
    pub end: u32,
}

impl InlineRecord {
    /// Is the return address or deopt offset `pc` inside this inline?
    pub fn contains(&self, pc: u32) -> bool {
        self.start < pc && pc <= self.end
    }
}

/// Specialized bytecode with everything needed to run and deoptimize it.
#[derive(Debug)]
pub struct CandidateBody {
    pub code: Box<[u8]>,
    pub handlers: Vec<Handler>,
    /// Sorted by specialized offset.
    pub deopts: Vec<DeoptPoint>,
    pub spesh_slots: Vec<SpeshSlot>,
    pub inlines: Vec<InlineRecord>,
    pub materializations: Vec<Materialization>,
    pub local_kinds: Vec<RegKind>,
    /// The caller's lexicals followed by those of every inlinee.
    pub lexical_names: Arc<[Arc<str>]>,
    pub strings: Vec<Arc<str>>,
    pub callsites: Vec<Arc<CallsiteShape>>,
}

impl CandidateBody {
    /// The deopt points at specialized offset `offset`.
    pub fn deopts_at(&self, offset: u32) -> &[DeoptPoint] {
        let start = self.deopts.partition_point(|x| x.specialized < offset);
        let end = self.deopts.partition_point(|x| x.specialized <= offset);
        &self.deopts[start..end]
    }

    /// The first deopt point of kind `kind` at specialized offset `offset`.
    pub fn deopt_point(&self, offset: u32, kind: DeoptKind) -> Option<&DeoptPoint> {
        self.deopts_at(offset).iter().find(|x| x.kind == kind)
    }

    /// The inlines containing `pc`, innermost first.
    pub fn inlines_at(&self, pc: u32) -> Vec<usize> {
        let mut v = self
            .inlines
            .iter()
            .enumerate()
            .filter(|(_, x)| x.contains(pc))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        v.sort_by_key(|i| self.inlines[*i].end - self.inlines[*i].start);
        v
    }

    /// How many instructions with opcode `op` does this body contain?
    pub fn count_op(&self, op: Opcode) -> usize {
        crate::bytecode::decode(&self.code)
            .map(|insts| insts.iter().filter(|x| x.op == op).count())
            .unwrap_or(0)
    }
}

/// One specialization of a call target.
pub struct Candidate {
    pub(crate) shape: Arc<CallsiteShape>,
    pub(crate) types: Option<TypeTuple>,
    pub(crate) kind: PlanKind,
    /// The body that runs while statistics are gathered.
    pub(crate) logging: Arc<CandidateBody>,
    /// The body that replaces `logging` once promoted.
    pub(crate) optimized: OnceLock<Arc<CandidateBody>>,
    runs_left: AtomicU32,
    promotion_queued: AtomicBool,
}

impl Candidate {
    pub(crate) fn new(
        shape: Arc<CallsiteShape>,
        types: Option<TypeTuple>,
        kind: PlanKind,
        logging: CandidateBody,
        log_runs: u32,
    ) -> Self {
        Self {
            shape,
            types,
            kind,
            logging: Arc::new(logging),
            optimized: OnceLock::new(),
            runs_left: AtomicU32::new(log_runs),
            promotion_queued: AtomicBool::new(false),
        }
    }

    pub fn shape(&self) -> &Arc<CallsiteShape> {
        &self.shape
    }

    pub fn types(&self) -> Option<&TypeTuple> {
        self.types.as_ref()
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    /// The body new frames should run: the optimized body if there is one.
    pub fn body(&self) -> Arc<CandidateBody> {
        Arc::clone(self.optimized.get().unwrap_or(&self.logging))
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized.get().is_some()
    }

    /// Record that the logging body has completed one run. Returns true exactly once: when the
    /// run budget is first exhausted, at which point the caller must queue a promotion.
    pub(crate) fn log_run(&self) -> bool {
        if self.is_optimized() {
            return false;
        }
        let prev = self
            .runs_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| x.checked_sub(1))
            .unwrap_or(0);
        prev <= 1 && !self.promotion_queued.swap(true, Ordering::AcqRel)
    }

    /// Does this candidate apply to a call with callsite `shape` and argument types `arg_types`?
    pub fn accepts(&self, shape: &CallsiteShape, arg_types: &[Option<ObservedType>]) -> bool {
        if *self.shape != *shape {
            return false;
        }
        match &self.types {
            None => true,
            Some(types) => types.iter().enumerate().all(|(i, t)| match t {
                None => true,
                Some(t) => arg_types.get(i).copied().flatten() == Some(*t),
            }),
        }
    }

    fn same_guards(&self, shape: &CallsiteShape, types: Option<&TypeTuple>) -> bool {
        *self.shape == *shape && self.types.as_ref() == types
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Candidate({} {}", self.kind, self.shape)?;
        if let Some(types) = &self.types {
            write!(f, " {}", tuple_to_string(types))?;
        }
        write!(f, ")")
    }
}

/// A unit of compilable code: generic bytecode, its candidates, its inline caches, and the
/// statistics gathered about it.
pub struct CallTarget {
    pub(crate) id: CallTargetId,
    pub(crate) name: Arc<str>,
    pub(crate) bytecode: Bytecode,
    candidates: AppendOnly<Arc<Candidate>>,
    /// The (shape, types) of every installed candidate, for duplicate checks at install time.
    guard_keys: Mutex<HashSet<(Arc<CallsiteShape>, Option<TypeTuple>)>>,
    /// One per `dispatch_o`, sorted by offset.
    inline_caches: Vec<InlineCache>,
    stats: Mutex<CallTargetStats>,
}

impl CallTarget {
    pub(crate) fn new(
        id: CallTargetId,
        name: &str,
        bytecode: Bytecode,
        max_candidates: usize,
    ) -> Result<Self, SpeshError> {
        let inline_caches = bytecode
            .decode()?
            .into_iter()
            .filter(|x| x.op == Opcode::DispatchO)
            .map(|x| InlineCache {
                offset: x.offset,
                programs: AppendOnly::with_capacity(INLINE_CACHE_SIZE),
            })
            .collect();
        Ok(Self {
            id,
            name: Arc::from(name),
            bytecode,
            candidates: AppendOnly::with_capacity(max_candidates),
            guard_keys: Mutex::new(HashSet::new()),
            inline_caches,
            stats: Mutex::new(CallTargetStats::default()),
        })
    }

    pub fn id(&self) -> CallTargetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The generic bytecode.
    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Arc<Candidate>> {
        self.candidates.iter()
    }

    /// The candidate a call with callsite `shape` and argument types `arg_types` should run, if
    /// any. Candidates specialized on types are preferred over those specialized on shape alone.
    pub fn find_candidate(
        &self,
        shape: &CallsiteShape,
        arg_types: &[Option<ObservedType>],
    ) -> Option<Arc<Candidate>> {
        let mut certain = None;
        for c in self.candidates.iter() {
            if c.accepts(shape, arg_types) {
                if c.types.is_some() {
                    return Some(Arc::clone(c));
                }
                certain.get_or_insert(c);
            }
        }
        certain.map(Arc::clone)
    }

    /// Is there an installed candidate with exactly these guards?
    pub fn has_candidate(&self, shape: &CallsiteShape, types: Option<&TypeTuple>) -> bool {
        self.candidates.iter().any(|c| c.same_guards(shape, types))
    }

    /// Publish `cand`. The caller must hold the context's install lock, which serialises this
    /// with other installs so that racing builds of the same plan converge on one winner.
    pub(crate) fn install(&self, cand: Candidate) -> Result<Arc<Candidate>, SpeshError> {
        let mut keys = self.guard_keys.lock();
        let key = (Arc::clone(&cand.shape), cand.types.clone());
        if keys.contains(&key) {
            return Err(SpeshError::DuplicateCandidate {
                call_target: self.id,
                shape: key.0,
            });
        }
        let cand = Arc::new(cand);
        self.candidates
            .push(Arc::clone(&cand))
            .map_err(|_| SpeshError::TooManyCandidates {
                call_target: self.id,
                limit: self.candidates.capacity(),
            })?;
        keys.insert(key);
        Ok(cand)
    }

    fn inline_cache(&self, offset: u32) -> Option<&InlineCache> {
        self.inline_caches
            .binary_search_by_key(&offset, |x| x.offset)
            .ok()
            .map(|i| &self.inline_caches[i])
    }

    /// Add `program` to the inline cache of the dispatch at generic offset `offset`, returning
    /// its outcome index, or `None` if there is no such dispatch or its cache is full.
    pub fn record_dispatch(&self, offset: u32, program: DispatchProgram) -> Option<usize> {
        self.inline_cache(offset)?.programs.push(Arc::new(program)).ok()
    }

    /// The first cached dispatch program at `offset` matching `args`, and its outcome index.
    pub fn resolve_dispatch(
        &self,
        offset: u32,
        args: &[Value],
    ) -> Option<(usize, Arc<DispatchProgram>)> {
        self.inline_cache(offset)?
            .programs
            .iter()
            .enumerate()
            .find(|(_, p)| p.matches(args))
            .map(|(i, p)| (i, Arc::clone(p)))
    }

    /// The dispatch program recorded as outcome `outcome` at `offset`.
    pub fn dispatch_program(&self, offset: u32, outcome: usize) -> Option<Arc<DispatchProgram>> {
        self.inline_cache(offset)?
            .programs
            .get(outcome)
            .map(Arc::clone)
    }

    /// Record a statistics log entry.
    pub fn record(&self, entry: LogEntry) {
        self.stats.lock().record(entry);
    }

    /// A copy of the statistics gathered so far.
    pub fn stats(&self) -> CallTargetStats {
        self.stats.lock().clone()
    }

    pub(crate) fn with_stats<T>(&self, f: impl FnOnce(&CallTargetStats) -> T) -> T {
        f(&self.stats.lock())
    }
}

impl fmt::Debug for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallTarget({} '{}')", self.id, self.name)
    }
}
