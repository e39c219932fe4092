//! Deoptimization: abandoning specialized code and resuming the equivalent generic code.
//!
//! A frame goes from running a candidate's body to running its call target's generic bytecode.
//! Deopt-one does this for the top frame after a guard fails; deopt-all does it for every caller
//! frame on a thread whose return address has a deopt point. Neither touches a frame until every
//! frame it will change has been validated, so an error never leaves a frame half rewound.

use crate::{
    callsite::TypeId,
    candidate::CandidateBody,
    errors::SpeshError,
    frame::{Frame, ThreadContext},
    value::{Object, Value},
};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum DeoptKind {
    /// A guard: deoptimizes the frame that fails it.
    #[strum(to_string = "one")]
    One,
    /// An invocation: if code is invalidated while the callee runs, the caller deoptimizes when
    /// control returns to it.
    #[strum(to_string = "all")]
    All,
}

/// A point in specialized code from which execution can continue in generic code.
#[derive(Clone, Debug, PartialEq)]
pub struct DeoptPoint {
    /// The specialized offset immediately after the deoptimizing instruction.
    pub specialized: u32,
    /// The generic offset to resume at.
    pub generic: u32,
    pub kind: DeoptKind,
    /// Indexes into the body's materializations to perform before resuming.
    pub materializations: SmallVec<[usize; 1]>,
}

impl DeoptPoint {
    pub fn new(specialized: u32, generic: u32, kind: DeoptKind) -> Self {
        Self {
            specialized,
            generic,
            kind,
            materializations: SmallVec::new(),
        }
    }
}

/// How to recreate an object whose allocation was scalar replaced.
#[derive(Clone, Debug, PartialEq)]
pub struct Materialization {
    pub ty: TypeId,
    /// The register holding each field's value, in layout order.
    pub fields: Vec<u16>,
    /// The registers the recreated object must be stored into.
    pub targets: Vec<u16>,
}

impl Materialization {
    fn materialize(&self, registers: &mut [Value]) -> Result<(), SpeshError> {
        let fields = self
            .fields
            .iter()
            .map(|r| register(registers, *r).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let obj = Object::instance(self.ty, fields);
        for t in &self.targets {
            let slot = registers
                .get_mut(usize::from(*t))
                .ok_or_else(|| SpeshError::Internal(format!("no register r{t} to materialize into")))?;
            *slot = Value::Obj(Arc::clone(&obj));
        }
        Ok(())
    }

    fn check(&self, registers: &[Value]) -> Result<(), SpeshError> {
        for r in self.fields.iter().chain(self.targets.iter()) {
            register(registers, *r)?;
        }
        Ok(())
    }
}

fn register(registers: &[Value], r: u16) -> Result<&Value, SpeshError> {
    registers
        .get(usize::from(r))
        .ok_or_else(|| SpeshError::Internal(format!("no register r{r} in frame")))
}

/// A validated rewind of one frame.
struct Rewind {
    frame: usize,
    generic: u32,
    materializations: Vec<Materialization>,
}

/// Find the deopt point at which `frame` can leave specialized code, checking that the frame can
/// be rewound there.
fn plan_rewind(
    frame_idx: usize,
    frame: &Frame,
    body: &CandidateBody,
    point: &DeoptPoint,
) -> Result<Rewind, SpeshError> {
    if let Some(i) = body.inlines_at(frame.pc).first() {
        return Err(SpeshError::NotYetSupported(format!(
            "deoptimizing inside inlined code from '{}' at offset {} of call target {}",
            body.inlines[*i].name, frame.pc, frame.call_target.id()
        )));
    }
    let mut materializations = Vec::with_capacity(point.materializations.len());
    for m in &point.materializations {
        let m = body.materializations.get(*m).ok_or_else(|| {
            SpeshError::Internal(format!("deopt point refers to missing materialization {m}"))
        })?;
        m.check(&frame.registers)?;
        materializations.push(m.clone());
    }
    Ok(Rewind {
        frame: frame_idx,
        generic: point.generic,
        materializations,
    })
}

fn apply_rewind(frame: &mut Frame, rw: Rewind) -> Result<(), SpeshError> {
    for m in &rw.materializations {
        m.materialize(&mut frame.registers)?;
    }
    let bc = frame.call_target.bytecode();
    frame.registers.truncate(bc.local_kinds.len());
    frame.env.truncate_to(Arc::clone(&bc.lexical_names));
    frame.pc = rw.generic;
    frame.body = None;
    frame.candidate = None;
    Ok(())
}

/// The top frame of `thread` failed a guard: continue it in generic code. The frame's `pc` must be
/// the offset immediately after the failing instruction.
pub fn deopt_one(thread: &mut ThreadContext) -> Result<(), SpeshError> {
    let idx = thread.depth().checked_sub(1).ok_or(SpeshError::NotSpecialized)?;
    let frame = &thread.frames()[idx];
    let body = frame.body.as_ref().ok_or(SpeshError::NotSpecialized)?;
    // A guard's point if there is one; otherwise the frame is at a return address.
    let point = body
        .deopt_point(frame.pc, DeoptKind::One)
        .or_else(|| body.deopts_at(frame.pc).first())
        .ok_or_else(|| SpeshError::DeoptPointNotFound {
            call_target: frame.call_target.id(),
            offset: frame.pc,
        })?;
    let rw = plan_rewind(idx, frame, body, point)?;
    apply_rewind(&mut thread.frames_mut()[idx], rw)
}

/// Code has been invalidated: every caller frame on `thread` running specialized code whose return
/// address has a deopt point continues in generic code when control returns to it. Frames without
/// such a point are left alone. Returns the number of frames rewound.
pub fn deopt_all(thread: &mut ThreadContext) -> Result<usize, SpeshError> {
    let Some(callers) = thread.depth().checked_sub(1) else {
        return Ok(0);
    };
    let mut rewinds = Vec::new();
    for (idx, frame) in thread.frames()[..callers].iter().enumerate() {
        let Some(body) = &frame.body else { continue };
        if let Some(point) = body.deopt_point(frame.pc, DeoptKind::All) {
            rewinds.push(plan_rewind(idx, frame, body, point)?);
        }
    }
    let n = rewinds.len();
    for rw in rewinds {
        let idx = rw.frame;
        apply_rewind(&mut thread.frames_mut()[idx], rw)?;
    }
    Ok(n)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::{text::assemble, RegKind},
        callsite::CallsiteShape,
        candidate::{CallTarget, CallTargetId, Candidate, InlineRecord, PlanKind},
    };
    use std::sync::Weak;

    fn target() -> Arc<CallTarget> {
        let bc = assemble(
            "
            .locals obj obj
            .lex $x
              param_rp_o r0, 0
              decont r1, r0
              return_o r1
            ",
        )
        .unwrap();
        Arc::new(CallTarget::new(CallTargetId(3), "t", bc, 4).unwrap())
    }

    fn frame(t: &Arc<CallTarget>, body: CandidateBody) -> Frame {
        let c = Arc::new(Candidate::new(
            Arc::new(CallsiteShape::positional(vec![])),
            None,
            PlanKind::Certain,
            body,
            8,
        ));
        Frame::specialized(Arc::clone(t), c, None)
    }

    fn body(deopts: Vec<DeoptPoint>) -> CandidateBody {
        CandidateBody {
            code: vec![0; 64].into_boxed_slice(),
            handlers: Vec::new(),
            deopts,
            spesh_slots: Vec::new(),
            inlines: Vec::new(),
            materializations: Vec::new(),
            local_kinds: vec![RegKind::Obj, RegKind::Obj, RegKind::Int, RegKind::Obj],
            lexical_names: Arc::from(vec![Arc::from("$x"), Arc::from("$inl")]),
            strings: Vec::new(),
            callsites: Vec::new(),
        }
    }

    #[test]
    fn one_rewinds_to_generic() {
        let t = target();
        let mut thread = ThreadContext::new();
        let mut f = frame(&t, body(vec![DeoptPoint::new(20, 6, DeoptKind::One)]));
        f.pc = 20;
        thread.push(f);
        deopt_one(&mut thread).unwrap();
        let f = thread.current_frame().unwrap();
        assert!(!f.is_specialized());
        assert!(f.candidate.is_none());
        assert_eq!(f.pc, 6);
        assert_eq!(f.effective_code(), &*t.bytecode().code);
        assert_eq!(f.registers.len(), 2);
        assert_eq!(f.env.len(), 1);
        assert!(matches!(deopt_one(&mut thread), Err(SpeshError::NotSpecialized)));
    }

    #[test]
    fn one_at_a_return_address() {
        let t = target();
        let mut thread = ThreadContext::new();
        thread.push(Frame::generic(Arc::clone(&t), None));
        let mut f = frame(&t, body(vec![DeoptPoint::new(20, 10, DeoptKind::All)]));
        f.pc = 20;
        thread.push(f);
        deopt_one(&mut thread).unwrap();
        let f = thread.current_frame().unwrap();
        assert!(!f.is_specialized());
        assert_eq!(f.pc, 10);
        assert_eq!(f.registers.len(), 2);
        assert!(!thread.frames()[0].is_specialized());

        // Where a guard and an invocation share an offset, the guard's point wins.
        let mut thread = ThreadContext::new();
        let mut f = frame(
            &t,
            body(vec![
                DeoptPoint::new(20, 10, DeoptKind::All),
                DeoptPoint::new(20, 6, DeoptKind::One),
            ]),
        );
        f.pc = 20;
        thread.push(f);
        deopt_one(&mut thread).unwrap();
        assert_eq!(thread.current_frame().unwrap().pc, 6);
    }

    #[test]
    fn one_without_point() {
        let t = target();
        let mut thread = ThreadContext::new();
        let mut f = frame(&t, body(vec![DeoptPoint::new(20, 6, DeoptKind::One)]));
        f.pc = 22;
        thread.push(f);
        assert!(matches!(
            deopt_one(&mut thread),
            Err(SpeshError::DeoptPointNotFound { offset: 22, .. })
        ));
        assert!(thread.current_frame().unwrap().is_specialized());
    }

    #[test]
    fn one_inside_inline() {
        let t = target();
        let mut b = body(vec![DeoptPoint::new(20, 6, DeoptKind::One)]);
        b.inlines.push(InlineRecord {
            call_target: Weak::new(),
            name: Arc::from("inlinee"),
            lexical_names: Arc::from(vec![Arc::from("$inl")]),
            locals_start: 2,
            lexicals_start: 1,
            start: 12,
            end: 30,
        });
        let mut thread = ThreadContext::new();
        let mut f = frame(&t, b);
        f.pc = 20;
        thread.push(f);
        assert!(matches!(
            deopt_one(&mut thread),
            Err(SpeshError::NotYetSupported(_))
        ));
        assert!(thread.current_frame().unwrap().is_specialized());
    }

    #[test]
    fn one_materializes() {
        let t = target();
        let mut b = body(vec![DeoptPoint {
            specialized: 20,
            generic: 6,
            kind: DeoptKind::One,
            materializations: SmallVec::from_slice(&[0]),
        }]);
        b.materializations.push(Materialization {
            ty: TypeId(5),
            fields: vec![2],
            targets: vec![0],
        });
        let mut thread = ThreadContext::new();
        let mut f = frame(&t, b);
        f.pc = 20;
        f.registers[2] = Value::Int(42);
        thread.push(f);
        deopt_one(&mut thread).unwrap();
        let f = thread.current_frame().unwrap();
        match &f.registers[0] {
            Value::Obj(o) => {
                assert_eq!(o.ty, TypeId(5));
                assert_eq!(*o.fields.lock(), vec![Value::Int(42)]);
            }
            x => panic!("{x}"),
        }
    }

    #[test]
    fn all_rewinds_callers_only() {
        let t = target();
        let mut thread = ThreadContext::new();
        // A caller at a return address with a deopt point.
        let mut f = frame(&t, body(vec![DeoptPoint::new(20, 6, DeoptKind::All)]));
        f.pc = 20;
        thread.push(f);
        // A caller past its last deopt point.
        let mut f = frame(&t, body(vec![DeoptPoint::new(20, 6, DeoptKind::All)]));
        f.pc = 24;
        thread.push(f);
        // A generic caller.
        thread.push(Frame::generic(Arc::clone(&t), None));
        // The top frame is never rewound by deopt-all.
        let mut f = frame(&t, body(vec![DeoptPoint::new(20, 6, DeoptKind::All)]));
        f.pc = 20;
        thread.push(f);
        assert_eq!(deopt_all(&mut thread).unwrap(), 1);
        let frames = thread.frames();
        assert!(!frames[0].is_specialized());
        assert_eq!(frames[0].pc, 6);
        assert!(frames[1].is_specialized());
        assert!(frames[3].is_specialized());
        assert_eq!(deopt_all(&mut thread).unwrap(), 0);
    }

    #[test]
    fn all_is_validated_first() {
        let t = target();
        let mut thread = ThreadContext::new();
        let mut f = frame(&t, body(vec![DeoptPoint::new(20, 6, DeoptKind::All)]));
        f.pc = 20;
        thread.push(f);
        let mut b = body(vec![DeoptPoint::new(20, 6, DeoptKind::All)]);
        b.inlines.push(InlineRecord {
            call_target: Weak::new(),
            name: Arc::from("inlinee"),
            lexical_names: Arc::from(Vec::new()),
            locals_start: 2,
            lexicals_start: 1,
            start: 10,
            end: 20,
        });
        let mut f = frame(&t, b);
        f.pc = 20;
        thread.push(f);
        thread.push(Frame::generic(Arc::clone(&t), None));
        assert!(matches!(
            deopt_all(&mut thread),
            Err(SpeshError::NotYetSupported(_))
        ));
        assert!(thread.frames()[0].is_specialized());
    }
}
