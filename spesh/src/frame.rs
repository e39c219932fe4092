//! Frames, lexical environments, and the per-thread call stack, as far as the specializer needs to
//! see and mutate them.

use crate::{
    bytecode::{Handler, RegKind},
    candidate::{CallTarget, Candidate, CandidateBody},
    value::Value,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A frame's lexical environment. Environments may outlive their frame (e.g. when captured by a
/// closure), so they are reference counted and internally locked.
#[derive(Debug)]
pub struct LexicalEnv {
    inner: Mutex<EnvInner>,
    outer: Option<Arc<LexicalEnv>>,
}

#[derive(Debug)]
struct EnvInner {
    names: Arc<[Arc<str>]>,
    values: Vec<Value>,
}

impl LexicalEnv {
    /// A new environment with one null value per name in `names`.
    pub fn new(names: Arc<[Arc<str>]>, outer: Option<Arc<LexicalEnv>>) -> Arc<Self> {
        let values = vec![Value::Null; names.len()];
        Arc::new(Self {
            inner: Mutex::new(EnvInner { names, values }),
            outer,
        })
    }

    pub fn outer(&self) -> Option<&Arc<LexicalEnv>> {
        self.outer.as_ref()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<Value> {
        self.inner.lock().values.get(idx).cloned()
    }

    /// Set lexical `idx` to `v`, returning false if there is no such lexical.
    pub fn set(&self, idx: usize, v: Value) -> bool {
        match self.inner.lock().values.get_mut(idx) {
            Some(x) => {
                *x = v;
                true
            }
            None => false,
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.inner.lock().names.iter().position(|x| &**x == name)
    }

    /// Look `name` up in this environment only.
    pub fn lookup_local(&self, name: &str) -> Option<Value> {
        let inner = self.inner.lock();
        let idx = inner.names.iter().position(|x| &**x == name)?;
        inner.values.get(idx).cloned()
    }

    /// Look `name` up in this environment, then in each outer environment in turn.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Some(v) = e.lookup_local(name) {
                return Some(v);
            }
            env = e.outer.as_deref();
        }
        None
    }

    /// Cut this environment back to exactly `names`, which must be a prefix of its current names.
    pub(crate) fn truncate_to(&self, names: Arc<[Arc<str>]>) {
        let mut inner = self.inner.lock();
        inner.values.truncate(names.len());
        inner.values.resize(names.len(), Value::Null);
        inner.names = names;
    }
}

/// One activation of a call target.
#[derive(Debug)]
pub struct Frame {
    pub call_target: Arc<CallTarget>,
    /// The candidate this frame is running, if it is running specialized code.
    pub candidate: Option<Arc<Candidate>>,
    /// The specialized body this frame is running. A frame keeps running the body it started with
    /// even if its candidate is promoted meanwhile.
    pub body: Option<Arc<CandidateBody>>,
    /// For the frame at the top of a stack, the current offset; for any other frame, the return
    /// address (the offset after the invoking instruction).
    pub pc: u32,
    pub registers: Vec<Value>,
    pub env: Arc<LexicalEnv>,
}

impl Frame {
    /// A frame running `call_target`'s generic bytecode.
    pub fn generic(call_target: Arc<CallTarget>, outer: Option<Arc<LexicalEnv>>) -> Self {
        let bc = call_target.bytecode();
        let registers = initial_registers(&bc.local_kinds);
        let env = LexicalEnv::new(Arc::clone(&bc.lexical_names), outer);
        Self {
            call_target,
            candidate: None,
            body: None,
            pc: 0,
            registers,
            env,
        }
    }

    /// A frame running `candidate`'s current body.
    pub fn specialized(
        call_target: Arc<CallTarget>,
        candidate: Arc<Candidate>,
        outer: Option<Arc<LexicalEnv>>,
    ) -> Self {
        let body = candidate.body();
        let registers = initial_registers(&body.local_kinds);
        let env = LexicalEnv::new(Arc::clone(&body.lexical_names), outer);
        Self {
            call_target,
            candidate: Some(candidate),
            body: Some(body),
            pc: 0,
            registers,
            env,
        }
    }

    pub fn is_specialized(&self) -> bool {
        self.body.is_some()
    }

    /// The bytecode this frame is executing.
    pub fn effective_code(&self) -> &[u8] {
        match &self.body {
            Some(b) => &b.code,
            None => &self.call_target.bytecode().code,
        }
    }

    pub fn effective_handlers(&self) -> &[Handler] {
        match &self.body {
            Some(b) => &b.handlers,
            None => &self.call_target.bytecode().handlers,
        }
    }
}

fn initial_registers(kinds: &[RegKind]) -> Vec<Value> {
    kinds
        .iter()
        .map(|k| match k {
            RegKind::Int => Value::Int(0),
            RegKind::Num => Value::Num(0.0),
            RegKind::Str | RegKind::Obj => Value::Null,
        })
        .collect()
}

/// A thread's call stack. The last frame is the one currently executing.
#[derive(Debug, Default)]
pub struct ThreadContext {
    frames: Vec<Frame>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// The frames, outermost caller first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub(crate) fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    /// How many frames are on the stack?
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_chain() {
        let names = |xs: &[&str]| xs.iter().map(|x| Arc::from(*x)).collect::<Arc<[Arc<str>]>>();
        let outer = LexicalEnv::new(names(&["$x", "$y"]), None);
        outer.set(0, Value::Int(1));
        outer.set(1, Value::Int(2));
        let inner = LexicalEnv::new(names(&["$x"]), Some(Arc::clone(&outer)));
        inner.set(0, Value::Int(3));
        assert_eq!(inner.lookup("$x"), Some(Value::Int(3)));
        assert_eq!(inner.lookup("$y"), Some(Value::Int(2)));
        assert_eq!(inner.lookup("$z"), None);
        assert!(!inner.set(1, Value::Null));

        let e = LexicalEnv::new(names(&["$a", "$b", "$c"]), None);
        e.set(2, Value::Int(9));
        e.truncate_to(names(&["$a"]));
        assert_eq!(e.len(), 1);
        assert_eq!(e.lookup("$c"), None);
    }
}
