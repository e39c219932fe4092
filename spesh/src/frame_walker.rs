//! A cursor over a thread's frames that knows about inlined code.
//!
//! The walker visits, for each frame from the top of the stack down: every inline containing the
//! frame's current position (innermost first), then the frame itself, then (if requested) each
//! environment on its outer chain. Inlines have no frame of their own and none is created for
//! them: [FrameWalker::current_frame] returns `None` while visiting one.

use crate::{
    candidate::{CallTarget, InlineRecord},
    frame::{Frame, LexicalEnv, ThreadContext},
    value::Value,
};
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Position {
    /// `.0` indexes the containing inlines list.
    Inline(usize),
    Frame,
    Outer(Arc<LexicalEnv>),
}

pub struct FrameWalker<'a> {
    frames: &'a [Frame],
    visit_outers: bool,
    /// The index into `frames` being visited.
    frame: Option<usize>,
    /// The inlines of `frame` containing its current position, innermost first.
    inlines: Vec<usize>,
    pos: Option<Position>,
    started: bool,
}

impl<'a> FrameWalker<'a> {
    /// A walker positioned before the top frame of `thread`. If `visit_outers` is true, each
    /// frame's outer environments are visited after the frame.
    pub fn new(thread: &'a ThreadContext, visit_outers: bool) -> Self {
        Self {
            frames: thread.frames(),
            visit_outers,
            frame: None,
            inlines: Vec::new(),
            pos: None,
            started: false,
        }
    }

    fn enter_frame(&mut self, idx: usize) {
        let f = &self.frames[idx];
        self.frame = Some(idx);
        self.inlines = match &f.body {
            Some(b) => b.inlines_at(f.pc),
            None => Vec::new(),
        };
        self.pos = Some(if self.inlines.is_empty() {
            Position::Frame
        } else {
            Position::Inline(0)
        });
    }

    fn next_frame(&mut self) -> bool {
        match self.frame.and_then(|x| x.checked_sub(1)) {
            Some(idx) => {
                self.enter_frame(idx);
                true
            }
            None => {
                self.frame = None;
                self.pos = None;
                false
            }
        }
    }

    /// Move to the next position. Returns false when there are no more positions.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if !self.started {
            self.started = true;
            return match self.frames.len().checked_sub(1) {
                Some(idx) => {
                    self.enter_frame(idx);
                    true
                }
                None => false,
            };
        }
        match self.pos.take() {
            Some(Position::Inline(i)) => {
                self.pos = Some(if i + 1 < self.inlines.len() {
                    Position::Inline(i + 1)
                } else {
                    Position::Frame
                });
                true
            }
            Some(Position::Frame) => {
                let outer = self
                    .frame
                    .and_then(|i| self.frames[i].env.outer().cloned())
                    .filter(|_| self.visit_outers);
                match outer {
                    Some(e) => {
                        self.pos = Some(Position::Outer(e));
                        true
                    }
                    None => self.next_frame(),
                }
            }
            Some(Position::Outer(e)) => match e.outer() {
                Some(o) => {
                    self.pos = Some(Position::Outer(Arc::clone(o)));
                    true
                }
                None => self.next_frame(),
            },
            None => false,
        }
    }

    fn inline(&self) -> Option<(&'a Frame, &'a InlineRecord)> {
        let Some(Position::Inline(i)) = &self.pos else {
            return None;
        };
        let f = &self.frames[self.frame?];
        let body = f.body.as_ref()?;
        Some((f, &body.inlines[self.inlines[*i]]))
    }

    /// Is the current position inside inlined code?
    pub fn is_inline(&self) -> bool {
        matches!(self.pos, Some(Position::Inline(_)))
    }

    /// The real frame at the current position. Inlines and outer environments have none.
    pub fn current_frame(&self) -> Option<&'a Frame> {
        match self.pos {
            Some(Position::Frame) => self.frame.map(|i| &self.frames[i]),
            _ => None,
        }
    }

    /// The call target whose code is running at the current position, if known.
    pub fn current_call_target(&self) -> Option<Arc<CallTarget>> {
        match &self.pos {
            Some(Position::Inline(_)) => self.inline()?.1.call_target.upgrade(),
            Some(Position::Frame) => self.current_frame().map(|f| Arc::clone(&f.call_target)),
            _ => None,
        }
    }

    /// Look up the lexical `name` at the current position: in the inline's (or frame's) own
    /// lexicals first, then along the outer chain. An inline shares the outer chain of the frame
    /// it was inlined into.
    pub fn get_lex(&self, name: &str) -> Option<Value> {
        match &self.pos {
            Some(Position::Inline(_)) => {
                let (f, inl) = self.inline()?;
                match inl.lexical_names.iter().position(|x| &**x == name) {
                    Some(idx) => f.env.get(usize::from(inl.lexicals_start) + idx),
                    None => f.env.outer()?.lookup(name),
                }
            }
            Some(Position::Frame) => self.current_frame()?.env.lookup(name),
            Some(Position::Outer(e)) => e.lookup(name),
            None => None,
        }
    }
}
