//! The specialization graph: an arena-owned control flow graph of basic blocks and instructions
//! for one call target's bytecode.
//!
//! Blocks and instructions live in [IndexVec]s and refer to each other by [BlockIdx] and
//! [InstIdx]. Registers are versioned ([Var]): every version other than 0 has exactly one
//! writer, and version 0 is a register's incoming value. All versions of a register share that
//! register when bytecode is generated, so versions are purely an analysis aid.
//!
//! Deleted instructions stay in the arena (marked `deleted`) but are removed from their block's
//! instruction list. Blocks unreachable from the entry block are never placed in [Graph::order].

use crate::{
    bytecode::{Handler, OpKind, Opcode, RegKind},
    callsite::{CallsiteShape, TypeId},
    candidate::{CallTarget, CallTargetId, SpeshSlot},
    deopt::{DeoptKind, Materialization},
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::{
    fmt::{self, Write},
    sync::{Arc, Weak},
};

mod build;
pub(crate) mod dead_code;
pub(crate) mod facts;
pub(crate) mod ssa;
pub(crate) mod usedef;
#[cfg(any(debug_assertions, test))]
pub(crate) mod well_formed;

pub use facts::{Facts, KnownValue};
pub(crate) use ssa::Dominance;
pub use usedef::VarInfo;

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
}

index_vec::define_index_type! {
    pub struct InstIdx = u32;
}

/// A versioned register.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Var {
    pub reg: u16,
    pub version: u32,
}

impl Var {
    pub fn new(reg: u16, version: u32) -> Self {
        Self { reg, version }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}({})", self.reg, self.version)
    }
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    Var(Var),
    Lex { idx: u16, outers: u16 },
    I16(i16),
    I64(i64),
    N64(f64),
    Str(u32),
    Type(TypeId),
    U32(u32),
    Block(BlockIdx),
    Callsite(u16),
    Slot(u16),
}

impl Operand {
    pub fn as_var(&self) -> Option<Var> {
        match self {
            Operand::Var(v) => Some(*v),
            _ => None,
        }
    }
}

/// Per-instruction annotations.
#[derive(Clone, Debug, PartialEq)]
pub enum InstAnn {
    /// This instruction may deoptimize, resuming generic code at `generic`.
    Deopt { kind: DeoptKind, generic: u32 },
    /// If this instruction deoptimizes, first materialize the object described by entry `.0` of
    /// [Graph::materializations].
    Materialize(usize),
}

/// Per-block annotations. Handler and inline boundaries are recorded on blocks, so they survive
/// the deletion of any individual instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BlockAnn {
    /// Handler `.0`'s region starts at the start of this block.
    HandlerStart(usize),
    /// Handler `.0`'s region ends at the end of this block.
    HandlerEnd(usize),
    /// Handler `.0` resumes at the start of this block.
    HandlerGoto(usize),
    /// Inline `.0` starts at the start of this block.
    InlineStart(usize),
    /// Inline `.0` ends at the end of this block.
    InlineEnd(usize),
}

#[derive(Clone, Debug)]
pub struct Inst {
    pub op: Opcode,
    pub operands: SmallVec<[Operand; 4]>,
    pub anns: SmallVec<[InstAnn; 1]>,
    pub block: BlockIdx,
    /// The offset of the generic instruction this was derived from, if any.
    pub generic_offset: Option<u32>,
    pub deleted: bool,
}

impl Inst {
    /// Is operand `i` a register that this instruction reads?
    pub fn is_read(&self, i: usize) -> bool {
        match self.op {
            Opcode::Phi => i > 0,
            op => op.operands().get(i) == Some(&OpKind::ReadReg),
        }
    }

    /// Is operand `i` a register that this instruction writes?
    pub fn is_write(&self, i: usize) -> bool {
        match self.op {
            Opcode::Phi => i == 0,
            op => op.operands().get(i) == Some(&OpKind::WriteReg),
        }
    }

    /// The versioned registers this instruction reads, in operand order.
    pub fn reads(&self) -> SmallVec<[Var; 4]> {
        self.operands
            .iter()
            .enumerate()
            .filter(|(i, _)| self.is_read(*i))
            .filter_map(|(_, x)| x.as_var())
            .collect()
    }

    /// The versioned register this instruction writes, if any.
    pub fn write(&self) -> Option<Var> {
        self.operands
            .iter()
            .enumerate()
            .find(|(i, _)| self.is_write(*i))
            .and_then(|(_, x)| x.as_var())
    }

    /// The deopt annotation of this instruction, if it has one.
    pub fn deopt(&self) -> Option<(DeoptKind, u32)> {
        self.anns.iter().find_map(|x| match x {
            InstAnn::Deopt { kind, generic } => Some((*kind, *generic)),
            _ => None,
        })
    }

    pub fn generic_next_offset(&self) -> Option<u32> {
        self.generic_offset.map(|x| x + self.op.encoded_len())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub insts: Vec<InstIdx>,
    pub preds: SmallVec<[BlockIdx; 2]>,
    pub succs: SmallVec<[BlockIdx; 2]>,
    pub anns: SmallVec<[BlockAnn; 1]>,
    /// The generic offset this block started at, if it was derived from generic bytecode.
    pub generic_offset: Option<u32>,
}

/// A call target inlined into this graph.
#[derive(Clone, Debug)]
pub struct GraphInline {
    pub call_target: Weak<CallTarget>,
    pub name: Arc<str>,
    pub lexical_names: Arc<[Arc<str>]>,
    /// The first register of the callee's register window in the caller.
    pub locals_start: u16,
    /// The first lexical of the callee's lexicals in the caller's lexical window.
    pub lexicals_start: u16,
}

pub struct Graph {
    pub(crate) call_target: CallTargetId,
    pub(crate) blocks: IndexVec<BlockIdx, Block>,
    /// The reachable blocks in the order they will be emitted.
    pub(crate) order: Vec<BlockIdx>,
    pub(crate) insts: IndexVec<InstIdx, Inst>,
    pub(crate) entry: BlockIdx,
    /// Use/def information, indexed by `[reg][version]`.
    pub(crate) vars: Vec<Vec<VarInfo>>,
    pub(crate) local_kinds: Vec<RegKind>,
    /// How many registers the generic bytecode has: registers past this were added by passes.
    pub(crate) generic_locals: usize,
    pub(crate) lexical_names: Vec<Arc<str>>,
    pub(crate) strings: Vec<Arc<str>>,
    pub(crate) callsites: Vec<Arc<CallsiteShape>>,
    /// The handler table, with offsets into generic bytecode.
    pub(crate) handlers: Vec<Handler>,
    pub(crate) spesh_slots: Vec<SpeshSlot>,
    pub(crate) inlines: Vec<GraphInline>,
    pub(crate) materializations: Vec<Materialization>,
    pub(crate) dom: Dominance,
}

impl Graph {
    pub fn call_target(&self) -> CallTargetId {
        self.call_target
    }

    pub fn inst(&self, iidx: InstIdx) -> &Inst {
        &self.insts[iidx]
    }

    pub fn block(&self, bidx: BlockIdx) -> &Block {
        &self.blocks[bidx]
    }

    pub fn entry(&self) -> BlockIdx {
        self.entry
    }

    pub fn order(&self) -> &[BlockIdx] {
        &self.order
    }

    pub fn local_kinds(&self) -> &[RegKind] {
        &self.local_kinds
    }

    /// Every live instruction, in emission order.
    pub fn insts_in_order(&self) -> Vec<InstIdx> {
        self.order
            .iter()
            .flat_map(|b| self.blocks[*b].insts.iter().copied())
            .collect()
    }

    /// Every live instruction with opcode `op`, in emission order.
    pub fn insts_with_op(&self, op: Opcode) -> Vec<InstIdx> {
        self.insts_in_order()
            .into_iter()
            .filter(|x| self.insts[*x].op == op)
            .collect()
    }

    /// How many live instructions have opcode `op`?
    pub fn count_op(&self, op: Opcode) -> usize {
        self.insts_with_op(op).len()
    }

    /// Add a new register of kind `kind`, returning its number.
    pub(crate) fn add_local(&mut self, kind: RegKind) -> u16 {
        // Register numbers are `u16`s in bytecode: a graph that outgrows them is rejected by the
        // well-formedness check.
        let reg = self.local_kinds.len() as u16;
        self.local_kinds.push(kind);
        self.vars.push(vec![VarInfo::default()]);
        reg
    }

    pub(crate) fn add_spesh_slot(&mut self, slot: SpeshSlot) -> u16 {
        if let Some(i) = self.spesh_slots.iter().position(|x| x.same_as(&slot)) {
            return i as u16;
        }
        self.spesh_slots.push(slot);
        (self.spesh_slots.len() - 1) as u16
    }

    fn new_inst(&mut self, block: BlockIdx, op: Opcode, operands: &[Operand]) -> InstIdx {
        self.insts.push(Inst {
            op,
            operands: SmallVec::from_slice(operands),
            anns: SmallVec::new(),
            block,
            generic_offset: None,
            deleted: false,
        })
    }

    fn place(&mut self, block: BlockIdx, pos: usize, op: Opcode, operands: &[Operand]) -> InstIdx {
        let iidx = self.new_inst(block, op, operands);
        self.blocks[block].insts.insert(pos, iidx);
        self.track(iidx);
        iidx
    }

    fn position(&self, iidx: InstIdx) -> usize {
        let b = self.insts[iidx].block;
        self.blocks[b]
            .insts
            .iter()
            .position(|x| *x == iidx)
            .unwrap_or_else(|| panic!("{iidx:?} is not in {b:?}"))
    }

    /// Insert a new instruction immediately after `after`.
    pub(crate) fn insert_after(
        &mut self,
        after: InstIdx,
        op: Opcode,
        operands: &[Operand],
    ) -> InstIdx {
        let pos = self.position(after) + 1;
        self.place(self.insts[after].block, pos, op, operands)
    }

    /// Insert a new instruction immediately before `before`.
    pub(crate) fn insert_before(
        &mut self,
        before: InstIdx,
        op: Opcode,
        operands: &[Operand],
    ) -> InstIdx {
        let pos = self.position(before);
        self.place(self.insts[before].block, pos, op, operands)
    }

    /// Insert a new instruction at the start of `block`, after any `PHI`s.
    pub(crate) fn insert_at_start(
        &mut self,
        block: BlockIdx,
        op: Opcode,
        operands: &[Operand],
    ) -> InstIdx {
        let pos = if op == Opcode::Phi {
            0
        } else {
            self.blocks[block]
                .insts
                .iter()
                .position(|x| self.insts[*x].op != Opcode::Phi)
                .unwrap_or(self.blocks[block].insts.len())
        };
        self.place(block, pos, op, operands)
    }

    /// Append a new instruction to the end of `block`.
    pub(crate) fn append(&mut self, block: BlockIdx, op: Opcode, operands: &[Operand]) -> InstIdx {
        let pos = self.blocks[block].insts.len();
        self.place(block, pos, op, operands)
    }

    /// Remove `iidx` from the graph, dropping its annotations.
    pub(crate) fn delete_inst(&mut self, iidx: InstIdx) {
        if self.insts[iidx].deleted {
            return;
        }
        self.untrack(iidx);
        let pos = self.position(iidx);
        let b = self.insts[iidx].block;
        self.blocks[b].insts.remove(pos);
        let inst = &mut self.insts[iidx];
        inst.deleted = true;
        inst.anns.clear();
    }

    /// Replace `iidx`'s opcode and operands, keeping its position. Deopt annotations are dropped if
    /// the new opcode cannot deoptimize.
    pub(crate) fn rewrite(&mut self, iidx: InstIdx, op: Opcode, operands: &[Operand]) {
        self.untrack(iidx);
        let inst = &mut self.insts[iidx];
        inst.op = op;
        inst.operands = SmallVec::from_slice(operands);
        if !op.is_guard() && !op.invokes() {
            inst.anns
                .retain(|x| !matches!(x, InstAnn::Deopt { .. } | InstAnn::Materialize(_)));
        }
        self.track(iidx);
    }

    /// Attach a deopt annotation to `iidx`.
    pub(crate) fn add_deopt(&mut self, iidx: InstIdx, kind: DeoptKind, generic: u32) {
        self.insts[iidx].anns.push(InstAnn::Deopt { kind, generic });
    }

    /// Does `a` come before (or is it) `b`, where both are in the same block?
    fn precedes_in_block(&self, a: InstIdx, b: InstIdx) -> bool {
        self.position(a) <= self.position(b)
    }

    /// Does the program point just after instruction `at` dominate every execution of `user`?
    pub(crate) fn point_dominates(&self, at: InstIdx, user: InstIdx) -> bool {
        let ab = self.insts[at].block;
        let ub = self.insts[user].block;
        if ab == ub {
            self.insts[user].op != Opcode::Phi && !self.precedes_in_block(user, at)
        } else {
            self.dom.dominates(ab, ub)
        }
    }

    /// The version of `reg` holding its value when `at` starts executing. Version 0 if no write of
    /// `reg` dominates `at`.
    pub(crate) fn reaching_version(&self, reg: u16, at: InstIdx) -> Var {
        let mut best: Option<(Var, InstIdx)> = None;
        for (version, info) in self.vars[usize::from(reg)].iter().enumerate() {
            let Some(w) = info.writer else {
                continue;
            };
            if w == at || self.insts[w].deleted || !self.point_dominates(w, at) {
                continue;
            }
            match best {
                Some((_, b)) if !self.point_dominates(b, w) => (),
                _ => best = Some((Var::new(reg, version as u32), w)),
            }
        }
        best.map_or(Var::new(reg, 0), |(v, _)| v)
    }

    /// `guard` writes `new`, a refinement of `old`. Rewrite every use of `old` that `guard`
    /// dominates to use `new`.
    pub(crate) fn refine_uses(&mut self, guard: InstIdx, old: Var, new: Var) {
        let gb = self.insts[guard].block;
        let users = self.var(old).users.to_vec();
        let mut seen = Vec::new();
        for u in users {
            if u == guard || seen.contains(&u) {
                continue;
            }
            seen.push(u);
            let inst = &self.insts[u];
            let positions = (0..inst.operands.len())
                .filter(|i| inst.is_read(*i) && inst.operands[*i] == Operand::Var(old))
                .collect::<Vec<_>>();
            let ub = inst.block;
            let mut renamed = Vec::new();
            for i in positions {
                let dominated = if inst.op == Opcode::Phi {
                    // A PHI's use occurs at the end of the corresponding predecessor.
                    let pred = self.blocks[ub].preds[i - 1];
                    pred == gb || self.dom.dominates(gb, pred)
                } else {
                    self.point_dominates(guard, u)
                };
                if dominated {
                    renamed.push(i);
                }
            }
            if !renamed.is_empty() {
                self.untrack(u);
                for i in renamed {
                    self.insts[u].operands[i] = Operand::Var(new);
                }
                self.track(u);
            }
        }
    }

    /// The `arg_*` instructions that set up the arguments of the invoking instruction `call`, in
    /// order. They immediately precede `call` in its block.
    pub(crate) fn call_args(&self, call: InstIdx) -> Vec<InstIdx> {
        let insts = &self.blocks[self.insts[call].block].insts;
        let pos = self.position(call);
        let mut args = insts[..pos]
            .iter()
            .rev()
            .take_while(|x| matches!(self.insts[**x].op, Opcode::ArgO | Opcode::ArgI))
            .copied()
            .collect::<Vec<_>>();
        args.reverse();
        args
    }

    /// The var passed as argument `idx` to `call`, if any.
    pub(crate) fn call_arg(&self, call: InstIdx, idx: u16) -> Option<Var> {
        self.call_args(call).into_iter().find_map(|a| {
            let inst = &self.insts[a];
            match inst.operands.as_slice() {
                [Operand::I16(i), Operand::Var(v)] if *i >= 0 && *i as u16 == idx => Some(*v),
                _ => None,
            }
        })
    }

    /// Add an empty block that is not yet part of [Graph::order].
    pub(crate) fn add_block(&mut self) -> BlockIdx {
        self.blocks.push(Block::default())
    }

    /// Append `inst` (which must not yet be tracked) to the end of `block`.
    pub(crate) fn push_inst(&mut self, block: BlockIdx, mut inst: Inst) -> InstIdx {
        inst.block = block;
        let iidx = self.insts.push(inst);
        self.blocks[block].insts.push(iidx);
        self.track(iidx);
        iidx
    }

    /// Move every instruction after `iidx` into a new block placed immediately after `iidx`'s
    /// block in [Graph::order]. The new block inherits the old block's successors and its
    /// end-of-block annotations; the old block is left with no successors.
    pub(crate) fn split_after(&mut self, iidx: InstIdx) -> BlockIdx {
        let b = self.insts[iidx].block;
        let pos = self.position(iidx) + 1;
        let nb = self.add_block();
        let moved = self.blocks[b].insts.split_off(pos);
        for x in &moved {
            self.insts[*x].block = nb;
        }
        self.blocks[nb].insts = moved;
        let succs = std::mem::take(&mut self.blocks[b].succs);
        for s in &succs {
            for p in self.blocks[*s].preds.iter_mut() {
                if *p == b {
                    *p = nb;
                }
            }
        }
        self.blocks[nb].succs = succs;
        let (ends, starts) = self.blocks[b]
            .anns
            .drain(..)
            .partition::<SmallVec<[BlockAnn; 1]>, _>(|x| {
                matches!(x, BlockAnn::HandlerEnd(_) | BlockAnn::InlineEnd(_))
            });
        self.blocks[b].anns = starts;
        self.blocks[nb].anns = ends;
        if let Some(i) = self.order.iter().position(|x| *x == b) {
            self.order.insert(i + 1, nb);
        }
        nb
    }

    /// Recompute dominance after the control flow graph has changed.
    pub(crate) fn recompute_dominance(&mut self) {
        self.dom = Dominance::compute(&self.blocks, self.entry);
    }

    /// Add a control flow edge from `from` to `to`.
    pub(crate) fn add_edge(&mut self, from: BlockIdx, to: BlockIdx) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
            self.blocks[to].preds.push(from);
        }
    }

    fn operand_to_string(&self, x: &Operand) -> String {
        match x {
            Operand::Var(v) => v.to_string(),
            Operand::Lex { idx, outers: 0 } => format!("lex{idx}"),
            Operand::Lex { idx, outers } => format!("lex{idx}^{outers}"),
            Operand::I16(v) => v.to_string(),
            Operand::I64(v) => v.to_string(),
            Operand::N64(v) => format!("{v:?}"),
            Operand::Str(i) => match self.strings.get(*i as usize) {
                Some(s) => format!("\"{s}\""),
                None => format!("s{i}"),
            },
            Operand::Type(t) => t.to_string(),
            Operand::U32(v) => v.to_string(),
            Operand::Block(b) => format!("@b{}", b.index()),
            Operand::Callsite(v) => format!("cs{v}"),
            Operand::Slot(v) => format!("ss{v}"),
        }
    }

    /// Pretty print instruction `iidx`.
    pub fn inst_to_string(&self, iidx: InstIdx) -> String {
        let inst = &self.insts[iidx];
        let mut s = inst.op.to_string();
        if !inst.operands.is_empty() {
            s.push(' ');
            s.push_str(
                &inst
                    .operands
                    .iter()
                    .map(|x| self.operand_to_string(x))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        for ann in &inst.anns {
            match ann {
                InstAnn::Deopt { kind, generic } => write!(s, " [deopt-{kind} {generic}]"),
                InstAnn::Materialize(i) => write!(s, " [materialize {i}]"),
            }
            .ok();
        }
        s
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blocks = |x: &[BlockIdx]| {
            x.iter()
                .map(|b| format!("b{}", b.index()))
                .collect::<Vec<_>>()
                .join(", ")
        };
        for bidx in &self.order {
            let b = &self.blocks[*bidx];
            write!(f, "block b{}:", bidx.index())?;
            if !b.preds.is_empty() {
                write!(f, " <- [{}]", blocks(&b.preds))?;
            }
            if !b.succs.is_empty() {
                write!(f, " -> [{}]", blocks(&b.succs))?;
            }
            for ann in &b.anns {
                match ann {
                    BlockAnn::HandlerStart(h) => write!(f, " [handler-start {h}]")?,
                    BlockAnn::HandlerEnd(h) => write!(f, " [handler-end {h}]")?,
                    BlockAnn::HandlerGoto(h) => write!(f, " [handler-goto {h}]")?,
                    BlockAnn::InlineStart(i) => write!(f, " [inline-start {i}]")?,
                    BlockAnn::InlineEnd(i) => write!(f, " [inline-end {i}]")?,
                }
            }
            writeln!(f)?;
            for iidx in &b.insts {
                writeln!(f, "  {}", self.inst_to_string(*iidx))?;
            }
        }
        Ok(())
    }
}
