//! Deciding what to specialize from the statistics gathered so far.

use crate::{
    callsite::{tuple_to_string, CallsiteShape, ObservedType, TypeTuple},
    candidate::{CallTarget, CallTargetId, PlanKind},
    config::SpeshConfig,
    log::{Log, Verbosity},
    stats::{meets_percent, CallsiteStats, TypeTupleStats},
};
use std::{collections::HashMap, fmt, sync::Arc};

/// One specialization the planner wants built.
#[derive(Clone)]
pub struct PlannedSpecialization {
    pub kind: PlanKind,
    pub call_target: Arc<CallTarget>,
    pub shape: Arc<CallsiteShape>,
    /// `None` for [PlanKind::Certain] plans.
    pub types: Option<TypeTuple>,
    /// The deepest call depth at which the evidence for this plan was seen.
    pub max_depth: u32,
    /// How many calls this plan's evidence accounts for.
    pub hits: u64,
}

impl fmt::Debug for PlannedSpecialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} plan for '{}' {}",
            self.kind,
            self.call_target.name(),
            self.shape
        )?;
        if let Some(types) = &self.types {
            write!(f, " {}", tuple_to_string(types))?;
        }
        write!(f, " (hits={}, depth={})", self.hits, self.max_depth)
    }
}

/// How many hits a call target of `size` bytes, seen at most `depth` frames deep, needs before it
/// is worth specializing. Bigger code must prove itself hotter; deeper code, being closer to the
/// leaves, is specialized sooner.
pub(crate) fn hit_threshold(size: usize, depth: u32, nodelay: bool) -> u64 {
    if nodelay {
        return 1;
    }
    let base: u64 = if size <= 2048 {
        150
    } else if size <= 8192 {
        200
    } else {
        300
    };
    base.saturating_sub(10 * u64::from(depth.min(5))).max(1)
}

/// Plan the specializations for `targets`, leaves first. Plans that duplicate an installed
/// candidate are never returned.
pub(crate) fn plan(
    config: &SpeshConfig,
    log: &Log,
    targets: &[Arc<CallTarget>],
) -> Vec<PlannedSpecialization> {
    if config.disabled {
        return Vec::new();
    }
    let mut plans = Vec::new();
    for t in targets {
        let size = t.bytecode().len();
        if size > config.max_bytecode_size {
            log.log(
                Verbosity::CandidateEvent,
                &format!(
                    "not planning '{}': {size} bytes of bytecode exceeds {}",
                    t.name(),
                    config.max_bytecode_size
                ),
            );
            continue;
        }
        t.with_stats(|stats| {
            let threshold = hit_threshold(size, stats.max_depth(), config.nodelay);
            if stats.total() < threshold {
                return;
            }
            for (shape, cs) in &stats.by_callsite {
                if cs.total() < threshold {
                    continue;
                }
                plan_callsite(config, t, shape, cs, &mut plans);
            }
        });
    }

    bump_callee_depths(&mut plans);
    // Stable, so plans for one call target keep the order they were derived in.
    plans.sort_by(|a, b| b.max_depth.cmp(&a.max_depth));
    plans.retain(|p| {
        let dup = p
            .call_target
            .has_candidate(&p.shape, p.types.as_ref());
        if dup {
            log.log(
                Verbosity::CandidateEvent,
                &format!("dropping {p:?}: already installed"),
            );
        }
        !dup
    });
    for p in &plans {
        log.log(Verbosity::CandidateEvent, &format!("planned {p:?}"));
    }
    plans
}

/// Plan the specializations for one callsite shape of `t`.
fn plan_callsite(
    config: &SpeshConfig,
    t: &Arc<CallTarget>,
    shape: &Arc<CallsiteShape>,
    cs: &CallsiteStats,
    plans: &mut Vec<PlannedSpecialization>,
) {
    let mut unclaimed = cs
        .by_type
        .iter()
        .filter(|(types, _)| types.iter().any(|x| x.is_some()))
        .collect::<Vec<_>>();
    let typed_hits = unclaimed.iter().map(|(_, s)| s.total()).sum::<u64>();
    let mut certain = TypeTupleStats {
        hits: cs.total() - typed_hits,
        osr_hits: 0,
        max_depth: cs
            .by_type
            .iter()
            .filter(|(types, _)| types.iter().all(|x| x.is_none()))
            .map(|(_, s)| s.max_depth)
            .max()
            .unwrap_or(0),
    };

    loop {
        if unclaimed.is_empty() {
            break;
        }
        // Narrow the evidence one argument position at a time.
        let mut constraints = vec![None; shape.num_args()];
        let mut evidence = unclaimed.clone();
        for (pos, c) in constraints.iter_mut().enumerate() {
            let mut counts = Vec::<(ObservedType, u64)>::new();
            for (types, s) in &evidence {
                if let Some(Some(ty)) = types.get(pos) {
                    match counts.iter_mut().find(|(x, _)| x == ty) {
                        Some((_, n)) => *n += s.total(),
                        None => counts.push((*ty, s.total())),
                    }
                }
            }
            // The first-seen type wins ties.
            let best = counts
                .iter()
                .fold(None::<(ObservedType, u64)>, |acc, (ty, n)| match acc {
                    Some((_, bn)) if bn >= *n => acc,
                    _ => Some((*ty, *n)),
                });
            if let Some((ty, n)) = best {
                if meets_percent(n, cs.total(), config.arg_type_percent) {
                    *c = Some(ty);
                    evidence.retain(|(types, _)| types.get(pos).copied().flatten() == Some(ty));
                }
            }
        }
        if constraints.iter().all(|x| x.is_none()) {
            break;
        }
        let kind = match evidence.as_slice() {
            [(types, _)] if types.iter().eq(constraints.iter()) => PlanKind::Observed,
            _ => PlanKind::Derived,
        };
        plans.push(PlannedSpecialization {
            kind,
            call_target: Arc::clone(t),
            shape: Arc::clone(shape),
            types: Some(Arc::from(constraints)),
            max_depth: evidence.iter().map(|(_, s)| s.max_depth).max().unwrap_or(0),
            hits: evidence.iter().map(|(_, s)| s.total()).sum(),
        });
        unclaimed.retain(|(types, _)| !evidence.iter().any(|(x, _)| x == types));
    }

    for (_, s) in &unclaimed {
        certain.hits += s.total();
        certain.max_depth = certain.max_depth.max(s.max_depth);
    }
    if certain.hits > 0 {
        plans.push(PlannedSpecialization {
            kind: PlanKind::Certain,
            call_target: Arc::clone(t),
            shape: Arc::clone(shape),
            types: None,
            max_depth: certain.max_depth,
            hits: certain.hits,
        });
    }
}

/// A callee must be specialized before its callers, so every plan for a call target invoked by
/// another planned call target is made deeper than its caller's plans.
fn bump_callee_depths(plans: &mut [PlannedSpecialization]) {
    let mut callees = HashMap::<CallTargetId, Vec<CallTargetId>>::new();
    for p in plans.iter() {
        let id = p.call_target.id();
        if !callees.contains_key(&id) {
            let cs = p.call_target.with_stats(|s| s.callees().collect::<Vec<_>>());
            callees.insert(id, cs);
        }
    }
    // Each round can only push depths further down a call chain, which is at most as long as the
    // number of plans. Recursion would otherwise never settle.
    for _ in 0..plans.len() {
        let mut depths = HashMap::<CallTargetId, u32>::new();
        for p in plans.iter() {
            let d = depths.entry(p.call_target.id()).or_default();
            *d = (*d).max(p.max_depth);
        }
        let mut changed = false;
        for p in plans.iter_mut() {
            let id = p.call_target.id();
            let min = callees
                .iter()
                .filter(|(caller, cs)| **caller != id && cs.contains(&id))
                .filter_map(|(caller, _)| depths.get(caller))
                .map(|d| d + 1)
                .max();
            if let Some(min) = min {
                if p.max_depth < min {
                    p.max_depth = min;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}
