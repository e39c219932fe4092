//! Runtime statistics about a call target, aggregated from the log entries that generic code and
//! logging candidates produce.

use crate::{
    callsite::{CallsiteShape, ObservedType, TypeTuple},
    candidate::CallTargetId,
};
use indexmap::IndexMap;
use std::{collections::BTreeMap, sync::Arc};

/// One observation reported by the interpreter.
#[derive(Clone, Debug)]
pub enum LogEntry {
    /// The call target was entered through a callsite of shape `shape` with argument types
    /// `types`, `depth` frames deep. `osr` is true for entries made by on-stack replacement.
    Entry {
        shape: Arc<CallsiteShape>,
        types: TypeTuple,
        depth: u32,
        osr: bool,
    },
    /// A logged value at the generic offset `offset` had type `ty`.
    Type { offset: u32, ty: ObservedType },
    /// The dispatch at generic offset `offset` used inline cache entry `outcome`.
    Dispatch { offset: u32, outcome: usize },
    /// The dispatch at generic offset `offset` invoked `callee`.
    Invoke { offset: u32, callee: CallTargetId },
}

/// Hits for one exact argument type tuple at one callsite shape.
#[derive(Clone, Debug, Default)]
pub struct TypeTupleStats {
    pub hits: u64,
    pub osr_hits: u64,
    pub max_depth: u32,
}

impl TypeTupleStats {
    pub fn total(&self) -> u64 {
        self.hits + self.osr_hits
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallsiteStats {
    pub hits: u64,
    pub osr_hits: u64,
    pub max_depth: u32,
    /// Per exact type tuple, in first-seen order.
    pub by_type: IndexMap<TypeTuple, TypeTupleStats>,
}

impl CallsiteStats {
    pub fn total(&self) -> u64 {
        self.hits + self.osr_hits
    }
}

/// Observations made at one generic bytecode offset.
#[derive(Clone, Debug, Default)]
pub struct OffsetStats {
    pub types: IndexMap<ObservedType, u64>,
    pub dispatch_outcomes: BTreeMap<usize, u64>,
    pub invokes: IndexMap<CallTargetId, u64>,
}

impl OffsetStats {
    /// The most common type logged here, if it accounts for at least `percent`% of the types
    /// logged.
    pub fn dominant_type(&self, percent: u32) -> Option<ObservedType> {
        let total = self.types.values().sum::<u64>();
        let (ty, n) = self.types.iter().max_by_key(|(_, n)| **n)?;
        meets_percent(*n, total, percent).then_some(*ty)
    }

    /// The most common dispatch outcome here, if it accounts for at least `percent`% of hits.
    pub fn dominant_outcome(&self, percent: u32) -> Option<usize> {
        let total = self.dispatch_outcomes.values().sum::<u64>();
        let (outcome, n) = self.dispatch_outcomes.iter().max_by_key(|(_, n)| **n)?;
        meets_percent(*n, total, percent).then_some(*outcome)
    }
}

/// Is `n` at least `percent`% of `total`? Zero is never a significant share of anything.
pub(crate) fn meets_percent(n: u64, total: u64, percent: u32) -> bool {
    n > 0 && n * 100 >= total * u64::from(percent)
}

/// All statistics for one call target.
#[derive(Clone, Debug, Default)]
pub struct CallTargetStats {
    pub hits: u64,
    pub osr_hits: u64,
    /// Per callsite shape, in first-seen order.
    pub by_callsite: IndexMap<Arc<CallsiteShape>, CallsiteStats>,
    pub by_offset: BTreeMap<u32, OffsetStats>,
}

impl CallTargetStats {
    pub fn total(&self) -> u64 {
        self.hits + self.osr_hits
    }

    /// The deepest call depth this call target has been observed at.
    pub fn max_depth(&self) -> u32 {
        self.by_callsite
            .values()
            .map(|x| x.max_depth)
            .max()
            .unwrap_or(0)
    }

    pub fn record(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Entry {
                shape,
                types,
                depth,
                osr,
            } => {
                let cs = self.by_callsite.entry(shape).or_default();
                let tt = cs.by_type.entry(types).or_default();
                if osr {
                    self.osr_hits += 1;
                    cs.osr_hits += 1;
                    tt.osr_hits += 1;
                } else {
                    self.hits += 1;
                    cs.hits += 1;
                    tt.hits += 1;
                }
                cs.max_depth = cs.max_depth.max(depth);
                tt.max_depth = tt.max_depth.max(depth);
            }
            LogEntry::Type { offset, ty } => {
                *self
                    .by_offset
                    .entry(offset)
                    .or_default()
                    .types
                    .entry(ty)
                    .or_default() += 1;
            }
            LogEntry::Dispatch { offset, outcome } => {
                *self
                    .by_offset
                    .entry(offset)
                    .or_default()
                    .dispatch_outcomes
                    .entry(outcome)
                    .or_default() += 1;
            }
            LogEntry::Invoke { offset, callee } => {
                *self
                    .by_offset
                    .entry(offset)
                    .or_default()
                    .invokes
                    .entry(callee)
                    .or_default() += 1;
            }
        }
    }

    /// Every call target invoked from this one.
    pub fn callees(&self) -> impl Iterator<Item = CallTargetId> + '_ {
        self.by_offset.values().flat_map(|x| x.invokes.keys().copied())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::callsite::{ArgKind, TypeId};

    #[test]
    fn aggregate() {
        let shape = Arc::new(CallsiteShape::positional(vec![ArgKind::Obj]));
        let int: TypeTuple = Arc::from(vec![Some(ObservedType::concrete(TypeId(1)))]);
        let mut s = CallTargetStats::default();
        for depth in [1, 3, 2] {
            s.record(LogEntry::Entry {
                shape: Arc::clone(&shape),
                types: Arc::clone(&int),
                depth,
                osr: false,
            });
        }
        s.record(LogEntry::Entry {
            shape: Arc::clone(&shape),
            types: Arc::clone(&int),
            depth: 0,
            osr: true,
        });
        assert_eq!((s.hits, s.osr_hits, s.total()), (3, 1, 4));
        assert_eq!(s.max_depth(), 3);
        let cs = &s.by_callsite[&shape];
        assert_eq!(cs.by_type[&int].total(), 4);

        for _ in 0..99 {
            s.record(LogEntry::Dispatch {
                offset: 10,
                outcome: 0,
            });
        }
        s.record(LogEntry::Dispatch {
            offset: 10,
            outcome: 1,
        });
        assert_eq!(s.by_offset[&10].dominant_outcome(99), Some(0));
        s.record(LogEntry::Dispatch {
            offset: 10,
            outcome: 1,
        });
        assert_eq!(s.by_offset[&10].dominant_outcome(99), None);
        s.record(LogEntry::Invoke {
            offset: 10,
            callee: CallTargetId(7),
        });
        assert_eq!(s.callees().collect::<Vec<_>>(), vec![CallTargetId(7)]);
    }

    #[test]
    fn percentages() {
        assert!(meets_percent(40, 100, 40));
        assert!(!meets_percent(39, 100, 40));
        assert!(!meets_percent(0, 0, 0));
    }
}
