//! Facts: what is known about a versioned register at every point it is live.
//!
//! A fact that is present must always be true. Facts are only ever strengthened by a guard (whose
//! output carries the refined facts) or by an instruction whose result is known statically.

use crate::{bytecode::Opcode, callsite::{ObservedType, TypeId}};

/// A statically known value.
#[derive(Clone, Debug, PartialEq)]
pub enum KnownValue {
    Int(i64),
    Num(f64),
    Str(u32),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Facts {
    pub ty: Option<TypeId>,
    /// `Some(true)` if known to be an instance, `Some(false)` if known to be a type object.
    pub concrete: Option<bool>,
    pub value: Option<KnownValue>,
    /// Set on registers that replaced the fields of the allocation with this id.
    pub from_allocation: Option<u32>,
}

impl Facts {
    pub fn known_type(ty: TypeId, concrete: bool) -> Self {
        Self {
            ty: Some(ty),
            concrete: Some(concrete),
            ..Self::default()
        }
    }

    pub fn known_value(v: KnownValue) -> Self {
        Self {
            value: Some(v),
            ..Self::default()
        }
    }

    pub fn from_observed(t: ObservedType) -> Self {
        Self::known_type(t.ty, t.concrete)
    }

    pub fn is_empty(&self) -> bool {
        self.ty.is_none() && self.concrete.is_none() && self.value.is_none()
    }

    /// The facts that hold at a merge of values with facts `self` and `other`.
    pub fn meet(&self, other: &Facts) -> Facts {
        Facts {
            ty: if self.ty == other.ty { self.ty } else { None },
            concrete: if self.concrete == other.concrete {
                self.concrete
            } else {
                None
            },
            value: if self.value == other.value {
                self.value.clone()
            } else {
                None
            },
            from_allocation: None,
        }
    }

    /// Do these facts already prove that the guard `op` with type/literal operand `lit` passes?
    pub fn proves_guard(&self, op: Opcode, ty: Option<TypeId>, lit: Option<i64>) -> bool {
        match op {
            Opcode::SpGuard => self.concrete == Some(true) && self.ty.is_some() && self.ty == ty,
            Opcode::SpGuardType => {
                self.concrete == Some(false) && self.ty.is_some() && self.ty == ty
            }
            Opcode::SpGuardConc => self.concrete == Some(true),
            Opcode::SpGuardLitI => {
                matches!((&self.value, lit), (Some(KnownValue::Int(x)), Some(y)) if *x == y)
            }
            _ => false,
        }
    }

    /// Do these facts contradict the guard, i.e. would it always fail?
    pub fn contradicts_guard(&self, op: Opcode, ty: Option<TypeId>) -> bool {
        match op {
            Opcode::SpGuard => {
                self.concrete == Some(false) || (self.ty.is_some() && ty.is_some() && self.ty != ty)
            }
            Opcode::SpGuardType => {
                self.concrete == Some(true) || (self.ty.is_some() && ty.is_some() && self.ty != ty)
            }
            Opcode::SpGuardConc => self.concrete == Some(false),
            _ => false,
        }
    }

    /// The facts that hold for a guard's output, given the facts of its input.
    pub fn refined_by_guard(&self, op: Opcode, ty: Option<TypeId>, lit: Option<i64>) -> Facts {
        let mut f = self.clone();
        f.from_allocation = None;
        match op {
            Opcode::SpGuard => {
                f.ty = ty;
                f.concrete = Some(true);
            }
            Opcode::SpGuardType => {
                f.ty = ty;
                f.concrete = Some(false);
            }
            Opcode::SpGuardConc => f.concrete = Some(true),
            Opcode::SpGuardLitI => f.value = lit.map(KnownValue::Int),
            _ => (),
        }
        f
    }
}
