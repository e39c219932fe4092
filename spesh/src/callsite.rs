//! Callsite shapes and the argument type tuples observed at them.

use std::{fmt, sync::Arc};

/// Identifies a type known to the object system.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// The type of an argument as observed at runtime: a type and whether the value was an instance
/// of it (concrete) or the type object itself.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObservedType {
    pub ty: TypeId,
    pub concrete: bool,
}

impl ObservedType {
    pub fn concrete(ty: TypeId) -> Self {
        Self { ty, concrete: true }
    }

    pub fn type_object(ty: TypeId) -> Self {
        Self {
            ty,
            concrete: false,
        }
    }
}

impl fmt::Display for ObservedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.concrete {
            write!(f, "{}", self.ty)
        } else {
            write!(f, "{}:U", self.ty)
        }
    }
}

/// One (optionally typed) entry per argument position. Only object arguments are ever typed.
pub type TypeTuple = Arc<[Option<ObservedType>]>;

/// Format a type tuple as `(T1, _, T3:U)`.
pub fn tuple_to_string(tuple: &[Option<ObservedType>]) -> String {
    format!(
        "({})",
        tuple
            .iter()
            .map(|x| match x {
                Some(x) => x.to_string(),
                None => "_".to_owned(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// The storage kind of an argument as passed at a callsite.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display)]
pub enum ArgKind {
    #[strum(to_string = "obj")]
    Obj,
    #[strum(to_string = "int")]
    Int,
    #[strum(to_string = "num")]
    Num,
    #[strum(to_string = "str")]
    Str,
}

/// The arity and kind signature of a call, independent of the argument types. The last
/// `named.len()` arguments are named.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CallsiteShape {
    pub args: Vec<ArgKind>,
    pub named: Vec<Arc<str>>,
}

impl CallsiteShape {
    pub fn positional(args: Vec<ArgKind>) -> Self {
        Self {
            args,
            named: Vec::new(),
        }
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Named arguments come last. A shape naming more arguments than it has has no positionals.
    pub fn num_positionals(&self) -> usize {
        self.args.len().saturating_sub(self.named.len())
    }
}

impl fmt::Display for CallsiteShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let npos = self.num_positionals();
        let mut parts = self.args[..npos]
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>();
        for (kind, name) in self.args[npos..].iter().zip(self.named.iter()) {
            parts.push(format!(":{name}({kind})"));
        }
        write!(f, "({})", parts.join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn more_names_than_args() {
        let cs = CallsiteShape {
            args: vec![ArgKind::Obj],
            named: vec![Arc::from("x"), Arc::from("y")],
        };
        assert_eq!(cs.num_positionals(), 0);
        assert_eq!(cs.to_string(), "(:x(obj))");
    }

    #[test]
    fn shape_display() {
        let cs = CallsiteShape {
            args: vec![ArgKind::Obj, ArgKind::Int, ArgKind::Obj],
            named: vec![Arc::from("x")],
        };
        assert_eq!(cs.num_positionals(), 2);
        assert_eq!(cs.to_string(), "(obj, int, :x(obj))");
        assert_eq!(
            tuple_to_string(&[
                Some(ObservedType::concrete(TypeId(3))),
                None,
                Some(ObservedType::type_object(TypeId(4)))
            ]),
            "(T3, _, T4:U)"
        );
    }
}
