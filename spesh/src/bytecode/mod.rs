//! Bytecode: the opcode table, operand kinds, and the buffers that the interpreter executes.
//!
//! An instruction is a little-endian `u16` opcode followed by its operands, each encoded at the
//! static width of its [OpKind]. The same format is used for generic bytecode and for the
//! specialized bytecode that [crate::codegen] produces.

use crate::{callsite::CallsiteShape, errors::SpeshError};
use static_assertions::const_assert;
use std::sync::Arc;
use strum::{Display, EnumCount, EnumIter, EnumString, FromRepr};

mod encode;
pub mod text;

pub use encode::{decode, DecodedInst, RawOperand, Writer};

/// The kind of a single operand, which determines both how it is encoded and how the specializer
/// treats it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OpKind {
    /// A register that is read.
    ReadReg,
    /// A register that is written.
    WriteReg,
    /// A lexical that is read: `(index, outers)`.
    ReadLex,
    /// A lexical that is written.
    WriteLex,
    LitI16,
    LitI64,
    LitN64,
    /// An index into the string heap.
    LitStr,
    LitType,
    LitU32,
    /// An absolute bytecode offset.
    Label,
    /// An index into the callsite table.
    Callsite,
    /// An index into a candidate's spesh slot table.
    Slot,
}

impl OpKind {
    /// The number of bytes this operand occupies when encoded.
    pub fn width(self) -> u32 {
        match self {
            OpKind::ReadReg | OpKind::WriteReg => 2,
            OpKind::ReadLex | OpKind::WriteLex => 4,
            OpKind::LitI16 | OpKind::Callsite | OpKind::Slot => 2,
            OpKind::LitI64 | OpKind::LitN64 => 8,
            OpKind::LitStr | OpKind::LitType | OpKind::LitU32 | OpKind::Label => 4,
        }
    }
}

/// The kind of value a register holds.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum RegKind {
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "num")]
    Num,
    #[strum(serialize = "str")]
    Str,
    #[strum(serialize = "obj")]
    Obj,
}

// Note: the numeric value of each opcode is its encoding, so new opcodes must only ever be added
// at the end of the generic or specialized groups respectively, before `Phi`.
#[repr(u16)]
#[derive(
    Clone, Copy, Debug, Display, EnumCount, EnumIter, EnumString, Eq, FromRepr, Hash, PartialEq,
)]
pub enum Opcode {
    #[strum(serialize = "no_op")]
    NoOp,
    #[strum(serialize = "goto")]
    Goto,
    #[strum(serialize = "if_i")]
    IfI,
    #[strum(serialize = "unless_i")]
    UnlessI,
    #[strum(serialize = "set")]
    Set,
    #[strum(serialize = "null")]
    Null,
    #[strum(serialize = "const_i64")]
    ConstI64,
    #[strum(serialize = "const_n64")]
    ConstN64,
    #[strum(serialize = "const_s")]
    ConstS,
    #[strum(serialize = "const_type")]
    ConstType,
    #[strum(serialize = "add_i")]
    AddI,
    #[strum(serialize = "sub_i")]
    SubI,
    #[strum(serialize = "mul_i")]
    MulI,
    #[strum(serialize = "lt_i")]
    LtI,
    #[strum(serialize = "eq_i")]
    EqI,
    #[strum(serialize = "add_n")]
    AddN,
    #[strum(serialize = "return_o")]
    ReturnO,
    #[strum(serialize = "return_i")]
    ReturnI,
    #[strum(serialize = "checkarity")]
    CheckArity,
    #[strum(serialize = "param_rp_o")]
    ParamRpO,
    #[strum(serialize = "param_rp_i")]
    ParamRpI,
    #[strum(serialize = "getlex")]
    GetLex,
    #[strum(serialize = "bindlex")]
    BindLex,
    #[strum(serialize = "decont")]
    Decont,
    #[strum(serialize = "create")]
    Create,
    #[strum(serialize = "getattr_o")]
    GetAttrO,
    #[strum(serialize = "getattr_i")]
    GetAttrI,
    #[strum(serialize = "getattr_n")]
    GetAttrN,
    #[strum(serialize = "bindattr_o")]
    BindAttrO,
    #[strum(serialize = "bindattr_i")]
    BindAttrI,
    #[strum(serialize = "bindattr_n")]
    BindAttrN,
    #[strum(serialize = "arg_o")]
    ArgO,
    #[strum(serialize = "arg_i")]
    ArgI,
    #[strum(serialize = "dispatch_o")]
    DispatchO,
    // Specialized-only opcodes.
    #[strum(serialize = "sp_log")]
    SpLog,
    #[strum(serialize = "sp_guard")]
    SpGuard,
    #[strum(serialize = "sp_guardconc")]
    SpGuardConc,
    #[strum(serialize = "sp_guardtype")]
    SpGuardType,
    #[strum(serialize = "sp_guardlit_i")]
    SpGuardLitI,
    #[strum(serialize = "sp_getspeshslot")]
    SpGetSpeshSlot,
    #[strum(serialize = "sp_dispatch_o")]
    SpDispatchO,
    #[strum(serialize = "sp_fastinvoke_o")]
    SpFastInvokeO,
    #[strum(serialize = "sp_fastcreate")]
    SpFastCreate,
    #[strum(serialize = "sp_get_o")]
    SpGetO,
    #[strum(serialize = "sp_get_i")]
    SpGetI,
    #[strum(serialize = "sp_get_n")]
    SpGetN,
    #[strum(serialize = "sp_bind_o")]
    SpBindO,
    #[strum(serialize = "sp_bind_i")]
    SpBindI,
    #[strum(serialize = "sp_bind_n")]
    SpBindN,
    /// A graph-only merge of versions. Never encoded.
    #[strum(serialize = "PHI")]
    Phi,
}

const_assert!(Opcode::COUNT < u16::MAX as usize);

impl Opcode {
    /// The fixed operand signature of this opcode. [Opcode::Phi] has a variable number of
    /// operands and reports none here.
    pub fn operands(self) -> &'static [OpKind] {
        use OpKind::*;
        match self {
            Opcode::NoOp | Opcode::Phi => &[],
            Opcode::Goto => &[Label],
            Opcode::IfI | Opcode::UnlessI => &[ReadReg, Label],
            Opcode::Set => &[WriteReg, ReadReg],
            Opcode::Null => &[WriteReg],
            Opcode::ConstI64 => &[WriteReg, LitI64],
            Opcode::ConstN64 => &[WriteReg, LitN64],
            Opcode::ConstS => &[WriteReg, LitStr],
            Opcode::ConstType => &[WriteReg, LitType],
            Opcode::AddI
            | Opcode::SubI
            | Opcode::MulI
            | Opcode::LtI
            | Opcode::EqI
            | Opcode::AddN => &[WriteReg, ReadReg, ReadReg],
            Opcode::ReturnO | Opcode::ReturnI => &[ReadReg],
            Opcode::CheckArity => &[LitI16, LitI16],
            Opcode::ParamRpO | Opcode::ParamRpI => &[WriteReg, LitI16],
            Opcode::GetLex => &[WriteReg, ReadLex],
            Opcode::BindLex => &[WriteLex, ReadReg],
            Opcode::Decont | Opcode::Create => &[WriteReg, ReadReg],
            Opcode::GetAttrO | Opcode::GetAttrI | Opcode::GetAttrN => {
                &[WriteReg, ReadReg, LitType, LitStr]
            }
            Opcode::BindAttrO | Opcode::BindAttrI | Opcode::BindAttrN => {
                &[ReadReg, LitType, LitStr, ReadReg]
            }
            Opcode::ArgO | Opcode::ArgI => &[LitI16, ReadReg],
            Opcode::DispatchO => &[WriteReg, Callsite, LitStr],
            Opcode::SpLog => &[ReadReg, LitI16, LitU32],
            Opcode::SpGuard | Opcode::SpGuardType => &[WriteReg, ReadReg, LitType],
            Opcode::SpGuardConc => &[WriteReg, ReadReg],
            Opcode::SpGuardLitI => &[WriteReg, ReadReg, LitI64],
            Opcode::SpGetSpeshSlot => &[WriteReg, Slot],
            Opcode::SpDispatchO => &[WriteReg, Callsite, LitStr, Slot],
            Opcode::SpFastInvokeO => &[WriteReg, Callsite, Slot],
            Opcode::SpFastCreate => &[WriteReg, LitI16, LitType],
            Opcode::SpGetO | Opcode::SpGetI | Opcode::SpGetN => &[WriteReg, ReadReg, LitI16],
            Opcode::SpBindO | Opcode::SpBindI | Opcode::SpBindN => &[ReadReg, LitI16, ReadReg],
        }
    }

    /// The number of bytes an instruction with this opcode occupies.
    pub fn encoded_len(self) -> u32 {
        2 + self.operands().iter().map(|x| x.width()).sum::<u32>()
    }

    /// Does this opcode carry a label operand?
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Goto | Opcode::IfI | Opcode::UnlessI)
    }

    /// Does control never fall through to the next instruction?
    pub fn ends_block(self) -> bool {
        matches!(self, Opcode::Goto | Opcode::ReturnO | Opcode::ReturnI)
    }

    pub fn is_guard(self) -> bool {
        matches!(
            self,
            Opcode::SpGuard | Opcode::SpGuardConc | Opcode::SpGuardType | Opcode::SpGuardLitI
        )
    }

    /// Does this opcode run (possibly generic) code in another frame?
    pub fn invokes(self) -> bool {
        matches!(
            self,
            Opcode::DispatchO | Opcode::SpDispatchO | Opcode::SpFastInvokeO
        )
    }

    /// Can an instruction with this opcode be removed if nothing uses its result?
    pub fn is_pure(self) -> bool {
        matches!(
            self,
            Opcode::Set
                | Opcode::Null
                | Opcode::ConstI64
                | Opcode::ConstN64
                | Opcode::ConstS
                | Opcode::ConstType
                | Opcode::AddI
                | Opcode::SubI
                | Opcode::MulI
                | Opcode::LtI
                | Opcode::EqI
                | Opcode::AddN
                | Opcode::GetLex
                | Opcode::SpGetSpeshSlot
                | Opcode::SpFastCreate
                | Opcode::SpGetO
                | Opcode::SpGetI
                | Opcode::SpGetN
                | Opcode::Phi
        )
    }

    /// Is this opcode only valid in specialized bytecode?
    pub fn is_specialized_only(self) -> bool {
        (self as u16) >= (Opcode::SpLog as u16)
    }
}

/// What a `sp_log` instruction records.
#[repr(i16)]
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, PartialEq)]
pub enum LogKind {
    #[strum(to_string = "param")]
    Param,
    #[strum(to_string = "return")]
    Return,
    #[strum(to_string = "decont")]
    Decont,
    #[strum(to_string = "attribute")]
    Attribute,
    #[strum(to_string = "invoke")]
    Invoke,
}

/// An exception handler. Offsets are absolute: the handler covers `start..end` and control
/// resumes at `goto`.
#[derive(Clone, Debug, PartialEq)]
pub struct Handler {
    pub start: u32,
    pub end: u32,
    pub goto: u32,
    pub category: u32,
}

/// Generic bytecode for one call target, together with the frame metadata needed to execute it.
#[derive(Debug, Default)]
pub struct Bytecode {
    pub code: Box<[u8]>,
    pub local_kinds: Vec<RegKind>,
    pub lexical_names: Arc<[Arc<str>]>,
    pub strings: Vec<Arc<str>>,
    pub callsites: Vec<Arc<CallsiteShape>>,
    pub handlers: Vec<Handler>,
}

impl Bytecode {
    pub fn decode(&self) -> Result<Vec<DecodedInst>, SpeshError> {
        decode(&self.code)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn lexical_index(&self, name: &str) -> Option<usize> {
        self.lexical_names.iter().position(|x| &**x == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_names_roundtrip() {
        for op in Opcode::iter() {
            assert_eq!(op.to_string().parse::<Opcode>().unwrap(), op);
            assert_eq!(Opcode::from_repr(op as u16), Some(op));
        }
    }

    #[test]
    fn encoded_lengths() {
        assert_eq!(Opcode::NoOp.encoded_len(), 2);
        assert_eq!(Opcode::ConstI64.encoded_len(), 12);
        assert_eq!(Opcode::GetLex.encoded_len(), 8);
        assert_eq!(Opcode::IfI.encoded_len(), 8);
        assert!(Opcode::SpGuardConc.is_specialized_only());
        assert!(!Opcode::DispatchO.is_specialized_only());
    }
}
