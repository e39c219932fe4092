//! Encoding and decoding of individual instructions.

use super::{OpKind, Opcode};
use crate::{callsite::TypeId, errors::SpeshError};
use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;

/// An operand as it appears in encoded bytecode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RawOperand {
    Reg(u16),
    Lex { idx: u16, outers: u16 },
    I16(i16),
    I64(i64),
    N64(f64),
    Str(u32),
    Type(TypeId),
    U32(u32),
    Label(u32),
    Callsite(u16),
    Slot(u16),
}

/// One decoded instruction.
#[derive(Clone, Debug)]
pub struct DecodedInst {
    pub offset: u32,
    pub op: Opcode,
    pub operands: SmallVec<[RawOperand; 4]>,
}

impl DecodedInst {
    /// The offset of the instruction following this one.
    pub fn next_offset(&self) -> u32 {
        self.offset + self.op.encoded_len()
    }
}

/// Decode every instruction in `code`.
pub fn decode(code: &[u8]) -> Result<Vec<DecodedInst>, SpeshError> {
    let mut insts = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let offset = u32::try_from(pc).map_err(|_| SpeshError::InvalidBytecode {
            offset: u32::MAX,
            msg: "bytecode too long".into(),
        })?;
        let err = |msg: &str| SpeshError::InvalidBytecode {
            offset,
            msg: msg.to_owned(),
        };
        let raw = read(code, pc, 2).ok_or_else(|| err("truncated opcode"))?;
        let op = match Opcode::from_repr(LittleEndian::read_u16(raw)) {
            Some(Opcode::Phi) | None => return Err(err("unknown opcode")),
            Some(x) => x,
        };
        pc += 2;
        let mut operands = SmallVec::new();
        for kind in op.operands() {
            let b = read(code, pc, kind.width() as usize)
                .ok_or_else(|| err(&format!("truncated operand for {op}")))?;
            operands.push(match kind {
                OpKind::ReadReg | OpKind::WriteReg => RawOperand::Reg(LittleEndian::read_u16(b)),
                OpKind::ReadLex | OpKind::WriteLex => RawOperand::Lex {
                    idx: LittleEndian::read_u16(&b[..2]),
                    outers: LittleEndian::read_u16(&b[2..]),
                },
                OpKind::LitI16 => RawOperand::I16(LittleEndian::read_i16(b)),
                OpKind::LitI64 => RawOperand::I64(LittleEndian::read_i64(b)),
                OpKind::LitN64 => RawOperand::N64(LittleEndian::read_f64(b)),
                OpKind::LitStr => RawOperand::Str(LittleEndian::read_u32(b)),
                OpKind::LitType => RawOperand::Type(TypeId(LittleEndian::read_u32(b))),
                OpKind::LitU32 => RawOperand::U32(LittleEndian::read_u32(b)),
                OpKind::Label => RawOperand::Label(LittleEndian::read_u32(b)),
                OpKind::Callsite => RawOperand::Callsite(LittleEndian::read_u16(b)),
                OpKind::Slot => RawOperand::Slot(LittleEndian::read_u16(b)),
            });
            pc += kind.width() as usize;
        }
        insts.push(DecodedInst {
            offset,
            op,
            operands,
        });
    }
    Ok(insts)
}

fn read(code: &[u8], at: usize, len: usize) -> Option<&[u8]> {
    code.get(at..at.checked_add(len)?)
}

/// An append-only bytecode buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The offset at which the next byte will be written.
    pub fn pos(&self) -> u32 {
        // Bytecode offsets are `u32`s throughout: buffers this large are rejected long before
        // code generation.
        self.buf.len() as u32
    }

    fn grow(&mut self, n: usize) -> &mut [u8] {
        let at = self.buf.len();
        self.buf.resize(at + n, 0);
        &mut self.buf[at..]
    }

    pub fn op(&mut self, op: Opcode) {
        self.u16(op as u16);
    }

    pub fn u16(&mut self, v: u16) {
        LittleEndian::write_u16(self.grow(2), v);
    }

    pub fn i16(&mut self, v: i16) {
        LittleEndian::write_i16(self.grow(2), v);
    }

    pub fn u32(&mut self, v: u32) {
        LittleEndian::write_u32(self.grow(4), v);
    }

    pub fn i64(&mut self, v: i64) {
        LittleEndian::write_i64(self.grow(8), v);
    }

    pub fn n64(&mut self, v: f64) {
        LittleEndian::write_f64(self.grow(8), v);
    }

    /// Encode a single raw operand.
    pub fn operand(&mut self, x: RawOperand) {
        match x {
            RawOperand::Reg(r) => self.u16(r),
            RawOperand::Lex { idx, outers } => {
                self.u16(idx);
                self.u16(outers);
            }
            RawOperand::I16(v) => self.i16(v),
            RawOperand::I64(v) => self.i64(v),
            RawOperand::N64(v) => self.n64(v),
            RawOperand::Str(v) | RawOperand::U32(v) | RawOperand::Label(v) => self.u32(v),
            RawOperand::Type(t) => self.u32(t.0),
            RawOperand::Callsite(v) | RawOperand::Slot(v) => self.u16(v),
        }
    }

    /// Overwrite the `u32` at `at`, which must already have been written.
    pub fn patch_u32(&mut self, at: u32, v: u32) {
        let at = at as usize;
        LittleEndian::write_u32(&mut self.buf[at..at + 4], v);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truncated() {
        let mut w = Writer::new();
        w.op(Opcode::ConstI64);
        w.u16(0);
        w.u32(7);
        match decode(&w.into_inner()) {
            Err(SpeshError::InvalidBytecode { offset: 0, msg }) => {
                assert_eq!(msg, "truncated operand for const_i64")
            }
            x => panic!("{x:?}"),
        }
        match decode(&[0xff, 0xff]) {
            Err(SpeshError::InvalidBytecode { offset: 0, .. }) => (),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn decode_operands() {
        let mut w = Writer::new();
        w.op(Opcode::GetLex);
        w.operand(RawOperand::Reg(3));
        w.operand(RawOperand::Lex { idx: 1, outers: 2 });
        w.op(Opcode::ConstN64);
        w.operand(RawOperand::Reg(4));
        w.operand(RawOperand::N64(1.5));
        let insts = decode(&w.into_inner()).unwrap();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[1].offset, 8);
        assert_eq!(
            insts[0].operands.as_slice(),
            &[RawOperand::Reg(3), RawOperand::Lex { idx: 1, outers: 2 }]
        );
        assert_eq!(insts[1].operands[1], RawOperand::N64(1.5));
        assert_eq!(insts[1].next_offset(), 20);
    }
}
