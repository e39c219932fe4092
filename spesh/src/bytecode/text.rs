//! A textual assembler and disassembler for bytecode, used for diagnostics and for writing tests.
//!
//! The assembler accepts one directive, label, or instruction per line:
//!
//! ```text
//! .locals obj int
//! .lex $x
//! .callsite obj, int, :named=obj
//! .handler @start @end @goto 1
//! start:
//!   const_i64 r1, 5
//!   getlex r0, lex0^1
//!   if_i r1, @end
//! ```
//!
//! Operands are written as `r<n>` (registers), `lex<idx>[^<outers>]` (lexicals), integer and float
//! literals, `"..."` (strings), `T<n>` (types), `@<label>`, `cs<n>` (callsites) and `ss<n>` (spesh
//! slots). `#` starts a comment.

use super::{decode, Bytecode, Handler, OpKind, Opcode, RawOperand, RegKind, Writer};
use crate::{
    callsite::{ArgKind, CallsiteShape, TypeId},
    errors::SpeshError,
};
use std::{collections::HashMap, error::Error, fmt::Write as _, sync::Arc};

/// Assemble `src` into [Bytecode].
pub fn assemble(src: &str) -> Result<Bytecode, Box<dyn Error>> {
    let mut local_kinds = Vec::new();
    let mut lexical_names = Vec::new();
    let mut callsites = Vec::new();
    let mut handlers = Vec::new();
    // Pass 1: directives, label offsets, and the instruction lines to encode.
    let mut labels = HashMap::new();
    let mut insts = Vec::new();
    let mut pc = 0u32;
    for (i, line) in src.lines().enumerate() {
        let lineno = i + 1;
        let line = match line.find('#') {
            Some(x) => &line[..x],
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(".locals") {
            for k in rest.split_whitespace() {
                local_kinds.push(
                    k.parse::<RegKind>()
                        .map_err(|_| format!("line {lineno}: invalid register kind '{k}'"))?,
                );
            }
        } else if let Some(rest) = line.strip_prefix(".lex") {
            lexical_names.extend(rest.split_whitespace().map(Arc::<str>::from));
        } else if let Some(rest) = line.strip_prefix(".callsite") {
            callsites.push(Arc::new(parse_callsite(rest.trim(), lineno)?));
        } else if let Some(rest) = line.strip_prefix(".handler") {
            let parts = rest.split_whitespace().collect::<Vec<_>>();
            if parts.len() != 4 {
                return Err(format!("line {lineno}: .handler needs 3 labels and a category").into());
            }
            handlers.push((
                parts[0].to_owned(),
                parts[1].to_owned(),
                parts[2].to_owned(),
                parts[3].parse::<u32>()?,
            ));
        } else if let Some(label) = line.strip_suffix(':') {
            if labels.insert(label.to_owned(), pc).is_some() {
                return Err(format!("line {lineno}: duplicate label '{label}'").into());
            }
        } else {
            let (name, rest) = match line.split_once(char::is_whitespace) {
                Some((n, r)) => (n, r.trim()),
                None => (line, ""),
            };
            let op = name
                .parse::<Opcode>()
                .map_err(|_| format!("line {lineno}: unknown opcode '{name}'"))?;
            if op == Opcode::Phi {
                return Err(format!("line {lineno}: PHI cannot be assembled").into());
            }
            let operands = if rest.is_empty() {
                Vec::new()
            } else {
                split_operands(rest)
            };
            if operands.len() != op.operands().len() {
                return Err(format!(
                    "line {lineno}: {op} expects {} operands, got {}",
                    op.operands().len(),
                    operands.len()
                )
                .into());
            }
            insts.push((lineno, op, operands));
            pc += op.encoded_len();
        }
    }

    // Pass 2: encode.
    let mut strings: Vec<Arc<str>> = Vec::new();
    let mut w = Writer::new();
    let mut max_reg = None;
    for (lineno, op, operands) in insts {
        w.op(op);
        for (kind, s) in op.operands().iter().zip(operands.iter()) {
            let x = parse_operand(*kind, s, &labels, &mut strings)
                .map_err(|e| format!("line {lineno}: {e}"))?;
            if let RawOperand::Reg(r) = x {
                max_reg = max_reg.max(Some(r));
            }
            w.operand(x);
        }
    }
    if let Some(r) = max_reg {
        while local_kinds.len() <= usize::from(r) {
            local_kinds.push(RegKind::Obj);
        }
    }
    let label = |l: &str| -> Result<u32, Box<dyn Error>> {
        l.strip_prefix('@')
            .and_then(|l| labels.get(l))
            .copied()
            .ok_or_else(|| format!("unknown handler label '{l}'").into())
    };
    let handlers = handlers
        .iter()
        .map(|(s, e, g, category)| {
            Ok(Handler {
                start: label(s)?,
                end: label(e)?,
                goto: label(g)?,
                category: *category,
            })
        })
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;
    Ok(Bytecode {
        code: w.into_inner().into_boxed_slice(),
        local_kinds,
        lexical_names: Arc::from(lexical_names),
        strings,
        callsites,
        handlers,
    })
}

/// Split on commas that are not inside a string literal.
fn split_operands(s: &str) -> Vec<String> {
    let mut ops = Vec::new();
    let mut cur = String::new();
    let mut in_str = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_str = !in_str;
                cur.push(c);
            }
            ',' if !in_str => {
                ops.push(cur.trim().to_owned());
                cur.clear();
            }
            _ => cur.push(c),
        }
    }
    ops.push(cur.trim().to_owned());
    ops
}

fn parse_callsite(s: &str, lineno: usize) -> Result<CallsiteShape, Box<dyn Error>> {
    let mut args = Vec::new();
    let mut named = Vec::new();
    if s.is_empty() {
        return Ok(CallsiteShape { args, named });
    }
    for part in s.split(',').map(str::trim) {
        let (name, kind) = match part.strip_prefix(':') {
            Some(x) => match x.split_once('=') {
                Some((n, k)) => (Some(n), k),
                None => return Err(format!("line {lineno}: malformed named arg '{part}'").into()),
            },
            None => (None, part),
        };
        let kind = match kind {
            "obj" => ArgKind::Obj,
            "int" => ArgKind::Int,
            "num" => ArgKind::Num,
            "str" => ArgKind::Str,
            _ => return Err(format!("line {lineno}: invalid arg kind '{kind}'").into()),
        };
        match name {
            Some(n) => named.push(Arc::from(n)),
            None if !named.is_empty() => {
                return Err(
                    format!("line {lineno}: positional args must precede named args").into(),
                )
            }
            None => (),
        }
        args.push(kind);
    }
    Ok(CallsiteShape { args, named })
}

fn parse_num<T: std::str::FromStr>(s: &str, prefix: &str) -> Result<T, String> {
    s.strip_prefix(prefix)
        .and_then(|x| x.parse::<T>().ok())
        .ok_or_else(|| format!("expected {prefix}<n>, got '{s}'"))
}

fn parse_operand(
    kind: OpKind,
    s: &str,
    labels: &HashMap<String, u32>,
    strings: &mut Vec<Arc<str>>,
) -> Result<RawOperand, String> {
    let int = |s: &str| s.parse::<i64>().map_err(|e| format!("'{s}': {e}"));
    Ok(match kind {
        OpKind::ReadReg | OpKind::WriteReg => RawOperand::Reg(parse_num(s, "r")?),
        OpKind::ReadLex | OpKind::WriteLex => {
            let (idx, outers) = match s.split_once('^') {
                Some((i, o)) => (i, o.parse::<u16>().map_err(|e| e.to_string())?),
                None => (s, 0),
            };
            RawOperand::Lex {
                idx: parse_num(idx, "lex")?,
                outers,
            }
        }
        OpKind::LitI16 => {
            RawOperand::I16(i16::try_from(int(s)?).map_err(|e| format!("'{s}': {e}"))?)
        }
        OpKind::LitI64 => RawOperand::I64(int(s)?),
        OpKind::LitU32 => {
            RawOperand::U32(u32::try_from(int(s)?).map_err(|e| format!("'{s}': {e}"))?)
        }
        OpKind::LitN64 => RawOperand::N64(s.parse::<f64>().map_err(|e| format!("'{s}': {e}"))?),
        OpKind::LitStr => {
            let body = s
                .strip_prefix('"')
                .and_then(|x| x.strip_suffix('"'))
                .ok_or_else(|| format!("expected string literal, got '{s}'"))?;
            let idx = match strings.iter().position(|x| &**x == body) {
                Some(x) => x,
                None => {
                    strings.push(Arc::from(body));
                    strings.len() - 1
                }
            };
            RawOperand::Str(idx as u32)
        }
        OpKind::LitType => RawOperand::Type(TypeId(parse_num(s, "T")?)),
        OpKind::Label => {
            let l = s
                .strip_prefix('@')
                .ok_or_else(|| format!("expected label, got '{s}'"))?;
            RawOperand::Label(
                *labels
                    .get(l)
                    .ok_or_else(|| format!("unknown label '{l}'"))?,
            )
        }
        OpKind::Callsite => RawOperand::Callsite(parse_num(s, "cs")?),
        OpKind::Slot => RawOperand::Slot(parse_num(s, "ss")?),
    })
}

/// Format a single raw operand the way the assembler accepts it (labels become `@<offset>`).
pub(crate) fn operand_to_string(x: &RawOperand, strings: &[Arc<str>]) -> String {
    match x {
        RawOperand::Reg(r) => format!("r{r}"),
        RawOperand::Lex { idx, outers: 0 } => format!("lex{idx}"),
        RawOperand::Lex { idx, outers } => format!("lex{idx}^{outers}"),
        RawOperand::I16(v) => v.to_string(),
        RawOperand::I64(v) => v.to_string(),
        RawOperand::N64(v) => format!("{v:?}"),
        RawOperand::Str(i) => match strings.get(*i as usize) {
            Some(s) => format!("\"{s}\""),
            None => format!("s{i}"),
        },
        RawOperand::Type(t) => t.to_string(),
        RawOperand::U32(v) => v.to_string(),
        RawOperand::Label(v) => format!("@{v}"),
        RawOperand::Callsite(v) => format!("cs{v}"),
        RawOperand::Slot(v) => format!("ss{v}"),
    }
}

/// Disassemble `code`, one instruction per line prefixed by its offset.
pub fn disassemble(code: &[u8], strings: &[Arc<str>]) -> Result<String, SpeshError> {
    let mut out = String::new();
    for inst in decode(code)? {
        let ops = inst
            .operands
            .iter()
            .map(|x| operand_to_string(x, strings))
            .collect::<Vec<_>>();
        if ops.is_empty() {
            writeln!(out, "{:04}: {}", inst.offset, inst.op).ok();
        } else {
            writeln!(out, "{:04}: {} {}", inst.offset, inst.op, ops.join(", ")).ok();
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use fm::FMBuilder;

    #[test]
    fn assemble_and_disassemble() {
        let bc = assemble(
            "
            .locals int obj
            .lex $x
            .callsite obj, :k=int
            .handler @a @b @b 4
            a:
              const_i64 r0, 5   # a comment
              getlex r1, lex0^1
              if_i r0, @b
              const_s r1, \"hi, there\"
            b:
              return_o r1
            ",
        )
        .unwrap();
        assert_eq!(bc.local_kinds, vec![RegKind::Int, RegKind::Obj]);
        assert_eq!(&*bc.lexical_names[0], "$x");
        assert_eq!(bc.callsites[0].to_string(), "(obj, :k(int))");
        assert_eq!(
            bc.handlers,
            vec![Handler {
                start: 0,
                end: 36,
                goto: 36,
                category: 4
            }]
        );
        let s = disassemble(&bc.code, &bc.strings).unwrap();
        let fmm = FMBuilder::new(
            "
            0000: const_i64 r0, 5
            0012: getlex r1, lex0^1
            0020: if_i r0, @36
            0028: const_s r1, \"hi, there\"
            0036: return_o r1
            ",
        )
        .unwrap()
        .build()
        .unwrap();
        if let Err(e) = fmm.matches(&s) {
            panic!("{e}");
        }
    }

    #[test]
    fn assemble_errors() {
        assert!(assemble("frob r0").is_err());
        assert!(assemble("goto @nowhere").is_err());
        assert!(assemble("const_i64 r0").is_err());
        assert!(assemble("a:\na:\n").is_err());
    }
}
