use std::fmt;
use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::ty::BType;

pub const MAGIC: [u8; 4] = *b"RCCO";
pub const VERSION: u32 = 1;

/// Binary operators of the stack machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Bop {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Uop {
    Neg,
    Not,
    Lnot,
}

/// One stack-machine operation.
///
/// The value stack holds word-sized items.  `Deref`/`Assign` move
/// `BType::size` bytes between the stack and byte-addressed memory,
/// extending by signedness on the way in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Push an immediate.
    Num(i64),
    /// Push the address of a symbol.
    Sym(u32),
    /// Push the address of the frame slot at the given offset.
    Loc(i64),
    /// Pop two, push the result.  `signed` selects the signed flavor of
    /// division, remainder, right shift and comparisons.
    Bop { op: Bop, signed: bool },
    Uop(Uop),
    /// Re-extend the top of stack at the given width.
    Cast(BType),
    /// Pop an address, push the loaded value.
    Deref(BType),
    /// Pop a value, pop an address, store, push the value back.
    Assign(BType),
    /// Pop a length and a source address; the destination below stays.
    Memcpy,
    /// Pop a length and a byte value; the destination below stays.
    Memset,
    /// Pop `argc` arguments and then the callee address; push the
    /// return value, re-extended at `ret`.
    Call { argc: u16, ret: BType },
    /// Pop the return value when `true`; leave the function.
    Ret(bool),
    Label(u32),
    Jmp(u32),
    /// Pop the condition; jump when zero.
    Jz(u32),
    /// Pop the condition; jump when nonzero.
    Jnz(u32),
    /// Swap the two topmost values.
    Swap,
    /// Duplicate the top value.
    Copy,
    /// Pop and discard the topmost values.
    Drop(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SymKind {
    /// Referenced but never defined (externs).
    Und,
    Func,
    Data,
    Bss,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjSym {
    pub name: String,
    pub kind: SymKind,
    /// Visible outside the translation unit (not `static`).
    pub global: bool,
    /// Data/BSS section offset, or function-table index.
    pub addr: i64,
    pub size: i64,
}

/// A word-sized patch: the symbol's final address plus `addend` is
/// written into the data section at `off`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Reloc {
    pub off: i64,
    pub sym: u32,
    pub addend: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FuncBody {
    pub sym: u32,
    pub argc: u16,
    pub varg: bool,
    /// Bytes of stack frame to reserve; the first `argc` words hold the
    /// arguments.
    pub frame_size: i64,
    pub ops: Vec<Op>,
}

/// A compiled translation unit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Object {
    pub syms: Vec<ObjSym>,
    pub data: Vec<u8>,
    pub bss_size: i64,
    pub relocs: Vec<Reloc>,
    pub funcs: Vec<FuncBody>,
}

impl Object {
    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        bincode::serialize_into(w, self).context("serializing object")?;
        Ok(())
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            bail!("not an rcc object file");
        }
        let mut ver = [0u8; 4];
        r.read_exact(&mut ver)?;
        let ver = u32::from_le_bytes(ver);
        if ver != VERSION {
            bail!("unsupported object version {ver}");
        }
        bincode::deserialize_from(r).context("deserializing object")
    }

    pub fn sym_by_name(&self, name: &str) -> Option<(u32, &ObjSym)> {
        self.syms
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
            .map(|(i, s)| (i as u32, s))
    }
}

/// Evaluate a binary operator the way the machine does, or `None` when
/// the result is undefined (division by zero).  Shared by the constant
/// folder and the interpreter so the two can never disagree.
pub fn bop_eval(op: Bop, signed: bool, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        Bop::Add => a.wrapping_add(b),
        Bop::Sub => a.wrapping_sub(b),
        Bop::Mul => a.wrapping_mul(b),
        Bop::Div => {
            if b == 0 {
                return None;
            }
            if signed {
                a.wrapping_div(b)
            } else {
                ((a as u64) / (b as u64)) as i64
            }
        }
        Bop::Mod => {
            if b == 0 {
                return None;
            }
            if signed {
                a.wrapping_rem(b)
            } else {
                ((a as u64) % (b as u64)) as i64
            }
        }
        Bop::And => a & b,
        Bop::Or => a | b,
        Bop::Xor => a ^ b,
        Bop::Shl => a.wrapping_shl(b as u32),
        Bop::Shr => {
            if signed {
                a.wrapping_shr(b as u32)
            } else {
                ((a as u64).wrapping_shr(b as u32)) as i64
            }
        }
        Bop::Lt => cmp(signed, a, b, |o| o.is_lt()),
        Bop::Gt => cmp(signed, a, b, |o| o.is_gt()),
        Bop::Le => cmp(signed, a, b, |o| o.is_le()),
        Bop::Ge => cmp(signed, a, b, |o| o.is_ge()),
        Bop::Eq => (a == b) as i64,
        Bop::Ne => (a != b) as i64,
    })
}

fn cmp(signed: bool, a: i64, b: i64, f: impl Fn(std::cmp::Ordering) -> bool) -> i64 {
    let ord = if signed {
        a.cmp(&b)
    } else {
        (a as u64).cmp(&(b as u64))
    };
    f(ord) as i64
}

pub fn uop_eval(op: Uop, a: i64) -> i64 {
    match op {
        Uop::Neg => a.wrapping_neg(),
        Uop::Not => !a,
        Uop::Lnot => (a == 0) as i64,
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Num(n) => write!(f, "num {n}"),
            Op::Sym(s) => write!(f, "sym @{s}"),
            Op::Loc(o) => write!(f, "loc {o}"),
            Op::Bop { op, signed } => {
                write!(f, "{:?}{}", op, if *signed { ".s" } else { "" })
            }
            Op::Uop(op) => write!(f, "{op:?}"),
            Op::Cast(bt) => write!(f, "cast {}{}", if bt.signed { "i" } else { "u" }, bt.size),
            Op::Deref(bt) => write!(f, "deref {}{}", if bt.signed { "i" } else { "u" }, bt.size),
            Op::Assign(bt) => write!(f, "store {}{}", if bt.signed { "i" } else { "u" }, bt.size),
            Op::Memcpy => write!(f, "memcpy"),
            Op::Memset => write!(f, "memset"),
            Op::Call { argc, ret } => write!(f, "call/{argc} -> {}{}", if ret.signed { "i" } else { "u" }, ret.size),
            Op::Ret(v) => write!(f, "ret{}", if *v { " val" } else { "" }),
            Op::Label(l) => write!(f, "L{l}:"),
            Op::Jmp(l) => write!(f, "jmp L{l}"),
            Op::Jz(l) => write!(f, "jz L{l}"),
            Op::Jnz(l) => write!(f, "jnz L{l}"),
            Op::Swap => write!(f, "swap"),
            Op::Copy => write!(f, "copy"),
            Op::Drop(n) => write!(f, "drop {n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_division_differs() {
        assert_eq!(bop_eval(Bop::Div, true, -6, 2), Some(-3));
        assert_eq!(bop_eval(Bop::Div, false, -6, 2), Some(((-6i64) as u64 / 2) as i64));
        assert_eq!(bop_eval(Bop::Div, true, 1, 0), None);
    }

    #[test]
    fn comparisons_respect_sign() {
        assert_eq!(bop_eval(Bop::Lt, true, -1, 1), Some(1));
        assert_eq!(bop_eval(Bop::Lt, false, -1, 1), Some(0));
    }

    #[test]
    fn operator_codes_are_stable() {
        // the on-disk encoding leans on these discriminants
        assert_eq!(u8::from(Bop::Add), 0);
        assert_eq!(u8::from(Bop::Ne), 15);
        assert_eq!(Bop::try_from(5u8).unwrap(), Bop::Or);
        assert!(Bop::try_from(16u8).is_err());
        assert_eq!(SymKind::try_from(2u8).unwrap(), SymKind::Data);
        assert_eq!(u8::from(Uop::Lnot), 2);
    }

    #[test]
    fn object_round_trip() {
        let obj = Object {
            syms: vec![ObjSym {
                name: "main".into(),
                kind: SymKind::Func,
                global: true,
                addr: 0,
                size: 0,
            }],
            data: vec![1, 2, 3],
            bss_size: 16,
            relocs: vec![Reloc { off: 0, sym: 0, addend: 4 }],
            funcs: vec![FuncBody {
                sym: 0,
                argc: 0,
                varg: false,
                frame_size: 8,
                ops: vec![Op::Num(14), Op::Ret(true)],
            }],
        };
        let mut buf = Vec::new();
        obj.write(&mut buf).unwrap();
        let back = Object::read(&mut buf.as_slice()).unwrap();
        assert_eq!(back.syms[0].name, "main");
        assert_eq!(back.funcs[0].ops, obj.funcs[0].ops);
        assert_eq!(back.bss_size, 16);
        assert_eq!(back.funcs[0].ops[0].to_string(), "num 14");
    }
}
