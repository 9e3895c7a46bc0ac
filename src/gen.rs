use std::collections::HashMap;
use std::mem;

use anyhow::{bail, Result};

use crate::obj::{bop_eval, uop_eval, Bop, FuncBody, Object, ObjSym, Op, Reloc, SymKind, Uop};
use crate::ty::{BType, LONGSZ};

/// Compile-time knowledge about one value-stack entry.
#[derive(Clone, Copy, Debug)]
enum Val {
    /// A folded integer constant.
    Con(i64),
    /// The address of a symbol plus a byte offset.
    Sym { id: u32, off: i64 },
    /// The address of a frame slot.
    Loc(i64),
    /// Anything only the running program knows.
    Tmp,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    val: Val,
    /// Index into `ops` where this value's computation starts, when the
    /// tail of the stream still holds it and nothing else has run since.
    /// `removable` re-verifies before any truncation.
    pos: Option<usize>,
}

struct CurFunc {
    sym: u32,
    argc: u16,
    varg: bool,
}

/// The code generator.
///
/// Ops are emitted eagerly, so the runtime stack always mirrors the
/// virtual `stack` here one-for-one.  Constant folding works backwards:
/// when an operation's inputs are folded constants whose ops still sit
/// at the tail of the stream, the tail is truncated and replaced.
/// `popnum` succeeds exactly when the top of stack is such a constant.
#[derive(Default)]
pub struct Gen {
    syms: Vec<ObjSym>,
    sym_ids: HashMap<String, u32>,
    data: Vec<u8>,
    bss: i64,
    relocs: Vec<Reloc>,
    funcs: Vec<FuncBody>,

    ops: Vec<Op>,
    stack: Vec<Slot>,
    frame_cur: i64,
    frame_max: i64,
    cur: Option<CurFunc>,
    pass1_ops: Vec<Op>,
    pass1_frame: i64,
}

/// Net stack effect of ops that are safe to delete from the tail;
/// `None` marks ops with control-flow or memory side effects.
fn pure_net(op: &Op) -> Option<i64> {
    Some(match op {
        Op::Num(_) | Op::Sym(_) | Op::Loc(_) | Op::Copy => 1,
        Op::Uop(_) | Op::Cast(_) | Op::Swap => 0,
        Op::Bop { .. } => -1,
        Op::Drop(n) => -(*n as i64),
        _ => return None,
    })
}

fn word_align(n: i64) -> i64 {
    (n + LONGSZ as i64 - 1) & !(LONGSZ as i64 - 1)
}

impl Gen {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- symbols ------------------------------------------------------

    fn sym_id(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.sym_ids.get(name) {
            return id;
        }
        let id = self.syms.len() as u32;
        self.syms.push(ObjSym {
            name: name.to_string(),
            kind: SymKind::Und,
            global: true,
            addr: 0,
            size: 0,
        });
        self.sym_ids.insert(name.to_string(), id);
        id
    }

    // ---- virtual stack helpers ---------------------------------------

    fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn pop_slot(&mut self) -> Slot {
        self.stack.pop().expect("value stack underflow")
    }

    /// Check whether the top `n` values can be erased from the stream:
    /// every op from the earliest of their positions must be pure and
    /// together they must have produced exactly those `n` values.
    fn removable(&self, n: usize) -> Option<usize> {
        if self.stack.len() < n {
            return None;
        }
        let mut earliest = self.ops.len();
        for s in &self.stack[self.stack.len() - n..] {
            earliest = earliest.min(s.pos?);
        }
        let mut net: i64 = 0;
        for op in &self.ops[earliest..] {
            net += pure_net(op)?;
        }
        (net == n as i64).then_some(earliest)
    }

    // ---- literals and names ------------------------------------------

    pub fn num(&mut self, n: i64) {
        let pos = self.ops.len();
        self.emit(Op::Num(n));
        self.stack.push(Slot { val: Val::Con(n), pos: Some(pos) });
    }

    pub fn sym(&mut self, name: &str) {
        let id = self.sym_id(name);
        let pos = self.ops.len();
        self.emit(Op::Sym(id));
        self.stack.push(Slot { val: Val::Sym { id, off: 0 }, pos: Some(pos) });
    }

    pub fn local(&mut self, addr: i64) {
        let pos = self.ops.len();
        self.emit(Op::Loc(addr));
        self.stack.push(Slot { val: Val::Loc(addr), pos: Some(pos) });
    }

    // ---- operators ----------------------------------------------------

    pub fn bop(&mut self, op: Bop, signed: bool) {
        let rm = self.removable(2);
        let b = self.pop_slot();
        let a = self.pop_slot();
        let val = match (a.val, b.val) {
            (Val::Con(x), Val::Con(y)) => match bop_eval(op, signed, x, y) {
                Some(v) => {
                    if let Some(at) = rm {
                        self.ops.truncate(at);
                        self.num(v);
                        return;
                    }
                    Val::Con(v)
                }
                None => Val::Tmp,
            },
            // address arithmetic stays symbolic so that global
            // initializers like `&arr[1]` can become relocations
            (Val::Sym { id, off }, Val::Con(y)) if op == Bop::Add => Val::Sym { id, off: off + y },
            (Val::Sym { id, off }, Val::Con(y)) if op == Bop::Sub => Val::Sym { id, off: off - y },
            (Val::Con(x), Val::Sym { id, off }) if op == Bop::Add => Val::Sym { id, off: off + x },
            (Val::Loc(x), Val::Con(y)) if op == Bop::Add => Val::Loc(x + y),
            (Val::Loc(x), Val::Con(y)) if op == Bop::Sub => Val::Loc(x - y),
            (Val::Con(x), Val::Loc(y)) if op == Bop::Add => Val::Loc(x + y),
            _ => Val::Tmp,
        };
        self.emit(Op::Bop { op, signed });
        self.stack.push(Slot { val, pos: rm });
    }

    pub fn uop(&mut self, op: Uop) {
        let rm = self.removable(1);
        let a = self.pop_slot();
        if let Val::Con(x) = a.val {
            let v = uop_eval(op, x);
            if let Some(at) = rm {
                self.ops.truncate(at);
                self.num(v);
                return;
            }
            self.emit(Op::Uop(op));
            self.stack.push(Slot { val: Val::Con(v), pos: None });
            return;
        }
        self.emit(Op::Uop(op));
        self.stack.push(Slot { val: Val::Tmp, pos: rm });
    }

    pub fn cast(&mut self, bt: BType) {
        if bt.is_void() {
            return;
        }
        let rm = self.removable(1);
        let a = self.pop_slot();
        if let Val::Con(x) = a.val {
            let v = bt.wrap(x);
            if let Some(at) = rm {
                self.ops.truncate(at);
                self.num(v);
                return;
            }
            self.emit(Op::Cast(bt));
            self.stack.push(Slot { val: Val::Con(v), pos: None });
            return;
        }
        self.emit(Op::Cast(bt));
        self.stack.push(Slot { val: Val::Tmp, pos: rm });
    }

    pub fn deref(&mut self, bt: BType) {
        self.pop_slot();
        self.emit(Op::Deref(bt));
        self.stack.push(Slot { val: Val::Tmp, pos: None });
    }

    pub fn assign(&mut self, bt: BType) {
        let v = self.pop_slot();
        self.pop_slot();
        self.emit(Op::Assign(bt));
        self.stack.push(Slot { val: v.val, pos: None });
    }

    /// Force the top of stack into a plain runtime value.  Emission is
    /// eager here, so the value is already materialized.
    pub fn load(&mut self) {}

    pub fn memcpy(&mut self) {
        self.pop_slot();
        self.pop_slot();
        self.emit(Op::Memcpy);
    }

    pub fn memset(&mut self) {
        self.pop_slot();
        self.pop_slot();
        self.emit(Op::Memset);
    }

    // ---- stack shuffling ---------------------------------------------

    pub fn tmpcopy(&mut self) {
        let top = *self.stack.last().expect("value stack underflow");
        let pos = self.ops.len();
        self.emit(Op::Copy);
        self.stack.push(Slot { val: top.val, pos: Some(pos) });
    }

    pub fn tmpswap(&mut self) {
        self.emit(Op::Swap);
        let n = self.stack.len();
        self.stack.swap(n - 1, n - 2);
    }

    /// Drop `n` values, or all of them when `n` is negative.
    pub fn tmpdrop(&mut self, n: i32) {
        let mut n = if n < 0 { self.stack.len() } else { n as usize };
        while n > 0 {
            match self.removable(1) {
                Some(at) => {
                    self.ops.truncate(at);
                    self.stack.pop();
                    n -= 1;
                }
                None => break,
            }
        }
        if n > 0 {
            for _ in 0..n {
                self.pop_slot();
            }
            self.emit(Op::Drop(n as u16));
        }
    }

    // ---- control flow -------------------------------------------------

    pub fn label(&mut self, id: u32) {
        self.emit(Op::Label(id));
    }

    pub fn jmp(&mut self, id: u32) {
        self.emit(Op::Jmp(id));
    }

    pub fn jz(&mut self, id: u32) {
        self.cjmp(id, true);
    }

    pub fn jnz(&mut self, id: u32) {
        self.cjmp(id, false);
    }

    fn cjmp(&mut self, id: u32, when_zero: bool) {
        let rm = self.removable(1);
        let a = self.pop_slot();
        if let Val::Con(v) = a.val {
            match rm {
                Some(at) => self.ops.truncate(at),
                None => self.emit(Op::Drop(1)),
            }
            if (v == 0) == when_zero {
                self.emit(Op::Jmp(id));
            }
            return;
        }
        self.emit(if when_zero { Op::Jz(id) } else { Op::Jnz(id) });
    }

    /// Open a phi region.  Each branch computes a value and announces it
    /// with `forkpush`; `forkjoin` reconciles the branches into one
    /// top-of-stack entry.
    pub fn fork(&mut self) {}

    pub fn forkpush(&mut self) {
        // the branch's value stays on the runtime stack for the join
        self.pop_slot();
    }

    pub fn forkjoin(&mut self) {
        self.stack.push(Slot { val: Val::Tmp, pos: None });
    }

    // ---- calls and functions -----------------------------------------

    pub fn call(&mut self, argc: usize, ret: BType) {
        for _ in 0..argc {
            self.pop_slot();
        }
        self.pop_slot(); // callee address
        self.emit(Op::Call { argc: argc as u16, ret });
        self.stack.push(Slot { val: Val::Tmp, pos: None });
    }

    pub fn ret(&mut self, has_value: bool) {
        if has_value {
            self.pop_slot();
        }
        self.emit(Op::Ret(has_value));
    }

    pub fn func_beg(&mut self, name: &str, argc: usize, global: bool, varg: bool) {
        let id = self.sym_id(name);
        self.syms[id as usize].kind = SymKind::Func;
        self.syms[id as usize].global = global;
        self.cur = Some(CurFunc { sym: id, argc: argc as u16, varg });
        self.ops.clear();
        self.stack.clear();
        self.pass1_ops.clear();
        self.frame_cur = argc as i64 * LONGSZ as i64;
        self.frame_max = self.frame_cur;
    }

    /// First pass: run the whole machinery to collect frame statistics,
    /// then throw the stream away in `pass2`.
    pub fn pass1(&mut self) {}

    pub fn pass2(&mut self) {
        self.pass1_ops = mem::take(&mut self.ops);
        self.pass1_frame = self.frame_max;
        self.stack.clear();
        let argc = self.cur.as_ref().map(|c| c.argc).unwrap_or(0);
        self.frame_cur = argc as i64 * LONGSZ as i64;
        self.frame_max = self.frame_cur;
    }

    pub fn func_end(&mut self) -> Result<()> {
        let cur = self.cur.take().expect("func_end without func_beg");
        let name = self.syms[cur.sym as usize].name.clone();
        // both passes must make the same sequence of logical operations;
        // symbol ids may differ (string literals are re-created), so
        // compare shape, not payload
        if self.pass1_ops.len() != self.ops.len()
            || !self
                .pass1_ops
                .iter()
                .zip(self.ops.iter())
                .all(|(a, b)| mem::discriminant(a) == mem::discriminant(b))
        {
            bail!("emission passes disagree in <{name}>");
        }
        if self.pass1_frame != self.frame_max {
            bail!("frame layout differs between passes in <{name}>");
        }
        let idx = self.funcs.len() as i64;
        self.syms[cur.sym as usize].addr = idx;
        self.funcs.push(FuncBody {
            sym: cur.sym,
            argc: cur.argc,
            varg: cur.varg,
            frame_size: word_align(self.frame_max),
            ops: mem::take(&mut self.ops),
        });
        self.pass1_ops.clear();
        Ok(())
    }

    // ---- locals -------------------------------------------------------

    pub fn mklocal(&mut self, size: i64) -> i64 {
        let off = word_align(self.frame_cur);
        self.frame_cur = off + size.max(1);
        self.frame_max = self.frame_max.max(self.frame_cur);
        off
    }

    pub fn rmlocal(&mut self, addr: i64, size: i64) {
        if self.frame_cur == addr + size {
            self.frame_cur = addr;
        }
    }

    pub fn arg2loc(&self, i: usize) -> i64 {
        i as i64 * LONGSZ as i64
    }

    // ---- constant folding interface ----------------------------------

    /// Pop the top of stack when it is a folded constant.
    pub fn popnum(&mut self) -> Option<i64> {
        let v = match self.stack.last()?.val {
            Val::Con(v) => v,
            _ => return None,
        };
        match self.removable(1) {
            Some(at) => self.ops.truncate(at),
            None => self.emit(Op::Drop(1)),
        }
        self.stack.pop();
        Some(v)
    }

    // ---- data and bss -------------------------------------------------

    /// Allocate initialized data-section space; idempotent per symbol so
    /// the second emission pass lands on the same storage.
    pub fn dsnew(&mut self, name: &str, size: i64, global: bool) -> i64 {
        let id = self.sym_id(name) as usize;
        if self.syms[id].kind == SymKind::Data {
            return self.syms[id].addr;
        }
        let addr = word_align(self.data.len() as i64);
        self.data.resize(addr as usize + size as usize, 0);
        let s = &mut self.syms[id];
        s.kind = SymKind::Data;
        s.global = global;
        s.addr = addr;
        s.size = size;
        addr
    }

    /// Copy literal bytes into the data section at `addr`.
    pub fn dscpy(&mut self, addr: i64, buf: &[u8]) {
        let at = addr as usize;
        self.data[at..at + buf.len()].copy_from_slice(buf);
    }

    /// Pop a folded value and poke it into `name`'s storage at `off`.
    /// Addresses of other symbols become relocations.
    pub fn dsset(&mut self, name: &str, off: i64, bt: BType) -> Result<()> {
        let rm = self.removable(1);
        let slot = self.pop_slot();
        match rm {
            Some(at) => self.ops.truncate(at),
            None => self.emit(Op::Drop(1)),
        }
        let id = self.sym_id(name) as usize;
        let at = self.syms[id].addr + off;
        match slot.val {
            Val::Con(v) => {
                let bytes = v.to_le_bytes();
                let n = bt.size.max(1) as usize;
                self.data[at as usize..at as usize + n].copy_from_slice(&bytes[..n]);
            }
            Val::Sym { id: sym, off: addend } => {
                self.relocs.push(Reloc { off: at, sym, addend });
            }
            _ => bail!("constant initializer expected for <{name}>"),
        }
        Ok(())
    }

    /// Reserve zero-initialized space; idempotent like `dsnew`.
    pub fn bsnew(&mut self, name: &str, size: i64, global: bool) {
        let id = self.sym_id(name) as usize;
        if self.syms[id].kind != SymKind::Und {
            return;
        }
        let addr = word_align(self.bss);
        self.bss = addr + size;
        let s = &mut self.syms[id];
        s.kind = SymKind::Bss;
        s.global = global;
        s.addr = addr;
        s.size = size;
    }

    // ---- output -------------------------------------------------------

    pub fn finish(self) -> Object {
        Object {
            syms: self.syms,
            data: self.data,
            bss_size: self.bss,
            relocs: self.relocs,
            funcs: self.funcs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_fold_away() {
        let mut g = Gen::new();
        g.num(2);
        g.num(3);
        g.bop(Bop::Mul, true);
        assert_eq!(g.popnum(), Some(6));
        assert!(g.ops.is_empty());
    }

    #[test]
    fn swapped_constants_still_fold() {
        let mut g = Gen::new();
        g.num(2);
        g.num(3);
        g.tmpswap();
        g.tmpswap();
        g.bop(Bop::Add, true);
        assert_eq!(g.popnum(), Some(5));
        assert!(g.ops.is_empty());
    }

    #[test]
    fn runtime_value_blocks_popnum() {
        let mut g = Gen::new();
        g.local(0);
        g.deref(BType::INT);
        assert_eq!(g.popnum(), None);
    }

    #[test]
    fn const_condition_collapses_jump() {
        let mut g = Gen::new();
        g.num(0);
        g.jz(7);
        assert_eq!(g.ops, vec![Op::Jmp(7)]);

        let mut g = Gen::new();
        g.num(1);
        g.jz(7);
        assert!(g.ops.is_empty());
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut g = Gen::new();
        g.num(1);
        g.num(0);
        g.bop(Bop::Div, true);
        assert_eq!(g.popnum(), None);
    }

    #[test]
    fn symbol_initializer_becomes_reloc() {
        let mut g = Gen::new();
        g.dsnew("p", 8, true);
        g.sym("msg");
        g.num(2);
        g.bop(Bop::Add, false);
        g.dsset("p", 0, BType::ULONG).unwrap();
        assert_eq!(g.relocs.len(), 1);
        assert_eq!(g.relocs[0].addend, 2);
        assert!(g.ops.is_empty());
    }

    #[test]
    fn runtime_global_initializer_is_an_error() {
        let mut g = Gen::new();
        g.dsnew("x", 4, true);
        g.local(0);
        g.deref(BType::INT);
        assert!(g.dsset("x", 0, BType::INT).is_err());
    }

    #[test]
    fn frame_layout_is_word_aligned() {
        let mut g = Gen::new();
        g.func_beg("f", 2, true, false);
        assert_eq!(g.arg2loc(1), 8);
        let a = g.mklocal(4);
        let b = g.mklocal(4);
        assert_eq!(a, 16);
        assert_eq!(b, 24);
        g.rmlocal(b, 4);
        assert_eq!(g.mklocal(8), 24);
    }

    #[test]
    fn two_pass_parity_enforced() {
        let mut g = Gen::new();
        g.func_beg("f", 0, true, false);
        g.pass1();
        g.num(1);
        g.ret(true);
        g.pass2();
        g.num(1);
        g.ret(true);
        g.func_end().unwrap();
        assert_eq!(g.funcs.len(), 1);
        assert_eq!(g.funcs[0].ops, vec![Op::Num(1), Op::Ret(true)]);

        let mut g = Gen::new();
        g.func_beg("g", 0, true, false);
        g.pass1();
        g.num(1);
        g.ret(true);
        g.pass2();
        g.ret(false);
        assert!(g.func_end().is_err());
    }
}
