use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

use crate::obj::{bop_eval, uop_eval, FuncBody, Object, Op, SymKind};
use crate::ty::BType;

// Address-space layout: the first page traps null dereferences, data
// and BSS follow, then the frame area.
const DATA_BASE: i64 = 0x1000;
const FUNC_BASE: i64 = 0x4000_0000;
const STACK_SIZE: usize = 1 << 20;
const MAX_DEPTH: usize = 256;

/// Interpreter for compiled objects.
///
/// Lays the data and BSS sections out in a flat byte memory, applies
/// relocations, and executes function op streams with a per-call value
/// stack.  Faults (bad addresses, undefined symbols, division by zero)
/// are reported as errors rather than silently corrupting the run.
pub struct Vm {
    obj: Object,
    mem: Vec<u8>,
    sym_addr: Vec<Option<i64>>,
    sp: i64,
    stack_top: i64,
    depth: usize,
}

impl Vm {
    pub fn new(obj: Object) -> Result<Self> {
        let data_end = DATA_BASE + obj.data.len() as i64;
        let bss_base = (data_end + 7) & !7;
        let stack_base = (bss_base + obj.bss_size + 7) & !7;
        let mut mem = vec![0u8; stack_base as usize + STACK_SIZE];
        mem[DATA_BASE as usize..data_end as usize].copy_from_slice(&obj.data);
        let sym_addr = obj
            .syms
            .iter()
            .map(|s| match s.kind {
                SymKind::Data => Some(DATA_BASE + s.addr),
                SymKind::Bss => Some(bss_base + s.addr),
                SymKind::Func => Some(FUNC_BASE + s.addr),
                SymKind::Und => None,
            })
            .collect::<Vec<_>>();
        let mut vm = Vm {
            obj,
            mem,
            sym_addr,
            sp: stack_base,
            stack_top: stack_base + STACK_SIZE as i64,
            depth: 0,
        };
        for r in vm.obj.relocs.clone() {
            let target = vm
                .sym_addr
                .get(r.sym as usize)
                .copied()
                .flatten()
                .ok_or_else(|| anyhow!("relocation against undefined symbol"))?;
            vm.write_mem(DATA_BASE + r.off, 8, target + r.addend)?;
        }
        Ok(vm)
    }

    /// Run a defined function by name and return its result.
    pub fn run(&mut self, name: &str, args: &[i64]) -> Result<i64> {
        let (_, sym) = self
            .obj
            .sym_by_name(name)
            .ok_or_else(|| anyhow!("no symbol <{name}>"))?;
        if sym.kind != SymKind::Func {
            bail!("<{name}> is not a function");
        }
        let idx = sym.addr as usize;
        self.call_fn(idx, args)
    }

    fn call_fn(&mut self, idx: usize, args: &[i64]) -> Result<i64> {
        if self.depth >= MAX_DEPTH {
            bail!("call depth exceeded");
        }
        let f = self
            .obj
            .funcs
            .get(idx)
            .cloned()
            .ok_or_else(|| anyhow!("bad function index {idx}"))?;
        let fp = self.sp;
        if fp + f.frame_size > self.stack_top {
            bail!("stack overflow");
        }
        self.depth += 1;
        self.sp = fp + f.frame_size;
        self.mem[fp as usize..self.sp as usize].fill(0);
        for (i, a) in args.iter().enumerate() {
            let off = i as i64 * 8;
            if off + 8 <= f.frame_size {
                self.write_mem(fp + off, 8, *a)?;
            }
        }
        let result = self.exec(&f, fp);
        self.sp = fp;
        self.depth -= 1;
        result
    }

    fn exec(&mut self, f: &FuncBody, fp: i64) -> Result<i64> {
        let labels: HashMap<u32, usize> = f
            .ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Op::Label(l) => Some((*l, i)),
                _ => None,
            })
            .collect();
        let jump = |l: &u32| -> Result<usize> {
            labels.get(l).copied().ok_or_else(|| anyhow!("missing label L{l}"))
        };
        let mut stack: Vec<i64> = Vec::new();
        let mut pc = 0usize;
        while pc < f.ops.len() {
            let op = f.ops[pc].clone();
            pc += 1;
            match op {
                Op::Num(n) => stack.push(n),
                Op::Sym(id) => {
                    let addr = self
                        .sym_addr
                        .get(id as usize)
                        .copied()
                        .flatten()
                        .ok_or_else(|| {
                            let name = self
                                .obj
                                .syms
                                .get(id as usize)
                                .map(|s| s.name.clone())
                                .unwrap_or_default();
                            anyhow!("undefined symbol <{name}>")
                        })?;
                    stack.push(addr);
                }
                Op::Loc(off) => stack.push(fp + off),
                Op::Bop { op, signed } => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    let v = bop_eval(op, signed, a, b)
                        .ok_or_else(|| anyhow!("division by zero"))?;
                    stack.push(v);
                }
                Op::Uop(u) => {
                    let a = pop(&mut stack)?;
                    stack.push(uop_eval(u, a));
                }
                Op::Cast(bt) => {
                    let a = pop(&mut stack)?;
                    stack.push(bt.wrap(a));
                }
                Op::Deref(bt) => {
                    let a = pop(&mut stack)?;
                    stack.push(self.read_mem(a, bt)?);
                }
                Op::Assign(bt) => {
                    let v = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    self.write_mem(a, bt.size.max(1), v)?;
                    stack.push(v);
                }
                Op::Memcpy => {
                    let len = pop(&mut stack)?;
                    let src = pop(&mut stack)?;
                    let dst = *stack.last().ok_or_else(|| anyhow!("value stack underflow"))?;
                    self.check_range(src, len)?;
                    self.check_range(dst, len)?;
                    self.mem
                        .copy_within(src as usize..(src + len) as usize, dst as usize);
                }
                Op::Memset => {
                    let len = pop(&mut stack)?;
                    let byte = pop(&mut stack)?;
                    let dst = *stack.last().ok_or_else(|| anyhow!("value stack underflow"))?;
                    self.check_range(dst, len)?;
                    self.mem[dst as usize..(dst + len) as usize].fill(byte as u8);
                }
                Op::Call { argc, ret } => {
                    let mut args = vec![0i64; argc as usize];
                    for a in args.iter_mut().rev() {
                        *a = pop(&mut stack)?;
                    }
                    let callee = pop(&mut stack)?;
                    let idx = callee - FUNC_BASE;
                    if idx < 0 || idx as usize >= self.obj.funcs.len() {
                        bail!("call through bad function address {callee:#x}");
                    }
                    let v = self.call_fn(idx as usize, &args)?;
                    stack.push(if ret.is_void() { 0 } else { ret.wrap(v) });
                }
                Op::Ret(has_value) => {
                    return if has_value { pop(&mut stack) } else { Ok(0) };
                }
                Op::Label(_) => (),
                Op::Jmp(l) => pc = jump(&l)?,
                Op::Jz(l) => {
                    if pop(&mut stack)? == 0 {
                        pc = jump(&l)?;
                    }
                }
                Op::Jnz(l) => {
                    if pop(&mut stack)? != 0 {
                        pc = jump(&l)?;
                    }
                }
                Op::Swap => {
                    let n = stack.len();
                    if n < 2 {
                        bail!("value stack underflow");
                    }
                    stack.swap(n - 1, n - 2);
                }
                Op::Copy => {
                    let v = *stack.last().ok_or_else(|| anyhow!("value stack underflow"))?;
                    stack.push(v);
                }
                Op::Drop(n) => {
                    if stack.len() < n as usize {
                        bail!("value stack underflow");
                    }
                    stack.truncate(stack.len() - n as usize);
                }
            }
        }
        // fell off the end of the body
        Ok(0)
    }

    fn check_range(&self, addr: i64, len: i64) -> Result<()> {
        if addr < DATA_BASE || len < 0 || (addr + len) as usize > self.mem.len() {
            bail!("bad memory access at {addr:#x}");
        }
        Ok(())
    }

    fn read_mem(&self, addr: i64, bt: BType) -> Result<i64> {
        let size = bt.size.max(1) as i64;
        self.check_range(addr, size)?;
        let mut bytes = [0u8; 8];
        bytes[..size as usize]
            .copy_from_slice(&self.mem[addr as usize..(addr + size) as usize]);
        let raw = i64::from_le_bytes(bytes);
        Ok(bt.wrap(raw))
    }

    fn write_mem(&mut self, addr: i64, size: u8, v: i64) -> Result<()> {
        self.check_range(addr, size as i64)?;
        let bytes = v.to_le_bytes();
        self.mem[addr as usize..addr as usize + size as usize]
            .copy_from_slice(&bytes[..size as usize]);
        Ok(())
    }
}

fn pop(stack: &mut Vec<i64>) -> Result<i64> {
    stack.pop().ok_or_else(|| anyhow!("value stack underflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{Bop, ObjSym, Reloc};

    fn func_obj(ops: Vec<Op>) -> Object {
        Object {
            syms: vec![ObjSym {
                name: "main".into(),
                kind: SymKind::Func,
                global: true,
                addr: 0,
                size: 0,
            }],
            data: Vec::new(),
            bss_size: 0,
            relocs: Vec::new(),
            funcs: vec![FuncBody { sym: 0, argc: 0, varg: false, frame_size: 16, ops }],
        }
    }

    #[test]
    fn arithmetic_and_return() {
        let obj = func_obj(vec![
            Op::Num(2),
            Op::Num(3),
            Op::Num(4),
            Op::Bop { op: Bop::Mul, signed: true },
            Op::Bop { op: Bop::Add, signed: true },
            Op::Ret(true),
        ]);
        let mut vm = Vm::new(obj).unwrap();
        assert_eq!(vm.run("main", &[]).unwrap(), 14);
    }

    #[test]
    fn locals_load_and_store() {
        let obj = func_obj(vec![
            Op::Loc(0),
            Op::Num(7),
            Op::Assign(BType::INT),
            Op::Drop(1),
            Op::Loc(0),
            Op::Deref(BType::INT),
            Op::Ret(true),
        ]);
        let mut vm = Vm::new(obj).unwrap();
        assert_eq!(vm.run("main", &[]).unwrap(), 7);
    }

    #[test]
    fn narrow_stores_sign_extend_on_load() {
        let obj = func_obj(vec![
            Op::Loc(0),
            Op::Num(0x1ff),
            Op::Assign(BType::CHAR),
            Op::Drop(1),
            Op::Loc(0),
            Op::Deref(BType::CHAR),
            Op::Ret(true),
        ]);
        let mut vm = Vm::new(obj).unwrap();
        assert_eq!(vm.run("main", &[]).unwrap(), -1);
    }

    #[test]
    fn relocations_patch_data_words() {
        let mut obj = func_obj(vec![
            Op::Sym(1),
            Op::Deref(BType::ULONG),
            Op::Deref(BType::CHAR),
            Op::Ret(true),
        ]);
        obj.syms.push(ObjSym {
            name: "p".into(),
            kind: SymKind::Data,
            global: true,
            addr: 0,
            size: 8,
        });
        obj.syms.push(ObjSym {
            name: "s".into(),
            kind: SymKind::Data,
            global: true,
            addr: 8,
            size: 3,
        });
        obj.data = vec![0, 0, 0, 0, 0, 0, 0, 0, b'h', b'i', 0];
        obj.relocs.push(Reloc { off: 0, sym: 2, addend: 1 });
        let mut vm = Vm::new(obj).unwrap();
        assert_eq!(vm.run("main", &[]).unwrap(), 'i' as i64);
    }

    #[test]
    fn null_dereference_faults() {
        let obj = func_obj(vec![Op::Num(0), Op::Deref(BType::INT), Op::Ret(true)]);
        let mut vm = Vm::new(obj).unwrap();
        assert!(vm.run("main", &[]).is_err());
    }
}
