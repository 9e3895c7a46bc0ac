use anyhow::Result;

use super::{Operand, Parser};
use crate::tok::Kind;
use crate::ty::{Name, Type, TypeKind};

/// The object an initializer writes into: a global's data-section
/// storage, or a local's stack slot.
#[derive(Clone, Debug)]
pub(crate) enum InitTarget {
    Global { name: Name },
    Local { addr: i64 },
}

impl Parser {
    /// Compute the length of an incomplete array from its initializer
    /// by scanning ahead and rewinding: a string's byte count, or the
    /// highest `[n] =` designator / element count of a braced list.
    pub(crate) fn init_size(&mut self) -> Result<i64> {
        let addr = self.toks.addr();
        let mut n: i64 = 0;
        if !self.toks.jmp(Kind::Assign) {
            return Ok(0);
        }
        if self.toks.see() == Kind::Str {
            let len = self.toks.peek().bytes.len() as i64 + 1;
            self.toks.jump(addr);
            return Ok(len);
        }
        self.toks.expect(Kind::LBrace)?;
        while !self.toks.jmp(Kind::RBrace) {
            let mut idx = n;
            if self.toks.jmp(Kind::LBrk) {
                self.expr()?;
                self.ts_pop_de();
                if let Some(v) = self.g_popnum() {
                    idx = v;
                }
                self.toks.expect(Kind::RBrk)?;
                self.toks.expect(Kind::Assign)?;
            }
            if n < idx + 1 {
                n = idx + 1;
            }
            while self.toks.see() != Kind::RBrace && self.toks.see() != Kind::Comma {
                if self.toks.see() == Kind::Eof {
                    return Err(self.err("syntax error"));
                }
                if self.toks.get().kind == Kind::LBrace {
                    self.jump_brace()?;
                }
            }
            self.toks.jmp(Kind::Comma);
        }
        self.toks.jump(addr);
        Ok(n)
    }

    /// Skip a balanced `{ ... }` whose opening brace is consumed.
    fn jump_brace(&mut self) -> Result<()> {
        let mut depth = 0u32;
        loop {
            match self.toks.see() {
                Kind::Eof => return Err(self.err("syntax error")),
                Kind::LBrace => {
                    depth += 1;
                    self.toks.get();
                }
                Kind::RBrace if depth == 0 => {
                    self.toks.get();
                    return Ok(());
                }
                Kind::RBrace => {
                    depth -= 1;
                    self.toks.get();
                }
                _ => {
                    self.toks.get();
                }
            }
        }
    }

    /// Recursively destructure a braced initializer; scalar leaves go
    /// through `init_set`.  Designators rebind the current field or
    /// index.
    pub(crate) fn init_expr(&mut self, t: Type, off: i64, tgt: &InitTarget) -> Result<()> {
        if !self.toks.jmp(Kind::LBrace) {
            return self.init_set(tgt, off, t);
        }
        if t.ptr == 0 && t.is_struct() {
            let TypeKind::Struct(id) = t.kind else { unreachable!() };
            let nfields = self.syms.structs[id].fields.len();
            for i in 0..nfields {
                if self.toks.see() == Kind::RBrace {
                    break;
                }
                let mut field = self.syms.structs[id].fields[i].clone();
                if self.toks.jmp(Kind::Dot) {
                    let fname = self.toks.expect(Kind::Name)?.text.clone();
                    field = self
                        .syms
                        .struct_field(id, &fname)
                        .ok_or_else(|| self.err("field not found"))?;
                    self.toks.expect(Kind::Assign)?;
                }
                self.init_expr(field.ty, off + field.addr, tgt)?;
                if !self.toks.jmp(Kind::Comma) {
                    break;
                }
            }
        } else if let TypeKind::Array(id) = t.kind {
            let elem = self.syms.arrays[id].ty;
            // extra braces around a string: char s[] = {"sth"}
            if elem.scalar_size() == 1 && self.toks.see() == Kind::Str {
                self.init_set(tgt, off, t)?;
                self.toks.expect(Kind::RBrace)?;
                return Ok(());
            }
            let mut i: i64 = 0;
            while self.toks.see() != Kind::RBrace {
                if self.toks.see() == Kind::Eof {
                    return Err(self.err("syntax error"));
                }
                let mut idx = i;
                let mut it = elem;
                if self.toks.jmp(Kind::LBrk) {
                    self.expr()?;
                    self.ts_pop_de();
                    if let Some(v) = self.g_popnum() {
                        idx = v;
                    }
                    self.toks.expect(Kind::RBrk)?;
                    self.toks.expect(Kind::Assign)?;
                }
                if self.toks.see() != Kind::LBrace
                    && (self.toks.see() != Kind::Str || !it.is_array())
                {
                    it = self.syms.innertype(&elem);
                }
                let esz = self.syms.totsz(&it);
                self.init_expr(it, off + esz * idx, tgt)?;
                if !self.toks.jmp(Kind::Comma) {
                    break;
                }
                i += 1;
            }
        }
        self.toks.expect(Kind::RBrace)?;
        Ok(())
    }

    /// Initialize one scalar (or string-filled byte array) at `off`.
    fn init_set(&mut self, tgt: &InitTarget, off: i64, t: Type) -> Result<()> {
        // string literal into a byte array copies the bytes directly
        let str_bytes = match t.kind {
            TypeKind::Array(id) if t.ptr == 0 && self.toks.see() == Kind::Str => {
                let elem = self.syms.arrays[id].ty;
                if elem.ptr == 0 && elem.kind == TypeKind::Scalar && elem.bt.size == 1 {
                    let mut bytes = self.toks.get().bytes.clone();
                    bytes.push(0);
                    Some(bytes)
                } else {
                    None
                }
            }
            _ => None,
        };
        match tgt {
            InitTarget::Global { name } => {
                if let Some(bytes) = str_bytes {
                    self.gen.dscpy(name.addr + off, &bytes);
                    return Ok(());
                }
                self.expr()?;
                let sym = name.sym().to_string();
                self.gen
                    .dsset(&sym, off, t.btype())
                    .map_err(|e| self.err(e))?;
                self.ts_pop();
                Ok(())
            }
            InitTarget::Local { addr } => {
                if let Some(bytes) = str_bytes {
                    self.local_off(*addr, off);
                    let sym = self.tmp_str(&bytes);
                    self.g_sym(&sym);
                    self.g_num(bytes.len() as i64);
                    self.g_memcpy();
                    self.g_drop(1);
                    return Ok(());
                }
                self.local_off(*addr, off);
                self.ts.push(Operand::Val(t));
                self.expr()?;
                self.do_assign();
                self.ts_pop();
                self.g_drop(1);
                Ok(())
            }
        }
    }

    /// Push the address of `local + off`.
    fn local_off(&mut self, addr: i64, off: i64) {
        self.g_local(addr);
        if off != 0 {
            self.g_num(off);
            self.g_bop(crate::obj::Bop::Add, false);
        }
    }
}
