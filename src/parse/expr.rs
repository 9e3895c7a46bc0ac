use anyhow::Result;

use super::{Operand, Parser};
use crate::obj::{Bop, Uop};
use crate::tok::Kind;
use crate::ty::{bt_op, bt_uop, BType, Type, TypeKind};

impl Parser {
    /// Assignment level, the loosest precedence tier.
    pub(crate) fn expr(&mut self) -> Result<()> {
        self.cexpr()?;
        if self.toks.jmp(Kind::Assign) {
            self.expr()?;
            self.do_assign();
            return Ok(());
        }
        let op = match self.toks.see() {
            Kind::PlusEq => Some((Bop::Add, true)),
            Kind::MinusEq => Some((Bop::Sub, true)),
            Kind::StarEq => Some((Bop::Mul, false)),
            Kind::SlashEq => Some((Bop::Div, false)),
            Kind::PercentEq => Some((Bop::Mod, false)),
            Kind::ShlEq => Some((Bop::Shl, false)),
            Kind::ShrEq => Some((Bop::Shr, false)),
            Kind::AmpEq => Some((Bop::And, false)),
            Kind::PipeEq => Some((Bop::Or, false)),
            Kind::CaretEq => Some((Bop::Xor, false)),
            _ => None,
        };
        if let Some((op, addop)) = op {
            self.toks.get();
            self.op_assign(op, addop)?;
        }
        Ok(())
    }

    /// Plain assignment.  Struct assignment copies bytes; anything else
    /// loads the right side and stores it at the left side's address.
    pub(crate) fn do_assign(&mut self) {
        let t = self.ts.last().expect("type stack underflow").ty();
        if t.ptr == 0 && t.is_struct() {
            self.ts_pop();
            let sz = self.syms.totsz(&t);
            self.g_num(sz);
            self.g_memcpy();
        } else {
            self.ts_pop_de();
            let bt = self.ts.last().expect("type stack underflow").ty().btype();
            self.g_assign(bt);
            self.ts_de(false);
        }
    }

    /// Compound assignment: duplicate the lvalue address, compute, then
    /// store back, leaving the new value as the expression result.
    fn op_assign(&mut self, op: Bop, addop: bool) -> Result<()> {
        let lhs = *self.ts.last().expect("type stack underflow");
        self.g_copy();
        self.ts.push(lhs);
        self.expr()?;
        if addop {
            self.ts_addop(op);
        } else {
            self.ts_binop(op);
        }
        let bt = self.ts[self.ts.len() - 2].ty().btype();
        self.g_assign(bt);
        self.ts_pop();
        self.ts_de(false);
        Ok(())
    }

    /// `?:`.  A compile-time-constant condition parses the dead arm in
    /// a nogen scope; otherwise both arms feed a fork/join phi.
    fn cexpr(&mut self) -> Result<()> {
        self.or_expr()?;
        if !self.toks.jmp(Kind::Quest) {
            return Ok(());
        }
        self.ncexpr += 1;
        self.ts_pop_de();
        self.g_fork();
        if !self.cexpr_const()? {
            let l_fail = self.label_new();
            let l_end = self.label_new();
            self.g_jz(l_fail);
            self.cexpr()?;
            // both arms yield the same type; the first is dropped
            let ret = self.ts_pop_de();
            if !ret.is_void() {
                self.g_forkpush();
            }
            self.g_jmp(l_end);
            self.toks.expect(Kind::Colon)?;
            self.g_label(l_fail);
            self.cexpr()?;
            // force a value so both arms agree on addr-ness
            self.ts_de(true);
            if !ret.is_void() {
                self.g_forkpush();
                self.g_forkjoin();
            }
            self.g_label(l_end);
        }
        self.ncexpr -= 1;
        Ok(())
    }

    fn cexpr_const(&mut self) -> Result<bool> {
        let Some(c) = self.g_popnum() else {
            return Ok(false);
        };
        if c == 0 {
            self.nogen += 1;
        }
        self.cexpr()?;
        self.ts_pop_de();
        self.toks.expect(Kind::Colon)?;
        if c != 0 {
            self.nogen += 1;
        } else {
            self.nogen -= 1;
        }
        self.cexpr()?;
        self.ts_de(true);
        if c != 0 {
            self.nogen -= 1;
        }
        Ok(true)
    }

    fn or_expr(&mut self) -> Result<()> {
        self.and_expr()?;
        if self.toks.see() != Kind::OrOr {
            return Ok(());
        }
        let l_pass = self.label_new();
        let l_end = self.label_new();
        self.g_fork();
        self.ts_pop_de();
        self.g_jnz(l_pass);
        while self.toks.jmp(Kind::OrOr) {
            self.and_expr()?;
            self.ts_pop_de();
            self.g_jnz(l_pass);
        }
        self.g_num(0);
        self.g_forkpush();
        self.g_jmp(l_end);
        self.g_label(l_pass);
        self.g_num(1);
        self.g_forkpush();
        self.g_forkjoin();
        self.g_label(l_end);
        self.ts_push_bt(BType::INT);
        Ok(())
    }

    fn and_expr(&mut self) -> Result<()> {
        self.bit_or()?;
        if self.toks.see() != Kind::AndAnd {
            return Ok(());
        }
        let l_out = self.label_new();
        let l_fail = self.label_new();
        self.g_fork();
        self.ts_pop_de();
        self.g_jz(l_fail);
        while self.toks.jmp(Kind::AndAnd) {
            self.bit_or()?;
            self.ts_pop_de();
            self.g_jz(l_fail);
        }
        self.g_num(1);
        self.g_forkpush();
        self.g_jmp(l_out);
        self.g_label(l_fail);
        self.g_num(0);
        self.g_forkpush();
        self.g_forkjoin();
        self.g_label(l_out);
        self.ts_push_bt(BType::INT);
        Ok(())
    }

    fn bit_or(&mut self) -> Result<()> {
        self.bit_xor()?;
        while self.toks.jmp(Kind::Pipe) {
            self.bit_xor()?;
            self.ts_binop(Bop::Or);
        }
        Ok(())
    }

    fn bit_xor(&mut self) -> Result<()> {
        self.bit_and()?;
        while self.toks.jmp(Kind::Caret) {
            self.bit_and()?;
            self.ts_binop(Bop::Xor);
        }
        Ok(())
    }

    fn bit_and(&mut self) -> Result<()> {
        self.eq_expr()?;
        while self.toks.jmp(Kind::Amp) {
            self.eq_expr()?;
            self.ts_binop(Bop::And);
        }
        Ok(())
    }

    fn eq_expr(&mut self) -> Result<()> {
        self.cmp_expr()?;
        loop {
            let op = match self.toks.see() {
                Kind::EqEq => Bop::Eq,
                Kind::NotEq => Bop::Ne,
                _ => return Ok(()),
            };
            self.toks.get();
            self.cmp_expr()?;
            self.ts_pop_de2();
            self.g_bop(op, false);
            self.ts_push_bt(BType::INT);
        }
    }

    fn cmp_expr(&mut self) -> Result<()> {
        self.shift_expr()?;
        loop {
            let op = match self.toks.see() {
                Kind::Lt => Bop::Lt,
                Kind::Gt => Bop::Gt,
                Kind::Le => Bop::Le,
                Kind::Ge => Bop::Ge,
                _ => return Ok(()),
            };
            self.toks.get();
            self.shift_expr()?;
            let (t1, t2) = self.ts_pop_de2();
            let bt = bt_op(t1.btype(), t2.btype());
            self.g_bop(op, bt.signed);
            self.ts_push_bt(BType::INT);
        }
    }

    fn shift_expr(&mut self) -> Result<()> {
        self.add_expr()?;
        loop {
            let op = match self.toks.see() {
                Kind::Shl => Bop::Shl,
                Kind::Shr => Bop::Shr,
                _ => return Ok(()),
            };
            self.toks.get();
            self.add_expr()?;
            // shifts take their width and sign from the left operand
            let (_t1, t2) = self.ts_pop_de2();
            self.g_bop(op, t2.btype().signed);
            self.ts_push_bt(bt_uop(t2.btype()));
        }
    }

    fn add_expr(&mut self) -> Result<()> {
        self.mul_expr()?;
        loop {
            let op = match self.toks.see() {
                Kind::Plus => Bop::Add,
                Kind::Minus => Bop::Sub,
                _ => return Ok(()),
            };
            self.toks.get();
            self.mul_expr()?;
            self.ts_addop(op);
        }
    }

    fn mul_expr(&mut self) -> Result<()> {
        self.unary()?;
        loop {
            let op = match self.toks.see() {
                Kind::Star => Bop::Mul,
                Kind::Slash => Bop::Div,
                Kind::Percent => Bop::Mod,
                _ => return Ok(()),
            };
            self.toks.get();
            self.unary()?;
            self.ts_binop(op);
        }
    }

    /// Ordinary binary operation: integer promotion, signedness from
    /// either side; division and remainder take the dividend's sign.
    pub(crate) fn ts_binop(&mut self, op: Bop) {
        let (t1, t2) = self.ts_pop_de2();
        let mut bt = bt_op(t1.btype(), t2.btype());
        if op == Bop::Div || op == Bop::Mod {
            bt = BType::new(bt.size, t2.btype().signed);
        }
        self.g_bop(op, bt.signed);
        self.ts_push_bt(bt);
    }

    /// Additive operation with pointer-arithmetic scaling: the integer
    /// side is scaled by the pointee size, and pointer difference is
    /// divided back down and becomes a signed word.
    pub(crate) fn ts_addop(&mut self, op: Bop) {
        let (t1, t2) = self.ts_pop_de2();
        if t1.ptr == 0 && t2.ptr == 0 {
            self.g_bop(op, false);
            self.ts_push_bt(bt_op(t1.btype(), t2.btype()));
            return;
        }
        if t1.ptr > 0 && t2.ptr > 0 {
            self.g_bop(op, false);
            let sz = self.syms.szde(&t1);
            if sz > 1 {
                self.g_num(sz);
                self.g_bop(Bop::Div, true);
            }
            self.ts_push_bt(BType::LONG);
            return;
        }
        // exactly one pointer: scale the integer side, which sits on
        // top unless the pointer is the right operand
        let ptr_on_right = t1.ptr > 0;
        let pt = if ptr_on_right { t1 } else { t2 };
        if ptr_on_right {
            self.g_swap();
        }
        let sz = self.syms.szde(&pt);
        if sz > 1 {
            self.g_num(sz);
            self.g_bop(Bop::Mul, false);
        }
        if ptr_on_right {
            self.g_swap();
        }
        self.g_bop(op, false);
        self.ts.push(Operand::Val(pt));
    }

    // ---- unary prefix --------------------------------------------------

    pub(crate) fn unary(&mut self) -> Result<()> {
        if self.toks.jmp(Kind::Amp) {
            self.unary()?;
            let op = self.ts_pop();
            let Operand::Lval(mut t) = op else {
                return Err(self.err("cannot use the address"));
            };
            t.ptr += 1;
            self.ts.push(Operand::Val(t));
            return Ok(());
        }
        if self.toks.jmp(Kind::Star) {
            self.unary()?;
            let op = self.ts_pop();
            let mut t = op.ty();
            let was_array = t.is_array();
            self.syms.array2ptr(&mut t);
            if t.ptr == 0 {
                return Err(self.err("dereferencing non-pointer"));
            }
            if op.is_lval() && !was_array {
                self.g_deref(t.btype());
            }
            t.ptr -= 1;
            self.ts.push(Operand::Lval(t));
            return Ok(());
        }
        if self.toks.jmp(Kind::Not) {
            self.unary()?;
            self.ts_pop_de();
            self.g_uop(Uop::Lnot);
            self.ts_push_bt(BType::INT);
            return Ok(());
        }
        if self.toks.jmp(Kind::Plus) {
            self.unary()?;
            let t = self.ts_pop_de();
            self.ts_push_bt(bt_uop(t.btype()));
            return Ok(());
        }
        if self.toks.jmp(Kind::Minus) {
            self.unary()?;
            let t = self.ts_pop_de();
            self.g_uop(Uop::Neg);
            self.ts_push_bt(bt_uop(t.btype()));
            return Ok(());
        }
        if self.toks.jmp(Kind::Tilde) {
            self.unary()?;
            let t = self.ts_pop_de();
            self.g_uop(Uop::Not);
            self.ts_push_bt(bt_uop(t.btype()));
            return Ok(());
        }
        if self.toks.jmp(Kind::Inc) {
            return self.inc_pre(Bop::Add);
        }
        if self.toks.jmp(Kind::Dec) {
            return self.inc_pre(Bop::Sub);
        }
        if self.toks.jmp(Kind::Sizeof) {
            let parens = self.toks.jmp(Kind::LPar);
            let t = match self.read_type()? {
                Some(t) => t,
                None => {
                    // no code for the operand, only its type
                    self.nogen += 1;
                    if parens {
                        self.expr()?;
                    } else {
                        self.unary()?;
                    }
                    self.nogen -= 1;
                    self.ts_pop().ty()
                }
            };
            let sz = self.syms.totsz(&t);
            self.g_num(sz);
            self.ts_push_bt(BType::ULONG);
            if parens {
                self.toks.expect(Kind::RPar)?;
            }
            return Ok(());
        }
        self.postfix()
    }

    fn inc_pre(&mut self, op: Bop) -> Result<()> {
        self.unary()?;
        self.g_copy();
        let lhs = *self.ts.last().expect("type stack underflow");
        self.ts.push(lhs);
        let t = self.ts_pop_de();
        let step = if t.ptr > 0 { self.syms.szde(&t) } else { 1 };
        self.g_num(step);
        self.g_bop(op, false);
        self.g_assign(t.btype());
        self.ts_de(false);
        Ok(())
    }

    /// Post-increment: the original value is left below the working
    /// copy, the increment is stored back, and the new value dropped.
    fn inc_post(&mut self, op: Bop) {
        let lhs = *self.ts.last().expect("type stack underflow");
        self.g_copy();
        self.ts_de(true);
        self.g_load();
        self.g_swap();

        self.g_copy();
        self.ts.push(lhs);
        let t = self.ts_pop_de();
        let step = if t.ptr > 0 { self.syms.szde(&t) } else { 1 };
        self.g_num(step);
        self.g_bop(op, false);

        self.g_assign(t.btype());
        self.g_drop(1);
    }

    // ---- postfix -------------------------------------------------------

    fn postfix(&mut self) -> Result<()> {
        self.primary()?;
        loop {
            if self.toks.jmp(Kind::LBrk) {
                self.expr()?;
                self.toks.expect(Kind::RBrk)?;
                self.array_deref();
                continue;
            }
            if self.toks.jmp(Kind::LPar) {
                self.call_expr()?;
                continue;
            }
            if self.toks.jmp(Kind::Inc) {
                self.inc_post(Bop::Add);
                continue;
            }
            if self.toks.jmp(Kind::Dec) {
                self.inc_post(Bop::Sub);
                continue;
            }
            if self.toks.jmp(Kind::Dot) {
                self.field_access()?;
                continue;
            }
            if self.toks.jmp(Kind::Arrow) {
                self.ts_de(true);
                self.field_access()?;
                continue;
            }
            return Ok(());
        }
    }

    /// `a[i]`: arrays already hold their address, anything else is
    /// loaded first; the index is scaled by the element size and the
    /// sum is an lvalue of the element type.
    fn array_deref(&mut self) {
        self.ts_pop_de();
        let op = self.ts_pop();
        let mut t = op.ty();
        if !t.is_array() && op.is_lval() {
            self.g_swap();
            self.g_deref(t.btype());
            self.g_swap();
        }
        self.syms.array2ptr(&mut t);
        t.ptr -= 1;
        let sz = self.syms.totsz(&t);
        if sz > 1 {
            self.g_num(sz);
            self.g_bop(Bop::Mul, false);
        }
        self.g_bop(Bop::Add, false);
        self.ts.push(Operand::Lval(t));
    }

    fn field_access(&mut self) -> Result<()> {
        let fname = self.toks.expect(Kind::Name)?.text.clone();
        let mut t = self.ts_pop().ty();
        self.syms.array2ptr(&mut t);
        let TypeKind::Struct(id) = t.kind else {
            return Err(self.err("field access on a non-struct"));
        };
        let field = self
            .syms
            .struct_field(id, &fname)
            .ok_or_else(|| self.err("field not found"))?;
        if field.addr != 0 {
            self.g_num(field.addr);
            self.g_bop(Bop::Add, false);
        }
        self.ts.push(Operand::Lval(field.ty));
        Ok(())
    }

    /// Call through whatever the primary left on the stack: a function,
    /// a function pointer (loaded first), or an unknown callee that
    /// defaults to returning int.
    fn call_expr(&mut self) -> Result<()> {
        let t = self.ts_pop().ty();
        if t.is_func() && t.ptr > 0 {
            self.g_deref(BType::ULONG);
        }
        let fi = match t.kind {
            TypeKind::Func(id) => Some(self.syms.funcs[id].clone()),
            _ => None,
        };
        let mut argc = 0;
        if self.toks.see() != Kind::RPar {
            loop {
                self.expr()?;
                self.ts_pop_de();
                argc += 1;
                if !self.toks.jmp(Kind::Comma) {
                    break;
                }
            }
        }
        self.toks.expect(Kind::RPar)?;
        match fi {
            Some(fi) => {
                let ret = fi.ret.btype();
                self.g_call(argc, ret);
                if !ret.is_void() {
                    self.g_cast(ret);
                }
                self.ts.push(Operand::Val(fi.ret));
            }
            None => {
                self.g_call(argc, BType::INT);
                self.ts_push_bt(BType::INT);
            }
        }
        Ok(())
    }

    // ---- primary -------------------------------------------------------

    /// Materialize a string literal as an anonymous data symbol.
    pub(crate) fn tmp_str(&mut self, bytes: &[u8]) -> String {
        let name = format!("__rcc.s{}", self.nstr);
        self.nstr += 1;
        let addr = self.gen.dsnew(&name, bytes.len() as i64, false);
        self.gen.dscpy(addr, bytes);
        name
    }

    fn primary(&mut self) -> Result<()> {
        if self.toks.see() == Kind::Num {
            let t = self.toks.get();
            let (n, bt) = (t.num, t.num_bt);
            self.g_num(n);
            self.ts_push_bt(bt);
            return Ok(());
        }
        if self.toks.see() == Kind::Str {
            let mut bytes = self.toks.get().bytes.clone();
            bytes.push(0);
            let id = self.syms.array_add(Type::scalar(BType::CHAR), bytes.len() as i64)?;
            let arr = Type { bt: BType::ULONG, ptr: 0, kind: TypeKind::Array(id) };
            let sym = self.tmp_str(&bytes);
            self.g_sym(&sym);
            self.ts.push(Operand::Val(arr));
            return Ok(());
        }
        if self.toks.see() == Kind::Name {
            let name = self.toks.get().text.clone();
            // a bare `name :` introduces a statement label, not a use
            if self.ncexpr == 0 && !self.caseexpr && self.toks.see() == Kind::Colon {
                self.pending_label = Some(name);
                return Ok(());
            }
            if let Some(i) = self.syms.local_find(&name) {
                let l = self.syms.locals[i].clone();
                self.g_local(l.addr);
                self.ts.push(Operand::Lval(l.ty));
                return Ok(());
            }
            if let Some(i) = self.syms.global_find(&name) {
                let g = self.syms.globals[i].clone();
                self.g_sym(g.sym());
                self.ts.push(Operand::Lval(g.ty));
                return Ok(());
            }
            if let Some(n) = self.syms.enum_find(&name) {
                self.g_num(n);
                self.ts_push_bt(BType::INT);
                return Ok(());
            }
            if self.toks.see() != Kind::LPar {
                return Err(self.err(format!("unknown symbol <{name}>")));
            }
            // calling an undeclared function defines it as an extern
            let unkn = crate::ty::Name::new(name.clone(), Type::scalar(BType::VOID));
            self.syms.global_add(unkn)?;
            self.g_sym(&name);
            self.ts_push_bt(BType::ULONG);
            return Ok(());
        }
        if self.toks.jmp(Kind::LPar) {
            // a type name makes this a cast, else a parenthesized
            // (possibly comma-separated) expression
            if let Some(t) = self.read_type()? {
                self.toks.expect(Kind::RPar)?;
                self.unary()?;
                let o = self.ts_pop_de();
                self.ts.push(Operand::Val(t));
                if t.ptr == 0 || o.ptr == 0 {
                    self.g_cast(t.btype());
                }
                return Ok(());
            }
            self.expr()?;
            while !self.toks.jmp(Kind::RPar) {
                self.toks.expect(Kind::Comma)?;
                self.ts_pop();
                self.g_drop(1);
                self.expr()?;
            }
            return Ok(());
        }
        Err(self.err("syntax error"))
    }
}
