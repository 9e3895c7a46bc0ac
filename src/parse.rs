pub mod decl;
pub mod expr;
pub mod init;

use anyhow::{anyhow, bail, Result};

use crate::gen::Gen;
use crate::obj::{Bop, Object, Uop};
use crate::sym::Syms;
use crate::tok::{Kind, TokenStream};
use crate::ty::{BType, Type, TypeKind, LONGSZ};

const NLABELS: usize = 1 << 12;

/// One entry of the type stack: either a plain value of some type, or
/// an lvalue (the generator stack holds the *address* of a value of
/// that type).  Converting an lvalue to a value is [`Parser::ts_de`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum Operand {
    Val(Type),
    Lval(Type),
}

impl Operand {
    pub(crate) fn ty(self) -> Type {
        match self {
            Operand::Val(t) | Operand::Lval(t) => t,
        }
    }

    pub(crate) fn is_lval(self) -> bool {
        matches!(self, Operand::Lval(_))
    }
}

/// The parser: walks the token stream once per declaration (twice per
/// function body) and drives the generator, mirroring every value the
/// generator holds with a typed entry on `ts`.
pub struct Parser {
    pub(crate) toks: TokenStream,
    pub(crate) gen: Gen,
    pub(crate) syms: Syms,
    /// Type stack shadowing the generator's value stack.
    pub(crate) ts: Vec<Operand>,
    /// When nonzero, generator calls are suppressed (dead ternary arms,
    /// `sizeof` operands); nestable.
    pub(crate) nogen: u32,
    /// Last label id handed out; reset per emission pass.
    label: u32,
    l_break: u32,
    l_cont: u32,
    /// goto labels of the current function: name -> label id.
    labels: Vec<(String, u32)>,
    /// Nonzero inside `?:`; suppresses statement-label recognition.
    pub(crate) ncexpr: u32,
    /// Set while parsing a `case` expression.
    pub(crate) caseexpr: bool,
    /// Identifier consumed by the expression layer that turned out to
    /// start a labelled statement.
    pub(crate) pending_label: Option<String>,
    pub(crate) func_name: String,
    /// Monotonic id for string-literal data symbols.
    pub(crate) nstr: u32,
}

impl Parser {
    pub fn new(toks: TokenStream) -> Self {
        Parser {
            toks,
            gen: Gen::new(),
            syms: Syms::new(),
            ts: Vec::new(),
            nogen: 0,
            label: 0,
            l_break: 0,
            l_cont: 0,
            labels: Vec::new(),
            ncexpr: 0,
            caseexpr: false,
            pending_label: None,
            func_name: String::new(),
            nstr: 0,
        }
    }

    pub fn into_object(self) -> Object {
        self.gen.finish()
    }

    /// Build an error prefixed with the current source location.
    pub(crate) fn err(&self, msg: impl std::fmt::Display) -> anyhow::Error {
        anyhow!("{}: {}", self.toks.loc_str(self.toks.addr()), msg)
    }

    // ---- gated generator calls ---------------------------------------
    // Every emission goes through these so that a nogen scope freezes
    // the generator while type bookkeeping continues.

    pub(crate) fn g_num(&mut self, n: i64) {
        if self.nogen == 0 {
            self.gen.num(n);
        }
    }

    pub(crate) fn g_sym(&mut self, name: &str) {
        if self.nogen == 0 {
            self.gen.sym(name);
        }
    }

    pub(crate) fn g_local(&mut self, addr: i64) {
        if self.nogen == 0 {
            self.gen.local(addr);
        }
    }

    pub(crate) fn g_bop(&mut self, op: Bop, signed: bool) {
        if self.nogen == 0 {
            self.gen.bop(op, signed);
        }
    }

    pub(crate) fn g_uop(&mut self, op: Uop) {
        if self.nogen == 0 {
            self.gen.uop(op);
        }
    }

    pub(crate) fn g_cast(&mut self, bt: BType) {
        if self.nogen == 0 {
            self.gen.cast(bt);
        }
    }

    pub(crate) fn g_deref(&mut self, bt: BType) {
        if self.nogen == 0 {
            self.gen.deref(bt);
        }
    }

    pub(crate) fn g_assign(&mut self, bt: BType) {
        if self.nogen == 0 {
            self.gen.assign(bt);
        }
    }

    pub(crate) fn g_load(&mut self) {
        if self.nogen == 0 {
            self.gen.load();
        }
    }

    pub(crate) fn g_memcpy(&mut self) {
        if self.nogen == 0 {
            self.gen.memcpy();
        }
    }

    pub(crate) fn g_memset(&mut self) {
        if self.nogen == 0 {
            self.gen.memset();
        }
    }

    pub(crate) fn g_call(&mut self, argc: usize, ret: BType) {
        if self.nogen == 0 {
            self.gen.call(argc, ret);
        }
    }

    pub(crate) fn g_ret(&mut self, has_value: bool) {
        if self.nogen == 0 {
            self.gen.ret(has_value);
        }
    }

    pub(crate) fn g_copy(&mut self) {
        if self.nogen == 0 {
            self.gen.tmpcopy();
        }
    }

    pub(crate) fn g_swap(&mut self) {
        if self.nogen == 0 {
            self.gen.tmpswap();
        }
    }

    pub(crate) fn g_drop(&mut self, n: i32) {
        if self.nogen == 0 {
            self.gen.tmpdrop(n);
        }
    }

    pub(crate) fn g_label(&mut self, id: u32) {
        if self.nogen == 0 {
            self.gen.label(id);
        }
    }

    pub(crate) fn g_jmp(&mut self, id: u32) {
        if self.nogen == 0 {
            self.gen.jmp(id);
        }
    }

    pub(crate) fn g_jz(&mut self, id: u32) {
        if self.nogen == 0 {
            self.gen.jz(id);
        }
    }

    pub(crate) fn g_jnz(&mut self, id: u32) {
        if self.nogen == 0 {
            self.gen.jnz(id);
        }
    }

    pub(crate) fn g_fork(&mut self) {
        if self.nogen == 0 {
            self.gen.fork();
        }
    }

    pub(crate) fn g_forkpush(&mut self) {
        if self.nogen == 0 {
            self.gen.forkpush();
        }
    }

    pub(crate) fn g_forkjoin(&mut self) {
        if self.nogen == 0 {
            self.gen.forkjoin();
        }
    }

    /// Pop a folded constant from the generator.  Inside a nogen scope
    /// the generator never saw the expression, so pretend it folded to
    /// zero; the surrounding code is itself dead.
    pub(crate) fn g_popnum(&mut self) -> Option<i64> {
        if self.nogen > 0 {
            Some(0)
        } else {
            self.gen.popnum()
        }
    }

    // ---- type stack ---------------------------------------------------

    pub(crate) fn ts_push_bt(&mut self, bt: BType) {
        self.ts.push(Operand::Val(Type::scalar(bt)));
    }

    pub(crate) fn ts_pop(&mut self) -> Operand {
        self.ts.pop().expect("type stack underflow")
    }

    /// Decay the top of stack and, when it is an lvalue of a loadable
    /// type, have the generator fetch the value.  `deref == false`
    /// converts to a value without a load (after stores, whose result
    /// already is the value).
    pub(crate) fn ts_de(&mut self, deref: bool) {
        let op = *self.ts.last().expect("type stack underflow");
        let mut t = op.ty();
        // decay produces the array's address, which already is the value
        let was_array = t.is_array();
        self.syms.array2ptr(&mut t);
        if deref && op.is_lval() && !was_array && (t.ptr > 0 || !t.is_func()) {
            self.g_deref(t.btype());
        }
        *self.ts.last_mut().expect("type stack underflow") = Operand::Val(t);
    }

    pub(crate) fn ts_pop_de(&mut self) -> Type {
        self.ts_de(true);
        self.ts_pop().ty()
    }

    /// Pop and load both operands of a binary operator, returning
    /// `(right, left)` in pop order.
    pub(crate) fn ts_pop_de2(&mut self) -> (Type, Type) {
        let t1 = self.ts_pop_de();
        self.g_swap();
        let t2 = self.ts_pop_de();
        self.g_swap();
        (t1, t2)
    }

    // ---- labels -------------------------------------------------------

    pub(crate) fn label_new(&mut self) -> u32 {
        self.label += 1;
        self.label
    }

    /// Label id for a goto target, allocated on first mention so that
    /// forward gotos and the definition agree.
    fn label_id(&mut self, name: &str) -> Result<u32> {
        if let Some((_, id)) = self.labels.iter().find(|(n, _)| n == name) {
            return Ok(*id);
        }
        if self.labels.len() >= NLABELS {
            bail!("nomem: NLABELS reached!");
        }
        let id = self.label_new();
        self.labels.push((name.to_string(), id));
        Ok(id)
    }

    // ---- statements ---------------------------------------------------

    pub(crate) fn stmt(&mut self) -> Result<()> {
        self.g_drop(-1);
        self.ts.clear();
        if self.toks.jmp(Kind::LBrace) {
            let mark = self.syms.mark();
            while !self.toks.jmp(Kind::RBrace) {
                if self.toks.see() == Kind::Eof {
                    return Err(self.err("syntax error"));
                }
                self.stmt()?;
            }
            self.syms.truncate(mark);
            return Ok(());
        }
        if self.read_defs(DefCtx::Local)? {
            self.toks.expect(Kind::Semi)?;
            return Ok(());
        }
        if self.toks.jmp(Kind::Typedef) {
            self.read_defs(DefCtx::Typedef)?;
            self.toks.expect(Kind::Semi)?;
            return Ok(());
        }
        if self.toks.jmp(Kind::If) {
            let l_fail = self.label_new();
            let l_end = self.label_new();
            self.toks.expect(Kind::LPar)?;
            self.expr_stmt()?;
            self.toks.expect(Kind::RPar)?;
            self.ts_pop_de();
            self.g_jz(l_fail);
            self.stmt()?;
            if self.toks.jmp(Kind::Else) {
                self.g_jmp(l_end);
                self.g_label(l_fail);
                self.stmt()?;
                self.g_label(l_end);
            } else {
                self.g_label(l_fail);
            }
            return Ok(());
        }
        if self.toks.jmp(Kind::While) {
            let o_break = self.l_break;
            let o_cont = self.l_cont;
            self.l_break = self.label_new();
            self.l_cont = self.label_new();
            self.g_label(self.l_cont);
            self.toks.expect(Kind::LPar)?;
            self.expr_stmt()?;
            self.toks.expect(Kind::RPar)?;
            self.ts_pop_de();
            self.g_jz(self.l_break);
            self.stmt()?;
            self.g_jmp(self.l_cont);
            self.g_label(self.l_break);
            self.l_break = o_break;
            self.l_cont = o_cont;
            return Ok(());
        }
        if self.toks.jmp(Kind::Do) {
            let o_break = self.l_break;
            let o_cont = self.l_cont;
            let l_beg = self.label_new();
            self.l_break = self.label_new();
            self.l_cont = self.label_new();
            self.g_label(l_beg);
            self.stmt()?;
            self.toks.expect(Kind::While)?;
            self.toks.expect(Kind::LPar)?;
            self.g_label(self.l_cont);
            self.expr()?;
            self.ts_pop_de();
            self.g_jnz(l_beg);
            self.toks.expect(Kind::RPar)?;
            self.g_label(self.l_break);
            self.toks.expect(Kind::Semi)?;
            self.l_break = o_break;
            self.l_cont = o_cont;
            return Ok(());
        }
        if self.toks.jmp(Kind::For) {
            let o_break = self.l_break;
            let o_cont = self.l_cont;
            let l_check = self.label_new();
            let l_body = self.label_new();
            self.l_cont = self.label_new();
            self.l_break = self.label_new();
            self.toks.expect(Kind::LPar)?;
            if self.toks.see() != Kind::Semi {
                self.expr_stmt()?;
                self.g_drop(-1);
                self.ts.clear();
            }
            self.toks.expect(Kind::Semi)?;
            self.g_label(l_check);
            if self.toks.see() != Kind::Semi {
                self.expr_stmt()?;
                self.ts_pop_de();
                self.g_jz(self.l_break);
            }
            self.toks.expect(Kind::Semi)?;
            self.g_jmp(l_body);
            self.g_label(self.l_cont);
            if self.toks.see() != Kind::RPar {
                self.expr_stmt()?;
                self.g_drop(-1);
                self.ts.clear();
            }
            self.toks.expect(Kind::RPar)?;
            self.g_jmp(l_check);
            self.g_label(l_body);
            self.stmt()?;
            self.g_jmp(self.l_cont);
            self.g_label(self.l_break);
            self.l_break = o_break;
            self.l_cont = o_cont;
            return Ok(());
        }
        if self.toks.jmp(Kind::Switch) {
            return self.switch_stmt();
        }
        if self.toks.jmp(Kind::Return) {
            let has_value = self.toks.see() != Kind::Semi;
            if has_value {
                self.expr()?;
                self.ts_pop_de();
            }
            self.toks.expect(Kind::Semi)?;
            self.g_ret(has_value);
            return Ok(());
        }
        if self.toks.jmp(Kind::Break) {
            self.toks.expect(Kind::Semi)?;
            let l = self.l_break;
            self.g_jmp(l);
            return Ok(());
        }
        if self.toks.jmp(Kind::Continue) {
            self.toks.expect(Kind::Semi)?;
            let l = self.l_cont;
            self.g_jmp(l);
            return Ok(());
        }
        if self.toks.jmp(Kind::Goto) {
            let name = self.toks.expect(Kind::Name)?.text.clone();
            let l = self.label_id(&name)?;
            self.g_jmp(l);
            self.toks.expect(Kind::Semi)?;
            return Ok(());
        }
        if self.toks.jmp(Kind::Semi) {
            return Ok(());
        }
        self.expr_stmt()?;
        // labelled statement: the expression layer saw `name :`
        if self.toks.jmp(Kind::Colon) {
            let name = self
                .pending_label
                .take()
                .ok_or_else(|| self.err("syntax error"))?;
            let l = self.label_id(&name)?;
            self.g_label(l);
            return Ok(());
        }
        self.toks.expect(Kind::Semi)?;
        // drop the unused value now: jump targets must always see the
        // same runtime stack depth
        self.g_drop(-1);
        self.ts.clear();
        Ok(())
    }

    /// Comma-separated expression statement; the value of the last
    /// expression stays on the stacks for condition contexts.
    pub(crate) fn expr_stmt(&mut self) -> Result<()> {
        loop {
            self.g_drop(-1);
            self.ts.clear();
            self.expr()?;
            if !self.toks.jmp(Kind::Comma) {
                return Ok(());
            }
        }
    }

    /// `switch`: the scrutinee is stored in a scratch local, and every
    /// `case` loads and compares it.  Matched cases jump into the chain
    /// of bodies so that fallthrough works.
    fn switch_stmt(&mut self) -> Result<()> {
        let o_break = self.l_break;
        let val_addr = self.gen.mklocal(LONGSZ as i64);
        let mut ncases = 0;
        let mut l_failed = self.label_new();
        let mut l_matched = self.label_new();
        let mut l_default = 0;
        self.l_break = self.label_new();
        self.toks.expect(Kind::LPar)?;
        self.expr()?;
        let t = self.ts_pop_de();
        self.g_local(val_addr);
        self.g_swap();
        self.g_assign(t.btype());
        self.g_drop(1);
        self.toks.expect(Kind::RPar)?;
        self.toks.expect(Kind::LBrace)?;
        while !self.toks.jmp(Kind::RBrace) {
            if self.toks.see() == Kind::Eof {
                return Err(self.err("syntax error"));
            }
            if self.toks.see() != Kind::Case && self.toks.see() != Kind::Default {
                self.stmt()?;
                continue;
            }
            if ncases > 0 {
                self.g_jmp(l_matched);
            }
            if self.toks.get().kind == Kind::Case {
                self.g_label(l_failed);
                l_failed = self.label_new();
                self.caseexpr = true;
                self.expr()?;
                self.ts_pop_de();
                self.caseexpr = false;
                self.g_local(val_addr);
                self.g_deref(t.btype());
                self.g_bop(Bop::Eq, false);
                self.g_jz(l_failed);
            } else {
                if ncases == 0 {
                    self.g_jmp(l_failed);
                }
                l_default = self.label_new();
                self.g_label(l_default);
            }
            self.toks.expect(Kind::Colon)?;
            self.g_label(l_matched);
            l_matched = self.label_new();
            ncases += 1;
        }
        self.gen.rmlocal(val_addr, LONGSZ as i64);
        self.g_jmp(self.l_break);
        self.g_label(l_failed);
        if l_default != 0 {
            self.g_jmp(l_default);
        }
        self.g_label(self.l_break);
        self.l_break = o_break;
        Ok(())
    }

    // ---- functions ----------------------------------------------------

    /// Two-pass function emission: the body is parsed once for frame
    /// statistics, the token cursor rewinds, and the body is parsed
    /// again for real.  All per-function parser state resets to the
    /// same values in between so both passes replay identically.
    pub(crate) fn func_def(&mut self, name: &crate::ty::Name, is_static: bool) -> Result<()> {
        let TypeKind::Func(fid) = name.ty.kind else {
            return Err(self.err("not a function"));
        };
        let fi = self.syms.funcs[fid].clone();
        let beg = self.toks.addr();
        self.func_name = fi.name.clone();
        self.gen
            .func_beg(name.sym(), fi.args.len(), !is_static, fi.varg);
        for (i, ty) in fi.args.iter().enumerate() {
            let mut arg = crate::ty::Name::new(fi.argnames[i].clone(), *ty);
            arg.addr = self.gen.arg2loc(i);
            self.syms.local_add(arg)?;
        }
        self.label = 0;
        self.labels.clear();
        self.gen.pass1();
        self.stmt()?;
        self.toks.jump(beg);
        self.label = 0;
        self.labels.clear();
        self.gen.pass2();
        self.stmt()?;
        self.gen.func_end().map_err(|e| self.err(e))?;
        self.func_name.clear();
        self.syms.clear_locals();
        Ok(())
    }

    // ---- translation unit ---------------------------------------------

    pub fn parse_unit(&mut self) -> Result<()> {
        while self.toks.see() != Kind::Eof {
            self.decl()?;
        }
        Ok(())
    }

    fn decl(&mut self) -> Result<()> {
        if self.toks.jmp(Kind::Typedef) {
            self.read_defs(DefCtx::Typedef)?;
            self.toks.expect(Kind::Semi)?;
            return Ok(());
        }
        if !self.read_defs_int(DefCtx::Global)? {
            return Err(self.err("syntax error"));
        }
        self.toks.jmp(Kind::Semi);
        Ok(())
    }
}

/// Where the declarators of one definition statement land: the same
/// reader serves globals, locals, struct fields, typedefs and K&R
/// parameter redeclarations.
#[derive(Clone, Copy, Debug)]
pub(crate) enum DefCtx {
    Global,
    Local,
    Typedef,
    /// Building the fields of this struct descriptor.
    Field(usize),
    /// Retro-typing the K&R parameters of this function signature.
    Kr(usize),
}
