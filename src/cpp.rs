use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::tok::{keyword, Kind, Lexer, Loc, Token, TokenStream};

const NINCLUDE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
struct Macro {
    /// `None` for object-like macros.
    params: Option<Vec<String>>,
    body: Vec<Token>,
}

/// One active `#if`/`#ifdef` region.
#[derive(Clone, Copy)]
struct Cond {
    /// The enclosing region is itself active.
    parent: bool,
    /// Some branch of this region has already been taken.
    taken: bool,
    /// The current branch is emitting tokens.
    active: bool,
    seen_else: bool,
}

/// The preprocessor.  Feeds one or more source files through macro
/// expansion, conditionals and includes, accumulating the final token
/// stream the parser runs on.
pub struct Cpp {
    files: Vec<String>,
    paths: Vec<PathBuf>,
    macros: HashMap<String, Macro>,
    conds: Vec<Cond>,
    out: Vec<Token>,
}

/// Pull-based token source for one file, with single-token lookahead.
struct Source<'a> {
    lx: Lexer<'a>,
    peeked: Option<Token>,
}

impl<'a> Source<'a> {
    fn new(lx: Lexer<'a>) -> Self {
        Source { lx, peeked: None }
    }

    fn next(&mut self) -> Result<Option<Token>> {
        if let Some(t) = self.peeked.take() {
            return Ok(Some(t));
        }
        self.lx.next_token()
    }

    fn peek(&mut self) -> Result<Option<&Token>> {
        if self.peeked.is_none() {
            self.peeked = self.lx.next_token()?;
        }
        Ok(self.peeked.as_ref())
    }
}

impl Cpp {
    pub fn new() -> Self {
        Cpp {
            files: Vec::new(),
            paths: Vec::new(),
            macros: HashMap::new(),
            conds: Vec::new(),
            out: Vec::new(),
        }
    }

    pub fn add_path(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// Define a macro from `-D` syntax: `name`, `name=body` or
    /// `name(params)=body`.
    pub fn define(&mut self, spec: &str) -> Result<()> {
        let (name_part, body_part) = match spec.find('=') {
            Some(i) => (&spec[..i], &spec[i + 1..]),
            None => (spec, ""),
        };
        let loc = Loc { file: u16::MAX, line: 0 };
        let mut toks = Vec::new();
        let mut lx = Lexer::new(name_part.as_bytes(), u16::MAX, "<define>");
        while let Some(t) = lx.next_token()? {
            toks.push(t);
        }
        if toks.is_empty() || toks[0].kind != Kind::Name {
            bail!("bad macro definition <{spec}>");
        }
        let name = toks[0].text.clone();
        let params = if toks.len() > 1 {
            if toks[1].kind != Kind::LPar || *toks.last().map(|t| &t.kind).unwrap() != Kind::RPar {
                bail!("bad macro definition <{spec}>");
            }
            let mut params = Vec::new();
            for t in &toks[2..toks.len() - 1] {
                match t.kind {
                    Kind::Name => params.push(t.text.clone()),
                    Kind::Comma => (),
                    _ => bail!("bad macro definition <{spec}>"),
                }
            }
            Some(params)
        } else {
            None
        };
        let mut body = Vec::new();
        let mut lx = Lexer::new(body_part.as_bytes(), u16::MAX, "<define>");
        while let Some(mut t) = lx.next_token()? {
            t.loc = loc;
            body.push(t);
        }
        self.macros.insert(name, Macro { params, body });
        Ok(())
    }

    pub fn undef(&mut self, name: &str) {
        self.macros.remove(name);
    }

    /// Preprocess a file from disk, appending to the output stream.
    pub fn read_file(&mut self, path: &Path) -> Result<()> {
        let src = fs::read(path).with_context(|| format!("cannot open <{}>", path.display()))?;
        let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
        self.read(&src, &path.display().to_string(), &dir, 0)
    }

    /// Preprocess in-memory source (tests, the predefined-macro probe).
    pub fn read_str(&mut self, name: &str, src: &str) -> Result<()> {
        self.read(src.as_bytes(), name, Path::new("."), 0)
    }

    /// Finish preprocessing and hand the token stream to the parser.
    pub fn finish(self) -> TokenStream {
        TokenStream::new(self.out, self.files)
    }

    fn active(&self) -> bool {
        self.conds.last().map(|c| c.active).unwrap_or(true)
    }

    fn read(&mut self, src: &[u8], fname: &str, dir: &Path, depth: usize) -> Result<()> {
        if depth >= NINCLUDE_DEPTH {
            bail!("nomem: NINCLUDE_DEPTH reached!");
        }
        let file_id = self.files.len() as u16;
        self.files.push(fname.to_string());
        let mut src = Source::new(Lexer::new(src, file_id, fname));
        while let Some(tok) = src.next()? {
            if tok.kind == Kind::Hash && tok.bol {
                self.directive(&mut src, dir, depth)?;
                continue;
            }
            if !self.active() {
                continue;
            }
            self.expand(tok, &mut src, &mut HashSet::new())?;
        }
        Ok(())
    }

    /// Collect the remaining tokens of the current directive line.
    fn directive_line(src: &mut Source) -> Result<Vec<Token>> {
        let mut line = Vec::new();
        loop {
            match src.peek()? {
                Some(t) if !t.bol => (),
                _ => break,
            }
            if let Some(t) = src.next()? {
                line.push(t);
            }
        }
        Ok(line)
    }

    fn directive(&mut self, src: &mut Source, dir: &Path, depth: usize) -> Result<()> {
        let starts_directive =
            matches!(src.peek()?, Some(t) if !t.bol && t.kind == Kind::Name);
        if !starts_directive {
            // a lone `#` is a null directive
            return Ok(());
        }
        let name = src.next()?.expect("peeked a directive name");
        let line = Self::directive_line(src)?;
        match name.text.as_str() {
            "ifdef" | "ifndef" => {
                let parent = self.active();
                let mut active = false;
                if parent {
                    let defined = line
                        .first()
                        .filter(|t| t.kind == Kind::Name)
                        .map(|t| self.macros.contains_key(&t.text))
                        .ok_or_else(|| anyhow!("bad #{} directive", name.text))?;
                    active = defined == (name.text == "ifdef");
                }
                self.conds.push(Cond { parent, taken: active, active, seen_else: false });
            }
            "if" => {
                let parent = self.active();
                let active = parent && self.eval_cond(&line)? != 0;
                self.conds.push(Cond { parent, taken: active, active, seen_else: false });
            }
            "elif" => {
                let mut c = self.conds.pop().ok_or_else(|| anyhow!("#elif without #if"))?;
                if c.seen_else {
                    bail!("#elif after #else");
                }
                c.active = c.parent && !c.taken && self.eval_cond(&line)? != 0;
                c.taken |= c.active;
                self.conds.push(c);
            }
            "else" => {
                let c = self.conds.last_mut().ok_or_else(|| anyhow!("#else without #if"))?;
                if c.seen_else {
                    bail!("duplicate #else");
                }
                c.active = c.parent && !c.taken;
                c.taken = true;
                c.seen_else = true;
            }
            "endif" => {
                self.conds.pop().ok_or_else(|| anyhow!("#endif without #if"))?;
            }
            _ if !self.active() => (),
            "include" => {
                let path = Self::include_target(&line)?;
                self.include(&path, dir, depth)?;
            }
            "define" => self.define_directive(&line)?,
            "undef" => {
                let t = line.first().ok_or_else(|| anyhow!("bad #undef"))?;
                self.macros.remove(&t.text);
            }
            "error" => {
                bail!("#error: {}", toks_text(&line));
            }
            "pragma" => (),
            other => bail!("unknown directive #{other}"),
        }
        Ok(())
    }

    /// Reassemble the `#include` target from its tokens.
    fn include_target(line: &[Token]) -> Result<(String, bool)> {
        match line.first().map(|t| t.kind) {
            Some(Kind::Str) => {
                let bytes = &line[0].bytes;
                Ok((String::from_utf8_lossy(bytes).into_owned(), true))
            }
            Some(Kind::Lt) => {
                let end = line
                    .iter()
                    .position(|t| t.kind == Kind::Gt)
                    .ok_or_else(|| anyhow!("bad #include"))?;
                Ok((toks_text(&line[1..end]), false))
            }
            _ => bail!("bad #include"),
        }
    }

    fn include(&mut self, target: &(String, bool), dir: &Path, depth: usize) -> Result<()> {
        let (name, quoted) = target;
        let mut candidates = Vec::new();
        if *quoted {
            candidates.push(dir.join(name));
        }
        for p in &self.paths {
            candidates.push(p.join(name));
        }
        for cand in &candidates {
            if cand.is_file() {
                let src = fs::read(cand)?;
                let sub_dir = cand.parent().map(|p| p.to_path_buf()).unwrap_or_default();
                return self.read(&src, &cand.display().to_string(), &sub_dir, depth + 1);
            }
        }
        bail!("cannot find include <{name}>");
    }

    fn define_directive(&mut self, line: &[Token]) -> Result<()> {
        let name = match line.first() {
            Some(t) if t.kind == Kind::Name => t.text.clone(),
            _ => bail!("bad #define"),
        };
        let mut rest = &line[1..];
        // parameter list only when the paren hugs the macro name
        let params = if rest.first().map(|t| t.kind == Kind::LPar && !t.spaced).unwrap_or(false) {
            let end = rest
                .iter()
                .position(|t| t.kind == Kind::RPar)
                .ok_or_else(|| anyhow!("bad #define {name}"))?;
            let mut params = Vec::new();
            for t in &rest[1..end] {
                match t.kind {
                    Kind::Name => params.push(t.text.clone()),
                    Kind::Comma => (),
                    _ => bail!("bad #define {name}"),
                }
            }
            rest = &rest[end + 1..];
            Some(params)
        } else {
            None
        };
        self.macros.insert(name, Macro { params, body: rest.to_vec() });
        Ok(())
    }

    /// Expand one token (recursively) and append the result to `out`.
    /// `hide` holds the macros already being expanded on this path.
    fn expand(&mut self, tok: Token, src: &mut Source, hide: &mut HashSet<String>) -> Result<()> {
        if tok.kind != Kind::Name || hide.contains(&tok.text) {
            return self.emit(tok);
        }
        let mac = match self.macros.get(&tok.text) {
            Some(m) => m.clone(),
            None => return self.emit(tok),
        };
        let args = match &mac.params {
            None => None,
            Some(params) => {
                // function-like macro used without arguments: plain name
                if !matches!(src.peek()?, Some(t) if t.kind == Kind::LPar) {
                    return self.emit(tok);
                }
                src.next()?;
                Some(self.collect_args(src, params.len(), &tok)?)
            }
        };
        hide.insert(tok.text.clone());
        let body = self.substitute(&mac, args.as_deref(), tok.loc);
        let mut queue: VecDeque<Token> = body.into();
        while let Some(t) = queue.pop_front() {
            // nested function-like uses may consume tokens that follow
            // the expansion, so fall back to `src` when the queue runs dry
            self.expand_queued(t, &mut queue, src, hide)?;
        }
        hide.remove(&tok.text);
        Ok(())
    }

    /// Like `expand`, but arguments for nested function-like macros are
    /// drawn from `queue` first and then from the underlying source.
    fn expand_queued(
        &mut self,
        tok: Token,
        queue: &mut VecDeque<Token>,
        src: &mut Source,
        hide: &mut HashSet<String>,
    ) -> Result<()> {
        if tok.kind != Kind::Name || hide.contains(&tok.text) {
            return self.emit(tok);
        }
        let mac = match self.macros.get(&tok.text) {
            Some(m) => m.clone(),
            None => return self.emit(tok),
        };
        let args = match &mac.params {
            None => None,
            Some(params) => {
                let next_is_par = match queue.front() {
                    Some(t) => t.kind == Kind::LPar,
                    None => matches!(src.peek()?, Some(t) if t.kind == Kind::LPar),
                };
                if !next_is_par {
                    return self.emit(tok);
                }
                if queue.front().is_some() {
                    queue.pop_front();
                } else {
                    src.next()?;
                }
                Some(self.collect_args_mixed(queue, src, params.len(), &tok)?)
            }
        };
        hide.insert(tok.text.clone());
        let body = self.substitute(&mac, args.as_deref(), tok.loc);
        for t in body.into_iter().rev() {
            queue.push_front(t);
        }
        hide.remove(&tok.text);
        Ok(())
    }

    fn collect_args(&mut self, src: &mut Source, nparams: usize, at: &Token) -> Result<Vec<Vec<Token>>> {
        let mut q = VecDeque::new();
        self.collect_args_mixed(&mut q, src, nparams, at)
    }

    /// Read macro arguments up to the matching `)`, splitting on
    /// top-level commas.
    fn collect_args_mixed(
        &mut self,
        queue: &mut VecDeque<Token>,
        src: &mut Source,
        nparams: usize,
        at: &Token,
    ) -> Result<Vec<Vec<Token>>> {
        let mut args: Vec<Vec<Token>> = vec![Vec::new()];
        let mut depth = 0usize;
        loop {
            let t = match queue.pop_front() {
                Some(t) => t,
                None => src
                    .next()?
                    .ok_or_else(|| anyhow!("unterminated macro call of <{}>", at.text))?,
            };
            match t.kind {
                Kind::RPar if depth == 0 => break,
                Kind::RPar => {
                    depth -= 1;
                    args.last_mut().unwrap().push(t);
                }
                Kind::LPar => {
                    depth += 1;
                    args.last_mut().unwrap().push(t);
                }
                Kind::Comma if depth == 0 => args.push(Vec::new()),
                _ => args.last_mut().unwrap().push(t),
            }
        }
        if args.len() == 1 && args[0].is_empty() && nparams == 0 {
            args.clear();
        }
        if args.len() != nparams {
            bail!("macro <{}> expects {} arguments, got {}", at.text, nparams, args.len());
        }
        Ok(args)
    }

    /// Substitute parameters into a macro body.  Substituted tokens take
    /// the location of the invocation so errors point at the use site.
    fn substitute(&self, mac: &Macro, args: Option<&[Vec<Token>]>, loc: Loc) -> Vec<Token> {
        let mut out = Vec::with_capacity(mac.body.len());
        for t in &mac.body {
            let param = mac
                .params
                .as_ref()
                .filter(|_| t.kind == Kind::Name)
                .and_then(|ps| ps.iter().position(|p| *p == t.text));
            match (param, args) {
                (Some(i), Some(args)) => {
                    for a in &args[i] {
                        let mut a = a.clone();
                        a.loc = loc;
                        out.push(a);
                    }
                }
                _ => {
                    let mut t = t.clone();
                    t.loc = loc;
                    out.push(t);
                }
            }
        }
        out
    }

    /// Final token output: classify keywords, merge adjacent string
    /// literals, append to the stream.
    fn emit(&mut self, mut tok: Token) -> Result<()> {
        if tok.kind == Kind::Name {
            if let Some(kw) = keyword(&tok.text) {
                tok.kind = kw;
            }
        }
        if tok.kind == Kind::Str {
            if let Some(last) = self.out.last_mut() {
                if last.kind == Kind::Str {
                    last.bytes.extend_from_slice(&tok.bytes);
                    return Ok(());
                }
            }
        }
        self.out.push(tok);
        Ok(())
    }

    // ---- #if expression evaluation -----------------------------------

    fn eval_cond(&mut self, line: &[Token]) -> Result<i64> {
        // `defined` is resolved before macro expansion
        let mut pre = Vec::new();
        let mut i = 0;
        while i < line.len() {
            let t = &line[i];
            if t.kind == Kind::Name && t.text == "defined" {
                let (name, skip) = match line.get(i + 1) {
                    Some(p) if p.kind == Kind::LPar => {
                        let n = line.get(i + 2).ok_or_else(|| anyhow!("bad defined()"))?;
                        match line.get(i + 3) {
                            Some(c) if c.kind == Kind::RPar => (),
                            _ => bail!("bad defined()"),
                        }
                        (n.text.clone(), 4)
                    }
                    Some(n) if n.kind == Kind::Name => (n.text.clone(), 2),
                    _ => bail!("bad defined()"),
                };
                let v = self.macros.contains_key(&name) as i64;
                pre.push(Token::num(v, crate::ty::BType::INT, t.loc));
                i += skip;
                continue;
            }
            pre.push(t.clone());
            i += 1;
        }
        // expand what remains, then evaluate
        let mut exp = Vec::new();
        let mut queue: VecDeque<Token> = pre.into();
        let mut hide = HashSet::new();
        while let Some(t) = queue.pop_front() {
            self.expand_for_eval(t, &mut queue, &mut hide, &mut exp)?;
        }
        let mut ev = CondEval { toks: &exp, pos: 0 };
        let v = ev.logic_or()?;
        if ev.pos != ev.toks.len() {
            bail!("trailing tokens in #if expression");
        }
        Ok(v)
    }

    /// Expansion for `#if` lines: no source to draw from, and unknown
    /// names become literal 0.
    fn expand_for_eval(
        &mut self,
        tok: Token,
        queue: &mut VecDeque<Token>,
        hide: &mut HashSet<String>,
        out: &mut Vec<Token>,
    ) -> Result<()> {
        if tok.kind != Kind::Name || hide.contains(&tok.text) {
            out.push(tok);
            return Ok(());
        }
        let mac = match self.macros.get(&tok.text) {
            Some(m) => m.clone(),
            None => {
                out.push(Token::num(0, crate::ty::BType::INT, tok.loc));
                return Ok(());
            }
        };
        let args = match &mac.params {
            None => None,
            Some(params) => {
                if !matches!(queue.front(), Some(t) if t.kind == Kind::LPar) {
                    out.push(Token::num(0, crate::ty::BType::INT, tok.loc));
                    return Ok(());
                }
                queue.pop_front();
                let mut args: Vec<Vec<Token>> = vec![Vec::new()];
                let mut depth = 0usize;
                loop {
                    let t = queue
                        .pop_front()
                        .ok_or_else(|| anyhow!("unterminated macro call of <{}>", tok.text))?;
                    match t.kind {
                        Kind::RPar if depth == 0 => break,
                        Kind::RPar => {
                            depth -= 1;
                            args.last_mut().unwrap().push(t);
                        }
                        Kind::LPar => {
                            depth += 1;
                            args.last_mut().unwrap().push(t);
                        }
                        Kind::Comma if depth == 0 => args.push(Vec::new()),
                        _ => args.last_mut().unwrap().push(t),
                    }
                }
                if args.len() == 1 && args[0].is_empty() && params.is_empty() {
                    args.clear();
                }
                if args.len() != params.len() {
                    bail!("macro <{}> expects {} arguments", tok.text, params.len());
                }
                Some(args)
            }
        };
        hide.insert(tok.text.clone());
        for t in self.substitute(&mac, args.as_deref(), tok.loc).into_iter().rev() {
            queue.push_front(t);
        }
        hide.remove(&tok.text);
        Ok(())
    }
}

impl Default for Cpp {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive-descent evaluator for `#if` expressions.
struct CondEval<'a> {
    toks: &'a [Token],
    pos: usize,
}

impl<'a> CondEval<'a> {
    fn see(&self) -> Option<Kind> {
        self.toks.get(self.pos).map(|t| t.kind)
    }

    fn jmp(&mut self, k: Kind) -> bool {
        if self.see() == Some(k) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn primary(&mut self) -> Result<i64> {
        if self.jmp(Kind::LPar) {
            let v = self.logic_or()?;
            if !self.jmp(Kind::RPar) {
                bail!("missing ) in #if expression");
            }
            return Ok(v);
        }
        match self.toks.get(self.pos) {
            Some(t) if t.kind == Kind::Num => {
                self.pos += 1;
                Ok(t.num)
            }
            _ => bail!("bad #if expression"),
        }
    }

    fn unary(&mut self) -> Result<i64> {
        if self.jmp(Kind::Not) {
            return Ok((self.unary()? == 0) as i64);
        }
        if self.jmp(Kind::Tilde) {
            return Ok(!self.unary()?);
        }
        if self.jmp(Kind::Minus) {
            return Ok(self.unary()?.wrapping_neg());
        }
        if self.jmp(Kind::Plus) {
            return self.unary();
        }
        self.primary()
    }

    fn mul(&mut self) -> Result<i64> {
        let mut v = self.unary()?;
        loop {
            if self.jmp(Kind::Star) {
                v = v.wrapping_mul(self.unary()?);
            } else if self.jmp(Kind::Slash) {
                let d = self.unary()?;
                if d == 0 {
                    bail!("division by zero in #if");
                }
                v = v.wrapping_div(d);
            } else if self.jmp(Kind::Percent) {
                let d = self.unary()?;
                if d == 0 {
                    bail!("division by zero in #if");
                }
                v = v.wrapping_rem(d);
            } else {
                return Ok(v);
            }
        }
    }

    fn add(&mut self) -> Result<i64> {
        let mut v = self.mul()?;
        loop {
            if self.jmp(Kind::Plus) {
                v = v.wrapping_add(self.mul()?);
            } else if self.jmp(Kind::Minus) {
                v = v.wrapping_sub(self.mul()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn shift(&mut self) -> Result<i64> {
        let mut v = self.add()?;
        loop {
            if self.jmp(Kind::Shl) {
                v = v.wrapping_shl(self.add()? as u32);
            } else if self.jmp(Kind::Shr) {
                v = v.wrapping_shr(self.add()? as u32);
            } else {
                return Ok(v);
            }
        }
    }

    fn rel(&mut self) -> Result<i64> {
        let mut v = self.shift()?;
        loop {
            if self.jmp(Kind::Lt) {
                v = (v < self.shift()?) as i64;
            } else if self.jmp(Kind::Gt) {
                v = (v > self.shift()?) as i64;
            } else if self.jmp(Kind::Le) {
                v = (v <= self.shift()?) as i64;
            } else if self.jmp(Kind::Ge) {
                v = (v >= self.shift()?) as i64;
            } else {
                return Ok(v);
            }
        }
    }

    fn eq(&mut self) -> Result<i64> {
        let mut v = self.rel()?;
        loop {
            if self.jmp(Kind::EqEq) {
                v = (v == self.rel()?) as i64;
            } else if self.jmp(Kind::NotEq) {
                v = (v != self.rel()?) as i64;
            } else {
                return Ok(v);
            }
        }
    }

    fn bitand(&mut self) -> Result<i64> {
        let mut v = self.eq()?;
        while self.jmp(Kind::Amp) {
            v &= self.eq()?;
        }
        Ok(v)
    }

    fn bitxor(&mut self) -> Result<i64> {
        let mut v = self.bitand()?;
        while self.jmp(Kind::Caret) {
            v ^= self.bitand()?;
        }
        Ok(v)
    }

    fn bit_or(&mut self) -> Result<i64> {
        let mut v = self.bitxor()?;
        while self.jmp(Kind::Pipe) {
            v |= self.bitxor()?;
        }
        Ok(v)
    }

    fn logic_and(&mut self) -> Result<i64> {
        let mut v = self.bit_or()?;
        while self.jmp(Kind::AndAnd) {
            let r = self.bit_or()?;
            v = (v != 0 && r != 0) as i64;
        }
        Ok(v)
    }

    fn logic_or(&mut self) -> Result<i64> {
        let mut v = self.logic_and()?;
        while self.jmp(Kind::OrOr) {
            let r = self.logic_and()?;
            v = (v != 0 || r != 0) as i64;
        }
        Ok(v)
    }
}

fn punct_text(kind: Kind) -> &'static str {
    use Kind::*;
    match kind {
        LBrace => "{",
        RBrace => "}",
        LPar => "(",
        RPar => ")",
        LBrk => "[",
        RBrk => "]",
        Semi => ";",
        Comma => ",",
        Colon => ":",
        Quest => "?",
        Dot => ".",
        Arrow => "->",
        Assign => "=",
        Plus => "+",
        Minus => "-",
        Star => "*",
        Slash => "/",
        Percent => "%",
        Amp => "&",
        Pipe => "|",
        Caret => "^",
        Tilde => "~",
        Not => "!",
        Lt => "<",
        Gt => ">",
        Le => "<=",
        Ge => ">=",
        EqEq => "==",
        NotEq => "!=",
        Shl => "<<",
        Shr => ">>",
        AndAnd => "&&",
        OrOr => "||",
        Inc => "++",
        Dec => "--",
        PlusEq => "+=",
        MinusEq => "-=",
        StarEq => "*=",
        SlashEq => "/=",
        PercentEq => "%=",
        ShlEq => "<<=",
        ShrEq => ">>=",
        AmpEq => "&=",
        PipeEq => "|=",
        CaretEq => "^=",
        Ellipsis => "...",
        Hash => "#",
        _ => "",
    }
}

/// Flatten tokens back to text (include targets, #error messages).
fn toks_text(toks: &[Token]) -> String {
    let mut s = String::new();
    for t in toks {
        match t.kind {
            Kind::Name => s.push_str(&t.text),
            Kind::Num => s.push_str(&t.num.to_string()),
            Kind::Str => s.push_str(&String::from_utf8_lossy(&t.bytes)),
            k => s.push_str(punct_text(k)),
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(src: &str) -> Vec<Token> {
        let mut cpp = Cpp::new();
        cpp.read_str("t.c", src).unwrap();
        let mut ts = cpp.finish();
        let mut out = Vec::new();
        while ts.see() != Kind::Eof {
            out.push(ts.get().clone());
        }
        out
    }

    fn texts(toks: &[Token]) -> Vec<String> {
        toks.iter()
            .map(|t| match t.kind {
                Kind::Num => t.num.to_string(),
                Kind::Name => t.text.clone(),
                k => punct_text(k).to_string(),
            })
            .collect()
    }

    #[test]
    fn object_macro() {
        let toks = expand("#define N 10\nint a = N;");
        assert_eq!(texts(&toks), vec!["int", "a", "=", "10", ";"]);
        assert_eq!(toks[0].kind, Kind::Int);
    }

    #[test]
    fn function_macro_with_args() {
        let toks = expand("#define SQ(x) ((x) * (x))\nSQ(a + 1)");
        assert_eq!(
            texts(&toks),
            vec!["(", "(", "a", "+", "1", ")", "*", "(", "a", "+", "1", ")", ")"]
        );
    }

    #[test]
    fn attribute_erasure() {
        let mut cpp = Cpp::new();
        cpp.define("__attribute__(x)=").unwrap();
        cpp.read_str("t.c", "int __attribute__((noreturn)) f;").unwrap();
        let mut ts = cpp.finish();
        let mut kinds = Vec::new();
        while ts.see() != Kind::Eof {
            kinds.push(ts.get().kind);
        }
        assert_eq!(kinds, vec![Kind::Int, Kind::Name, Kind::Semi]);
    }

    #[test]
    fn conditionals_nest() {
        let toks = expand("#define A\n#ifdef A\n#ifndef B\n1\n#else\n2\n#endif\n#else\n3\n#endif");
        assert_eq!(texts(&toks), vec!["1"]);
    }

    #[test]
    fn if_expression() {
        let toks = expand("#if defined(A) || 2 * 3 > 5\nyes\n#endif\n#if 0\nno\n#endif");
        assert_eq!(texts(&toks), vec!["yes"]);
    }

    #[test]
    fn elif_chain() {
        let toks = expand("#define V 2\n#if V == 1\na\n#elif V == 2\nb\n#elif V == 3\nc\n#else\nd\n#endif");
        assert_eq!(texts(&toks), vec!["b"]);
    }

    #[test]
    fn string_concatenation() {
        let toks = expand(r#"char *s = "ab" "cd";"#);
        let s = toks.iter().find(|t| t.kind == Kind::Str).unwrap();
        assert_eq!(s.bytes, b"abcd");
    }

    #[test]
    fn macro_not_reexpanded_recursively() {
        let toks = expand("#define a a b\na");
        assert_eq!(texts(&toks), vec!["a", "b"]);
    }

    #[test]
    fn keyword_erasure_via_define() {
        let mut cpp = Cpp::new();
        cpp.define("const=").unwrap();
        cpp.read_str("t.c", "const int x;").unwrap();
        let mut ts = cpp.finish();
        let mut kinds = Vec::new();
        while ts.see() != Kind::Eof {
            kinds.push(ts.get().kind);
        }
        assert_eq!(kinds, vec![Kind::Int, Kind::Name, Kind::Semi]);
    }
}
