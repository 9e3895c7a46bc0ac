use anyhow::{anyhow, bail, Result};

use crate::ty::BType;

/// Token kind.  Keywords are classified from identifiers only after
/// preprocessing, so that specifier keywords remain `#define`-able.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Num,
    Str,
    Name,
    Eof,
    // keywords
    Void,
    Int,
    Char,
    Short,
    Long,
    Signed,
    Unsigned,
    Static,
    Extern,
    Struct,
    Union,
    Enum,
    Typedef,
    Sizeof,
    If,
    Else,
    While,
    Do,
    For,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    Return,
    Goto,
    // punctuation
    LBrace,
    RBrace,
    LPar,
    RPar,
    LBrk,
    RBrk,
    Semi,
    Comma,
    Colon,
    Quest,
    Dot,
    Arrow,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Not,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    NotEq,
    Shl,
    Shr,
    AndAnd,
    OrOr,
    Inc,
    Dec,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    ShlEq,
    ShrEq,
    AmpEq,
    PipeEq,
    CaretEq,
    Ellipsis,
    Hash,
}

/// Source location of a token: an index into the preprocessor's file
/// table plus a 1-based line number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Loc {
    pub file: u16,
    pub line: u32,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: Kind,
    pub loc: Loc,
    /// First token on its (unspliced) source line; directives key off this.
    pub bol: bool,
    /// Whitespace separated this token from the previous one.  The
    /// preprocessor uses this to tell `#define F(x)` from `#define F (x)`.
    pub spaced: bool,
    pub num: i64,
    pub num_bt: BType,
    /// Identifier text; also kept for keywords until classification.
    pub text: String,
    /// String literal payload, without the trailing NUL.
    pub bytes: Vec<u8>,
}

impl Token {
    pub fn punct(kind: Kind, loc: Loc) -> Self {
        Token {
            kind,
            loc,
            bol: false,
            spaced: false,
            num: 0,
            num_bt: BType::INT,
            text: String::new(),
            bytes: Vec::new(),
        }
    }

    pub fn name(text: impl Into<String>, loc: Loc) -> Self {
        let mut t = Token::punct(Kind::Name, loc);
        t.text = text.into();
        t
    }

    pub fn num(n: i64, bt: BType, loc: Loc) -> Self {
        let mut t = Token::punct(Kind::Num, loc);
        t.num = n;
        t.num_bt = bt;
        t
    }
}

/// Map an identifier to its keyword kind, if any.
pub fn keyword(text: &str) -> Option<Kind> {
    Some(match text {
        "void" => Kind::Void,
        "int" => Kind::Int,
        "char" => Kind::Char,
        "short" => Kind::Short,
        "long" => Kind::Long,
        "signed" => Kind::Signed,
        "unsigned" => Kind::Unsigned,
        "static" => Kind::Static,
        "extern" => Kind::Extern,
        "struct" => Kind::Struct,
        "union" => Kind::Union,
        "enum" => Kind::Enum,
        "typedef" => Kind::Typedef,
        "sizeof" => Kind::Sizeof,
        "if" => Kind::If,
        "else" => Kind::Else,
        "while" => Kind::While,
        "do" => Kind::Do,
        "for" => Kind::For,
        "switch" => Kind::Switch,
        "case" => Kind::Case,
        "default" => Kind::Default,
        "break" => Kind::Break,
        "continue" => Kind::Continue,
        "return" => Kind::Return,
        "goto" => Kind::Goto,
        _ => return None,
    })
}

/// Raw lexer over a single file's bytes.  Produces [`Kind::Name`] for
/// every identifier; keyword classification is the preprocessor's job.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    file: u16,
    fname: &'a str,
    line: u32,
    at_bol: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a [u8], file: u16, fname: &'a str) -> Self {
        Lexer { src, pos: 0, file, fname, line: 1, at_bol: true }
    }

    fn loc(&self) -> Loc {
        Loc { file: self.file, line: self.line }
    }

    fn err(&self, msg: &str) -> anyhow::Error {
        anyhow!("{}:{}: {}", self.fname, self.line, msg)
    }

    fn peek_at(&self, off: usize) -> u8 {
        *self.src.get(self.pos + off).unwrap_or(&0)
    }

    fn cur(&self) -> u8 {
        self.peek_at(0)
    }

    /// Skip whitespace, comments and line splices, tracking line starts.
    fn skip_space(&mut self) -> Result<()> {
        loop {
            match self.cur() {
                b'\n' => {
                    self.pos += 1;
                    self.line += 1;
                    self.at_bol = true;
                }
                b' ' | b'\t' | b'\r' | 0x0b | 0x0c => self.pos += 1,
                b'\\' if self.peek_at(1) == b'\n' => {
                    self.pos += 2;
                    self.line += 1;
                }
                b'/' if self.peek_at(1) == b'/' => {
                    while self.pos < self.src.len() && self.cur() != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.peek_at(1) == b'*' => {
                    let start = self.line;
                    self.pos += 2;
                    loop {
                        if self.pos >= self.src.len() {
                            self.line = start;
                            return Err(self.err("unterminated comment"));
                        }
                        if self.cur() == b'\n' {
                            self.line += 1;
                        }
                        if self.cur() == b'*' && self.peek_at(1) == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_escape(&mut self) -> Result<u8> {
        self.pos += 1; // backslash
        let c = self.cur();
        self.pos += 1;
        Ok(match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'e' => 0x1b,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'?' => b'?',
            b'x' => {
                let mut v: u32 = 0;
                let mut seen = false;
                while self.cur().is_ascii_hexdigit() {
                    v = v * 16 + (self.cur() as char).to_digit(16).unwrap();
                    self.pos += 1;
                    seen = true;
                }
                if !seen {
                    return Err(self.err("bad hex escape"));
                }
                v as u8
            }
            b'0'..=b'7' => {
                let mut v: u32 = (c - b'0') as u32;
                for _ in 0..2 {
                    if !(b'0'..=b'7').contains(&self.cur()) {
                        break;
                    }
                    v = v * 8 + (self.cur() - b'0') as u32;
                    self.pos += 1;
                }
                v as u8
            }
            _ => return Err(self.err("bad escape sequence")),
        })
    }

    fn read_num(&mut self) -> Result<Token> {
        let loc = self.loc();
        let mut val: u64;
        if self.cur() == b'0' && matches!(self.peek_at(1), b'x' | b'X') {
            self.pos += 2;
            val = 0;
            if !self.cur().is_ascii_hexdigit() {
                return Err(self.err("bad hex constant"));
            }
            while self.cur().is_ascii_hexdigit() {
                val = val
                    .wrapping_mul(16)
                    .wrapping_add((self.cur() as char).to_digit(16).unwrap() as u64);
                self.pos += 1;
            }
        } else {
            let base: u64 = if self.cur() == b'0' { 8 } else { 10 };
            val = 0;
            while self.cur().is_ascii_digit() {
                val = val.wrapping_mul(base).wrapping_add((self.cur() - b'0') as u64);
                self.pos += 1;
            }
        }
        let mut signed = true;
        let mut size = 4u8;
        while matches!(self.cur(), b'u' | b'U' | b'l' | b'L') {
            match self.cur() {
                b'u' | b'U' => signed = false,
                _ => size = crate::ty::LONGSZ,
            }
            self.pos += 1;
        }
        Ok(Token::num(val as i64, BType::new(size, signed), loc))
    }

    fn read_str(&mut self) -> Result<Token> {
        let loc = self.loc();
        let mut bytes = Vec::new();
        self.pos += 1; // opening quote
        loop {
            match self.cur() {
                0 => return Err(self.err("unterminated string literal")),
                b'"' => {
                    self.pos += 1;
                    break;
                }
                b'\n' => return Err(self.err("newline in string literal")),
                b'\\' => bytes.push(self.read_escape()?),
                c => {
                    bytes.push(c);
                    self.pos += 1;
                }
            }
        }
        let mut t = Token::punct(Kind::Str, loc);
        t.bytes = bytes;
        Ok(t)
    }

    fn read_char(&mut self) -> Result<Token> {
        let loc = self.loc();
        self.pos += 1; // opening quote
        let v = match self.cur() {
            0 | b'\n' => return Err(self.err("unterminated character constant")),
            b'\\' => self.read_escape()?,
            c => {
                self.pos += 1;
                c
            }
        };
        if self.cur() != b'\'' {
            return Err(self.err("unterminated character constant"));
        }
        self.pos += 1;
        Ok(Token::num(v as i64, BType::INT, loc))
    }

    /// Produce the next token, or `None` at end of file.
    pub fn next_token(&mut self) -> Result<Option<Token>> {
        let before = self.pos;
        self.skip_space()?;
        if self.pos >= self.src.len() {
            return Ok(None);
        }
        let bol = self.at_bol;
        let spaced = bol || self.pos != before || before == 0;
        self.at_bol = false;
        let mut tok = self.token_body()?;
        tok.bol = bol;
        tok.spaced = spaced;
        Ok(Some(tok))
    }

    fn token_body(&mut self) -> Result<Token> {
        let loc = self.loc();
        let c = self.cur();
        if c.is_ascii_digit() {
            return self.read_num();
        }
        if c == b'"' {
            return self.read_str();
        }
        if c == b'\'' {
            return self.read_char();
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while self.cur().is_ascii_alphanumeric() || self.cur() == b'_' {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[start..self.pos])
                .map_err(|_| self.err("non-ascii identifier"))?;
            return Ok(Token::name(text, loc));
        }
        // punctuation, longest match first
        let three = &self.src[self.pos..self.src.len().min(self.pos + 3)];
        let k3 = match three {
            b"<<=" => Some(Kind::ShlEq),
            b">>=" => Some(Kind::ShrEq),
            b"..." => Some(Kind::Ellipsis),
            _ => None,
        };
        if let Some(k) = k3 {
            self.pos += 3;
            return Ok(Token::punct(k, loc));
        }
        let two = &self.src[self.pos..self.src.len().min(self.pos + 2)];
        let k2 = match two {
            b"->" => Some(Kind::Arrow),
            b"++" => Some(Kind::Inc),
            b"--" => Some(Kind::Dec),
            b"<<" => Some(Kind::Shl),
            b">>" => Some(Kind::Shr),
            b"<=" => Some(Kind::Le),
            b">=" => Some(Kind::Ge),
            b"==" => Some(Kind::EqEq),
            b"!=" => Some(Kind::NotEq),
            b"&&" => Some(Kind::AndAnd),
            b"||" => Some(Kind::OrOr),
            b"+=" => Some(Kind::PlusEq),
            b"-=" => Some(Kind::MinusEq),
            b"*=" => Some(Kind::StarEq),
            b"/=" => Some(Kind::SlashEq),
            b"%=" => Some(Kind::PercentEq),
            b"&=" => Some(Kind::AmpEq),
            b"|=" => Some(Kind::PipeEq),
            b"^=" => Some(Kind::CaretEq),
            _ => None,
        };
        if let Some(k) = k2 {
            self.pos += 2;
            return Ok(Token::punct(k, loc));
        }
        let k1 = match c {
            b'{' => Kind::LBrace,
            b'}' => Kind::RBrace,
            b'(' => Kind::LPar,
            b')' => Kind::RPar,
            b'[' => Kind::LBrk,
            b']' => Kind::RBrk,
            b';' => Kind::Semi,
            b',' => Kind::Comma,
            b':' => Kind::Colon,
            b'?' => Kind::Quest,
            b'.' => Kind::Dot,
            b'=' => Kind::Assign,
            b'+' => Kind::Plus,
            b'-' => Kind::Minus,
            b'*' => Kind::Star,
            b'/' => Kind::Slash,
            b'%' => Kind::Percent,
            b'&' => Kind::Amp,
            b'|' => Kind::Pipe,
            b'^' => Kind::Caret,
            b'~' => Kind::Tilde,
            b'!' => Kind::Not,
            b'<' => Kind::Lt,
            b'>' => Kind::Gt,
            b'#' => Kind::Hash,
            _ => bail!("{}:{}: stray character {:?}", self.fname, self.line, c as char),
        };
        self.pos += 1;
        Ok(Token::punct(k1, loc))
    }
}

/// The preprocessed token stream the parser runs on.
///
/// The entire translation unit is expanded into `toks` up front, so the
/// cursor is a plain index and `addr`/`jump` replay (two-pass function
/// bodies, initializer size probing) re-produces the exact same tokens.
pub struct TokenStream {
    toks: Vec<Token>,
    files: Vec<String>,
    pos: usize,
}

impl TokenStream {
    pub fn new(mut toks: Vec<Token>, files: Vec<String>) -> Self {
        let eof_loc = toks.last().map(|t| t.loc).unwrap_or(Loc { file: 0, line: 1 });
        toks.push(Token::punct(Kind::Eof, eof_loc));
        TokenStream { toks, files, pos: 0 }
    }

    /// Peek the current token's kind.
    pub fn see(&self) -> Kind {
        self.toks[self.pos.min(self.toks.len() - 1)].kind
    }

    pub fn peek(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    /// Consume and return the current token.
    pub fn get(&mut self) -> &Token {
        let at = self.pos.min(self.toks.len() - 1);
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        &self.toks[at]
    }

    /// Consume the current token if it has the given kind.
    pub fn jmp(&mut self, kind: Kind) -> bool {
        if self.see() == kind {
            self.get();
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, kind: Kind) -> Result<&Token> {
        if self.see() != kind {
            bail!("{}: syntax error", self.loc_str(self.pos));
        }
        Ok(self.get())
    }

    /// The logical cursor; `jump` rewinds to a previously saved value.
    pub fn addr(&self) -> usize {
        self.pos
    }

    pub fn jump(&mut self, addr: usize) {
        self.pos = addr;
    }

    /// Render a token address as `file:line` for error messages.
    pub fn loc_str(&self, addr: usize) -> String {
        let tok = &self.toks[addr.min(self.toks.len() - 1)];
        let file = self
            .files
            .get(tok.loc.file as usize)
            .map(|s| s.as_str())
            .unwrap_or("<unknown>");
        format!("{}:{}", file, tok.loc.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new(src.as_bytes(), 0, "t.c");
        let mut out = Vec::new();
        while let Some(t) = lx.next_token().unwrap() {
            out.push(t);
        }
        out
    }

    #[test]
    fn punct_longest_match() {
        let kinds: Vec<Kind> = lex_all("a <<= b >> c >= ...").iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![Kind::Name, Kind::ShlEq, Kind::Name, Kind::Shr, Kind::Name, Kind::Ge, Kind::Ellipsis]
        );
    }

    #[test]
    fn numbers_and_suffixes() {
        let toks = lex_all("42 0x1f 010 7u 9L");
        let vals: Vec<i64> = toks.iter().map(|t| t.num).collect();
        assert_eq!(vals, vec![42, 31, 8, 7, 9]);
        assert!(toks[3].num_bt.signed == false);
        assert_eq!(toks[4].num_bt.size, crate::ty::LONGSZ);
    }

    #[test]
    fn char_and_string_escapes() {
        let toks = lex_all(r#"'h' "a\n\x41\0b""#);
        assert_eq!(toks[0].num, 'h' as i64);
        assert_eq!(toks[1].bytes, b"a\n\x41\0b");
    }

    #[test]
    fn comments_and_splice() {
        let toks = lex_all("a /* x\ny */ b // z\nc\\\nd");
        let names: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert!(toks[2].bol);
        assert!(!toks[3].bol);
    }

    #[test]
    fn stream_replay_is_exact() {
        let toks = lex_all("int a = 1 + 2;");
        let mut ts = TokenStream::new(toks, vec!["t.c".into()]);
        ts.get();
        let at = ts.addr();
        let first: Vec<Kind> = (0..3).map(|_| ts.get().kind).collect();
        ts.jump(at);
        let second: Vec<Kind> = (0..3).map(|_| ts.get().kind).collect();
        assert_eq!(first, second);
    }
}
