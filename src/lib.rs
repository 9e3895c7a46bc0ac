#![forbid(unsafe_code)]
pub mod cpp;
pub mod gen;
pub mod obj;
pub mod parse;
pub mod sym;
pub mod tok;
pub mod ty;
pub mod vm;

#[cfg(test)]
mod test;

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::cpp::Cpp;
use crate::obj::Object;
use crate::parse::Parser;

/// Compilation options mirroring the CLI flags.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// `-I`: include search paths, in order.
    pub include_paths: Vec<PathBuf>,
    /// `-D`: macro definitions, `name` or `name=value`.
    pub defines: Vec<String>,
}

/// Install the predefined macros: the usual platform tags, the type
/// qualifiers this compiler erases, and the builtin va_list alias.
pub fn predefine(cpp: &mut Cpp) -> Result<()> {
    cpp.define("__STDC__")?;
    cpp.define("__linux__")?;
    cpp.define("__x86_64__")?;
    for kw in [
        "const",
        "register",
        "volatile",
        "inline",
        "restrict",
        "__inline__",
        "__restrict__",
    ] {
        cpp.define(kw)?;
    }
    cpp.define("__attribute__(x)=")?;
    cpp.define("__builtin_va_list__=long")?;
    Ok(())
}

fn make_cpp(opts: &Options) -> Result<Cpp> {
    let mut cpp = Cpp::new();
    predefine(&mut cpp)?;
    for p in &opts.include_paths {
        cpp.add_path(p.clone());
    }
    for d in &opts.defines {
        cpp.define(d)?;
    }
    Ok(cpp)
}

/// Compile one translation unit from disk into an object.
pub fn compile_file(path: &Path, opts: &Options) -> Result<Object> {
    let mut cpp = make_cpp(opts)?;
    cpp.read_file(path)?;
    let mut parser = Parser::new(cpp.finish());
    parser.parse_unit()?;
    Ok(parser.into_object())
}

/// Compile in-memory source (tests and tooling).
pub fn compile_str(name: &str, src: &str, opts: &Options) -> Result<Object> {
    let mut cpp = make_cpp(opts)?;
    cpp.read_str(name, src)?;
    let mut parser = Parser::new(cpp.finish());
    parser.parse_unit()?;
    Ok(parser.into_object())
}
