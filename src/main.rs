use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rcc::Options;

/// Compile a C source file into an rcc object file.
#[derive(Clone, Debug, Parser)]
struct Args {
    /// input filename to compile
    input: PathBuf,
    /// append an include search path
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,
    /// predefine a macro: NAME or NAME=VALUE
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    define: Vec<String>,
    /// output object file; defaults to the input with its last
    /// character replaced by `o`
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,
}

fn default_output(input: &PathBuf) -> PathBuf {
    let mut s = input.to_string_lossy().into_owned();
    s.pop();
    s.push('o');
    PathBuf::from(s)
}

fn run() -> Result<()> {
    let args = Args::parse();
    let opts = Options {
        include_paths: args.include.clone(),
        defines: args.define.clone(),
    };
    let obj = rcc::compile_file(&args.input, &opts)?;
    let out = args.output.clone().unwrap_or_else(|| default_output(&args.input));
    let mut file = File::create(&out)
        .with_context(|| format!("cannot create <{}>", out.display()))?;
    obj.write(&mut file)?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
