//! quill: a small imperative scripting language.
//!
//! Source text is lexed and parsed into a syntax tree, compiled to a flat
//! instruction stream, and executed by a stack machine with a mark-sweep
//! collected heap.

use std::io::Write;

pub mod ast;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod vm;

use ast::Program;
use vm::{CompiledProgram, MachineConfig, Value};

/// Any failure along the source-to-result pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Compile(#[from] vm::CompileError),
    #[error(transparent)]
    Runtime(#[from] vm::VmError),
    #[error("invalid syntax tree: {0}")]
    Ast(#[from] serde_json::Error),
}

/// Lex and parse. The returned program keeps the source for diagnostics.
pub fn parse_source(source: &str) -> Result<Program, Error> {
    let tokens = lexer::lex(source)?;
    let mut program = parser::parse(tokens)?;
    program.source = Some(source.to_string());
    Ok(program)
}

/// Read a syntax tree produced by an external front end.
pub fn parse_ast_json(json: &str) -> Result<Program, Error> {
    Ok(serde_json::from_str(json)?)
}

pub fn compile_source(source: &str) -> Result<CompiledProgram, Error> {
    let program = parse_source(source)?;
    Ok(vm::compile(&program)?)
}

/// Compile and run `source`, writing program output to `out`.
pub fn run_source<W: Write>(source: &str, config: MachineConfig, out: W) -> Result<Value, Error> {
    let compiled = compile_source(source)?;
    Ok(vm::run(&compiled, config, out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(source: &str) -> String {
        let mut out = Vec::new();
        run_source(source, MachineConfig::default(), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn end_to_end_programs() {
        assert_eq!(output("function main() { printLine 1 + 2 * 3; }"), "7\n");
        assert_eq!(
            output("function factorial(n){ if (n<2){ return 1; } return n*factorial(n-1); } function main(){ printLine factorial(5); }"),
            "120\n"
        );
        assert_eq!(
            output("function main(){ var total=0; for i=0,i<5,i=i+1{ total=total+i; } printLine total; }"),
            "10\n"
        );
        assert_eq!(output("function main(){ var a=[1,2,3]; a[0]=9; printLine a[0]; }"), "9\n");
    }

    #[test]
    fn builtin_length_of_literal() {
        assert_eq!(output("function main() { printLine length([4, 5, 6]); }"), "3\n");
    }

    #[test]
    fn errors_carry_their_stage() {
        let sink = std::io::sink();
        assert!(matches!(run_source("function main() { @ }", MachineConfig::default(), sink), Err(Error::Lex(_))));
        let sink = std::io::sink();
        assert!(matches!(run_source("function main() {", MachineConfig::default(), sink), Err(Error::Parse(_))));
        let sink = std::io::sink();
        assert!(matches!(run_source("function main() { break; }", MachineConfig::default(), sink), Err(Error::Compile(_))));
        let sink = std::io::sink();
        assert!(matches!(run_source("function main() { 1 / 0; }", MachineConfig::default(), sink), Err(Error::Runtime(_))));
    }

    #[test]
    fn parse_source_keeps_source() {
        let program = parse_source("function main() {}").unwrap();
        assert_eq!(program.source.as_deref(), Some("function main() {}"));
    }

    #[test]
    fn ast_json_round_trip_runs() {
        let program = parse_source("function main() { printLine \"hi\"; }").unwrap();
        let json = serde_json::to_string(&program).unwrap();
        let restored = parse_ast_json(&json).unwrap();
        let compiled = vm::compile(&restored).unwrap();
        let mut out = Vec::new();
        vm::run(&compiled, MachineConfig::default(), &mut out).unwrap();
        assert_eq!(out, b"hi\n");
    }

    #[test]
    fn malformed_ast_json_is_rejected() {
        assert!(matches!(parse_ast_json("{\"functions\": 3}"), Err(Error::Ast(_))));
    }
}
