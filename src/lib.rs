//! CubeScript: an embeddable, dynamically-typed, command-oriented
//! scripting language. Source text is compiled in a single pass into a
//! compact 32-bit bytecode and executed by a stack-based interpreter.
//!
//! The host embeds the language by constructing a [`State`], registering
//! native commands and variables on it, and running script text:
//!
//! ```
//! use cubescript::{State, Value};
//!
//! let mut cs = State::new();
//! cs.new_command("double", "i", |_, args, res| {
//!     *res = Value::Int(args[0].get_int() * 2);
//!     Ok(())
//! })
//! .unwrap();
//! assert_eq!(cs.run_int("double 21").unwrap(), 42);
//! ```

#![allow(clippy::result_large_err)]

pub mod bytecode;
pub mod error;
pub mod ident;
pub mod parser;
pub mod state;
pub mod stdlib;
pub mod strpool;
pub mod value;

mod gen;
mod vm;

pub use bytecode::{disassemble, CodeBlock, CodeRef};
pub use error::{CubeError, ParseError, RuntimeError, SrcPos, TraceFrame};
pub use ident::{Ident, IdentKind, MAX_ARGUMENTS, MAX_RESULTS, MAX_RUN_DEPTH};
pub use state::{format_var, State};
pub use strpool::StringPool;
pub use value::Value;

/// Evaluate source text in a fresh state with the base library loaded.
pub fn eval(source: &str) -> Result<Value, CubeError> {
    let mut state = State::new();
    stdlib::register(&mut state)?;
    state.run(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_round_trip() {
        assert_eq!(eval("+ 2 3").unwrap().get_int(), 5);
    }
}
