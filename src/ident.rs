//! Identifier records: aliases, typed variables, commands and the
//! built-in specials, all indexed by a dense, stable integer.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::bytecode::block::CodeRef;
use crate::error::CubeError;
use crate::state::State;
use crate::value::Value;

/// Positional argument slots shared by every call frame.
pub const MAX_ARGUMENTS: usize = 25;
/// Result registers available on top of the argument slots.
pub const MAX_RESULTS: usize = 7;
/// Recursion cap for nested `run` frames.
pub const MAX_RUN_DEPTH: usize = 255;

/// Reserved indices assigned at state construction.
pub const DUMMY_IDX: usize = MAX_ARGUMENTS;
pub const NUMARGS_IDX: usize = MAX_ARGUMENTS + 1;
pub const DBGALIAS_IDX: usize = MAX_ARGUMENTS + 2;

pub const FLAG_PERSIST: u32 = 1 << 0;
pub const FLAG_OVERRIDE: u32 = 1 << 1;
pub const FLAG_READ_ONLY: u32 = 1 << 3;
pub const FLAG_ARG: u32 = 1 << 4;
pub const FLAG_HEX: u32 = 1 << 5;
pub const FLAG_UNKNOWN: u32 = 1 << 25;

/// Callback type for native commands: the interpreter state, the argument
/// slice, and the result slot.
pub type CommandFn = Rc<dyn Fn(&mut State, &mut [Value], &mut Value) -> Result<(), CubeError>>;

/// Callback invoked after a variable write, inside the setter.
pub type VarHook = Rc<dyn Fn(&mut State, &Rc<Ident>)>;

/// Mutable core of an alias: its value, the stack of values saved by
/// enclosing frames, and the cached compilation of the current value.
#[derive(Default)]
pub struct AliasData {
    pub value: Value,
    pub stack: Vec<Value>,
    pub code: Option<CodeRef>,
}

impl AliasData {
    pub fn set_value(&mut self, v: Value) {
        self.value = v;
        self.code = None;
    }

    /// Save the current value and install a new one.
    pub fn push(&mut self, v: Value) {
        let old = std::mem::replace(&mut self.value, v);
        self.stack.push(old);
        self.code = None;
    }

    /// Restore the most recently saved value.
    pub fn pop(&mut self) -> bool {
        match self.stack.pop() {
            Some(old) => {
                self.value = old;
                self.code = None;
                true
            }
            None => false,
        }
    }

    /// Swap the current value out for the saved one, handing the current
    /// value to the caller. Inverse of [`AliasData::redo`].
    pub fn undo(&mut self) -> Value {
        let saved = self.stack.pop().unwrap_or_default();
        self.code = None;
        std::mem::replace(&mut self.value, saved)
    }

    /// Re-install a value taken by [`AliasData::undo`].
    pub fn redo(&mut self, v: Value) {
        let outer = std::mem::replace(&mut self.value, v);
        self.stack.push(outer);
        self.code = None;
    }
}

pub struct IntVar {
    pub storage: Cell<i32>,
    pub min: i32,
    pub max: i32,
    pub default: i32,
    pub hook: Option<VarHook>,
}

pub struct FloatVar {
    pub storage: Cell<f32>,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub hook: Option<VarHook>,
}

pub struct StrVar {
    pub storage: RefCell<Rc<str>>,
    pub default: Rc<str>,
    pub hook: Option<VarHook>,
}

/// A native command: its argument format, the derived fixed arity, and
/// the callback.
pub struct Command {
    pub format: String,
    pub num_args: usize,
    pub variadic: bool,
    pub cb: CommandFn,
}

/// Built-ins the code generator compiles specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    If,
    And,
    Or,
    Do,
    DoArgs,
    Local,
    Not,
    Result,
    Break,
    Continue,
}

pub enum IdentKind {
    Alias(RefCell<AliasData>),
    IVar(IntVar),
    FVar(FloatVar),
    SVar(StrVar),
    Command(Command),
    /// A special, with its runtime fallback for dynamic invocation.
    Special(SpecialKind, Option<Command>),
}

pub struct Ident {
    pub name: Rc<str>,
    pub index: usize,
    pub flags: Cell<u32>,
    pub kind: IdentKind,
}

impl Ident {
    pub fn new(name: Rc<str>, index: usize, flags: u32, kind: IdentKind) -> Rc<Self> {
        Rc::new(Self {
            name,
            index,
            flags: Cell::new(flags),
            kind,
        })
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, IdentKind::Alias(_))
    }

    pub fn is_var(&self) -> bool {
        matches!(
            self.kind,
            IdentKind::IVar(_) | IdentKind::FVar(_) | IdentKind::SVar(_)
        )
    }

    pub fn is_command(&self) -> bool {
        matches!(self.kind, IdentKind::Command(_))
    }

    /// Whether the identifier is one of the positional argument slots.
    pub fn is_arg(&self) -> bool {
        self.index < MAX_ARGUMENTS && self.is_alias()
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.get() & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.set(self.flags.get() | flag);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.set(self.flags.get() & !flag);
    }

    pub fn alias(&self) -> &RefCell<AliasData> {
        match &self.kind {
            IdentKind::Alias(a) => a,
            _ => panic!("identifier '{}' is not an alias", self.name),
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match &self.kind {
            IdentKind::Command(c) => Some(c),
            IdentKind::Special(_, Some(c)) => Some(c),
            _ => None,
        }
    }

    pub fn special(&self) -> Option<SpecialKind> {
        match &self.kind {
            IdentKind::Special(kind, _) => Some(*kind),
            _ => None,
        }
    }
}

/// Validate a command format string and derive its fixed arity.
///
/// Digit groups must repeat at least as many letters as they name and must
/// be immediately followed by `C` or `V`; nothing may follow `C`/`V`.
pub fn parse_format(fmt: &str) -> Result<(usize, bool), String> {
    let mut num_args = 0usize;
    let mut variadic = false;
    let mut pending_digit = false;
    let bytes = fmt.as_bytes();
    for (i, &c) in bytes.iter().enumerate() {
        if variadic {
            return Err(format!("format letters after C/V in \"{}\"", fmt));
        }
        match c {
            b'i' | b'b' | b'f' | b'F' | b's' | b'S' | b't' | b'T' | b'E' | b'e' | b'r'
            | b'$' | b'N' => {
                if pending_digit {
                    return Err(format!("digit group must precede C/V in \"{}\"", fmt));
                }
                num_args += 1;
            }
            b'1'..=b'4' => {
                let rep = (c - b'0') as usize;
                if pending_digit || i < rep {
                    return Err(format!("bad repetition group in \"{}\"", fmt));
                }
                pending_digit = true;
            }
            b'C' | b'V' => variadic = true,
            _ => return Err(format!("unknown format letter '{}'", c as char)),
        }
    }
    if pending_digit && !variadic {
        return Err(format!("digit group must precede C/V in \"{}\"", fmt));
    }
    if num_args > MAX_ARGUMENTS {
        return Err(format!("too many arguments in \"{}\"", fmt));
    }
    Ok((num_args, variadic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_push_pop_restores() {
        let mut a = AliasData::default();
        a.set_value(Value::Int(1));
        a.push(Value::Int(2));
        assert_eq!(a.value.get_int(), 2);
        assert!(a.pop());
        assert_eq!(a.value.get_int(), 1);
        assert!(!a.pop());
    }

    #[test]
    fn alias_undo_redo() {
        let mut a = AliasData::default();
        a.set_value(Value::Int(1));
        a.push(Value::Int(2));
        let held = a.undo();
        assert_eq!(held.get_int(), 2);
        assert_eq!(a.value.get_int(), 1);
        a.redo(held);
        assert_eq!(a.value.get_int(), 2);
        assert!(a.pop());
        assert_eq!(a.value.get_int(), 1);
    }

    #[test]
    fn format_arity() {
        assert_eq!(parse_format("tee").unwrap(), (3, false));
        assert_eq!(parse_format("C").unwrap(), (0, true));
        assert_eq!(parse_format("E1V").unwrap(), (1, true));
        assert_eq!(parse_format("rie").unwrap(), (3, false));
        assert_eq!(parse_format("$iN").unwrap(), (3, false));
    }

    #[test]
    fn format_rejections() {
        assert!(parse_format("Vi").is_err());
        assert!(parse_format("Cs").is_err());
        assert!(parse_format("1V").is_err());
        assert!(parse_format("i1").is_err());
        assert!(parse_format("z").is_err());
    }
}
