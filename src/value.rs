//! Runtime values: a tagged union over null, numbers, strings in their
//! three flavors, bytecode references and identifier references.

use std::fmt;
use std::rc::Rc;

use crate::bytecode::block::CodeRef;
use crate::parser::text;
use crate::strpool::StringPool;

/// A script value.
///
/// `Str` is an owned handle into the intern pool. `CStr` is a borrowed view
/// of interned content that carries no pool reference of its own. `Macro`
/// holds bytes captured from inside a bytecode block and is never interned.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i32),
    Float(f32),
    Str(Rc<str>),
    CStr(Rc<str>),
    Macro(Rc<str>),
    Code(CodeRef),
    Ident(usize),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::CStr(_) => "cstring",
            Value::Macro(_) => "macro",
            Value::Code(_) => "code",
            Value::Ident(_) => "ident",
        }
    }

    /// The string content of the three string flavors, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::CStr(s) | Value::Macro(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&CodeRef> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_ident(&self) -> Option<usize> {
        match self {
            Value::Ident(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_int(&self) -> i32 {
        match self {
            Value::Int(v) => *v,
            Value::Float(v) => *v as i32,
            Value::Str(s) | Value::CStr(s) | Value::Macro(s) => text::parse_int(s).0,
            _ => 0,
        }
    }

    pub fn get_float(&self) -> f32 {
        match self {
            Value::Int(v) => *v as f32,
            Value::Float(v) => *v,
            Value::Str(s) | Value::CStr(s) | Value::Macro(s) => text::parse_float(s).0,
            _ => 0.0,
        }
    }

    /// Render the value as text. Null, code and identifier references
    /// render empty.
    pub fn get_str(&self) -> String {
        match self {
            Value::Int(v) => text::int_str(*v),
            Value::Float(v) => text::float_str(*v),
            Value::Str(s) | Value::CStr(s) | Value::Macro(s) => s.to_string(),
            _ => String::new(),
        }
    }

    /// Truthiness: nonzero numbers are true; strings that parse fully as a
    /// number follow that number, any other nonempty string is true.
    pub fn get_bool(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) | Value::CStr(s) | Value::Macro(s) => {
                if s.is_empty() {
                    return false;
                }
                let (iv, n) = text::parse_int(s);
                if n == s.len() {
                    return iv != 0;
                }
                let (fv, n) = text::parse_float(s);
                if n == s.len() {
                    return fv != 0.0;
                }
                true
            }
            _ => false,
        }
    }

    pub fn force_int(&mut self) {
        if !matches!(self, Value::Int(_)) {
            *self = Value::Int(self.get_int());
        }
    }

    pub fn force_float(&mut self) {
        if !matches!(self, Value::Float(_)) {
            *self = Value::Float(self.get_float());
        }
    }

    /// Coerce to an owned interned string.
    pub fn force_str(&mut self, pool: &mut StringPool) {
        match self {
            Value::Str(_) => {}
            Value::CStr(s) => *self = Value::Str(s.clone()),
            Value::Macro(s) => *self = Value::Str(pool.add(s)),
            other => *other = Value::Str(pool.add(&other.get_str())),
        }
    }

    pub fn force_null(&mut self) {
        *self = Value::Null;
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.get_str())
    }
}

/// Join rendered values with `sep`, the way command concatenation does.
pub fn concat_values(vals: &[Value], sep: &str) -> String {
    let mut out = String::new();
    for (i, v) in vals.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(&v.get_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_defaults() {
        assert_eq!(Value::Null.get_int(), 0);
        assert_eq!(Value::Null.get_float(), 0.0);
        assert_eq!(Value::Null.get_str(), "");
        assert!(!Value::Null.get_bool());
    }

    #[test]
    fn string_truthiness() {
        let t = |s: &str| Value::Str(Rc::from(s)).get_bool();
        assert!(!t(""));
        assert!(!t("0"));
        assert!(!t("0.0"));
        assert!(t("1"));
        assert!(t("yes"));
        assert!(t("0x10"));
    }

    #[test]
    fn numeric_round_trip() {
        let mut pool = StringPool::new();
        let mut v = Value::Int(-37);
        v.force_str(&mut pool);
        assert_eq!(v.get_int(), -37);

        let mut v = Value::Float(2.5);
        v.force_str(&mut pool);
        assert_eq!(v.get_str(), "2.5");
        assert_eq!(v.get_float(), 2.5);

        let mut v = Value::Float(4.0);
        v.force_str(&mut pool);
        assert_eq!(v.get_str(), "4.0");
        assert_eq!(v.get_float(), 4.0);
    }

    #[test]
    fn force_str_interns() {
        let mut pool = StringPool::new();
        let mut a = Value::Int(7);
        let mut b = Value::Int(7);
        a.force_str(&mut pool);
        b.force_str(&mut pool);
        match (&a, &b) {
            (Value::Str(x), Value::Str(y)) => assert!(Rc::ptr_eq(x, y)),
            _ => panic!("expected interned strings"),
        }
    }

    #[test]
    fn concatenation() {
        let vals = [
            Value::Str(Rc::from("a")),
            Value::Int(2),
            Value::Null,
            Value::Float(1.5),
        ];
        assert_eq!(concat_values(&vals, " "), "a 2  1.5");
        assert_eq!(concat_values(&vals, ""), "a21.5");
    }
}
