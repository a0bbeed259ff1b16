//! A small host-side base library: enough commands for the REPL and the
//! test suite. Registered entirely through the public embedding API; the
//! core never depends on it.

use crate::error::{CubeError, RuntimeError};
use crate::ident::DUMMY_IDX;
use crate::state::State;
use crate::value::Value;

fn fold_int(args: &[Value], f: fn(i32, i32) -> i32) -> i32 {
    let mut it = args.iter();
    let mut acc = it.next().map(|v| v.get_int()).unwrap_or(0);
    for v in it {
        acc = f(acc, v.get_int());
    }
    acc
}

fn fold_float(args: &[Value], f: fn(f32, f32) -> f32) -> f32 {
    let mut it = args.iter();
    let mut acc = it.next().map(|v| v.get_float()).unwrap_or(0.0);
    for v in it {
        acc = f(acc, v.get_float());
    }
    acc
}

fn chain_cmp(args: &[Value], f: fn(i32, i32) -> bool) -> i32 {
    args.windows(2).all(|w| f(w[0].get_int(), w[1].get_int())) as i32
}

/// Run a loop body, translating `break`/`continue` unwinds into loop
/// control. Returns `Ok(false)` to stop the loop.
fn run_loop_body(state: &mut State, body: &crate::bytecode::CodeRef) -> Result<bool, CubeError> {
    match state.run_code(body) {
        Ok(_) => Ok(true),
        Err(CubeError::Run(RuntimeError::Break)) => Ok(false),
        Err(CubeError::Run(RuntimeError::Continue)) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Register the base library into a state.
pub fn register(st: &mut State) -> Result<(), CubeError> {
    st.new_command("echo", "C", |state, args, _| {
        state.write_out(&args[0].get_str());
        Ok(())
    })?;

    st.new_command("alias", "st", |state, args, _| {
        let name = args[0].get_str();
        state.set_alias(&name, std::mem::take(&mut args[1]));
        Ok(())
    })?;

    st.new_command("concat", "C", |state, args, res| {
        let s = args[0].get_str();
        *res = Value::Str(state.strings.steal(s));
        Ok(())
    })?;

    st.new_command("concatword", "V", |state, args, res| {
        let s = crate::value::concat_values(args, "");
        *res = Value::Str(state.strings.steal(s));
        Ok(())
    })?;

    // --- Integer math ---
    st.new_command("+", "V", |_, args, res| {
        *res = Value::Int(fold_int(args, i32::wrapping_add));
        Ok(())
    })?;
    st.new_command("-", "V", |_, args, res| {
        *res = Value::Int(if args.len() == 1 {
            args[0].get_int().wrapping_neg()
        } else {
            fold_int(args, i32::wrapping_sub)
        });
        Ok(())
    })?;
    st.new_command("*", "V", |_, args, res| {
        *res = Value::Int(if args.is_empty() {
            1
        } else {
            fold_int(args, i32::wrapping_mul)
        });
        Ok(())
    })?;
    st.new_command("div", "V", |_, args, res| {
        *res = Value::Int(fold_int(args, |a, b| if b == 0 { 0 } else { a.wrapping_div(b) }));
        Ok(())
    })?;
    st.new_command("mod", "V", |_, args, res| {
        *res = Value::Int(fold_int(args, |a, b| if b == 0 { 0 } else { a.wrapping_rem(b) }));
        Ok(())
    })?;
    st.new_command("min", "V", |_, args, res| {
        *res = Value::Int(fold_int(args, i32::min));
        Ok(())
    })?;
    st.new_command("max", "V", |_, args, res| {
        *res = Value::Int(fold_int(args, i32::max));
        Ok(())
    })?;

    // --- Float math ---
    st.new_command("+f", "V", |_, args, res| {
        *res = Value::Float(fold_float(args, |a, b| a + b));
        Ok(())
    })?;
    st.new_command("-f", "V", |_, args, res| {
        *res = Value::Float(if args.len() == 1 {
            -args[0].get_float()
        } else {
            fold_float(args, |a, b| a - b)
        });
        Ok(())
    })?;
    st.new_command("*f", "V", |_, args, res| {
        *res = Value::Float(if args.is_empty() {
            1.0
        } else {
            fold_float(args, |a, b| a * b)
        });
        Ok(())
    })?;
    st.new_command("divf", "V", |_, args, res| {
        *res = Value::Float(fold_float(args, |a, b| if b == 0.0 { 0.0 } else { a / b }));
        Ok(())
    })?;

    // --- Comparisons ---
    st.new_command("=", "V", |_, args, res| {
        *res = Value::Int(chain_cmp(args, |a, b| a == b));
        Ok(())
    })?;
    st.new_command("!=", "V", |_, args, res| {
        *res = Value::Int(chain_cmp(args, |a, b| a != b));
        Ok(())
    })?;
    st.new_command("<", "V", |_, args, res| {
        *res = Value::Int(chain_cmp(args, |a, b| a < b));
        Ok(())
    })?;
    st.new_command("<=", "V", |_, args, res| {
        *res = Value::Int(chain_cmp(args, |a, b| a <= b));
        Ok(())
    })?;
    st.new_command(">", "V", |_, args, res| {
        *res = Value::Int(chain_cmp(args, |a, b| a > b));
        Ok(())
    })?;
    st.new_command(">=", "V", |_, args, res| {
        *res = Value::Int(chain_cmp(args, |a, b| a >= b));
        Ok(())
    })?;

    // --- Strings ---
    st.new_command("strlen", "s", |_, args, res| {
        *res = Value::Int(args[0].get_str().chars().count() as i32);
        Ok(())
    })?;
    st.new_command("substr", "sib", |state, args, res| {
        let s = args[0].get_str();
        let chars: Vec<char> = s.chars().collect();
        let start = (args[1].get_int().max(0) as usize).min(chars.len());
        let count = args[2].get_int();
        let count = if count < 0 {
            chars.len() - start
        } else {
            (count as usize).min(chars.len() - start)
        };
        let out: String = chars[start..start + count].iter().collect();
        *res = Value::Str(state.strings.steal(out));
        Ok(())
    })?;

    // --- Loops ---
    st.new_command("loop", "rie", |state, args, res| {
        res.force_null();
        let idx = args[0].as_ident().unwrap_or(DUMMY_IDX);
        let n = args[1].get_int();
        let Some(body) = args[2].as_code().cloned() else {
            return Ok(());
        };
        let id = state.identmap[idx].clone();
        if !id.is_alias() {
            state.debug_code(&format!("cannot loop through {}", id.name));
            return Ok(());
        }
        id.clear_flag(crate::ident::FLAG_UNKNOWN);
        let mut pushed = false;
        for i in 0..n {
            {
                let mut alias = id.alias().borrow_mut();
                if pushed {
                    alias.set_value(Value::Int(i));
                } else {
                    alias.push(Value::Int(i));
                    pushed = true;
                }
            }
            match run_loop_body(state, &body) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    id.alias().borrow_mut().pop();
                    return Err(e);
                }
            }
        }
        if pushed {
            id.alias().borrow_mut().pop();
        }
        Ok(())
    })?;

    st.new_command("while", "ee", |state, args, res| {
        res.force_null();
        let (Some(cond), Some(body)) = (args[0].as_code().cloned(), args[1].as_code().cloned())
        else {
            return Ok(());
        };
        while state.run_code(&cond)?.get_bool() {
            if !run_loop_body(state, &body)? {
                break;
            }
        }
        Ok(())
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> State {
        let mut st = State::new();
        register(&mut st).unwrap();
        st
    }

    #[test]
    fn math_folds() {
        let mut st = state();
        assert_eq!(st.run_int("+ 1 2 3").unwrap(), 6);
        assert_eq!(st.run_int("- 5").unwrap(), -5);
        assert_eq!(st.run_int("div 7 0").unwrap(), 0);
        assert_eq!(st.run_float("+f 1.5 2").unwrap(), 3.5);
    }

    #[test]
    fn comparisons_chain() {
        let mut st = state();
        assert_eq!(st.run_int("< 1 2 3").unwrap(), 1);
        assert_eq!(st.run_int("< 1 3 2").unwrap(), 0);
        assert_eq!(st.run_int("= 2 2 2").unwrap(), 1);
    }

    #[test]
    fn string_helpers() {
        let mut st = state();
        assert_eq!(st.run_int("strlen abcd").unwrap(), 4);
        assert_eq!(st.run_str("substr hello 1 3").unwrap(), "ell");
        assert_eq!(st.run_str("substr hello 2").unwrap(), "llo");
        assert_eq!(st.run_str("concatword a b c").unwrap(), "abc");
    }

    #[test]
    fn while_loops_and_break() {
        let mut st = state();
        let total = st
            .run_int("i = 0; n = 0; while [< $i 10] [ n = (+ $n $i); i = (+ $i 1) ]; result $n")
            .unwrap();
        assert_eq!(total, 45);
    }
}
