//! The bytecode interpreter: a switch-dispatched loop over 32-bit words
//! with an in-frame value array, plus the alias call machinery that swaps
//! positional argument slots in and out per call frame.

use std::rc::Rc;

use crate::bytecode::block::{CodeBlock, CodeRef};
use crate::bytecode::opcode::{self as op, RET_FLOAT, RET_INT, RET_NULL, RET_STR};
use crate::error::{CubeError, RuntimeError};
use crate::ident::{Ident, IdentKind, SpecialKind, DUMMY_IDX, MAX_ARGUMENTS, MAX_RUN_DEPTH};
use crate::parser::text;
use crate::state::{Frame, State};
use crate::strpool::StringPool;
use crate::value::{concat_values, Value};

/// Apply a requested return-type coercion in place.
pub(crate) fn force_arg(v: &mut Value, ret: u32, pool: &mut StringPool) {
    match ret {
        RET_STR => v.force_str(pool),
        RET_INT => v.force_int(),
        RET_FLOAT => v.force_float(),
        _ => {}
    }
}

/// Execute a code reference, leaving its result in `result`.
pub(crate) fn run(state: &mut State, code: &CodeRef, result: &mut Value) -> Result<(), CubeError> {
    run_block(state, &code.block, code.start, result).map(|_| ())
}

/// Walk instructions without executing until the `EXIT` matching the
/// entry depth, applying its return coercion to `result`.
fn skip_code(
    block: &Rc<CodeBlock>,
    mut ip: usize,
    result: Option<&mut Value>,
    pool: &mut StringPool,
) -> usize {
    let code = &block.code;
    let mut depth = 0usize;
    loop {
        let word = code[ip];
        ip += 1;
        match op::op(word) {
            op::MACRO => ip += op::inline_words(op::imm(word) as usize),
            op::VAL => match op::ret(word) {
                RET_STR => ip += op::inline_words(op::imm(word) as usize),
                RET_INT | RET_FLOAT => ip += 1,
                _ => {}
            },
            op::BLOCK
            | op::JUMP
            | op::JUMP_TRUE
            | op::JUMP_FALSE
            | op::JUMP_RESULT_TRUE
            | op::JUMP_RESULT_FALSE => ip += op::imm(word) as usize,
            op::ENTER | op::ENTER_RESULT => depth += 1,
            op::EXIT => {
                if depth == 0 {
                    if let Some(result) = result {
                        force_arg(result, op::ret(word), pool);
                    }
                    return ip;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
}

/// Compile a value into runnable code: numbers become literal blocks,
/// strings compile as source, anything else yields null.
fn force_code(state: &mut State, v: &mut Value) -> Result<(), CubeError> {
    if v.as_code().is_some() {
        return Ok(());
    }
    let code = match v {
        Value::Int(_) | Value::Float(_) => {
            let mut code = vec![op::START];
            match v {
                Value::Int(n) => {
                    if (-0x80_0000..0x80_0000).contains(n) {
                        code.push(op::VALI | RET_INT | ((*n as u32) << 8));
                    } else {
                        code.push(op::VAL | RET_INT);
                        code.push(*n as u32);
                    }
                }
                Value::Float(f) => {
                    code.push(op::VAL | RET_FLOAT);
                    code.push(f.to_bits());
                }
                _ => unreachable!(),
            }
            code.push(op::RESULT);
            code.push(op::EXIT);
            CodeRef::main(code)
        }
        Value::Str(s) | Value::CStr(s) | Value::Macro(s) => {
            let source = s.to_string();
            state.compile(&source, None)?
        }
        _ => {
            let code = vec![op::START, op::VAL | RET_NULL, op::RESULT, op::EXIT];
            CodeRef::main(code)
        }
    };
    *v = Value::Code(code);
    Ok(())
}

/// Coerce a condition argument: nonempty strings compile to code, empty
/// ones become false.
fn force_cond(state: &mut State, v: &mut Value) -> Result<(), CubeError> {
    if let Some(s) = v.as_str() {
        if s.is_empty() {
            *v = Value::Int(0);
        } else {
            force_code(state, v)?;
        }
    }
    Ok(())
}

fn set_slot(buf: &mut Vec<Value>, i: usize, v: Value) {
    if i < buf.len() {
        buf[i] = v;
    } else {
        debug_assert_eq!(i, buf.len());
        buf.push(v);
    }
}

/// Invoke a command through its format string at runtime, synthesizing
/// defaults for missing arguments.
pub(crate) fn call_command(
    state: &mut State,
    id: &Rc<Ident>,
    given: Vec<Value>,
    result: &mut Value,
    lookup: bool,
) -> Result<(), CubeError> {
    let cmd = id.as_command().expect("call_command on non-command");
    let cb = cmd.cb.clone();
    let format = cmd.format.clone();
    let fmt = format.as_bytes();
    let numargs = given.len();
    let mut buf = given;
    let mut i: isize = -1;
    let mut fakeargs = 0isize;
    let mut rep = false;
    let mut k = 0usize;
    while k < fmt.len() {
        match fmt[k] {
            b'i' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    set_slot(&mut buf, i as usize, Value::Int(0));
                    fakeargs += 1;
                } else {
                    buf[i as usize].force_int();
                }
            }
            b'b' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    set_slot(&mut buf, i as usize, Value::Int(i32::MIN));
                    fakeargs += 1;
                } else {
                    buf[i as usize].force_int();
                }
            }
            b'f' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    set_slot(&mut buf, i as usize, Value::Float(0.0));
                    fakeargs += 1;
                } else {
                    buf[i as usize].force_float();
                }
            }
            b'F' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    let prev = buf[i as usize - 1].get_float();
                    set_slot(&mut buf, i as usize, Value::Float(prev));
                    fakeargs += 1;
                } else {
                    buf[i as usize].force_float();
                }
            }
            b'S' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    let empty = state.strings.add("");
                    set_slot(&mut buf, i as usize, Value::Str(empty));
                    fakeargs += 1;
                } else {
                    buf[i as usize].force_str(&mut state.strings);
                }
            }
            b's' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    let empty = state.strings.add("");
                    set_slot(&mut buf, i as usize, Value::CStr(empty));
                    fakeargs += 1;
                } else {
                    buf[i as usize].force_str(&mut state.strings);
                }
            }
            b't' | b'T' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    set_slot(&mut buf, i as usize, Value::Null);
                    fakeargs += 1;
                }
            }
            b'E' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    set_slot(&mut buf, i as usize, Value::Null);
                    fakeargs += 1;
                } else {
                    force_cond(state, &mut buf[i as usize])?;
                }
            }
            b'e' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    let empty = state.empty_ret(RET_NULL);
                    set_slot(&mut buf, i as usize, Value::Code(empty));
                    fakeargs += 1;
                } else {
                    force_code(state, &mut buf[i as usize])?;
                }
            }
            b'r' => {
                i += 1;
                if i as usize >= numargs {
                    if rep {
                        k += 1;
                        continue;
                    }
                    set_slot(&mut buf, i as usize, Value::Ident(DUMMY_IDX));
                    fakeargs += 1;
                } else {
                    let idx = state.force_ident_idx(&mut buf[i as usize]);
                    buf[i as usize] = Value::Ident(idx);
                }
            }
            b'$' => {
                i += 1;
                set_slot(&mut buf, i as usize, Value::Ident(id.index));
            }
            b'N' => {
                i += 1;
                let n = if lookup { -1 } else { (i - fakeargs) as i32 };
                set_slot(&mut buf, i as usize, Value::Int(n));
            }
            b'C' => {
                let upto = ((i + 1).max(numargs as isize)) as usize;
                while buf.len() < upto {
                    buf.push(Value::Null);
                }
                let joined = concat_values(&buf[..upto], " ");
                let mut tv = [Value::Str(state.strings.steal(joined))];
                return cb(state, &mut tv, result);
            }
            b'V' => {
                let upto = ((i + 1).max(numargs as isize)) as usize;
                while buf.len() < upto {
                    buf.push(Value::Null);
                }
                return cb(state, &mut buf[..upto], result);
            }
            c @ b'1'..=b'4' => {
                if (i + 1) < numargs as isize {
                    let numrep = (c - b'0' + 1) as usize;
                    k -= numrep;
                    rep = true;
                }
            }
            _ => {}
        }
        k += 1;
    }
    i += 1;
    cb(state, &mut buf[..i as usize], result)
}

/// Call an alias: install actuals into the positional slots, link a new
/// frame, run the (cached) compiled body, and restore everything on any
/// exit path.
pub(crate) fn call_alias(
    state: &mut State,
    id: &Rc<Ident>,
    args: &mut Vec<Value>,
    callargs: usize,
    result: &mut Value,
    ret: u32,
    skip: usize,
) -> Result<(), CubeError> {
    let offset = args.len() - callargs;
    for i in 0..callargs {
        let v = std::mem::take(&mut args[offset + i]);
        state.identmap[i].alias().borrow_mut().push(v);
    }
    let old_numargs = state.ivar_raw(crate::ident::NUMARGS_IDX);
    state.set_ivar_raw(crate::ident::NUMARGS_IDX, callargs as i32);
    state.frames.push(Frame {
        id: Some(id.index),
        usedargs: if callargs >= 32 { !0 } else { (1u32 << callargs) - 1 },
    });

    let res = state
        .alias_code(id)
        .and_then(|body| run(state, &body, result));

    let frame = state.frames.pop().expect("call frame unlinked twice");
    for i in 0..callargs {
        state.identmap[i].alias().borrow_mut().pop();
    }
    // pop any extra slots the body touched, tracked by the frame bitmask
    let mut argmask = frame.usedargs & (!0u32).checked_shl(callargs as u32).unwrap_or(0);
    let mut i = callargs;
    while argmask != 0 {
        if argmask & (1 << i) != 0 {
            state.identmap[i].alias().borrow_mut().pop();
            argmask &= !(1 << i);
        }
        i += 1;
    }
    state.set_ivar_raw(crate::ident::NUMARGS_IDX, old_numargs);
    args.truncate(offset - skip);
    res?;
    force_arg(result, ret, &mut state.strings);
    Ok(())
}

/// Run code with the caller's argument frame re-exposed (the dynamic
/// `doargs` path).
pub(crate) fn run_in_caller_frame(state: &mut State, code: &CodeRef) -> Result<Value, CubeError> {
    let mut result = Value::Null;
    if state.frames.len() > 1 {
        do_args(state, |st| run(st, code, &mut result))?;
    } else {
        run(state, code, &mut result)?;
    }
    Ok(result)
}

/// Run `body` with the caller's argument frame re-exposed.
fn do_args<F>(state: &mut State, body: F) -> Result<(), CubeError>
where
    F: FnOnce(&mut State) -> Result<(), CubeError>,
{
    if state.frames.len() <= 1 {
        return body(state);
    }
    let top = state.frames.len() - 1;
    let cur = Frame {
        id: state.frames[top].id,
        usedargs: state.frames[top].usedargs,
    };
    let prev_used = state.frames[top - 1].usedargs;
    let mut saved: Vec<(usize, Value)> = Vec::new();
    let mut mask = cur.usedargs;
    let mut i = 0usize;
    while mask != 0 {
        if mask & 1 != 0 {
            let v = state.identmap[i].alias().borrow_mut().undo();
            saved.push((i, v));
        }
        mask >>= 1;
        i += 1;
    }
    state.frames.push(Frame {
        id: cur.id,
        usedargs: prev_used,
    });
    let res = body(state);
    let pseudo = state.frames.pop().expect("caller frame unlinked twice");
    let top = state.frames.len() - 1;
    state.frames[top - 1].usedargs = pseudo.usedargs;
    for (idx, v) in saved.into_iter().rev() {
        state.identmap[idx].alias().borrow_mut().redo(v);
    }
    res
}

enum LookupKind {
    Alias(Rc<Ident>),
    IVar(Rc<Ident>),
    FVar(Rc<Ident>),
    SVar(Rc<Ident>),
    Unknown,
    Done,
}

/// Resolve a runtime lookup argument to an identifier kind, handling
/// commands (invoked with no arguments) in place.
fn lookup_u_type(
    state: &mut State,
    arg: &mut Value,
    ret: u32,
) -> Result<LookupKind, CubeError> {
    let name = match arg.as_str() {
        Some(s) => s.to_string(),
        None => return Ok(LookupKind::Done),
    };
    match state.get_ident(&name) {
        Some(id) => match &id.kind {
            IdentKind::Alias(_) => {
                if id.has_flag(crate::ident::FLAG_UNKNOWN) {
                    state.debug_code(&format!("unknown alias lookup: {}", name));
                    return Ok(LookupKind::Unknown);
                }
                if id.is_arg() && !state.arg_used(id.index) {
                    return Ok(LookupKind::Unknown);
                }
                Ok(LookupKind::Alias(id))
            }
            IdentKind::SVar(_) => Ok(LookupKind::SVar(id)),
            IdentKind::IVar(_) => Ok(LookupKind::IVar(id)),
            IdentKind::FVar(_) => Ok(LookupKind::FVar(id)),
            IdentKind::Command(_) => {
                *arg = Value::Null;
                call_command(state, &id, Vec::new(), arg, true)?;
                force_arg(arg, ret, &mut state.strings);
                Ok(LookupKind::Done)
            }
            IdentKind::Special(..) => Ok(LookupKind::Unknown),
        },
        None => {
            state.debug_code(&format!("unknown alias lookup: {}", name));
            Ok(LookupKind::Unknown)
        }
    }
}

fn lookup_known(state: &mut State, idx: usize) -> Rc<Ident> {
    let id = state.identmap[idx].clone();
    if id.has_flag(crate::ident::FLAG_UNKNOWN) {
        state.debug_code(&format!("unknown alias lookup: {}", id.name));
    }
    id
}

fn alias_value_for(id: &Rc<Ident>, ret: u32, pool: &mut StringPool) -> Value {
    let v = id.alias().borrow().value.clone();
    match ret {
        RET_STR => Value::Str(pool.add(&v.get_str())),
        RET_INT => Value::Int(v.get_int()),
        RET_FLOAT => Value::Float(v.get_float()),
        _ => v,
    }
}

fn unknown_sentinel(ret: u32, pool: &mut StringPool) -> Value {
    match ret {
        RET_STR => Value::Str(pool.add("")),
        RET_INT => Value::Int(0),
        RET_FLOAT => Value::Float(0.0),
        _ => Value::Null,
    }
}

/// Move the head value of a `CALL_U` into the result as a literal.
fn take_litval(
    args: &mut Vec<Value>,
    offset: usize,
    result: &mut Value,
    ret: u32,
    pool: &mut StringPool,
) {
    *result = std::mem::take(&mut args[offset - 1]);
    args.truncate(offset - 1);
    force_arg(result, ret, pool);
}

/// Run one nesting level starting at `ip`, returning the position after
/// the matching `EXIT`.
pub(crate) fn run_block(
    state: &mut State,
    block: &Rc<CodeBlock>,
    ip: usize,
    result: &mut Value,
) -> Result<usize, CubeError> {
    result.force_null();
    if state.rundepth >= MAX_RUN_DEPTH {
        state.debug_code("exceeded recursion limit");
        return Ok(skip_code(block, ip, Some(result), &mut state.strings));
    }
    state.rundepth += 1;
    let res = dispatch(state, block, ip, result);
    state.rundepth -= 1;
    res
}

fn dispatch(
    state: &mut State,
    block: &Rc<CodeBlock>,
    mut ip: usize,
    result: &mut Value,
) -> Result<usize, CubeError> {
    if let Some(hook) = state.call_hook() {
        hook(state)?;
    }
    let mut args: Vec<Value> = Vec::with_capacity(MAX_ARGUMENTS + crate::ident::MAX_RESULTS);
    loop {
        let word = block.code[ip];
        ip += 1;
        let ret = op::ret(word);
        match op::op(word) {
            op::START | op::OFFSET => {}

            op::NULL => {
                *result = match ret {
                    RET_STR => Value::Str(state.strings.add("")),
                    RET_INT => Value::Int(0),
                    RET_FLOAT => Value::Float(0.0),
                    _ => Value::Null,
                };
            }
            op::FALSE => {
                *result = match ret {
                    RET_STR => Value::Str(state.strings.add("0")),
                    RET_FLOAT => Value::Float(0.0),
                    _ => Value::Int(0),
                };
            }
            op::TRUE => {
                *result = match ret {
                    RET_STR => Value::Str(state.strings.add("1")),
                    RET_FLOAT => Value::Float(1.0),
                    _ => Value::Int(1),
                };
            }
            op::NOT => {
                let v = args.pop().expect("NOT with empty stack");
                *result = match ret {
                    RET_STR => Value::Str(state.strings.add(if v.get_bool() { "0" } else { "1" })),
                    RET_FLOAT => Value::Float(if v.get_bool() { 0.0 } else { 1.0 }),
                    _ => Value::Int(!v.get_bool() as i32),
                };
            }

            op::POP => {
                args.pop();
            }
            op::ENTER => {
                let mut v = Value::Null;
                ip = run_block(state, block, ip, &mut v)?;
                args.push(v);
            }
            op::ENTER_RESULT => {
                ip = run_block(state, block, ip, result)?;
            }
            op::EXIT => {
                force_arg(result, ret, &mut state.strings);
                return Ok(ip);
            }
            op::RESULT => {
                *result = args.pop().expect("RESULT with empty stack");
                force_arg(result, ret, &mut state.strings);
            }
            op::RESULT_ARG => {
                force_arg(result, ret, &mut state.strings);
                args.push(std::mem::take(result));
            }
            op::PRINT => {
                let id = state.identmap[op::imm(word) as usize].clone();
                state.print_var(&id);
            }

            op::LOCAL => {
                let numlocals = op::imm(word) as usize;
                let offset = args.len() - numlocals;
                let mut pushed = Vec::with_capacity(numlocals);
                for arg in &args[offset..] {
                    if let Some(idx) = arg.as_ident() {
                        let id = &state.identmap[idx];
                        if id.is_alias() && idx >= MAX_ARGUMENTS {
                            id.alias().borrow_mut().push(Value::Null);
                            pushed.push(idx);
                        }
                    }
                }
                let res = run_block(state, block, ip, result);
                for idx in pushed {
                    state.identmap[idx].alias().borrow_mut().pop();
                }
                return res;
            }

            op::DO_ARGS => {
                let v = args.pop().expect("DO_ARGS with empty stack");
                if state.frames.len() > 1 {
                    do_args(state, |state| {
                        if let Some(code) = v.as_code() {
                            run(state, &code.clone(), result)?;
                        }
                        Ok(())
                    })?;
                } else if let Some(code) = v.as_code() {
                    run(state, &code.clone(), result)?;
                }
                force_arg(result, ret, &mut state.strings);
            }
            op::DO => {
                let v = args.pop().expect("DO with empty stack");
                if let Some(code) = v.as_code() {
                    run(state, &code.clone(), result)?;
                }
                force_arg(result, ret, &mut state.strings);
            }

            op::JUMP => {
                ip += op::imm(word) as usize;
            }
            op::JUMP_TRUE => {
                let v = args.pop().expect("JUMP_TRUE with empty stack");
                if v.get_bool() {
                    ip += op::imm(word) as usize;
                }
            }
            op::JUMP_FALSE => {
                let v = args.pop().expect("JUMP_FALSE with empty stack");
                if !v.get_bool() {
                    ip += op::imm(word) as usize;
                }
            }
            op::JUMP_RESULT_TRUE => {
                let v = args.pop().expect("JUMP_RESULT with empty stack");
                if let Some(code) = v.as_code() {
                    run(state, &code.clone(), result)?;
                } else {
                    *result = v;
                }
                if result.get_bool() {
                    ip += op::imm(word) as usize;
                }
            }
            op::JUMP_RESULT_FALSE => {
                let v = args.pop().expect("JUMP_RESULT with empty stack");
                if let Some(code) = v.as_code() {
                    run(state, &code.clone(), result)?;
                } else {
                    *result = v;
                }
                if !result.get_bool() {
                    ip += op::imm(word) as usize;
                }
            }
            op::BREAK => {
                return Err(if op::imm(word) == 0 {
                    RuntimeError::Break.into()
                } else {
                    RuntimeError::Continue.into()
                });
            }

            op::MACRO => {
                let len = op::imm(word) as usize;
                let s = op::read_inline_str(&block.code, ip, len);
                args.push(Value::Macro(Rc::from(s)));
                ip += op::inline_words(len);
            }
            op::VAL => match ret {
                RET_STR => {
                    let len = op::imm(word) as usize;
                    let s = op::read_inline_str(&block.code, ip, len);
                    args.push(Value::Str(state.strings.steal(s)));
                    ip += op::inline_words(len);
                }
                RET_INT => {
                    args.push(Value::Int(block.code[ip] as i32));
                    ip += 1;
                }
                RET_FLOAT => {
                    args.push(Value::Float(f32::from_bits(block.code[ip])));
                    ip += 1;
                }
                _ => args.push(Value::Null),
            },
            op::VALI => match ret {
                RET_STR => {
                    let s = op::unpack_chars(word);
                    args.push(Value::Str(state.strings.add(&s)));
                }
                RET_INT => args.push(Value::Int(op::imm_signed(word))),
                RET_FLOAT => args.push(Value::Float(op::imm_signed(word) as f32)),
                _ => args.push(Value::Null),
            },

            op::DUP => {
                let prev = args.last().expect("DUP with empty stack");
                let v = match ret {
                    RET_INT => Value::Int(prev.get_int()),
                    RET_FLOAT => Value::Float(prev.get_float()),
                    RET_STR => {
                        let s = prev.get_str();
                        Value::Str(state.strings.steal(s))
                    }
                    _ => prev.clone(),
                };
                args.push(v);
            }
            op::FORCE => {
                let last = args.last_mut().expect("FORCE with empty stack");
                force_arg(last, ret, &mut state.strings);
            }

            op::EMPTY => {
                args.push(Value::Code(state.empty_ret(ret)));
            }
            op::BLOCK => {
                let len = op::imm(word) as usize;
                args.push(Value::Code(CodeRef::inner(block, ip + 1)));
                ip += len;
            }
            op::COMPILE => {
                let last = args.last_mut().expect("COMPILE with empty stack");
                let mut v = std::mem::take(last);
                force_code(state, &mut v)?;
                *args.last_mut().unwrap() = v;
            }
            op::COND => {
                let last = args.last_mut().expect("COND with empty stack");
                let mut v = std::mem::take(last);
                force_cond(state, &mut v)?;
                *args.last_mut().unwrap() = v;
            }

            op::IDENT => {
                args.push(Value::Ident(op::imm(word) as usize));
            }
            op::IDENT_ARG => {
                let idx = op::imm(word) as usize;
                if !state.arg_used(idx) {
                    state.identmap[idx].alias().borrow_mut().push(Value::Null);
                    state.mark_arg_used(idx);
                }
                args.push(Value::Ident(idx));
            }
            op::IDENT_U => {
                let arg = args.last_mut().expect("IDENT_U with empty stack");
                let idx = match arg.as_str() {
                    Some(s) => {
                        let name = s.to_string();
                        match state.new_ident(&name, crate::ident::FLAG_UNKNOWN) {
                            Some(id) => id.index,
                            None => {
                                state.debug_code(&format!(
                                    "number {} is not a valid identifier name",
                                    name
                                ));
                                DUMMY_IDX
                            }
                        }
                    }
                    None => DUMMY_IDX,
                };
                if idx < MAX_ARGUMENTS && !state.arg_used(idx) {
                    state.identmap[idx].alias().borrow_mut().push(Value::Null);
                    state.mark_arg_used(idx);
                }
                *args.last_mut().unwrap() = Value::Ident(idx);
            }

            op::LOOKUP => {
                let id = lookup_known(state, op::imm(word) as usize);
                args.push(alias_value_for(&id, ret, &mut state.strings));
            }
            op::LOOKUP_ARG => {
                let idx = op::imm(word) as usize;
                let v = if state.arg_used(idx) {
                    let id = state.identmap[idx].clone();
                    alias_value_for(&id, ret, &mut state.strings)
                } else {
                    unknown_sentinel(ret, &mut state.strings)
                };
                args.push(v);
            }
            op::LOOKUP_U => {
                let mut arg = std::mem::take(args.last_mut().expect("LOOKUP_U with empty stack"));
                match lookup_u_type(state, &mut arg, ret)? {
                    LookupKind::Alias(id) => {
                        arg = alias_value_for(&id, ret, &mut state.strings);
                    }
                    LookupKind::SVar(id) => {
                        let IdentKind::SVar(var) = &id.kind else { unreachable!() };
                        let s = var.storage.borrow().clone();
                        arg = match ret {
                            RET_INT => Value::Int(text::parse_int(&s).0),
                            RET_FLOAT => Value::Float(text::parse_float(&s).0),
                            _ => Value::Str(s),
                        };
                    }
                    LookupKind::IVar(id) => {
                        let IdentKind::IVar(var) = &id.kind else { unreachable!() };
                        let n = var.storage.get();
                        arg = match ret {
                            RET_STR => Value::Str(state.strings.steal(text::int_str(n))),
                            RET_FLOAT => Value::Float(n as f32),
                            _ => Value::Int(n),
                        };
                    }
                    LookupKind::FVar(id) => {
                        let IdentKind::FVar(var) = &id.kind else { unreachable!() };
                        let f = var.storage.get();
                        arg = match ret {
                            RET_STR => Value::Str(state.strings.steal(text::float_str(f))),
                            RET_INT => Value::Int(f as i32),
                            _ => Value::Float(f),
                        };
                    }
                    LookupKind::Unknown => {
                        arg = unknown_sentinel(ret, &mut state.strings);
                    }
                    LookupKind::Done => {}
                }
                *args.last_mut().unwrap() = arg;
            }

            op::SVAR => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let IdentKind::SVar(var) = &id.kind else { unreachable!() };
                let s = var.storage.borrow().clone();
                args.push(match ret {
                    RET_INT => Value::Int(text::parse_int(&s).0),
                    RET_FLOAT => Value::Float(text::parse_float(&s).0),
                    _ => Value::Str(s),
                });
            }
            op::SVAR1 => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let v = args.pop().expect("SVAR1 with empty stack");
                state.set_var_str_checked(&id, &v.get_str());
            }
            op::IVAR => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let IdentKind::IVar(var) = &id.kind else { unreachable!() };
                let n = var.storage.get();
                args.push(match ret {
                    RET_STR => Value::Str(state.strings.steal(text::int_str(n))),
                    RET_FLOAT => Value::Float(n as f32),
                    _ => Value::Int(n),
                });
            }
            op::IVAR1 => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let v = args.pop().expect("IVAR1 with empty stack");
                state.set_var_int_checked(&id, v.get_int());
            }
            op::IVAR2 => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let g = args.pop().expect("IVAR2 with empty stack");
                let r = args.pop().expect("IVAR2 with empty stack");
                state.set_var_int_checked(&id, (r.get_int() << 16) | (g.get_int() << 8));
            }
            op::IVAR3 => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let b = args.pop().expect("IVAR3 with empty stack");
                let g = args.pop().expect("IVAR3 with empty stack");
                let r = args.pop().expect("IVAR3 with empty stack");
                state.set_var_int_checked(
                    &id,
                    (r.get_int() << 16) | (g.get_int() << 8) | b.get_int(),
                );
            }
            op::FVAR => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let IdentKind::FVar(var) = &id.kind else { unreachable!() };
                let f = var.storage.get();
                args.push(match ret {
                    RET_STR => Value::Str(state.strings.steal(text::float_str(f))),
                    RET_INT => Value::Int(f as i32),
                    _ => Value::Float(f),
                });
            }
            op::FVAR1 => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let v = args.pop().expect("FVAR1 with empty stack");
                state.set_var_float_checked(&id, v.get_float());
            }

            op::COM => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let cmd = id.as_command().expect("COM on non-command");
                let cb = cmd.cb.clone();
                let offset = args.len() - cmd.num_args;
                result.force_null();
                let res = cb(state, &mut args[offset..], result);
                args.truncate(offset);
                res?;
                force_arg(result, ret, &mut state.strings);
            }
            op::COM_V => {
                let id = state.identmap[op::call_ident(word)].clone();
                let cb = id.as_command().expect("COM_V on non-command").cb.clone();
                let callargs = op::call_args(word);
                let offset = args.len() - callargs;
                result.force_null();
                let res = cb(state, &mut args[offset..], result);
                args.truncate(offset);
                res?;
                force_arg(result, ret, &mut state.strings);
            }
            op::COM_C => {
                let id = state.identmap[op::call_ident(word)].clone();
                let cb = id.as_command().expect("COM_C on non-command").cb.clone();
                let callargs = op::call_args(word);
                let offset = args.len() - callargs;
                result.force_null();
                let joined = concat_values(&args[offset..], " ");
                args.truncate(offset);
                let mut tv = [Value::Str(state.strings.steal(joined))];
                cb(state, &mut tv, result)?;
                force_arg(result, ret, &mut state.strings);
            }

            op::CONC | op::CONC_W => {
                let numconc = op::imm(word) as usize;
                let sep = if op::op(word) == op::CONC { " " } else { "" };
                let at = args.len() - numconc;
                let joined = concat_values(&args[at..], sep);
                args.truncate(at);
                let mut v = Value::Str(state.strings.steal(joined));
                force_arg(&mut v, ret, &mut state.strings);
                args.push(v);
            }
            op::CONC_M => {
                let numconc = op::imm(word) as usize;
                let at = args.len() - numconc;
                let joined = concat_values(&args[at..], "");
                args.truncate(at);
                *result = Value::Str(state.strings.steal(joined));
                force_arg(result, ret, &mut state.strings);
            }

            op::ALIAS => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let v = args.pop().expect("ALIAS with empty stack");
                state.set_alias_value(&id, v);
            }
            op::ALIAS_ARG => {
                let id = state.identmap[op::imm(word) as usize].clone();
                let v = args.pop().expect("ALIAS_ARG with empty stack");
                state.set_arg_value(&id, v);
            }
            op::ALIAS_U => {
                let v = args.pop().expect("ALIAS_U with empty stack");
                let name = args.pop().expect("ALIAS_U with empty stack");
                state.set_alias(&name.get_str(), v);
            }

            op::CALL => {
                result.force_null();
                let id = state.identmap[op::call_ident(word)].clone();
                let callargs = op::call_args(word);
                if id.has_flag(crate::ident::FLAG_UNKNOWN) {
                    state.debug_code(&format!("unknown command: {}", id.name));
                    args.truncate(args.len() - callargs);
                    force_arg(result, ret, &mut state.strings);
                } else {
                    call_alias(state, &id, &mut args, callargs, result, ret, 0)?;
                }
            }
            op::CALL_ARG => {
                result.force_null();
                let id = state.identmap[op::call_ident(word)].clone();
                let callargs = op::call_args(word);
                if !state.arg_used(id.index) {
                    args.truncate(args.len() - callargs);
                    force_arg(result, ret, &mut state.strings);
                } else {
                    call_alias(state, &id, &mut args, callargs, result, ret, 0)?;
                }
            }
            op::CALL_U => {
                let callargs = op::imm(word) as usize;
                let offset = args.len() - callargs;
                if offset == 0 {
                    // no head value, e.g. an empty parenthesized statement
                    args.clear();
                    force_arg(result, ret, &mut state.strings);
                    continue;
                }
                if args[offset - 1].as_str().is_none() {
                    take_litval(&mut args, offset, result, ret, &mut state.strings);
                    continue;
                }
                let name = args[offset - 1].as_str().unwrap().to_string();
                let Some(id) = state.get_ident(&name) else {
                    if text::check_num(&name) {
                        take_litval(&mut args, offset, result, ret, &mut state.strings);
                    } else {
                        state.debug_code(&format!("unknown command: {}", name));
                        result.force_null();
                        args.truncate(offset - 1);
                        force_arg(result, ret, &mut state.strings);
                    }
                    continue;
                };
                result.force_null();
                match &id.kind {
                    IdentKind::Command(_) | IdentKind::Special(_, Some(_)) => {
                        let given: Vec<Value> = args.drain(offset..).collect();
                        args.pop();
                        call_command(state, &id, given, result, false)?;
                        force_arg(result, ret, &mut state.strings);
                    }
                    IdentKind::Special(SpecialKind::Local, _) => {
                        args[offset - 1] = Value::Null;
                        let mut pushed = Vec::with_capacity(callargs);
                        for j in 0..callargs {
                            let mut v = std::mem::take(&mut args[offset + j]);
                            let idx = state.force_ident_idx(&mut v);
                            args[offset + j] = v;
                            let aid = &state.identmap[idx];
                            if aid.is_alias() && idx >= MAX_ARGUMENTS {
                                aid.alias().borrow_mut().push(Value::Null);
                                pushed.push(idx);
                            }
                        }
                        let res = run_block(state, block, ip, result);
                        for idx in pushed {
                            state.identmap[idx].alias().borrow_mut().pop();
                        }
                        return res;
                    }
                    IdentKind::IVar(_) => {
                        if callargs == 0 {
                            state.print_var(&id);
                        } else {
                            let vals: Vec<Value> = args.drain(offset..).collect();
                            state.set_var_int_multi(&id, &vals);
                        }
                        args.truncate(offset - 1);
                        force_arg(result, ret, &mut state.strings);
                    }
                    IdentKind::FVar(_) => {
                        if callargs == 0 {
                            state.print_var(&id);
                        } else {
                            let f = args[offset].get_float();
                            state.set_var_float_checked(&id, f);
                        }
                        args.truncate(offset - 1);
                        force_arg(result, ret, &mut state.strings);
                    }
                    IdentKind::SVar(_) => {
                        if callargs == 0 {
                            state.print_var(&id);
                        } else {
                            let s = args[offset].get_str();
                            state.set_var_str_checked(&id, &s);
                        }
                        args.truncate(offset - 1);
                        force_arg(result, ret, &mut state.strings);
                    }
                    IdentKind::Special(_, None) => {
                        args.truncate(offset - 1);
                        force_arg(result, ret, &mut state.strings);
                    }
                    IdentKind::Alias(alias) => {
                        if id.is_arg() && !state.arg_used(id.index) {
                            args.truncate(offset - 1);
                            force_arg(result, ret, &mut state.strings);
                        } else if matches!(alias.borrow().value, Value::Null) {
                            if text::check_num(&name) {
                                take_litval(&mut args, offset, result, ret, &mut state.strings);
                            } else {
                                state.debug_code(&format!("unknown command: {}", name));
                                args.truncate(offset - 1);
                                force_arg(result, ret, &mut state.strings);
                            }
                        } else {
                            call_alias(state, &id, &mut args, callargs, result, ret, 1)?;
                        }
                    }
                }
            }

            other => {
                // unreachable with well-formed code; treat as a no-op word
                debug_assert!(false, "bad opcode {}", other);
            }
        }
    }
}
