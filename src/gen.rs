//! The single-pass code generator. Source text is consumed through a
//! [`Cursor`] and instruction words are appended directly to the output
//! buffer; there is no intermediate AST. Control-flow specials are
//! rewritten into jump chains by peephole patching of already-emitted
//! block instructions.

use std::rc::Rc;

use crate::bytecode::opcode::{self as op, RET_FLOAT, RET_INT, RET_MASK, RET_NULL, RET_STR};
use crate::error::ParseError;
use crate::ident::{Ident, IdentKind, SpecialKind, DUMMY_IDX, FLAG_HEX, FLAG_UNKNOWN};
use crate::parser::text;
use crate::parser::Cursor;
use crate::state::State;

/// The representation requested for a parsed argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordType {
    Int,
    Float,
    String,
    Any,
    Code,
    Cond,
    Ident,
    Pop,
    Word,
}

/// Return-type bits for a word type, `def` for the untyped ones.
fn ret_code(wt: WordType, def: u32) -> u32 {
    match wt {
        WordType::Int => RET_INT,
        WordType::Float => RET_FLOAT,
        WordType::String => RET_STR,
        _ => def,
    }
}

/// Code generation context: the output buffer plus the interpreter state
/// used to resolve identifiers at compile time.
pub(crate) struct GenState<'s> {
    pub state: &'s mut State,
    pub code: Vec<u32>,
    pub src_name: Option<Rc<str>>,
}

/// Compile a complete source text into a top-level buffer.
pub(crate) fn gen_main(
    state: &mut State,
    source: &str,
    src_name: Option<Rc<str>>,
    first_line: usize,
    ret: u32,
) -> Result<Vec<u32>, ParseError> {
    let mut gs = GenState {
        state,
        code: vec![op::START],
        src_name,
    };
    let mut cur = Cursor::new(source, first_line);
    compile_statements(&mut gs, &mut cur, WordType::Any, None)?;
    gs.code.push(op::EXIT | ret);
    Ok(gs.code)
}

impl GenState<'_> {
    fn name(&self) -> Option<&str> {
        self.src_name.as_deref()
    }

    fn gen_null(&mut self) {
        self.code.push(op::VAL | RET_NULL);
    }

    fn gen_int(&mut self, v: i32) {
        if (-0x80_0000..0x80_0000).contains(&v) {
            self.code.push(op::VALI | RET_INT | ((v as u32) << 8));
        } else {
            self.code.push(op::VAL | RET_INT);
            self.code.push(v as u32);
        }
    }

    fn gen_float(&mut self, v: f32) {
        let iv = v as i32;
        if v == iv as f32 && (-0x80_0000..0x80_0000).contains(&iv) {
            self.code.push(op::VALI | RET_FLOAT | ((iv as u32) << 8));
        } else {
            self.code.push(op::VAL | RET_FLOAT);
            self.code.push(v.to_bits());
        }
    }

    fn gen_str(&mut self, s: &str) {
        if s.len() <= 3 {
            self.code
                .push(op::VALI | RET_STR | op::pack_chars(s.as_bytes()));
        } else {
            op::push_inline_str(&mut self.code, op::VAL | RET_STR, s.as_bytes());
        }
    }

    fn gen_ident(&mut self, id: &Rc<Ident>) {
        let word = if id.is_arg() { op::IDENT_ARG } else { op::IDENT };
        self.code.push(word | ((id.index as u32) << 8));
    }

    fn gen_ident_name(&mut self, name: &str) {
        match self.state.new_ident(name, FLAG_UNKNOWN) {
            Some(id) => self.gen_ident(&id),
            None => self.gen_dummy_ident(),
        }
    }

    fn gen_dummy_ident(&mut self) {
        self.code.push(op::IDENT | ((DUMMY_IDX as u32) << 8));
    }

    /// Emit a literal in the requested representation.
    fn gen_value(&mut self, wt: WordType, word: &str, line: usize) -> Result<(), ParseError> {
        match wt {
            WordType::Any => {
                if !word.is_empty() {
                    self.gen_str(word);
                } else {
                    self.gen_null();
                }
            }
            WordType::String => self.gen_str(word),
            WordType::Float => {
                let v = text::parse_float(word).0;
                self.gen_float(v);
            }
            WordType::Int => {
                let v = text::parse_int(word).0;
                self.gen_int(v);
            }
            WordType::Cond => {
                if !word.is_empty() {
                    compile_text_block(self, word, line, RET_NULL)?;
                } else {
                    self.gen_null();
                }
            }
            WordType::Code => compile_text_block(self, word, line, RET_NULL)?,
            WordType::Ident => self.gen_ident_name(word),
            _ => {}
        }
        Ok(())
    }
}

/// Close an open `[BLOCK][OFFSET]…` region: append the typed `EXIT` and
/// patch the block length, or collapse an empty region to `EMPTY`.
fn finish_block(gs: &mut GenState, start: usize, ret: u32) {
    if gs.code.len() > start + 2 {
        gs.code.push(op::EXIT | ret);
        let len = (gs.code.len() - (start + 1)) as u32;
        gs.code[start] |= len << 8;
    } else {
        gs.code.truncate(start);
        gs.code.push(op::EMPTY | ret);
    }
}

/// Compile captured text as a block with its own cursor.
fn compile_text_block(
    gs: &mut GenState,
    text: &str,
    line: usize,
    ret: u32,
) -> Result<(), ParseError> {
    let start = gs.code.len();
    gs.code.push(op::BLOCK);
    gs.code.push(op::OFFSET | (((start + 2) as u32) << 8));
    if !text.is_empty() {
        let mut cur = Cursor::new(text, line);
        compile_statements(gs, &mut cur, WordType::Any, None)?;
    }
    finish_block(gs, start, ret);
    Ok(())
}

/// Compile a `[ … ]` region in place by rewinding the main cursor to the
/// start of its body and parsing up to the closing bracket.
fn compile_block_here(
    gs: &mut GenState,
    cur: &mut Cursor,
    body_pos: usize,
    body_line: usize,
    ret: u32,
) -> Result<(), ParseError> {
    let start = gs.code.len();
    gs.code.push(op::BLOCK);
    gs.code.push(op::OFFSET | (((start + 2) as u32) << 8));
    cur.pos = body_pos;
    cur.line = body_line;
    compile_statements(gs, cur, WordType::Any, Some(b']'))?;
    finish_block(gs, start, ret);
    Ok(())
}

/// Emit a quoted string argument with its escapes decoded.
fn compile_unescape_str(gs: &mut GenState, cur: &mut Cursor) -> Result<(), ParseError> {
    let pos = cur.srcpos(gs.name());
    let raw = cur.get_str(gs.name())?;
    let s = text::unescape_string(&String::from_utf8_lossy(raw))
        .map_err(|c| ParseError::InvalidEscape(pos, c))?;
    op::push_inline_str(&mut gs.code, op::VAL | RET_STR, s.as_bytes());
    Ok(())
}

/// Emit the fallback value for an unusable `$…` form.
fn lookup_invalid(gs: &mut GenState, ltype: WordType, line: usize) -> Result<(), ParseError> {
    match ltype {
        WordType::Pop => Ok(()),
        WordType::Any | WordType::Word | WordType::Cond => {
            gs.gen_null();
            Ok(())
        }
        _ => gs.gen_value(ltype, "", line),
    }
}

/// Compile a `$name` (or `$(…)`, `$[…]`, `$$…`) lookup in the requested
/// representation.
fn compile_lookup(gs: &mut GenState, cur: &mut Cursor, ltype: WordType) -> Result<(), ParseError> {
    cur.next_char();
    let line = cur.line;
    let mut known = false;
    match cur.current(0) {
        b'(' | b'[' => {
            if !compile_arg(gs, cur, WordType::String, None)? {
                return lookup_invalid(gs, ltype, line);
            }
        }
        b'$' => compile_lookup(gs, cur, WordType::String)?,
        c => {
            let name = if c == b'"' {
                cur.get_str_dup(gs.name())?
            } else {
                String::from_utf8_lossy(cur.get_word()).into_owned()
            };
            if name.is_empty() {
                return lookup_invalid(gs, ltype, line);
            }
            match gs.state.new_ident(&name, FLAG_UNKNOWN) {
                Some(id) => match &id.kind {
                    IdentKind::IVar(_) => {
                        gs.code
                            .push(op::IVAR | ret_code(ltype, RET_INT) | ((id.index as u32) << 8));
                        match ltype {
                            WordType::Pop => {
                                gs.code.pop();
                            }
                            WordType::Code => gs.code.push(op::COMPILE),
                            WordType::Ident => gs.code.push(op::IDENT_U),
                            _ => {}
                        }
                        return Ok(());
                    }
                    IdentKind::FVar(_) => {
                        gs.code
                            .push(op::FVAR | ret_code(ltype, RET_FLOAT) | ((id.index as u32) << 8));
                        match ltype {
                            WordType::Pop => {
                                gs.code.pop();
                            }
                            WordType::Code => gs.code.push(op::COMPILE),
                            WordType::Ident => gs.code.push(op::IDENT_U),
                            _ => {}
                        }
                        return Ok(());
                    }
                    IdentKind::SVar(_) => match ltype {
                        WordType::Pop => return Ok(()),
                        _ => {
                            gs.code.push(
                                op::SVAR | ret_code(ltype, RET_STR) | ((id.index as u32) << 8),
                            );
                            known = true;
                        }
                    },
                    IdentKind::Alias(_) => {
                        let base = if id.is_arg() { op::LOOKUP_ARG } else { op::LOOKUP };
                        match ltype {
                            WordType::Pop => return Ok(()),
                            WordType::Cond => {
                                gs.code.push(base | ((id.index as u32) << 8));
                            }
                            _ => {
                                gs.code.push(
                                    base | ret_code(ltype, RET_STR) | ((id.index as u32) << 8),
                                );
                            }
                        }
                        known = true;
                    }
                    IdentKind::Command(cmd) => {
                        // synthesize default arguments, then a zero-input call
                        let mut comtype = op::COM;
                        let mut numargs = 0u32;
                        let format = cmd.format.clone();
                        let mut variadic = false;
                        for c in format.bytes() {
                            match c {
                                b's' | b'S' => {
                                    gs.gen_str("");
                                    numargs += 1;
                                }
                                b'i' => {
                                    gs.gen_int(0);
                                    numargs += 1;
                                }
                                b'b' => {
                                    gs.gen_int(i32::MIN);
                                    numargs += 1;
                                }
                                b'f' => {
                                    gs.gen_float(0.0);
                                    numargs += 1;
                                }
                                b'F' => {
                                    gs.code.push(op::DUP | RET_FLOAT);
                                    numargs += 1;
                                }
                                b'E' | b't' | b'T' => {
                                    gs.gen_null();
                                    numargs += 1;
                                }
                                b'e' => {
                                    gs.code.push(op::EMPTY);
                                    numargs += 1;
                                }
                                b'r' => {
                                    gs.gen_dummy_ident();
                                    numargs += 1;
                                }
                                b'$' => {
                                    gs.gen_ident(&id);
                                    numargs += 1;
                                }
                                b'N' => {
                                    gs.gen_int(-1);
                                    numargs += 1;
                                }
                                b'C' => {
                                    comtype = op::COM_C;
                                    variadic = true;
                                    break;
                                }
                                b'V' => {
                                    comtype = op::COM_V;
                                    variadic = true;
                                    break;
                                }
                                _ => {}
                            }
                        }
                        if variadic {
                            gs.code.push(op::pack_call(
                                comtype,
                                ret_code(ltype, 0),
                                id.index,
                                numargs as usize,
                            ));
                        } else {
                            gs.code
                                .push(comtype | ret_code(ltype, 0) | ((id.index as u32) << 8));
                        }
                        gs.code.push(op::RESULT_ARG | ret_code(ltype, 0));
                        known = true;
                    }
                    IdentKind::Special(..) => return lookup_invalid(gs, ltype, line),
                },
                None => gs.gen_str(&name),
            }
        }
    }
    if !known {
        match ltype {
            WordType::Cond => gs.code.push(op::LOOKUP_U),
            _ => gs.code.push(op::LOOKUP_U | ret_code(ltype, 0)),
        }
    }
    match ltype {
        WordType::Pop => gs.code.push(op::POP),
        WordType::Code => gs.code.push(op::COMPILE),
        WordType::Cond => gs.code.push(op::COND),
        WordType::Ident => gs.code.push(op::IDENT_U),
        _ => {}
    }
    Ok(())
}

/// Emit one raw text piece of a `[ … ]` body as a macro string: carriage
/// returns and comments are stripped, quoted strings pass through intact.
fn compile_blockstr(gs: &mut GenState, bytes: &[u8]) -> bool {
    let mut buf = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => i += 1,
            b'"' => match text::scan_string(&bytes[i..]) {
                Some((consumed, _)) => {
                    buf.extend_from_slice(&bytes[i..i + consumed]);
                    i += consumed;
                }
                None => {
                    buf.extend_from_slice(&bytes[i..]);
                    i = bytes.len();
                }
            },
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            c => {
                buf.push(c);
                i += 1;
            }
        }
    }
    op::push_inline_str(&mut gs.code, op::MACRO, &buf);
    true
}

/// Compile one `@…` substitution inside a block body.
fn compile_blocksub(gs: &mut GenState, cur: &mut Cursor) -> Result<bool, ParseError> {
    match cur.current(0) {
        b'(' => return compile_arg(gs, cur, WordType::Any, None),
        b'[' => {
            if !compile_arg(gs, cur, WordType::String, None)? {
                return Ok(false);
            }
            gs.code.push(op::LOOKUP_U);
        }
        c => {
            let name = if c == b'"' {
                cur.get_str_dup(gs.name())?
            } else {
                String::from_utf8_lossy(cur.read_macro_name()).into_owned()
            };
            if name.is_empty() {
                return Ok(false);
            }
            match gs.state.new_ident(&name, FLAG_UNKNOWN) {
                Some(id) => match &id.kind {
                    IdentKind::IVar(_) => gs.code.push(op::IVAR | ((id.index as u32) << 8)),
                    IdentKind::FVar(_) => gs.code.push(op::FVAR | ((id.index as u32) << 8)),
                    IdentKind::SVar(_) => gs.code.push(op::SVAR | ((id.index as u32) << 8)),
                    IdentKind::Alias(_) => {
                        let base = if id.is_arg() { op::LOOKUP_ARG } else { op::LOOKUP };
                        gs.code.push(base | ((id.index as u32) << 8));
                    }
                    _ => {
                        gs.gen_str(&name);
                        gs.code.push(op::LOOKUP_U);
                    }
                },
                None => {
                    gs.gen_str(&name);
                    gs.code.push(op::LOOKUP_U);
                }
            }
        }
    }
    Ok(true)
}

/// Compile a `[ … ]` block argument: capture raw text, splice `@`
/// substitutions, and deliver the result in the requested representation.
fn compile_blockmain(gs: &mut GenState, cur: &mut Cursor, wt: WordType) -> Result<(), ParseError> {
    let mut start = cur.pos;
    let start_line = cur.line;
    let mut concs = 0u32;
    let mut brak = 1usize;
    while brak != 0 {
        match cur.skip_until(b"@\"/[]") {
            0 => {
                return Err(ParseError::MissingBracket(cur.srcpos(gs.name()), ']'));
            }
            b'"' => {
                cur.get_str(gs.name())?;
            }
            b'/' => {
                cur.next_char();
                if cur.current(0) == b'/' {
                    cur.skip_until_char(b'\n');
                }
            }
            b'[' => {
                cur.next_char();
                brak += 1;
            }
            b']' => {
                cur.next_char();
                brak -= 1;
            }
            _ => {
                // a run of @s substitutes at the matching bracket level
                let esc = cur.pos;
                let mut level = 0usize;
                while cur.current(0) == b'@' {
                    level += 1;
                    cur.next_char();
                }
                if brak > level {
                    continue;
                }
                if brak < level {
                    return Err(ParseError::TooManyAts(cur.srcpos(gs.name())));
                }
                if compile_blockstr(gs, cur.slice(start, esc)) {
                    concs += 1;
                }
                if compile_blocksub(gs, cur)? {
                    concs += 1;
                }
                start = cur.pos;
            }
        }
    }
    let end = cur.pos - 1;
    if end > start {
        if concs == 0 {
            match wt {
                WordType::Pop => return Ok(()),
                WordType::Code | WordType::Cond => {
                    return compile_block_here(gs, cur, start, start_line, RET_NULL);
                }
                WordType::Ident => {
                    let name = String::from_utf8_lossy(cur.slice(start, end)).into_owned();
                    gs.gen_ident_name(&name);
                    return Ok(());
                }
                _ => {}
            }
        }
        compile_blockstr(gs, cur.slice(start, end));
        if concs > 1 {
            concs += 1;
        }
    }
    if concs > 0 {
        gs.code
            .push(op::CONC_W | ret_code(wt, 0) | (concs << 8));
    }
    let empty = concs == 0 && end <= start;
    match wt {
        WordType::Pop => {
            if !empty {
                gs.code.push(op::POP);
            }
        }
        WordType::Cond => {
            if empty {
                gs.gen_null();
            } else {
                gs.code.push(op::COND);
            }
        }
        WordType::Code => {
            if empty {
                gs.code.push(op::EMPTY);
            } else {
                gs.code.push(op::COMPILE);
            }
        }
        WordType::Ident => {
            if empty {
                gs.gen_dummy_ident();
            } else {
                gs.code.push(op::IDENT_U);
            }
        }
        WordType::String | WordType::Any | WordType::Word => {
            if empty {
                gs.gen_str("");
            }
        }
        WordType::Int | WordType::Float => {
            if concs == 0 {
                if empty {
                    gs.gen_value(wt, "", cur.line)?;
                } else {
                    gs.code.push(op::FORCE | ret_code(wt, 0));
                }
            }
        }
    }
    Ok(())
}

/// Compile one argument of the requested word type. Returns false when no
/// argument is present before the statement terminator.
fn compile_arg(
    gs: &mut GenState,
    cur: &mut Cursor,
    wt: WordType,
    word_out: Option<&mut String>,
) -> Result<bool, ParseError> {
    cur.skip_comments(gs.name())?;
    match cur.current(0) {
        b'"' => {
            match wt {
                WordType::Pop => {
                    cur.get_str(gs.name())?;
                }
                WordType::Cond => {
                    let line = cur.line;
                    let s = cur.get_str_dup(gs.name())?;
                    if !s.is_empty() {
                        compile_text_block(gs, &s, line, RET_NULL)?;
                    } else {
                        gs.gen_null();
                    }
                }
                WordType::Code => {
                    let line = cur.line;
                    let s = cur.get_str_dup(gs.name())?;
                    compile_text_block(gs, &s, line, RET_NULL)?;
                }
                WordType::Word => {
                    let s = cur.get_str_dup(gs.name())?;
                    if let Some(out) = word_out {
                        *out = s;
                    }
                }
                WordType::Any | WordType::String => compile_unescape_str(gs, cur)?,
                _ => {
                    let line = cur.line;
                    let s = cur.get_str_dup(gs.name())?;
                    gs.gen_value(wt, &s, line)?;
                }
            }
            Ok(true)
        }
        b'$' => {
            compile_lookup(gs, cur, wt)?;
            Ok(true)
        }
        b'(' => {
            cur.next_char();
            let start = gs.code.len();
            compile_statements(gs, cur, WordType::Any, Some(b')'))?;
            if gs.code.len() > start {
                gs.code.push(op::RESULT_ARG | ret_code(wt, 0));
            } else {
                gs.gen_value(wt, "", cur.line)?;
                return Ok(true);
            }
            match wt {
                WordType::Pop => gs.code.push(op::POP),
                WordType::Cond => gs.code.push(op::COND),
                WordType::Code => gs.code.push(op::COMPILE),
                WordType::Ident => gs.code.push(op::IDENT_U),
                _ => {}
            }
            Ok(true)
        }
        b'[' => {
            cur.next_char();
            compile_blockmain(gs, cur, wt)?;
            Ok(true)
        }
        _ => match wt {
            WordType::Pop => Ok(!cur.get_word().is_empty()),
            WordType::Cond | WordType::Code => {
                let line = cur.line;
                let s = cur.get_word();
                if s.is_empty() {
                    return Ok(false);
                }
                compile_text_block(gs, &String::from_utf8_lossy(s), line, RET_NULL)?;
                Ok(true)
            }
            WordType::Word => {
                let s = cur.get_word();
                if let Some(out) = word_out {
                    out.clear();
                    out.push_str(&String::from_utf8_lossy(s));
                }
                Ok(!s.is_empty())
            }
            _ => {
                let line = cur.line;
                let s = cur.get_word();
                if s.is_empty() {
                    return Ok(false);
                }
                gs.gen_value(wt, &String::from_utf8_lossy(s), line)?;
                Ok(true)
            }
        },
    }
}

/// Compile a command invocation, consuming arguments per the format
/// string. `limit` bounds the caller-supplied arguments (assignments pass
/// one). Returns whether more arguments may follow.
fn compile_cmd(
    gs: &mut GenState,
    cur: &mut Cursor,
    id: &Rc<Ident>,
    rettype: WordType,
    limit: u32,
) -> Result<bool, ParseError> {
    let cmd = id.as_command().expect("compile_cmd on non-command");
    let format = cmd.format.clone();
    let fmt = format.as_bytes();
    let mut comtype = op::COM;
    let mut numargs = 0u32;
    let mut numcargs = 0u32;
    let mut fakeargs = 0u32;
    let mut rep = false;
    let mut more = true;
    let mut variadic = false;
    let mut i = 0usize;
    while i < fmt.len() {
        let limited = limit != 0 && numcargs >= limit;
        match fmt[i] {
            b's' | b'S' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::String, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.gen_str("");
                    fakeargs += 1;
                } else if i + 1 == fmt.len() {
                    // trailing string args concatenate into the last slot
                    let mut numconc = 1u32;
                    loop {
                        more = compile_arg(gs, cur, WordType::String, None)?;
                        if !more {
                            break;
                        }
                        numconc += 1;
                    }
                    if numconc > 1 {
                        gs.code.push(op::CONC | RET_STR | (numconc << 8));
                    }
                }
                numargs += 1;
                numcargs += 1;
            }
            b'i' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Int, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.gen_int(0);
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b'b' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Int, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.gen_int(i32::MIN);
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b'f' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Float, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.gen_float(0.0);
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b'F' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Float, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.code.push(op::DUP | RET_FLOAT);
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b't' | b'T' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Any, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.gen_null();
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b'E' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Cond, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.gen_null();
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b'e' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Code, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.code.push(op::EMPTY);
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b'r' => {
                if more && !limited {
                    more = compile_arg(gs, cur, WordType::Ident, None)?;
                }
                if !more || limited {
                    if rep {
                        i += 1;
                        continue;
                    }
                    gs.gen_dummy_ident();
                    fakeargs += 1;
                }
                numargs += 1;
                numcargs += 1;
            }
            b'$' => {
                gs.gen_ident(id);
                numargs += 1;
            }
            b'N' => {
                gs.gen_int((numargs - fakeargs) as i32);
                numargs += 1;
            }
            b'C' => {
                comtype = op::COM_C;
                if more && !limited {
                    loop {
                        more = compile_arg(gs, cur, WordType::Any, None)?;
                        if !more || (limit != 0 && numcargs >= limit) {
                            break;
                        }
                        numargs += 1;
                        numcargs += 1;
                    }
                }
                variadic = true;
                break;
            }
            b'V' => {
                comtype = op::COM_V;
                if more && !limited {
                    loop {
                        more = compile_arg(gs, cur, WordType::Any, None)?;
                        if !more || (limit != 0 && numcargs >= limit) {
                            break;
                        }
                        numargs += 1;
                        numcargs += 1;
                    }
                }
                variadic = true;
                break;
            }
            c @ b'1'..=b'4' => {
                if more && !limited {
                    let numrep = (c - b'0' + 1) as usize;
                    i -= numrep;
                    rep = true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    if variadic {
        gs.code.push(op::pack_call(
            comtype,
            ret_code(rettype, 0),
            id.index,
            numargs as usize,
        ));
    } else {
        gs.code
            .push(comtype | ret_code(rettype, 0) | ((id.index as u32) << 8));
    }
    Ok(more)
}

/// Compile an alias invocation: all arguments as-is, then a packed call.
fn compile_alias_call(gs: &mut GenState, cur: &mut Cursor, id: &Rc<Ident>) -> Result<bool, ParseError> {
    let mut numargs = 0usize;
    let more = loop {
        let more = compile_arg(gs, cur, WordType::Any, None)?;
        if !more {
            break more;
        }
        numargs += 1;
    };
    let opc = if id.is_arg() { op::CALL_ARG } else { op::CALL };
    gs.code.push(op::pack_call(opc, 0, id.index, numargs));
    Ok(more)
}

fn compile_local(gs: &mut GenState, cur: &mut Cursor) -> Result<bool, ParseError> {
    let mut numargs = 0u32;
    let more = loop {
        let more = compile_arg(gs, cur, WordType::Ident, None)?;
        if !more {
            break more;
        }
        numargs += 1;
    };
    gs.code.push(op::LOCAL | (numargs << 8));
    Ok(more)
}

fn compile_do(
    gs: &mut GenState,
    cur: &mut Cursor,
    rettype: WordType,
    opcode: u32,
) -> Result<bool, ParseError> {
    let more = compile_arg(gs, cur, WordType::Code, None)?;
    gs.code
        .push(if more { opcode } else { op::NULL } | ret_code(rettype, 0));
    Ok(more)
}

/// Compile `if`, rewriting literal then/else blocks into a jump chain.
/// Anything else falls back to the runtime callback.
fn compile_if(
    gs: &mut GenState,
    cur: &mut Cursor,
    id: &Rc<Ident>,
    rettype: WordType,
) -> Result<bool, ParseError> {
    let mut more = compile_arg(gs, cur, WordType::Any, None)?;
    if !more {
        gs.code.push(op::NULL | ret_code(rettype, 0));
        return Ok(more);
    }
    let start1 = gs.code.len();
    more = compile_arg(gs, cur, WordType::Code, None)?;
    if !more {
        gs.code.push(op::POP);
        gs.code.push(op::NULL | ret_code(rettype, 0));
        return Ok(more);
    }
    let start2 = gs.code.len();
    more = compile_arg(gs, cur, WordType::Code, None)?;
    let inst1 = gs.code[start1];
    let op1 = inst1 & !RET_MASK;
    let len1 = (start2 - (start1 + 1)) as u32;
    if !more {
        if op1 == (op::BLOCK | (len1 << 8)) {
            gs.code[start1] = (len1 << 8) | op::JUMP_FALSE;
            gs.code[start1 + 1] = op::ENTER_RESULT;
            let exit1 = start1 + len1 as usize;
            gs.code[exit1] = (gs.code[exit1] & !RET_MASK) | ret_code(rettype, 0);
            return Ok(more);
        }
        gs.code.push(op::EMPTY);
    } else {
        let inst2 = gs.code[start2];
        let op2 = inst2 & !RET_MASK;
        let len2 = (gs.code.len() - (start2 + 1)) as u32;
        if op2 == (op::BLOCK | (len2 << 8)) {
            if op1 == (op::BLOCK | (len1 << 8)) {
                gs.code[start1] = (((start2 - start1) as u32) << 8) | op::JUMP_FALSE;
                gs.code[start1 + 1] = op::ENTER_RESULT;
                let exit1 = start1 + len1 as usize;
                gs.code[exit1] = (gs.code[exit1] & !RET_MASK) | ret_code(rettype, 0);
                gs.code[start2] = (len2 << 8) | op::JUMP;
                gs.code[start2 + 1] = op::ENTER_RESULT;
                let exit2 = start2 + len2 as usize;
                gs.code[exit2] = (gs.code[exit2] & !RET_MASK) | ret_code(rettype, 0);
                return Ok(more);
            } else if op1 == (op::EMPTY | (len1 << 8)) {
                gs.code[start1] = op::NULL | (inst2 & RET_MASK);
                gs.code[start2] = (len2 << 8) | op::JUMP_TRUE;
                gs.code[start2 + 1] = op::ENTER_RESULT;
                let exit2 = start2 + len2 as usize;
                gs.code[exit2] = (gs.code[exit2] & !RET_MASK) | ret_code(rettype, 0);
                return Ok(more);
            }
        }
    }
    gs.code
        .push(op::COM | ret_code(rettype, 0) | ((id.index as u32) << 8));
    Ok(more)
}

/// Compile `and`/`or` short-circuiting: every literal block becomes a
/// conditional jump over the rest; non-block arguments force the variadic
/// runtime fallback.
fn compile_and_or(
    gs: &mut GenState,
    cur: &mut Cursor,
    id: &Rc<Ident>,
    kind: SpecialKind,
    rettype: WordType,
) -> Result<bool, ParseError> {
    let mut numargs = 0usize;
    let mut more = compile_arg(gs, cur, WordType::Cond, None)?;
    if !more {
        let word = if kind == SpecialKind::And { op::TRUE } else { op::FALSE };
        gs.code.push(word | ret_code(rettype, 0));
        return Ok(more);
    }
    numargs += 1;
    let mut start = gs.code.len();
    let mut end = start;
    loop {
        more = compile_arg(gs, cur, WordType::Cond, None)?;
        if !more {
            break;
        }
        numargs += 1;
        let len = (gs.code.len() - (end + 1)) as u32;
        if (gs.code[end] & !RET_MASK) != (op::BLOCK | (len << 8)) {
            break;
        }
        end = gs.code.len();
    }
    if more {
        loop {
            more = compile_arg(gs, cur, WordType::Cond, None)?;
            if !more {
                break;
            }
            numargs += 1;
        }
        gs.code
            .push(op::pack_call(op::COM_V, ret_code(rettype, 0), id.index, numargs));
    } else {
        let opc = if kind == SpecialKind::And {
            op::JUMP_RESULT_FALSE
        } else {
            op::JUMP_RESULT_TRUE
        };
        gs.code.push(opc);
        end = gs.code.len();
        while start + 1 < end {
            let len = (gs.code[start] >> 8) as usize;
            gs.code[start] = (((end - (start + 1)) as u32) << 8) | opc;
            gs.code[start + 1] = op::ENTER;
            gs.code[start + len] = (gs.code[start + len] & !RET_MASK) | ret_code(rettype, 0);
            start += len + 1;
        }
    }
    Ok(more)
}

/// Compile a typed variable statement into the direct setter opcodes, or
/// a print when no value follows. Assignments pass `limit_one`.
fn compile_var(
    gs: &mut GenState,
    cur: &mut Cursor,
    id: &Rc<Ident>,
    limit_one: bool,
) -> Result<bool, ParseError> {
    let idx = (id.index as u32) << 8;
    let mut more;
    match &id.kind {
        IdentKind::IVar(_) => {
            more = compile_arg(gs, cur, WordType::Int, None)?;
            if !more {
                gs.code.push(op::PRINT | idx);
            } else if limit_one || !id.has_flag(FLAG_HEX) {
                gs.code.push(op::IVAR1 | idx);
            } else {
                more = compile_arg(gs, cur, WordType::Int, None)?;
                if !more {
                    gs.code.push(op::IVAR1 | idx);
                } else {
                    more = compile_arg(gs, cur, WordType::Int, None)?;
                    gs.code.push(if more { op::IVAR3 } else { op::IVAR2 } | idx);
                }
            }
        }
        IdentKind::FVar(_) => {
            more = compile_arg(gs, cur, WordType::Float, None)?;
            gs.code.push(if more { op::FVAR1 } else { op::PRINT } | idx);
        }
        IdentKind::SVar(_) => {
            more = compile_arg(gs, cur, WordType::String, None)?;
            gs.code.push(if more { op::SVAR1 } else { op::PRINT } | idx);
        }
        _ => unreachable!("compile_var on non-variable"),
    }
    Ok(more)
}

/// Compile the trailing `name arg*` form for an unknown head: arguments
/// as-is, then a runtime-dispatched call. The head value is already on
/// the stack.
fn compile_call_unknown(gs: &mut GenState, cur: &mut Cursor) -> Result<bool, ParseError> {
    let mut numargs = 0u32;
    let more = loop {
        let more = compile_arg(gs, cur, WordType::Any, None)?;
        if !more {
            break more;
        }
        numargs += 1;
    };
    gs.code.push(op::CALL_U | (numargs << 8));
    Ok(more)
}

/// Compile statements until the closing bracket (or the end of input).
pub(crate) fn compile_statements(
    gs: &mut GenState,
    cur: &mut Cursor,
    rettype: WordType,
    brak: Option<u8>,
) -> Result<(), ParseError> {
    loop {
        cur.skip_comments(gs.name())?;
        let curline = cur.line;
        let mut idname = String::new();
        let mut more = compile_arg(gs, cur, WordType::Word, Some(&mut idname))?;
        'stmt: {
            if !more {
                break 'stmt;
            }
            cur.skip_comments(gs.name())?;
            let assign = cur.current(0) == b'='
                && match cur.current(1) {
                    b'/' => cur.current(2) == b'/',
                    b';' | b' ' | b'\t' | b'\r' | b'\n' | 0 => true,
                    _ => false,
                };
            if assign {
                cur.next_char();
                if !idname.is_empty() {
                    match gs.state.new_ident(&idname, FLAG_UNKNOWN) {
                        Some(id) => match &id.kind {
                            IdentKind::Alias(_) => {
                                more = compile_arg(gs, cur, WordType::Any, None)?;
                                if !more {
                                    gs.gen_str("");
                                }
                                let opc = if id.is_arg() { op::ALIAS_ARG } else { op::ALIAS };
                                gs.code.push(opc | ((id.index as u32) << 8));
                                break 'stmt;
                            }
                            IdentKind::IVar(_) | IdentKind::FVar(_) | IdentKind::SVar(_) => {
                                more = compile_var(gs, cur, &id, true)?;
                                break 'stmt;
                            }
                            _ => gs.gen_str(&idname),
                        },
                        None => gs.gen_str(&idname),
                    }
                }
                more = compile_arg(gs, cur, WordType::Any, None)?;
                if !more {
                    gs.gen_str("");
                }
                gs.code.push(op::ALIAS_U);
                break 'stmt;
            }
            if idname.is_empty() {
                more = compile_call_unknown(gs, cur)?;
                break 'stmt;
            }
            let id = gs.state.get_ident(&idname);
            match id {
                None => {
                    if text::is_valid_name(&idname) {
                        gs.gen_str(&idname);
                        more = compile_call_unknown(gs, cur)?;
                        break 'stmt;
                    }
                    // a bare literal statement becomes the result
                    match rettype {
                        WordType::Any => {
                            let (val, n) = text::parse_int(&idname);
                            if n > 0 && n == idname.len() {
                                gs.gen_int(val);
                            } else {
                                gs.gen_str(&idname);
                            }
                        }
                        _ => gs.gen_value(rettype, &idname, curline)?,
                    }
                    gs.code.push(op::RESULT);
                }
                Some(id) => match &id.kind {
                    IdentKind::Alias(_) => {
                        more = compile_alias_call(gs, cur, &id)?;
                    }
                    IdentKind::Command(_) => {
                        more = compile_cmd(gs, cur, &id, rettype, 0)?;
                    }
                    IdentKind::IVar(_) | IdentKind::FVar(_) | IdentKind::SVar(_) => {
                        more = compile_var(gs, cur, &id, false)?;
                    }
                    IdentKind::Special(kind, _) => match kind {
                        SpecialKind::Local => more = compile_local(gs, cur)?,
                        SpecialKind::Do => more = compile_do(gs, cur, rettype, op::DO)?,
                        SpecialKind::DoArgs => more = compile_do(gs, cur, rettype, op::DO_ARGS)?,
                        SpecialKind::If => more = compile_if(gs, cur, &id, rettype)?,
                        SpecialKind::Break => gs.code.push(op::BREAK),
                        SpecialKind::Continue => gs.code.push(op::BREAK | (1 << 8)),
                        SpecialKind::Result => {
                            more = compile_arg(gs, cur, WordType::Any, None)?;
                            gs.code.push(
                                if more { op::RESULT } else { op::NULL } | ret_code(rettype, 0),
                            );
                        }
                        SpecialKind::Not => {
                            more = compile_arg(gs, cur, WordType::Any, None)?;
                            gs.code
                                .push(if more { op::NOT } else { op::TRUE } | ret_code(rettype, 0));
                        }
                        SpecialKind::And | SpecialKind::Or => {
                            more = compile_and_or(gs, cur, &id, *kind, rettype)?;
                        }
                    },
                },
            }
        }
        if more {
            while compile_arg(gs, cur, WordType::Pop, None)? {}
        }
        loop {
            match cur.skip_until(b")];/\n") {
                0 => {
                    if let Some(b) = brak {
                        return Err(ParseError::MissingBracket(
                            cur.srcpos(gs.name()),
                            b as char,
                        ));
                    }
                    return Ok(());
                }
                c @ (b')' | b']') => {
                    if brak == Some(c) {
                        cur.next_char();
                        return Ok(());
                    }
                    return Err(ParseError::UnexpectedBracket(
                        cur.srcpos(gs.name()),
                        c as char,
                    ));
                }
                b'/' => {
                    cur.next_char();
                    if cur.current(0) == b'/' {
                        cur.skip_until_char(b'\n');
                    }
                }
                _ => {
                    cur.next_char();
                    break;
                }
            }
        }
    }
}
