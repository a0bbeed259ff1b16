//! The interpreter state: the identifier registry, string pool, call
//! frames, host hooks, and the embedding API for registering commands
//! and variables and running code.

use std::path::Path;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::block::{CodeBlock, CodeRef};
use crate::error::{CubeError, RuntimeError, TraceFrame};
use crate::gen;
use crate::ident::{
    Command, CommandFn, FloatVar, Ident, IdentKind, IntVar, SpecialKind, StrVar, VarHook,
    DBGALIAS_IDX, DUMMY_IDX, FLAG_ARG, FLAG_HEX, FLAG_READ_ONLY, FLAG_UNKNOWN, MAX_ARGUMENTS,
    MAX_RUN_DEPTH, NUMARGS_IDX,
};
use crate::parser::text;
use crate::strpool::StringPool;
use crate::value::Value;
use crate::vm;

pub type CallHookFn = Rc<dyn Fn(&mut State) -> Result<(), CubeError>>;
pub type VarPrintFn = Rc<dyn Fn(&State, &Ident)>;
pub type OutputFn = Rc<dyn Fn(&str)>;

/// One alias call frame: the alias being run and the bitmask of
/// positional slots this frame pushed.
pub(crate) struct Frame {
    pub id: Option<usize>,
    pub usedargs: u32,
}

/// One interpreter state. Single-threaded; everything the language can
/// see lives here.
pub struct State {
    pub(crate) strings: StringPool,
    idents: IndexMap<Rc<str>, usize>,
    pub(crate) identmap: Vec<Rc<Ident>>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) rundepth: usize,
    empties: [CodeRef; 4],
    call_hook: Option<CallHookFn>,
    var_printer: VarPrintFn,
    diag: OutputFn,
    out: OutputFn,
    pub(crate) src_name: Option<Rc<str>>,
}

/// Default textual rendering of a variable for the print hook.
pub fn format_var(id: &Ident) -> String {
    match &id.kind {
        IdentKind::IVar(var) => {
            let n = var.storage.get();
            if id.has_flag(FLAG_HEX) {
                format!(
                    "{} = 0x{:X} ({}, {}, {})",
                    id.name,
                    n,
                    (n >> 16) & 0xFF,
                    (n >> 8) & 0xFF,
                    n & 0xFF
                )
            } else {
                format!("{} = {}", id.name, n)
            }
        }
        IdentKind::FVar(var) => format!("{} = {}", id.name, text::float_str(var.storage.get())),
        IdentKind::SVar(var) => {
            let s = var.storage.borrow();
            if s.contains('"') {
                format!("{} = [{}]", id.name, s)
            } else {
                format!("{} = \"{}\"", id.name, s)
            }
        }
        _ => String::new(),
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        let mut st = Self {
            strings: StringPool::new(),
            idents: IndexMap::new(),
            identmap: Vec::new(),
            frames: vec![Frame {
                id: None,
                usedargs: (1 << MAX_ARGUMENTS) - 1,
            }],
            rundepth: 0,
            empties: CodeBlock::empties(),
            call_hook: None,
            var_printer: Rc::new(|st, id| st.write_out(&format_var(id))),
            diag: Rc::new(|msg| eprintln!("{}", msg)),
            out: Rc::new(|line| println!("{}", line)),
            src_name: None,
        };
        for i in 1..=MAX_ARGUMENTS {
            st.add_ident(
                &format!("arg{}", i),
                IdentKind::Alias(Default::default()),
                FLAG_ARG,
            );
        }
        let dummy = st.add_ident("//dummy", IdentKind::Alias(Default::default()), 0);
        debug_assert_eq!(dummy.index, DUMMY_IDX);
        let numargs = st.add_ident(
            "numargs",
            IdentKind::IVar(IntVar {
                storage: 0.into(),
                min: i32::MIN,
                max: i32::MAX,
                default: 0,
                hook: None,
            }),
            FLAG_READ_ONLY,
        );
        debug_assert_eq!(numargs.index, NUMARGS_IDX);
        let dbgalias = st.add_ident(
            "dbgalias",
            IdentKind::IVar(IntVar {
                storage: 4.into(),
                min: 0,
                max: 1000,
                default: 4,
                hook: None,
            }),
            0,
        );
        debug_assert_eq!(dbgalias.index, DBGALIAS_IDX);
        register_specials(&mut st);
        st
    }

    fn add_ident(&mut self, name: &str, kind: IdentKind, flags: u32) -> Rc<Ident> {
        let name_rc = self.strings.add(name);
        let index = self.identmap.len();
        let id = Ident::new(name_rc.clone(), index, flags, kind);
        self.idents.insert(name_rc, index);
        self.identmap.push(id.clone());
        id
    }

    /// Look up an identifier, creating an unknown alias when absent and
    /// the name is usable. Invalid (number-like) names yield `None`.
    pub fn new_ident(&mut self, name: &str, flags: u32) -> Option<Rc<Ident>> {
        if let Some(&i) = self.idents.get(name) {
            return Some(self.identmap[i].clone());
        }
        if !text::is_valid_name(name) {
            return None;
        }
        Some(self.add_ident(name, IdentKind::Alias(Default::default()), flags))
    }

    /// Look up without creating.
    pub fn get_ident(&self, name: &str) -> Option<Rc<Ident>> {
        self.idents.get(name).map(|&i| self.identmap[i].clone())
    }

    /// All identifiers in creation order.
    pub fn idents(&self) -> impl Iterator<Item = &Rc<Ident>> {
        self.identmap.iter()
    }

    fn check_new_name(&mut self, name: &str) -> Result<(), CubeError> {
        if name.is_empty() {
            return Err(self.error("empty identifier name"));
        }
        if self.idents.contains_key(name) {
            return Err(self.error(format!("cannot redefine \"{}\"", name)));
        }
        Ok(())
    }

    /// Register a native command. The format string is validated at
    /// registration time.
    pub fn new_command<F>(&mut self, name: &str, format: &str, cb: F) -> Result<Rc<Ident>, CubeError>
    where
        F: Fn(&mut State, &mut [Value], &mut Value) -> Result<(), CubeError> + 'static,
    {
        self.check_new_name(name)?;
        let (num_args, variadic) =
            crate::ident::parse_format(format).map_err(|msg| self.error(msg))?;
        Ok(self.add_ident(
            name,
            IdentKind::Command(Command {
                format: format.to_string(),
                num_args,
                variadic,
                cb: Rc::new(cb),
            }),
            0,
        ))
    }

    fn new_special(
        &mut self,
        name: &str,
        kind: SpecialKind,
        format: Option<&str>,
        cb: Option<CommandFn>,
    ) -> Rc<Ident> {
        let cmd = format.map(|fmt| {
            let (num_args, variadic) = crate::ident::parse_format(fmt).expect("bad special format");
            Command {
                format: fmt.to_string(),
                num_args,
                variadic,
                cb: cb.clone().expect("special format without callback"),
            }
        });
        self.add_ident(name, IdentKind::Special(kind, cmd), 0)
    }

    pub fn new_ivar(
        &mut self,
        name: &str,
        min: i32,
        max: i32,
        default: i32,
        hook: Option<VarHook>,
        flags: u32,
    ) -> Result<Rc<Ident>, CubeError> {
        self.check_new_name(name)?;
        Ok(self.add_ident(
            name,
            IdentKind::IVar(IntVar {
                storage: default.into(),
                min,
                max,
                default,
                hook,
            }),
            flags,
        ))
    }

    pub fn new_fvar(
        &mut self,
        name: &str,
        min: f32,
        max: f32,
        default: f32,
        hook: Option<VarHook>,
        flags: u32,
    ) -> Result<Rc<Ident>, CubeError> {
        self.check_new_name(name)?;
        Ok(self.add_ident(
            name,
            IdentKind::FVar(FloatVar {
                storage: default.into(),
                min,
                max,
                default,
                hook,
            }),
            flags,
        ))
    }

    pub fn new_svar(
        &mut self,
        name: &str,
        default: &str,
        hook: Option<VarHook>,
        flags: u32,
    ) -> Result<Rc<Ident>, CubeError> {
        self.check_new_name(name)?;
        let default = self.strings.add(default);
        Ok(self.add_ident(
            name,
            IdentKind::SVar(StrVar {
                storage: std::cell::RefCell::new(default.clone()),
                default,
                hook,
            }),
            flags,
        ))
    }

    // --- Hooks ---

    pub fn set_call_hook<F>(&mut self, hook: F)
    where
        F: Fn(&mut State) -> Result<(), CubeError> + 'static,
    {
        self.call_hook = Some(Rc::new(hook));
    }

    pub fn clear_call_hook(&mut self) {
        self.call_hook = None;
    }

    pub(crate) fn call_hook(&self) -> Option<CallHookFn> {
        self.call_hook.clone()
    }

    pub fn set_var_print_hook<F>(&mut self, hook: F)
    where
        F: Fn(&State, &Ident) + 'static,
    {
        self.var_printer = Rc::new(hook);
    }

    /// Route non-fatal diagnostics (unknown command, clamped writes).
    pub fn set_diag_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str) + 'static,
    {
        self.diag = Rc::new(hook);
    }

    /// Route ordinary script output (`echo` and variable prints).
    pub fn set_out_hook<F>(&mut self, hook: F)
    where
        F: Fn(&str) + 'static,
    {
        self.out = Rc::new(hook);
    }

    pub fn write_out(&self, line: &str) {
        (self.out)(line);
    }

    /// Build a runtime error carrying the current alias call trace.
    pub fn error(&self, message: impl Into<String>) -> CubeError {
        let trace = self
            .frames
            .iter()
            .skip(1)
            .rev()
            .filter_map(|f| {
                f.id.map(|i| TraceFrame {
                    index: i,
                    name: self.identmap[i].name.to_string(),
                })
            })
            .collect();
        RuntimeError::with_trace(message, trace).into()
    }

    /// Print a non-fatal diagnostic, prefixed with the active source name
    /// and followed by the alias trace up to `$dbgalias` frames.
    pub fn debug_code(&self, msg: &str) {
        match &self.src_name {
            Some(name) => (self.diag)(&format!("{}: {}", name, msg)),
            None => (self.diag)(msg),
        }
        let limit = self.ivar_raw(DBGALIAS_IDX);
        if limit <= 0 {
            return;
        }
        let limit = limit as usize;
        let total = self.frames.len() - 1;
        let mut depth = 0usize;
        for (pos, frame) in self.frames[1..].iter().enumerate().rev() {
            depth += 1;
            let name = frame
                .id
                .map(|i| self.identmap[i].name.to_string())
                .unwrap_or_default();
            if depth < limit {
                (self.diag)(&format!("  {}) {}", total - depth + 1, name));
            } else if pos == 0 {
                let ellipsis = if depth == limit { "" } else { ".." };
                (self.diag)(&format!("  {}{}) {}", ellipsis, total - depth + 1, name));
            }
        }
    }

    pub fn print_var(&mut self, id: &Rc<Ident>) {
        let printer = self.var_printer.clone();
        printer(self, id);
    }

    // --- Frames and positional slots ---

    pub(crate) fn arg_used(&self, idx: usize) -> bool {
        self.frames.last().map_or(false, |f| f.usedargs & (1 << idx) != 0)
    }

    pub(crate) fn mark_arg_used(&mut self, idx: usize) {
        if let Some(f) = self.frames.last_mut() {
            f.usedargs |= 1 << idx;
        }
    }

    pub(crate) fn ivar_raw(&self, idx: usize) -> i32 {
        match &self.identmap[idx].kind {
            IdentKind::IVar(v) => v.storage.get(),
            _ => 0,
        }
    }

    pub(crate) fn set_ivar_raw(&mut self, idx: usize, v: i32) {
        if let IdentKind::IVar(var) = &self.identmap[idx].kind {
            var.storage.set(v);
        }
    }

    pub(crate) fn empty_ret(&self, ret: u32) -> CodeRef {
        self.empties[(ret >> 6) as usize].clone()
    }

    // --- Variable writes ---

    pub fn set_var_int_checked(&mut self, id: &Rc<Ident>, v: i32) {
        let IdentKind::IVar(var) = &id.kind else { return };
        if id.has_flag(FLAG_READ_ONLY) {
            self.debug_code(&format!("variable {} is read only", id.name));
            return;
        }
        let mut v = v;
        if v < var.min || v > var.max {
            v = v.clamp(var.min, var.max);
            let msg = if id.has_flag(FLAG_HEX) {
                format!(
                    "valid range for {} is 0x{:X}..0x{:X}",
                    id.name, var.min, var.max
                )
            } else {
                format!("valid range for {} is {}..{}", id.name, var.min, var.max)
            };
            self.debug_code(&msg);
        }
        var.storage.set(v);
        if let Some(hook) = var.hook.clone() {
            hook(self, id);
        }
    }

    /// Hex variables accept 2 or 3 components packed as `r<<16|g<<8|b`.
    pub fn set_var_int_multi(&mut self, id: &Rc<Ident>, vals: &[Value]) {
        let mut n = vals[0].get_int();
        if id.has_flag(FLAG_HEX) && vals.len() > 1 {
            n = (n << 16) | (vals[1].get_int() << 8);
            if vals.len() > 2 {
                n |= vals[2].get_int();
            }
        }
        self.set_var_int_checked(id, n);
    }

    pub fn set_var_float_checked(&mut self, id: &Rc<Ident>, v: f32) {
        let IdentKind::FVar(var) = &id.kind else { return };
        if id.has_flag(FLAG_READ_ONLY) {
            self.debug_code(&format!("variable {} is read only", id.name));
            return;
        }
        let mut v = v;
        if v < var.min || v > var.max {
            v = v.clamp(var.min, var.max);
            self.debug_code(&format!(
                "valid range for {} is {}..{}",
                id.name,
                text::float_str(var.min),
                text::float_str(var.max)
            ));
        }
        var.storage.set(v);
        if let Some(hook) = var.hook.clone() {
            hook(self, id);
        }
    }

    pub fn set_var_str_checked(&mut self, id: &Rc<Ident>, v: &str) {
        let IdentKind::SVar(var) = &id.kind else { return };
        if id.has_flag(FLAG_READ_ONLY) {
            self.debug_code(&format!("variable {} is read only", id.name));
            return;
        }
        let interned = self.strings.add(v);
        *var.storage.borrow_mut() = interned;
        if let Some(hook) = var.hook.clone() {
            hook(self, id);
        }
    }

    // --- Alias writes ---

    pub(crate) fn set_alias_value(&mut self, id: &Rc<Ident>, v: Value) {
        id.alias().borrow_mut().set_value(v);
        id.clear_flag(FLAG_UNKNOWN);
    }

    /// Write a positional slot within the current frame, pushing a saved
    /// value the first time the frame touches the slot.
    pub(crate) fn set_arg_value(&mut self, id: &Rc<Ident>, v: Value) {
        if self.arg_used(id.index) {
            id.alias().borrow_mut().set_value(v);
        } else {
            id.alias().borrow_mut().push(v);
            self.mark_arg_used(id.index);
        }
    }

    /// Assign by name: aliases get the value, variables go through their
    /// checked setters, builtins are refused.
    pub fn set_alias(&mut self, name: &str, v: Value) {
        match self.get_ident(name) {
            Some(id) => match &id.kind {
                IdentKind::Alias(_) => {
                    if id.index < MAX_ARGUMENTS {
                        self.set_arg_value(&id, v);
                    } else {
                        self.set_alias_value(&id, v);
                    }
                }
                IdentKind::IVar(_) => self.set_var_int_checked(&id, v.get_int()),
                IdentKind::FVar(_) => self.set_var_float_checked(&id, v.get_float()),
                IdentKind::SVar(_) => self.set_var_str_checked(&id, &v.get_str()),
                _ => self.debug_code(&format!("cannot redefine builtin {} with an alias", name)),
            },
            None => {
                if !text::is_valid_name(name) {
                    self.debug_code(&format!("cannot alias invalid name \"{}\"", name));
                    return;
                }
                let id = self.add_ident(name, IdentKind::Alias(Default::default()), 0);
                id.alias().borrow_mut().set_value(v);
            }
        }
    }

    pub(crate) fn force_ident_idx(&mut self, v: &mut Value) -> usize {
        if let Some(i) = v.as_ident() {
            return i;
        }
        let name = v.get_str();
        let idx = match self.new_ident(&name, 0) {
            Some(id) => id.index,
            None => {
                self.debug_code(&format!("number {} is not a valid identifier name", name));
                DUMMY_IDX
            }
        };
        *v = Value::Ident(idx);
        idx
    }

    /// The cached compilation of an alias body, compiling on first use.
    pub(crate) fn alias_code(&mut self, id: &Rc<Ident>) -> Result<CodeRef, CubeError> {
        if let Some(code) = id.alias().borrow().code.clone() {
            return Ok(code);
        }
        let source = id.alias().borrow().value.get_str();
        let code = self.compile(&source, None)?;
        id.alias().borrow_mut().code = Some(code.clone());
        Ok(code)
    }

    // --- Compilation and execution ---

    /// Compile source text into a refcounted bytecode block.
    pub fn compile(&mut self, source: &str, name: Option<&str>) -> Result<CodeRef, CubeError> {
        self.compile_at(source, name, 1)
    }

    /// Compile with an explicit starting line for error positions.
    pub fn compile_at(
        &mut self,
        source: &str,
        name: Option<&str>,
        first_line: usize,
    ) -> Result<CodeRef, CubeError> {
        let src_name = name.map(Rc::from);
        let code = gen::gen_main(self, source, src_name, first_line, 0)?;
        Ok(CodeRef::main(code))
    }

    /// Execute compiled code. `break`/`continue` escaping every loop are
    /// returned as control errors; the string entry points demote them.
    pub fn run_code(&mut self, code: &CodeRef) -> Result<Value, CubeError> {
        let mut result = Value::Null;
        vm::run(self, code, &mut result)?;
        Ok(result)
    }

    pub fn run(&mut self, source: &str) -> Result<Value, CubeError> {
        let code = self.compile(source, None)?;
        self.run_code(&code).map_err(CubeError::demote_control)
    }

    pub fn run_int(&mut self, source: &str) -> Result<i32, CubeError> {
        self.run(source).map(|v| v.get_int())
    }

    pub fn run_float(&mut self, source: &str) -> Result<f32, CubeError> {
        self.run(source).map(|v| v.get_float())
    }

    pub fn run_bool(&mut self, source: &str) -> Result<bool, CubeError> {
        self.run(source).map(|v| v.get_bool())
    }

    pub fn run_str(&mut self, source: &str) -> Result<String, CubeError> {
        self.run(source).map(|v| v.get_str())
    }

    /// Invoke an identifier with prepared arguments, dispatching on its
    /// kind the way `CALL_U` does.
    pub fn run_ident(&mut self, id: &Rc<Ident>, args: Vec<Value>) -> Result<Value, CubeError> {
        let mut ret = Value::Null;
        if self.rundepth >= MAX_RUN_DEPTH {
            self.debug_code("exceeded recursion limit");
            return Ok(ret);
        }
        self.rundepth += 1;
        let res = (|| -> Result<(), CubeError> {
            match &id.kind {
                IdentKind::Command(_) | IdentKind::Special(_, Some(_)) => {
                    vm::call_command(self, id, args, &mut ret, false)?;
                }
                IdentKind::IVar(_) => {
                    if args.is_empty() {
                        self.print_var(id);
                    } else {
                        self.set_var_int_multi(id, &args);
                    }
                }
                IdentKind::FVar(_) => {
                    if args.is_empty() {
                        self.print_var(id);
                    } else {
                        self.set_var_float_checked(id, args[0].get_float());
                    }
                }
                IdentKind::SVar(_) => {
                    if args.is_empty() {
                        self.print_var(id);
                    } else {
                        self.set_var_str_checked(id, &args[0].get_str());
                    }
                }
                IdentKind::Alias(alias) => {
                    if id.is_arg() && !self.arg_used(id.index) {
                        return Ok(());
                    }
                    if matches!(alias.borrow().value, Value::Null) {
                        return Ok(());
                    }
                    let mut argv = args;
                    let n = argv.len();
                    vm::call_alias(self, id, &mut argv, n, &mut ret, 0, 0)?;
                }
                IdentKind::Special(_, None) => {}
            }
            Ok(())
        })();
        self.rundepth -= 1;
        res?;
        Ok(ret)
    }

    /// Load and run a script file, recording its name for diagnostics.
    pub fn run_file(&mut self, path: impl AsRef<Path>) -> Result<Value, CubeError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let name: Rc<str> = Rc::from(path.to_string_lossy().as_ref());
        let old = std::mem::replace(&mut self.src_name, Some(name.clone()));
        let res = self
            .compile_at(&source, Some(&name), 1)
            .and_then(|code| self.run_code(&code));
        self.src_name = old;
        res.map_err(CubeError::demote_control)
    }

    pub fn run_file_int(&mut self, path: impl AsRef<Path>) -> Result<i32, CubeError> {
        self.run_file(path).map(|v| v.get_int())
    }

    pub fn run_file_float(&mut self, path: impl AsRef<Path>) -> Result<f32, CubeError> {
        self.run_file(path).map(|v| v.get_float())
    }

    pub fn run_file_bool(&mut self, path: impl AsRef<Path>) -> Result<bool, CubeError> {
        self.run_file(path).map(|v| v.get_bool())
    }

    pub fn run_file_str(&mut self, path: impl AsRef<Path>) -> Result<String, CubeError> {
        self.run_file(path).map(|v| v.get_str())
    }
}

impl CodeRef {
    /// Execute this code against a state. Equivalent to
    /// [`State::run_code`].
    pub fn call(&self, state: &mut State) -> Result<Value, CubeError> {
        state.run_code(self)
    }
}

/// Register the language built-ins: the specials the code generator
/// rewrites, with runtime fallbacks for dynamic invocation.
fn register_specials(st: &mut State) {
    st.new_special("local", SpecialKind::Local, None, None);

    st.new_special(
        "do",
        SpecialKind::Do,
        Some("e"),
        Some(Rc::new(|state, args, res| {
            if let Some(code) = args[0].as_code().cloned() {
                *res = state.run_code(&code)?;
            }
            Ok(())
        })),
    );

    st.new_special(
        "doargs",
        SpecialKind::DoArgs,
        Some("e"),
        Some(Rc::new(|state, args, res| {
            if let Some(code) = args[0].as_code().cloned() {
                *res = vm::run_in_caller_frame(state, &code)?;
            }
            Ok(())
        })),
    );

    st.new_special(
        "if",
        SpecialKind::If,
        Some("tee"),
        Some(Rc::new(|state, args, res| {
            let pick = if args[0].get_bool() { 1 } else { 2 };
            match args[pick].as_code().cloned() {
                Some(code) => *res = state.run_code(&code)?,
                None => *res = std::mem::take(&mut args[pick]),
            }
            Ok(())
        })),
    );

    st.new_special(
        "result",
        SpecialKind::Result,
        Some("t"),
        Some(Rc::new(|_, args, res| {
            *res = std::mem::take(&mut args[0]);
            Ok(())
        })),
    );

    st.new_special(
        "not",
        SpecialKind::Not,
        Some("t"),
        Some(Rc::new(|_, args, res| {
            *res = Value::Int(!args[0].get_bool() as i32);
            Ok(())
        })),
    );

    st.new_special(
        "and",
        SpecialKind::And,
        Some("E1V"),
        Some(Rc::new(|state, args, res| {
            *res = Value::Int(1);
            for arg in args.iter() {
                match arg.as_code() {
                    Some(code) => *res = state.run_code(&code.clone())?,
                    None => *res = arg.clone(),
                }
                if !res.get_bool() {
                    break;
                }
            }
            Ok(())
        })),
    );

    st.new_special(
        "or",
        SpecialKind::Or,
        Some("E1V"),
        Some(Rc::new(|state, args, res| {
            *res = Value::Int(0);
            for arg in args.iter() {
                match arg.as_code() {
                    Some(code) => *res = state.run_code(&code.clone())?,
                    None => *res = arg.clone(),
                }
                if res.get_bool() {
                    break;
                }
            }
            Ok(())
        })),
    );

    st.new_special(
        "break",
        SpecialKind::Break,
        Some(""),
        Some(Rc::new(|_, _, _| Err(RuntimeError::Break.into()))),
    );

    st.new_special(
        "continue",
        SpecialKind::Continue,
        Some(""),
        Some(Rc::new(|_, _, _| Err(RuntimeError::Continue.into()))),
    );
}
