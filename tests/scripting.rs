//! End-to-end scripting scenarios: compile and run real source through a
//! state with the base library registered, observing output, results and
//! diagnostics.

use std::cell::RefCell;
use std::rc::Rc;

use cubescript::{stdlib, CubeError, State, Value};

type Lines = Rc<RefCell<Vec<String>>>;

fn test_state() -> (State, Lines, Lines) {
    let mut st = State::new();
    stdlib::register(&mut st).unwrap();
    let out: Lines = Rc::new(RefCell::new(Vec::new()));
    let diag: Lines = Rc::new(RefCell::new(Vec::new()));
    {
        let out = out.clone();
        st.set_out_hook(move |line| out.borrow_mut().push(line.to_string()));
    }
    {
        let diag = diag.clone();
        st.set_diag_hook(move |line| diag.borrow_mut().push(line.to_string()));
    }
    (st, out, diag)
}

#[test]
fn echo_prints_and_returns_null() {
    let (mut st, out, _) = test_state();
    let result = st.run("echo (+ 1 2)").unwrap();
    assert!(matches!(result, Value::Null));
    assert_eq!(*out.borrow(), vec!["3"]);
}

#[test]
fn echo_block_passes_raw_text() {
    let (mut st, out, _) = test_state();
    st.run("echo [hi there]").unwrap();
    assert_eq!(*out.borrow(), vec!["hi there"]);
}

#[test]
fn alias_with_positional_args() {
    let (mut st, _, _) = test_state();
    assert_eq!(st.run_int("alias sq [ * $arg1 $arg1 ]; sq 4").unwrap(), 16);
    assert_eq!(st.run_int("sq 9").unwrap(), 81);
}

#[test]
fn assignment_form_defines_aliases() {
    let (mut st, _, _) = test_state();
    assert_eq!(st.run_int("double = [+ $arg1 $arg1]; double 21").unwrap(), 42);
}

#[test]
fn if_selects_branch() {
    let (mut st, _, _) = test_state();
    assert_eq!(st.run_str("if 1 [result yes] [result no]").unwrap(), "yes");
    assert_eq!(st.run_str("if 0 [result yes] [result no]").unwrap(), "no");
}

#[test]
fn if_falls_back_on_dynamic_condition() {
    let (mut st, _, _) = test_state();
    st.run("x = 7").unwrap();
    assert_eq!(st.run_str("if $x [result yes] [result no]").unwrap(), "yes");
}

#[test]
fn loop_exposes_index() {
    let (mut st, out, _) = test_state();
    st.run("loop i 3 [ echo $i ]").unwrap();
    assert_eq!(*out.borrow(), vec!["0", "1", "2"]);
}

#[test]
fn concat_joins_with_spaces() {
    let (mut st, _, _) = test_state();
    assert_eq!(st.run_str("concat a b c").unwrap(), "a b c");
}

#[test]
fn too_many_ats_is_a_parse_error() {
    let (mut st, _, _) = test_state();
    let err = st.compile("[ @@x ]", Some("boot.cfg")).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("too many @s"), "got: {}", msg);
    assert!(msg.starts_with("boot.cfg:1:"), "got: {}", msg);
}

#[test]
fn block_substitution_at_each_level() {
    let (mut st, _, _) = test_state();
    st.run("x = world").unwrap();
    assert_eq!(st.run_str("t = [hello @x]; result $t").unwrap(), "hello world");
    assert_eq!(
        st.run_str("u = [a [@@x] b]; result $u").unwrap(),
        "a [world] b"
    );
}

#[test]
fn and_or_short_circuit() {
    let (mut st, _, _) = test_state();
    assert_eq!(st.run_int("and 1 2").unwrap(), 2);
    assert_eq!(st.run_int("and 0 2").unwrap(), 0);
    assert_eq!(st.run_int("or 0 3").unwrap(), 3);
    assert_eq!(st.run_int("or 4 5").unwrap(), 4);
    // dynamic argument forces the runtime fallback
    st.run("x = 0").unwrap();
    assert_eq!(st.run_int("and $x 5").unwrap(), 0);
    assert_eq!(st.run_int("or $x 5").unwrap(), 5);
}

#[test]
fn and_does_not_evaluate_after_false() {
    let (mut st, out, _) = test_state();
    st.run("and 0 [echo never]").unwrap();
    assert!(out.borrow().is_empty());
}

#[test]
fn bare_literal_statement_is_its_result() {
    let (mut st, _, _) = test_state();
    assert_eq!(st.run_int("42").unwrap(), 42);
    assert_eq!(st.run_float("2.5").unwrap(), 2.5);
}

#[test]
fn lookup_of_alias_value_as_head() {
    let (mut st, _, _) = test_state();
    st.run("a = 1").unwrap();
    assert_eq!(st.run_int("$a").unwrap(), 1);
}

#[test]
fn unknown_command_is_nonfatal() {
    let (mut st, _, diag) = test_state();
    let result = st.run("definitelynotacommand 1 2").unwrap();
    assert!(matches!(result, Value::Null));
    assert!(diag
        .borrow()
        .iter()
        .any(|l| l.contains("unknown command: definitelynotacommand")));
    assert_eq!(st.run_int("+ 1 1").unwrap(), 2);
}

#[test]
fn recursion_cap_leaves_state_usable() {
    let (mut st, _, diag) = test_state();
    let result = st.run("alias r [r]; r").unwrap();
    assert!(matches!(result, Value::Null));
    assert!(diag
        .borrow()
        .iter()
        .any(|l| l.contains("exceeded recursion limit")));
    assert_eq!(st.run_int("+ 2 3").unwrap(), 5);
}

#[test]
fn local_restores_on_normal_exit() {
    let (mut st, _, _) = test_state();
    st.run("a = 1").unwrap();
    assert_eq!(st.run_str("scoped = [local a; a = 2; result $a]; scoped").unwrap(), "2");
    assert_eq!(st.run_str("result $a").unwrap(), "1");
}

#[test]
fn local_restores_on_exceptional_exit() {
    let (mut st, _, _) = test_state();
    st.run("a = 10").unwrap();
    st.run("boom = [local a; a = 99; break]").unwrap();
    st.run("loop i 1 [ boom ]").unwrap();
    assert_eq!(st.run_str("result $a").unwrap(), "10");
}

#[test]
fn break_and_continue_in_loops() {
    let (mut st, _, _) = test_state();
    let n = st
        .run_int("n = 0; loop i 5 [ if (= $i 3) [break]; n = (+ $n 1) ]; result $n")
        .unwrap();
    assert_eq!(n, 3);
    let n = st
        .run_int("n = 0; loop i 5 [ if (= $i 2) [continue]; n = (+ $n $i) ]; result $n")
        .unwrap();
    assert_eq!(n, 8);
}

#[test]
fn break_outside_loop_is_reported() {
    let (mut st, _, _) = test_state();
    let err = st.run("break").unwrap_err();
    assert_eq!(err.to_string(), "break outside loop");
    assert_eq!(st.run_int("+ 1 1").unwrap(), 2);
}

#[test]
fn unused_positional_slot_reads_empty() {
    let (mut st, _, _) = test_state();
    st.run("probe = [result $arg2]").unwrap();
    assert_eq!(st.run_str("probe 1").unwrap(), "");
    assert_eq!(st.run_str("probe 1 2").unwrap(), "2");
}

#[test]
fn numargs_tracks_call_arity() {
    let (mut st, _, _) = test_state();
    st.run("count = [result $numargs]").unwrap();
    assert_eq!(st.run_int("count a b c").unwrap(), 3);
    assert_eq!(st.run_int("count").unwrap(), 0);
}

#[test]
fn doargs_sees_callers_arguments() {
    let (mut st, _, _) = test_state();
    st.run("inner = [ doargs [ result $arg1 ] ]").unwrap();
    st.run("outer = [ inner ]").unwrap();
    assert_eq!(st.run_int("outer 7").unwrap(), 7);
}

#[test]
fn variable_write_clamps_and_reports() {
    let (mut st, _, diag) = test_state();
    st.new_ivar("gamma", 30, 300, 100, None, 0).unwrap();
    st.run("gamma 500").unwrap();
    assert_eq!(st.run_int("$gamma").unwrap(), 300);
    assert!(diag
        .borrow()
        .iter()
        .any(|l| l.contains("valid range for gamma is 30..300")));
}

#[test]
fn variable_hook_fires_inside_setter() {
    let (mut st, _, _) = test_state();
    let fired: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let log = fired.clone();
    st.new_ivar(
        "speed",
        0,
        100,
        10,
        Some(Rc::new(move |state: &mut State, id| {
            let _ = state;
            if let cubescript::IdentKind::IVar(var) = &id.kind {
                log.borrow_mut().push(var.storage.get());
            }
        })),
        0,
    )
    .unwrap();
    st.run("speed 42").unwrap();
    assert_eq!(*fired.borrow(), vec![42]);
}

#[test]
fn variable_statement_with_no_args_prints() {
    let (mut st, out, _) = test_state();
    st.new_ivar("volume", 0, 10, 5, None, 0).unwrap();
    st.run("volume").unwrap();
    assert_eq!(*out.borrow(), vec!["volume = 5"]);
}

#[test]
fn string_variable_assignment() {
    let (mut st, _, _) = test_state();
    st.new_svar("motd", "hi", None, 0).unwrap();
    st.run("motd = \"welcome back\"").unwrap();
    assert_eq!(st.run_str("result $motd").unwrap(), "welcome back");
}

#[test]
fn quoted_strings_unescape() {
    let (mut st, out, _) = test_state();
    st.run("echo \"a\\tb\"").unwrap();
    assert_eq!(*out.borrow(), vec!["a\tb"]);
}

#[test]
fn parse_error_carries_file_and_line() {
    let (mut st, _, _) = test_state();
    let err = st.compile("echo ok\necho \"broken", Some("boot.cfg")).unwrap_err();
    assert!(err.to_string().starts_with("boot.cfg:2:"), "got: {}", err);
}

#[test]
fn nested_expressions_have_own_result() {
    let (mut st, _, _) = test_state();
    assert_eq!(st.run_int("+ (* 2 3) (- 10 4)").unwrap(), 12);
}

#[test]
fn call_hook_can_cancel_execution() {
    let (mut st, _, _) = test_state();
    let count = Rc::new(RefCell::new(0u32));
    let counter = count.clone();
    st.set_call_hook(move |state| {
        *counter.borrow_mut() += 1;
        if *counter.borrow() > 50 {
            return Err(state.error("<execution interrupted>"));
        }
        Ok(())
    });
    let err = st.run("alias spin [spin]; spin").unwrap_err();
    assert!(err.to_string().contains("interrupted"));
    st.clear_call_hook();
    assert_eq!(st.run_int("+ 1 1").unwrap(), 2);
}

#[test]
fn runtime_error_carries_alias_trace() {
    let (mut st, _, _) = test_state();
    st.new_command("fail", "", |state, _, _| Err(state.error("boom")))
        .unwrap();
    st.run("inner = [fail]; outer = [inner]").unwrap();
    let err = st.run("outer").unwrap_err();
    match err {
        CubeError::Run(run) => {
            let names: Vec<&str> = run.trace().iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, vec!["inner", "outer"]);
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}
