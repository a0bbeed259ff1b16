//! CubeScript CLI: evaluate strings, run script files, or start the
//! interactive shell.

use std::io::Read;
use std::process;

use cubescript::{stdlib, State, Value};

mod repl;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("Usage: cubescript [options] [file]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -e STR  evaluate STR");
    eprintln!("  -i      enter interactive mode after the above");
    eprintln!("  -v      show version information");
    eprintln!("  -h      show this message");
    eprintln!("  --      stop handling options");
    eprintln!("  -       execute stdin and stop handling options");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut evals: Vec<String> = Vec::new();
    let mut interactive = false;
    let mut run_stdin = false;
    let mut file: Option<String> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-e" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("-e requires an argument");
                    print_usage();
                    process::exit(64);
                }
                evals.push(args[i].clone());
            }
            "-i" => interactive = true,
            "-v" => {
                println!("CubeScript {}", VERSION);
                return;
            }
            "-h" => {
                print_usage();
                return;
            }
            "--" => {
                if i + 1 < args.len() {
                    file = Some(args[i + 1].clone());
                }
                break;
            }
            "-" => {
                run_stdin = true;
                break;
            }
            arg if arg.starts_with('-') => {
                eprintln!("unknown option {:?}", arg);
                print_usage();
                process::exit(64);
            }
            arg => {
                file = Some(arg.to_string());
                break;
            }
        }
        i += 1;
    }

    let mut state = State::new();
    if let Err(e) = stdlib::register(&mut state) {
        eprintln!("failed to register base library: {}", e);
        process::exit(1);
    }

    let mut failed = false;
    let mut ran_anything = false;

    for code in &evals {
        ran_anything = true;
        match state.run(code) {
            Ok(Value::Null) => {}
            Ok(v) => println!("{}", v.get_str()),
            Err(e) => {
                repl::print_error(&e);
                failed = true;
            }
        }
    }

    if run_stdin {
        ran_anything = true;
        let mut source = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut source) {
            eprintln!("cannot read stdin: {}", e);
            process::exit(1);
        }
        if let Err(e) = state.run(&source) {
            repl::print_error(&e);
            failed = true;
        }
    }

    if let Some(path) = &file {
        ran_anything = true;
        if let Err(e) = state.run_file(path) {
            repl::print_error(&e);
            failed = true;
        }
    }

    if interactive || !ran_anything {
        repl::Repl::with_state(state).run();
    } else if failed {
        process::exit(1);
    }
}
