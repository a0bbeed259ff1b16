//! Interactive CubeScript shell with line editing and history.

use std::path::PathBuf;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use cubescript::{disassemble, CubeError, State, Value};

const HISTORY_FILE: &str = ".cubescript_history";

pub struct Repl {
    state: State,
    history_file: PathBuf,
}

impl Repl {
    pub fn with_state(state: State) -> Self {
        let history_file = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(HISTORY_FILE);
        Self {
            state,
            history_file,
        }
    }

    pub fn run(&mut self) {
        println!("CubeScript {}", env!("CARGO_PKG_VERSION"));
        println!("Type \".help\" for available commands.\n");

        let mut rl = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                eprintln!("cannot initialize line editor: {}", e);
                return;
            }
        };
        let _ = rl.load_history(&self.history_file);

        loop {
            match rl.readline("> ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line);
                    if line == ".quit" || line == ".exit" {
                        break;
                    }
                    if self.is_magic_command(line) {
                        self.handle_magic_command(line);
                    } else {
                        self.execute(line);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("read error: {}", e);
                    break;
                }
            }
        }
        let _ = rl.save_history(&self.history_file);
    }

    fn is_magic_command(&self, line: &str) -> bool {
        line.starts_with('.')
    }

    fn handle_magic_command(&mut self, line: &str) {
        let (cmd, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        match cmd {
            ".help" => {
                println!(".help        show this message");
                println!(".dis CODE    disassemble CODE without running it");
                println!(".idents      list registered identifiers");
                println!(".quit        leave the shell");
            }
            ".dis" => match self.state.compile(rest, None) {
                Ok(code) => print!("{}", disassemble(&code)),
                Err(e) => eprintln!("{}", e),
            },
            ".idents" => {
                for id in self.state.idents() {
                    println!("{}", id.name);
                }
            }
            _ => eprintln!("unknown command {:?}, try .help", cmd),
        }
    }

    fn execute(&mut self, line: &str) {
        match self.state.run(line) {
            Ok(Value::Null) => {}
            Ok(v) => println!("{}", v.get_str()),
            Err(e) => print_error(&e),
        }
    }
}

pub fn print_error(err: &CubeError) {
    eprintln!("{}", err);
    if let CubeError::Run(run) = err {
        for frame in run.trace() {
            eprintln!("  in {}", frame.name);
        }
    }
}
