use std::{env, fs, process};

use lumen::{CliReporter, InterpretError, Vm};
use rustyline::error::ReadlineError;
use rustyline::Editor;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.as_slice() {
        [] => run_repl(),
        [path] => run_file(path),
        _ => {
            eprintln!("Usage: lumen [path]");
            process::exit(exitcode::USAGE);
        }
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Could not read '{}': {}", path, err);
        process::exit(exitcode::NOINPUT);
    });

    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(exitcode::DATAERR),
        Err(InterpretError::Runtime) => process::exit(exitcode::SOFTWARE),
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut editor: Editor<()> = Editor::new().unwrap_or_else(|err| {
        eprintln!("Could not start the line editor: {}", err);
        process::exit(exitcode::OSERR);
    });

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                if line.trim() == "exit" {
                    break;
                }
                editor.add_history_entry(line.as_str());
                let mut reporter = CliReporter::new();
                let _ = vm.interpret(&line, &mut reporter);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error reading line: {}", err);
                break;
            }
        }
    }
}
