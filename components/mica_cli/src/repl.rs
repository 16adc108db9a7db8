//! Interactive REPL.

use crate::error::{CliError, CliResult};
use crate::runtime::Runtime;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Runs the interactive loop until EOF or an exit command.
pub fn run_repl(runtime: &mut Runtime) -> CliResult<()> {
    let mut editor = DefaultEditor::new()
        .map_err(|e| CliError::ReplError(format!("failed to initialize editor: {}", e)))?;

    println!("MicaScript runtime");
    println!("Type script statements, or '.help' for commands.");
    println!();

    let mut buffer = String::new();
    let mut continuation = false;

    loop {
        let prompt = if continuation { "... " } else { "> " };
        match editor.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if !continuation && (trimmed == "exit" || trimmed == "quit" || trimmed == ".exit")
                {
                    break;
                }
                if !continuation && trimmed.starts_with('.') {
                    handle_command(trimmed, runtime);
                    continue;
                }

                if continuation {
                    buffer.push('\n');
                }
                buffer.push_str(&line);

                if input_complete(&buffer) {
                    continuation = false;
                    let _ = editor.add_history_entry(&buffer);
                    if let Err(e) = runtime.execute_source(&buffer) {
                        eprintln!("{}", e);
                    }
                    buffer.clear();
                } else {
                    continuation = true;
                }
            }
            Err(ReadlineError::Interrupted) => {
                if continuation {
                    println!("^C");
                    buffer.clear();
                    continuation = false;
                } else {
                    println!("(Ctrl-D or 'exit' to quit)");
                }
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(CliError::ReplError(format!("readline error: {}", e))),
        }
    }
    Ok(())
}

fn handle_command(command: &str, runtime: &Runtime) {
    match command {
        ".help" => {
            println!(".help     show this help");
            println!(".clear    clear the screen");
            println!(".mem      show heap accounting");
            println!(".exit     leave the repl");
        }
        ".clear" => {
            print!("\x1b[2J\x1b[1;1H");
        }
        ".mem" => {
            let info = runtime.heap().borrow().memory_info();
            println!(
                "allocations: {}  allocated: {} bytes  free: {} bytes",
                info.num_allocations, info.allocated_size, info.free_size
            );
            for category in &info.allocations_by_type {
                println!(
                    "  {:<10} count {:<6} size {}",
                    category.type_name, category.count, category.size
                );
            }
        }
        other => {
            println!("unknown command: {}", other);
        }
    }
}

/// Brace/paren/bracket balance heuristic for multiline input.
fn input_complete(source: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for c in source.chars() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => in_string = Some(c),
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth -= 1,
            _ => {}
        }
    }
    depth <= 0 && in_string.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_complete() {
        assert!(input_complete("var a = 1;"));
        assert!(!input_complete("function f() {"));
        assert!(input_complete("function f() { return 1; }"));
        assert!(!input_complete("var s = \"unterminated {"));
        assert!(input_complete("var s = \"closed { brace\";"));
    }
}
