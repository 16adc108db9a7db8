//! MicaScript runtime CLI entry point.

use clap::Parser;
use mica_cli::{repl, Cli, CliError, Runtime};

fn main() {
    let cli = Cli::parse();
    let mut runtime = Runtime::new().with_print_bytecode(cli.print_bytecode);

    let result = if let Some(file) = &cli.file {
        if cli.compile {
            runtime.compile_file(file).map(|out| {
                println!("wrote {}", out);
            })
        } else {
            runtime.execute_file(file)
        }
    } else if let Some(source) = &cli.eval {
        runtime.execute_source(source)
    } else if cli.repl {
        repl::run_repl(&mut runtime)
    } else {
        println!("MicaScript embedded scripting runtime");
        println!();
        println!("  mica --file <FILE>    execute a script file");
        println!("  mica --eval <SOURCE>  evaluate inline source");
        println!("  mica --repl           start the interactive repl");
        println!();
        println!("Run 'mica --help' for all options.");
        Ok(())
    };

    if let Err(e) = result {
        match &e {
            CliError::ParseError(p) => eprintln!("{}", p),
            other => eprintln!("{}", other),
        }
        std::process::exit(1);
    }
}
