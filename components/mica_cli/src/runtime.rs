//! Composition of the runtime pipeline.
//!
//! A [`Runtime`] owns the shared stores and, per execution, wires source
//! text through the parser into an execution unit with the built-ins
//! installed, then drives it on a scheduler until every task is done.

use crate::error::{CliError, CliResult};
use bytecode_system::disassemble;
use core_types::AtomTable;
use interpreter::host::ConsoleHandle;
use interpreter::{ExecutionUnit, HostnameResolver};
use memory_manager::Heap;
use scheduler::Scheduler;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

/// The embedding runtime behind the CLI and the REPL.
pub struct Runtime {
    heap: Rc<RefCell<Heap>>,
    atoms: Rc<RefCell<AtomTable>>,
    console: Option<ConsoleHandle>,
    resolver: Option<Rc<dyn HostnameResolver>>,
    print_bytecode: bool,
    /// Globals carried across executions so REPL lines see each other's
    /// definitions.
    saved_globals: Vec<(core_types::Atom, core_types::Value)>,
    /// Pins protecting the carried globals between executions.
    saved_pins: Vec<core_types::Value>,
}

impl Runtime {
    /// A runtime with fresh stores.
    pub fn new() -> Self {
        Runtime {
            heap: Rc::new(RefCell::new(Heap::new())),
            atoms: Rc::new(RefCell::new(AtomTable::new())),
            console: None,
            resolver: None,
            print_bytecode: false,
            saved_globals: Vec::new(),
            saved_pins: Vec::new(),
        }
    }

    /// Enables the bytecode listing after each parse.
    pub fn with_print_bytecode(mut self, on: bool) -> Self {
        self.print_bytecode = on;
        self
    }

    /// Routes script output to a custom sink (tests capture with this).
    pub fn with_console(mut self, console: ConsoleHandle) -> Self {
        self.console = Some(console);
        self
    }

    /// Overrides the hostname resolver seam.
    pub fn with_resolver(mut self, resolver: Rc<dyn HostnameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The shared heap (diagnostics).
    pub fn heap(&self) -> Rc<RefCell<Heap>> {
        Rc::clone(&self.heap)
    }

    /// Parses and executes a script file.
    pub fn execute_file(&mut self, path: &str) -> CliResult<()> {
        let source = std::fs::read_to_string(path)?;
        self.execute_source(&source)
    }

    /// Parses and executes source text.
    pub fn execute_source(&mut self, source: &str) -> CliResult<()> {
        let mut program = {
            let mut heap = self.heap.borrow_mut();
            let mut atoms = self.atoms.borrow_mut();
            parser::parse_program(source, &mut heap, &mut atoms)?
        };
        for (name, value) in &self.saved_globals {
            program.set_global(*name, *value);
        }

        if self.print_bytecode {
            self.print_listing(program.main);
        }

        let mut eu =
            ExecutionUnit::new(program, Rc::clone(&self.heap), Rc::clone(&self.atoms));
        builtins::install(&mut eu);
        if let Some(console) = &self.console {
            eu.set_console(Rc::clone(console));
        }
        if let Some(resolver) = &self.resolver {
            eu.set_resolver(Rc::clone(resolver));
        }

        let mut scheduler = Scheduler::new();
        scheduler.set_installer(builtins::install);
        let id = scheduler.add_task(eu);
        scheduler.run();

        if let Some(task) = scheduler.task(id) {
            self.saved_globals = task.eu.program().globals().to_vec();
            // The carried values must survive collections triggered by
            // later executions; re-pin the fresh set.
            let mut heap = self.heap.borrow_mut();
            for v in self.saved_pins.drain(..) {
                heap.remove_static_value(v);
            }
            for (_, v) in &self.saved_globals {
                heap.add_static_value(*v);
                self.saved_pins.push(*v);
            }
        }
        Ok(())
    }

    /// Compiles a file to its persisted image, `<input>.m8b`.
    pub fn compile_file(&mut self, path: &str) -> CliResult<String> {
        let source = std::fs::read_to_string(path)?;
        let program = {
            let mut heap = self.heap.borrow_mut();
            let mut atoms = self.atoms.borrow_mut();
            parser::parse_program(&source, &mut heap, &mut atoms)?
        };
        let bytes = {
            let heap = self.heap.borrow();
            let atoms = self.atoms.borrow();
            memory_manager::write_image(&program, &heap, &atoms)?
        };
        let out = match Path::new(path).extension() {
            Some(_) => format!("{}.m8b", path.trim_end_matches(|c| c != '.').trim_end_matches('.')),
            None => format!("{}.m8b", path),
        };
        std::fs::write(&out, bytes)?;
        Ok(out)
    }

    /// Prints a listing of every function reachable from the root.
    fn print_listing(&self, main: core_types::ObjectId) {
        let heap = self.heap.borrow();
        let atoms = self.atoms.borrow();
        let mut pending = vec![main];
        let mut seen = vec![];
        while let Some(id) = pending.pop() {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(func) = heap.object(id).and_then(|o| o.as_function()) {
                println!("{}", disassemble(func, &atoms));
                for v in &func.constants {
                    if let Some(child) = v.as_object() {
                        if heap.object(child).map(|o| o.has_code()).unwrap_or(false) {
                            pending.push(child);
                        }
                    }
                }
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes source capturing its console output; the backbone of the
/// integration tests.
pub fn run_capturing(source: &str) -> CliResult<String> {
    run_capturing_with(source, None)
}

/// Like [`run_capturing`] with an injected resolver.
pub fn run_capturing_with(
    source: &str,
    resolver: Option<Rc<dyn HostnameResolver>>,
) -> CliResult<String> {
    let console = Rc::new(RefCell::new(interpreter::CaptureWriter::new()));
    let mut runtime = Runtime::new().with_console(console.clone());
    if let Some(r) = resolver {
        runtime = runtime.with_resolver(r);
    }
    runtime.execute_source(source)?;
    let out = console.borrow().contents().to_string();
    Ok(out)
}
