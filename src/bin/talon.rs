//! Talon entry-point driver.
//!
//! Compiles and runs a single Talon program: loads the entry file and
//! every module it imports (`module_loader`), compiles each in dependency
//! order into the VM's heap, runs each module's top-level code in that
//! same order, and maps the outcome to the process exit code spec.md §6
//! prescribes (0 on success, 64 on a runtime error). Grounded on the
//! shape of `atlas-cli`'s `run` command, trimmed to "compile, load, run"
//! since package management/build caching/templates are out of scope
//! here (SPEC_FULL.md §9).

use clap::Parser as ClapParser;
use std::path::PathBuf;
use std::process::ExitCode;
use talon::diagnostic::formatter::DiagnosticFormatter;
use talon::{bytecode, compiler, module_loader, Diagnostic, Vm};

/// Compile and run a Talon source file.
#[derive(ClapParser, Debug)]
#[command(name = "talon", version, about)]
struct Cli {
    /// Path to the program's entry module.
    entry: PathBuf,

    /// Print each module's disassembled bytecode before running it.
    #[arg(long = "dump-bytecode")]
    dump_bytecode: bool,
}

const EXIT_SUCCESS: u8 = 0;
const EXIT_RUNTIME_ERROR: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(RunError::Load(errors)) => {
            report_all(&errors);
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        Err(RunError::Compile(errors)) => {
            report_all(&errors);
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        Err(RunError::Runtime(diag)) => {
            report_all(std::slice::from_ref(&diag));
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

enum RunError {
    Load(Vec<Diagnostic>),
    Compile(Vec<Diagnostic>),
    Runtime(Diagnostic),
}

fn run(cli: &Cli) -> Result<(), RunError> {
    let linked = module_loader::load_program(&cli.entry).map_err(|e| RunError::Load(e.0))?;

    let mut vm = Vm::new();

    // Compile and run each module's top-level code in dependency order,
    // one at a time: a module's `ObjRef`s are only ever held across the
    // allocations its own compile performs, never across another
    // module's run (which may trigger a moving collection, see
    // [`crate::heap::object::ObjRef`]'s own doc comment on that hazard).
    for m in &linked {
        let function = vm
            .with_shared(|shared| {
                compiler::compile_module(
                    &m.module,
                    m.module_index,
                    m.imports.clone(),
                    m.ambient.clone(),
                    &mut shared.heap,
                    &mut shared.interner,
                )
            })
            .map_err(RunError::Compile)?;

        if cli.dump_bytecode {
            let chunk = &function.as_function().unwrap().chunk;
            eprintln!("{}", bytecode::disassemble(chunk, &m.module.name));
        }

        let closure = vm.wrap_script_closure(function);
        vm.run(closure).map_err(RunError::Runtime)?;
    }

    Ok(())
}

fn report_all(diagnostics: &[Diagnostic]) {
    let formatter = DiagnosticFormatter::auto();
    for diag in diagnostics {
        eprintln!("{}", formatter.format_to_string(diag));
    }
}
