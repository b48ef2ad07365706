//! Shared end-to-end test harness: write source to a temp file, load the
//! module graph, compile and run every module against one `Vm`, and let
//! tests read back a top-level global by name afterward.

use talon::{compiler, module_loader, Diagnostic, Value, Vm};

pub struct Run {
    pub vm: Vm,
    pub module_index_of: std::collections::HashMap<String, u32>,
}

impl Run {
    /// The value of `name` declared at the top level of the module named
    /// `module` (the entry file's stem, or an imported file's stem).
    pub fn global(&self, module: &str, name: &str) -> Value {
        let index = self.module_index_of[module];
        self.vm
            .with_shared(|shared| shared.globals.get(&format!("{index}_{name}")).copied())
            .unwrap_or_else(|| panic!("no global '{name}' in module '{module}'"))
    }
}

/// Write `source` as the entry module and run it to completion. Panics with
/// the formatted diagnostics on any load, compile, or runtime error.
pub fn run_source(source: &str) -> Run {
    run_files(&[("main.tln", source)], "main.tln")
}

/// Write several named modules (importer last-mentioned isn't required to
/// be last, `entry` picks which file starts the graph) and run them.
pub fn run_files(files: &[(&str, &str)], entry: &str) -> Run {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, contents) in files {
        std::fs::write(dir.path().join(name), contents).expect("write fixture");
    }
    let entry_path = dir.path().join(entry);

    let linked = module_loader::load_program(&entry_path).unwrap_or_else(|e| {
        panic!("module load failed: {:#?}", e.0);
    });

    let mut module_index_of = std::collections::HashMap::new();
    let mut vm = Vm::new();
    for m in &linked {
        module_index_of.insert(m.module.name.clone(), m.module_index);
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
            .unwrap_or_else(|errors| panic!("compile failed for '{}': {:#?}", m.module.name, errors));
        let closure = vm.wrap_script_closure(function);
        vm.run(closure).unwrap_or_else(|diag| panic!("runtime error: {}", diag.to_human_string()));
    }

    Run { vm, module_index_of }
}

/// Like [`run_source`] but returns the load/compile error instead of
/// panicking, for tests asserting a program is rejected.
pub fn try_compile(source: &str) -> Result<Run, Vec<Diagnostic>> {
    let dir = tempfile::tempdir().expect("tempdir");
    let entry_path = dir.path().join("main.tln");
    std::fs::write(&entry_path, source).expect("write fixture");
    run_files_checked(&entry_path)
}

fn run_files_checked(entry_path: &std::path::Path) -> Result<Run, Vec<Diagnostic>> {
    let linked = module_loader::load_program(entry_path).map_err(|e| e.0)?;
    let mut module_index_of = std::collections::HashMap::new();
    let mut vm = Vm::new();
    for m in &linked {
        module_index_of.insert(m.module.name.clone(), m.module_index);
        let function = vm.with_shared(|shared| {
            compiler::compile_module(
                &m.module,
                m.module_index,
                m.imports.clone(),
                m.ambient.clone(),
                &mut shared.heap,
                &mut shared.interner,
            )
        })?;
        let closure = vm.wrap_script_closure(function);
        vm.run(closure).map_err(|diag| vec![diag])?;
    }
    Ok(Run { vm, module_index_of })
}
