//! Module discovery, parsing, and load-order resolution.
//!
//! Runs ahead of the compiler proper: starting from the entry file, reads
//! and parses every module reachable through `import` declarations,
//! resolves each import path relative to the importing file's directory,
//! detects cycles, and returns the modules topologically sorted so that
//! dependencies precede dependents — exactly the compiler's public input
//! contract (spec.md §4.2). Also computes, per module, the linkage data
//! `compiler::compile_module` needs: an alias -> module-index map for
//! `alias::name` access, and a bare-name -> exporting-module-indices map
//! for the ambient-import resolution rule (two unaliased dependencies
//! exporting the same name is an ambiguity, flagged here as a diagnostic
//! rather than left for the compiler to discover per-reference).
//!
//! The parser encodes `import "path" [as alias];` as a placeholder
//! statement (a `ModuleAccess` expression used purely as a data carrier,
//! see `parser::import_decl`) rather than a dedicated AST node, so this
//! module is also responsible for recognizing and stripping that marker
//! out of a module's declaration list before it ever reaches the compiler.

use crate::ast::{Decl, DeclKind, Expr, ExprKind, ImportDecl, Module, Stmt, StmtKind};
use crate::diagnostic::{error_codes, Diagnostic};
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::span::Span;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Failure to assemble a program: either a filesystem/cycle problem
/// discovered while loading, or a batch of lex/parse diagnostics from one
/// of the files involved.
#[derive(Debug)]
pub struct ModuleLoadError(pub Vec<Diagnostic>);

impl From<Vec<Diagnostic>> for ModuleLoadError {
    fn from(diagnostics: Vec<Diagnostic>) -> Self {
        ModuleLoadError(diagnostics)
    }
}

impl From<Diagnostic> for ModuleLoadError {
    fn from(diagnostic: Diagnostic) -> Self {
        ModuleLoadError(vec![diagnostic])
    }
}

/// One module plus the compiler linkage resolved for it.
pub struct LinkedModule {
    pub module: Module,
    pub module_index: u32,
    /// Alias -> target module index, for `alias::name` access.
    pub imports: HashMap<String, u32>,
    /// Bare name -> module indices whose unaliased export list contains
    /// it. More than one entry is an ambiguity the compiler reports at
    /// the point of reference.
    pub ambient: HashMap<String, Vec<u32>>,
}

/// Load `entry_path` and every module it transitively imports, returning
/// them in dependency order (each module's imports already loaded by the
/// time it appears) with linkage resolved.
pub fn load_program(entry_path: &Path) -> Result<Vec<LinkedModule>, ModuleLoadError> {
    let entry = canonicalize(entry_path)?;

    let mut loader = Loader {
        modules: HashMap::new(),
        order: Vec::new(),
        loading: HashSet::new(),
    };
    loader.load_recursive(&entry)?;

    let index_of: HashMap<PathBuf, u32> =
        loader.order.iter().enumerate().map(|(i, p)| (p.clone(), i as u32)).collect();
    let exports_by_index: Vec<Vec<String>> =
        loader.order.iter().map(|p| loader.modules[p].exports.clone()).collect();

    let mut linked = Vec::with_capacity(loader.order.len());
    for path in &loader.order {
        let module = loader.modules.remove(path).expect("every ordered path was loaded");
        let module_index = index_of[path];

        let mut imports = HashMap::new();
        let mut ambient: HashMap<String, Vec<u32>> = HashMap::new();
        for import in &module.imports {
            let target_index = index_of[&PathBuf::from(&import.path)];
            match &import.alias {
                Some(alias) => {
                    if imports.insert(alias.clone(), target_index).is_some() {
                        return Err(Diagnostic::error_with_code(
                            error_codes::DUPLICATE_MODULE_ALIAS,
                            format!("duplicate import alias '{alias}' in '{}'", module.path),
                            import.span,
                        )
                        .into());
                    }
                }
                None => {
                    for name in &exports_by_index[target_index as usize] {
                        ambient.entry(name.clone()).or_default().push(target_index);
                    }
                }
            }
        }

        linked.push(LinkedModule {
            module,
            module_index,
            imports,
            ambient,
        });
    }

    Ok(linked)
}

struct Loader {
    modules: HashMap<PathBuf, Module>,
    /// Dependency-first load order.
    order: Vec<PathBuf>,
    /// Paths currently being parsed, for cycle detection.
    loading: HashSet<PathBuf>,
}

impl Loader {
    fn load_recursive(&mut self, path: &Path) -> Result<(), ModuleLoadError> {
        if self.modules.contains_key(path) {
            return Ok(());
        }
        if self.loading.contains(path) {
            return Err(Diagnostic::error_with_code(
                error_codes::MODULE_CYCLE,
                format!("module import cycle detected at '{}'", path.display()),
                Span::dummy(),
            )
            .into());
        }
        self.loading.insert(path.to_path_buf());

        let source = std::fs::read_to_string(path).map_err(|e| {
            ModuleLoadError::from(Diagnostic::error_with_code(
                error_codes::FILE_NOT_FOUND,
                format!("cannot read module '{}': {e}", path.display()),
                Span::dummy(),
            ))
        })?;
        let module = parse_module(path, &source)?;

        for import in &module.imports {
            self.load_recursive(&PathBuf::from(&import.path))?;
        }

        self.loading.remove(path);
        self.order.push(path.to_path_buf());
        self.modules.insert(path.to_path_buf(), module);
        Ok(())
    }
}

fn parse_module(path: &Path, source: &str) -> Result<Module, ModuleLoadError> {
    let mut lexer = Lexer::new(source);
    let tokens = lexer.tokenize()?;
    let mut parser = Parser::new(tokens);
    let decls = parser.parse()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut imports = Vec::new();
    let mut exports: Vec<String> = Vec::new();
    let mut items = Vec::with_capacity(decls.len());

    for decl in decls {
        if let Some((alias, raw_path, span)) = import_marker(&decl) {
            let target = resolve_import_path(dir, &raw_path, span)?;
            imports.push(ImportDecl {
                path: target.to_string_lossy().into_owned(),
                alias: if alias.is_empty() { None } else { Some(alias) },
                span,
            });
            continue;
        }
        if let DeclKind::Export(inner) = &decl.kind {
            if let Some(name) = crate::compiler::top_level_name(inner) {
                if exports.iter().any(|e| e == name) {
                    return Err(Diagnostic::error_with_code(
                        error_codes::DUPLICATE_EXPORT,
                        format!("'{name}' exported twice in '{}'", path.display()),
                        decl.span,
                    )
                    .into());
                }
                exports.push(name.to_string());
            }
        }
        items.push(decl);
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());

    Ok(Module {
        name,
        path: path.to_string_lossy().into_owned(),
        imports,
        exports,
        items,
    })
}

/// Recognize the parser's `import` placeholder: a top-level statement
/// whose expression is a `ModuleAccess{alias, name}` where `name` actually
/// carries the import path, not a real cross-module field access.
fn import_marker(decl: &Decl) -> Option<(String, String, Span)> {
    match &decl.kind {
        DeclKind::Stmt(Stmt {
            kind:
                StmtKind::Expr(Expr {
                    kind: ExprKind::ModuleAccess { alias, name },
                    span,
                }),
            ..
        }) => Some((alias.clone(), name.clone(), *span)),
        _ => None,
    }
}

fn resolve_import_path(dir: &Path, raw: &str, span: Span) -> Result<PathBuf, ModuleLoadError> {
    canonicalize(&dir.join(raw)).map_err(|e| {
        let message = e.0.into_iter().next().map(|d| d.message).unwrap_or_default();
        Diagnostic::error_with_code(error_codes::FILE_NOT_FOUND, format!("import '{raw}': {message}"), span).into()
    })
}

fn canonicalize(path: &Path) -> Result<PathBuf, ModuleLoadError> {
    std::fs::canonicalize(path).map_err(|e| {
        ModuleLoadError::from(Diagnostic::error_with_code(
            error_codes::FILE_NOT_FOUND,
            format!("module file not found: '{}': {e}", path.display()),
            Span::dummy(),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_single_module_no_imports() {
        let dir = std::env::temp_dir().join(format!("talon_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let entry = write_temp(&dir, "main.tln", "var x = 1;\n");
        let linked = load_program(&entry).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].module_index, 0);
        assert!(linked[0].imports.is_empty());
        assert!(linked[0].ambient.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_dependency_order_and_aliased_import() {
        let dir = std::env::temp_dir().join(format!("talon_test_dep_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_temp(&dir, "lib.tln", "export var x = 1;\n");
        let entry = write_temp(&dir, "main.tln", "import \"lib.tln\" as lib;\nprint lib::x;\n");
        let linked = load_program(&entry).unwrap();
        assert_eq!(linked.len(), 2);
        assert_eq!(linked[0].module.name, "lib");
        assert_eq!(linked[1].module.name, "main");
        assert_eq!(linked[1].imports.get("lib"), Some(&0));
        assert!(linked[1].ambient.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ambient_ambiguity_detected() {
        let dir = std::env::temp_dir().join(format!("talon_test_ambig_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_temp(&dir, "a.tln", "export var x = 1;\n");
        write_temp(&dir, "b.tln", "export var x = 2;\n");
        let entry = write_temp(&dir, "main.tln", "import \"a.tln\";\nimport \"b.tln\";\nprint x;\n");
        let linked = load_program(&entry).unwrap();
        let main = linked.last().unwrap();
        assert_eq!(main.ambient.get("x").map(Vec::len), Some(2));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cycle_detected() {
        let dir = std::env::temp_dir().join(format!("talon_test_cycle_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_temp(&dir, "a.tln", "import \"b.tln\";\n");
        write_temp(&dir, "b.tln", "import \"a.tln\";\n");
        let entry = dir.join("a.tln");
        let err = load_program(&entry).unwrap_err();
        assert_eq!(err.0[0].code, error_codes::MODULE_CYCLE);
        std::fs::remove_dir_all(&dir).ok();
    }
}
