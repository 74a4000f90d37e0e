//! Script loading and execution.
//!
//! A script is a Python-like (Starlark) module defining `main(ctx)`. Loading
//! resolves `load()` dependencies through a [`FileReader`] capability with a
//! two-state cache that doubles as cycle detection; sources are lightly
//! rewritten first so scripts that also run under a real Python interpreter
//! load cleanly here.

use std::collections::HashMap;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::rc::Rc;

use starlark::environment::{FrozenModule, Globals, GlobalsBuilder, LibraryExtension, Module};
use starlark::eval::{Evaluator, ReturnFileLoader};
use starlark::syntax::{AstModule, Dialect};
use starlark::values::structs::AllocStruct;
use starlark::values::dict::AllocDict;
use starlark::values::{OwnedFrozenValue, Value};

use crate::errors::Error;
use crate::requests::{requests_members, RequestContext};

/// Filesystem capability used by the loader.
pub trait FileReader {
    /// Resolve a load name (relative to `from`, when given) to a path.
    fn resolve(&self, name: &str, from: Option<&Path>) -> Result<PathBuf, Error>;

    /// Read a resolved path as UTF-8 source.
    fn read_file(&self, path: &Path) -> Result<String, Error>;
}

/// Default reader: load names are forward-slash paths under a root directory.
pub struct DirReader {
    root: PathBuf,
}

impl DirReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirReader { root: root.into() }
    }
}

impl FileReader for DirReader {
    fn resolve(&self, name: &str, _from: Option<&Path>) -> Result<PathBuf, Error> {
        if MAIN_SEPARATOR != '/' && name.contains(MAIN_SEPARATOR) {
            return Err(Error::Load {
                path: name.to_string(),
                message: format!("load names must use '/', not {MAIN_SEPARATOR:?}"),
            });
        }
        Ok(self.root.join(clean_name(name)))
    }

    fn read_file(&self, path: &Path) -> Result<String, Error> {
        std::fs::read_to_string(path).map_err(|source| Error::ReadScript {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Normalize a forward-slash load name: drop empty and `.` segments, resolve
/// `..` against earlier segments.
fn clean_name(name: &str) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.iter().collect()
}

/// Rewrites applied to every source before parsing, in order: a leading
/// shebang line, `import requests` lines (the module is predeclared), and a
/// trailing `if __name__ == ...` block.
pub fn preprocess(source: &str) -> String {
    let source = match source.strip_prefix("#!") {
        Some(rest) => match rest.split_once('\n') {
            Some((_, tail)) => tail,
            None => "",
        },
        None => source,
    };

    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        if line.trim() == "import requests" {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    if let Some(pos) = out.find("\nif __name__ ==") {
        out.truncate(pos + 1);
    }
    out
}

enum CacheEntry {
    /// Loading has begun but not finished; hitting this again is a cycle.
    InProgress,
    Ready(Rc<FrozenModule>),
    Failed(String),
}

struct Loader<'a> {
    reader: &'a dyn FileReader,
    globals: &'a Globals,
    cache: HashMap<PathBuf, CacheEntry>,
}

impl<'a> Loader<'a> {
    fn load(&mut self, name: &str, from: Option<&Path>) -> Result<Rc<FrozenModule>, Error> {
        let path = self.reader.resolve(name, from)?;
        match self.cache.get(&path) {
            Some(CacheEntry::Ready(module)) => return Ok(module.clone()),
            Some(CacheEntry::Failed(message)) => {
                return Err(Error::Load {
                    path: path.display().to_string(),
                    message: message.clone(),
                })
            }
            Some(CacheEntry::InProgress) => {
                return Err(Error::LoadCycle(path.display().to_string()))
            }
            None => {}
        }

        self.cache.insert(path.clone(), CacheEntry::InProgress);
        match self.load_uncached(&path) {
            Ok(module) => {
                self.cache
                    .insert(path, CacheEntry::Ready(module.clone()));
                Ok(module)
            }
            Err(err) => {
                self.cache
                    .insert(path, CacheEntry::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    fn load_uncached(&mut self, path: &Path) -> Result<Rc<FrozenModule>, Error> {
        let display = path.display().to_string();
        let source = preprocess(&self.reader.read_file(path)?);

        let ast = AstModule::parse(&display, source, &Dialect::Extended).map_err(|e| {
            Error::Load {
                path: display.clone(),
                message: e.to_string(),
            }
        })?;

        let load_names: Vec<String> = ast
            .loads()
            .iter()
            .map(|l| l.module_id.to_string())
            .collect();
        let mut deps: Vec<(String, Rc<FrozenModule>)> = Vec::with_capacity(load_names.len());
        for name in load_names {
            let dep = self.load(&name, Some(path))?;
            deps.push((name, dep));
        }

        let module = Module::new();
        {
            let modules: HashMap<&str, &FrozenModule> = deps
                .iter()
                .map(|(name, dep)| (name.as_str(), &**dep))
                .collect();
            let loader = ReturnFileLoader { modules: &modules };
            let mut eval = Evaluator::new(&module);
            eval.set_loader(&loader);
            eval.eval_module(ast, self.globals).map_err(|e| Error::Load {
                path: display.clone(),
                message: e.to_string(),
            })?;
        }

        let frozen = module.freeze().map_err(|e| Error::Load {
            path: display,
            message: e.to_string(),
        })?;
        Ok(Rc::new(frozen))
    }
}

/// Globals every loaded module sees: the standard library plus `json`,
/// `struct`, collection helpers, and the predeclared `requests` module.
fn default_globals() -> Globals {
    GlobalsBuilder::extended_by(&[
        LibraryExtension::StructType,
        LibraryExtension::Print,
        LibraryExtension::Json,
        LibraryExtension::Map,
        LibraryExtension::Filter,
        LibraryExtension::Partial,
    ])
    .with(|builder| builder.struct_("requests", requests_members))
    .build()
}

/// Per-worker script state. Owns the module heap behind `ctx`, so the
/// mutable `ctx.vars` dict carries scratch state from one unit to the next
/// for the lifetime of the worker; a fresh scope starts empty.
pub struct UnitScope {
    module: Module,
}

const CTX_BINDING: &str = "ctx";

impl UnitScope {
    fn new() -> UnitScope {
        let module = Module::new();
        let heap = module.heap();
        let vars = heap.alloc(AllocDict(Vec::<(Value, Value)>::new()));
        let ctx = heap.alloc(AllocStruct([("vars", vars)]));
        module.set(CTX_BINDING, ctx);
        UnitScope { module }
    }
}

/// A loaded script, ready to run units of work.
#[derive(Debug)]
pub struct ScriptEngine {
    main: OwnedFrozenValue,
}

impl ScriptEngine {
    /// Load the script at `path`; load names resolve against its directory.
    pub fn new(path: &Path) -> Result<ScriptEngine, Error> {
        let root = path.parent().unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| Error::Config(format!("not a script path: {}", path.display())))?
            .to_string_lossy()
            .into_owned();
        let reader = DirReader::new(root);
        Self::with_reader(&reader, &name)
    }

    /// Load through an explicit reader capability (used by tests).
    pub fn with_reader(reader: &dyn FileReader, name: &str) -> Result<ScriptEngine, Error> {
        let globals = default_globals();
        let mut loader = Loader {
            reader,
            globals: &globals,
            cache: HashMap::new(),
        };
        let top = loader.load(name, None)?;
        let main = top
            .get("main")
            .map_err(|_| Error::MissingMain(name.to_string()))?;
        let ty = main.value().get_type();
        if !matches!(ty, "function" | "builtin_function_or_method") {
            return Err(Error::Load {
                path: name.to_string(),
                message: format!("main is not callable (got {ty})"),
            });
        }
        Ok(ScriptEngine { main })
    }

    /// Open a fresh unit scope. Each worker holds one for its lifetime.
    pub fn new_scope(&self) -> UnitScope {
        UnitScope::new()
    }

    /// Run one unit of work: call `main(ctx)` with the per-invocation
    /// context installed in the evaluator. `ctx.vars` is the scope's
    /// mutable dict; state a unit writes there is visible to the next unit
    /// run in the same scope.
    pub fn run_unit(&self, scope: &UnitScope, rcx: &RequestContext) -> Result<(), Error> {
        let ctx = scope
            .module
            .get(CTX_BINDING)
            .ok_or_else(|| Error::Script("unit context binding is missing".to_string()))?;
        let mut eval = Evaluator::new(&scope.module);
        eval.extra = Some(rcx);
        eval.eval_function(self.main.value(), &[ctx], &[])
            .map_err(|e| Error::Script(e.to_string()))?;
        Ok(())
    }
}
