//! User-script record conversion.
//!
//! The script is compiled once. Each call leases an engine from a pool,
//! arms a hard deadline, binds the record as `arg`, and evaluates the
//! compiled AST. Returning unit drops the record. Because records cross
//! the boundary through serde, map keys keep their JSON names.

mod toolkit;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{AST, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use snafu::prelude::*;

use crate::error::{BindSnafu, CompileSnafu, ReadScriptSnafu, ScriptError};

/// Hard per-call execution limit.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

/// A pooled engine together with its interrupt deadline.
struct PooledEngine {
    engine: Engine,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl PooledEngine {
    fn new() -> Self {
        let deadline = Arc::new(Mutex::new(None::<Instant>));
        let mut engine = Engine::new();
        toolkit::register(&mut engine);

        let armed = Arc::clone(&deadline);
        engine.on_progress(move |_| {
            let expired = armed
                .lock()
                .ok()
                .and_then(|guard| *guard)
                .is_some_and(|deadline| Instant::now() >= deadline);
            if expired {
                Some("execution timeout".into())
            } else {
                None
            }
        });

        Self { engine, deadline }
    }
}

/// Compiled conversion script with a pool of evaluation engines.
pub struct Converter {
    ast: AST,
    engines: Mutex<Vec<PooledEngine>>,
    timeout: Duration,
}

impl Converter {
    /// Compile the script at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ScriptError> {
        let source = std::fs::read_to_string(path).context(ReadScriptSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_source(&source)
    }

    /// Compile a script from source text.
    pub fn from_source(source: &str) -> Result<Self, ScriptError> {
        Self::with_timeout(source, SCRIPT_TIMEOUT)
    }

    fn with_timeout(source: &str, timeout: Duration) -> Result<Self, ScriptError> {
        let probe = PooledEngine::new();
        let ast = probe.engine.compile(source).map_err(|err| {
            CompileSnafu {
                message: err.to_string(),
            }
            .build()
        })?;

        Ok(Self {
            ast,
            engines: Mutex::new(vec![probe]),
            timeout,
        })
    }

    /// Run the script against one record.
    ///
    /// Returns `None` when the script yields unit, which drops the record.
    pub fn convert(&self, record: Value) -> Result<Option<Value>, ScriptError> {
        let arg = rhai::serde::to_dynamic(record).map_err(|err| {
            BindSnafu {
                message: err.to_string(),
            }
            .build()
        })?;

        let pooled = self.lease();
        if let Ok(mut guard) = pooled.deadline.lock() {
            *guard = Some(Instant::now() + self.timeout);
        }

        let mut scope = Scope::new();
        scope.push_dynamic("arg", arg);
        let result = pooled
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast);

        if let Ok(mut guard) = pooled.deadline.lock() {
            *guard = None;
        }
        self.release(pooled);

        let value = match result {
            Ok(value) => value,
            Err(err) => return Err(convert_error(*err)),
        };
        if value.is_unit() {
            return Ok(None);
        }

        rhai::serde::from_dynamic::<Value>(&value)
            .map(Some)
            .map_err(|err| {
                BindSnafu {
                    message: err.to_string(),
                }
                .build()
            })
    }

    fn lease(&self) -> PooledEngine {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        engines.pop().unwrap_or_else(PooledEngine::new)
    }

    fn release(&self, engine: PooledEngine) {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        engines.push(engine);
    }
}

fn convert_error(err: EvalAltResult) -> ScriptError {
    match err {
        EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout,
        other => ScriptError::Execute {
            message: other.to_string(),
        },
    }
}
