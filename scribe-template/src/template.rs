//! Template parsing and evaluation.
//!
//! A [`Template`] wraps a parsed Tera body whose data functions (`service`,
//! `kv`, `secret`, `envvar`) resolve against a [`Brain`] snapshot at render
//! time. Every data call is recorded as a used dependency; calls the brain
//! has no value for are additionally recorded as missing and render as the
//! dependency's zero value, so evaluation always completes and the caller
//! can decide whether the output is trustworthy.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use sha2::{Digest, Sha256};
use tera::{Context, Tera, Value};

use scribe_core::brain::Brain;
use scribe_core::dependency::{DepKey, Dependency};

use crate::error::TemplateError;

const TEMPLATE_NAME: &str = "template";

// ---------------------------------------------------------------------------
// TemplateId
// ---------------------------------------------------------------------------

/// Content-derived template identity. Templates with equal contents and
/// delimiters share one id, no matter how many configurations point at them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(String);

impl TemplateId {
    fn derive(contents: &str, left_delim: &str, right_delim: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left_delim.as_bytes());
        hasher.update([0]);
        hasher.update(right_delim.as_bytes());
        hasher.update([0]);
        hasher.update(contents.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full digests make logs unreadable; eight hex chars are plenty.
        f.write_str(&self.0[..8])
    }
}

// ---------------------------------------------------------------------------
// Per-render call state
// ---------------------------------------------------------------------------

/// Shared state the Tera data functions write into during one `execute`.
/// Renders are serialized by the exec guard in [`Template::execute`], so a
/// single slot per template is sufficient.
#[derive(Default)]
struct CallState {
    brain: RwLock<Option<Arc<Brain>>>,
    env: RwLock<HashMap<String, String>>,
    used: Mutex<BTreeMap<DepKey, Dependency>>,
    missing: Mutex<BTreeMap<DepKey, Dependency>>,
}

impl CallState {
    fn begin(&self, brain: Arc<Brain>, env: HashMap<String, String>) {
        *self.brain.write().expect("call state lock poisoned") = Some(brain);
        *self.env.write().expect("call state lock poisoned") = env;
        self.used.lock().expect("call state lock poisoned").clear();
        self.missing.lock().expect("call state lock poisoned").clear();
    }

    /// Record `dep` as used and return its current value, falling back to the
    /// zero value (and a missing record) when the brain has none.
    fn resolve(&self, dep: Dependency) -> Value {
        let key = dep.key();
        let value = self
            .brain
            .read()
            .expect("call state lock poisoned")
            .as_ref()
            .and_then(|brain| brain.recall(&key));

        self.used
            .lock()
            .expect("call state lock poisoned")
            .insert(key.clone(), dep.clone());

        match value {
            Some(value) => value,
            None => {
                let zero = dep.zero_value();
                self.missing
                    .lock()
                    .expect("call state lock poisoned")
                    .insert(key, dep);
                zero
            }
        }
    }

    fn env_var(&self, key: &str) -> String {
        self.env
            .read()
            .expect("call state lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn finish(&self) -> (Vec<Dependency>, Vec<Dependency>) {
        *self.brain.write().expect("call state lock poisoned") = None;
        let used = std::mem::take(&mut *self.used.lock().expect("call state lock poisoned"));
        let missing = std::mem::take(&mut *self.missing.lock().expect("call state lock poisoned"));
        (
            used.into_values().collect(),
            missing.into_values().collect(),
        )
    }
}

fn str_arg(args: &HashMap<String, Value>, name: &str, func: &str) -> tera::Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(tera::Error::msg(format!(
            "{func}: argument '{name}' must be a string, got {other}"
        ))),
        None => Err(tera::Error::msg(format!(
            "{func}: missing required argument '{name}'"
        ))),
    }
}

fn opt_str_arg(args: &HashMap<String, Value>, name: &str, func: &str) -> tera::Result<Option<String>> {
    match args.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(tera::Error::msg(format!(
            "{func}: argument '{name}' must be a string, got {other}"
        ))),
    }
}

fn register_functions(tera: &mut Tera, state: &Arc<CallState>) {
    let s = Arc::clone(state);
    tera.register_function("service", move |args: &HashMap<String, Value>| {
        let name = str_arg(args, "name", "service")?;
        let tag = opt_str_arg(args, "tag", "service")?;
        Ok(s.resolve(Dependency::Service { name, tag }))
    });

    let s = Arc::clone(state);
    tera.register_function("kv", move |args: &HashMap<String, Value>| {
        let key = str_arg(args, "key", "kv")?;
        Ok(s.resolve(Dependency::KvKey { key }))
    });

    let s = Arc::clone(state);
    tera.register_function("secret", move |args: &HashMap<String, Value>| {
        let path = str_arg(args, "path", "secret")?;
        Ok(s.resolve(Dependency::Secret { path }))
    });

    let s = Arc::clone(state);
    tera.register_function("envvar", move |args: &HashMap<String, Value>| {
        let key = str_arg(args, "key", "envvar")?;
        Ok(Value::String(s.env_var(&key)))
    });
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Input to [`Template::new`]. Exactly one of `source` / `contents` must be
/// set; optional delimiters are rewritten to Tera's `{{` / `}}` before
/// parsing and participate in the template id. A custom-delimiter body that
/// already contains `{{` or `}}` is rejected, so literal braces destined for
/// the output can never be reinterpreted by the rewrite.
#[derive(Debug, Default, Clone)]
pub struct NewTemplateInput {
    pub source: Option<PathBuf>,
    pub contents: Option<String>,
    pub left_delim: Option<String>,
    pub right_delim: Option<String>,
}

/// Result of one template evaluation.
#[derive(Debug)]
pub struct ExecuteResult {
    pub output: String,
    pub used: Vec<Dependency>,
    pub missing: Vec<Dependency>,
}

/// Input to [`Template::execute`].
pub struct ExecuteInput<'a> {
    pub brain: &'a Arc<Brain>,
    pub env: &'a HashMap<String, String>,
}

/// A parsed template bound to the scribe data functions.
pub struct Template {
    id: TemplateId,
    source: Option<PathBuf>,
    tera: Tera,
    state: Arc<CallState>,
    exec_guard: Mutex<()>,
}

impl Template {
    /// Parse a template from a file or inline contents. Parse errors surface
    /// here, not at render time.
    pub fn new(input: NewTemplateInput) -> Result<Self, TemplateError> {
        let contents = match (&input.source, input.contents) {
            (Some(path), None) => {
                std::fs::read_to_string(path).map_err(|e| TemplateError::Io {
                    path: path.clone(),
                    source: e,
                })?
            }
            (None, Some(contents)) => contents,
            (Some(_), Some(contents)) => contents,
            (None, None) => return Err(TemplateError::NoBody),
        };

        let left = input.left_delim.as_deref().unwrap_or("{{");
        let right = input.right_delim.as_deref().unwrap_or("}}");
        let id = TemplateId::derive(&contents, left, right);

        let body = if left == "{{" && right == "}}" {
            contents
        } else {
            // Tera's lexer only knows its own delimiters, so after the
            // rewrite any literal `{{` / `}}` in the body would be parsed
            // as Tera syntax. Refuse the body rather than corrupt it.
            for sequence in ["{{", "}}"] {
                if contents.contains(sequence) {
                    return Err(TemplateError::DelimiterCollision {
                        sequence: sequence.to_string(),
                    });
                }
            }
            contents.replace(left, "{{").replace(right, "}}")
        };

        let state = Arc::new(CallState::default());
        let mut tera = Tera::default();
        register_functions(&mut tera, &state);
        tera.add_raw_template(TEMPLATE_NAME, &body)?;

        Ok(Self {
            id,
            source: input.source,
            tera,
            state,
            exec_guard: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &TemplateId {
        &self.id
    }

    pub fn source(&self) -> Option<&PathBuf> {
        self.source.as_ref()
    }

    /// Evaluate against a brain snapshot. The render always completes; the
    /// caller must treat the output as untrusted while `missing` is
    /// non-empty.
    pub fn execute(&self, input: &ExecuteInput<'_>) -> Result<ExecuteResult, TemplateError> {
        let _guard = self.exec_guard.lock().expect("template exec lock poisoned");

        self.state
            .begin(Arc::clone(input.brain), input.env.clone());
        let rendered = self.tera.render(TEMPLATE_NAME, &Context::new());
        let (used, missing) = self.state.finish();

        let output = rendered?;
        tracing::debug!(
            template = %self.id,
            used = used.len(),
            missing = missing.len(),
            "template evaluated",
        );

        Ok(ExecuteResult {
            output,
            used,
            missing,
        })
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
