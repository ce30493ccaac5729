//! # scribe-template
//!
//! Tera-based template evaluation against the scribe brain, plus the atomic
//! destination writer.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use scribe_core::Brain;
//! use scribe_template::{ExecuteInput, NewTemplateInput, Template};
//!
//! fn evaluate() {
//!     let tmpl = Template::new(NewTemplateInput {
//!         contents: Some("port = {{ kv(key='app/port') }}".into()),
//!         ..Default::default()
//!     })
//!     .expect("parse");
//!
//!     let brain = Arc::new(Brain::new());
//!     let result = tmpl
//!         .execute(&ExecuteInput { brain: &brain, env: &HashMap::new() })
//!         .expect("execute");
//!     println!("{} missing deps", result.missing.len());
//! }
//! ```

pub mod error;
pub mod sink;
pub mod template;

pub use error::{SinkError, TemplateError};
pub use sink::{render, RenderInput, RenderResult};
pub use template::{ExecuteInput, ExecuteResult, NewTemplateInput, Template, TemplateId};
