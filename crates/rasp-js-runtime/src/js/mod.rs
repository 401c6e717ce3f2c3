//! JavaScript Layer
//!
//! QuickJS isolates, the native bindings they expose and the plugin prelude.

mod globals;
mod runtime;

pub(crate) use runtime::{Isolate, IsolateFactory, ScriptFailure};
