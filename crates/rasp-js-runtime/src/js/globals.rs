//! Native Bindings
//!
//! Host functions installed as `__rasp_native` before the prelude runs. The
//! prelude wraps them into the plugin API and removes the raw object.

use std::sync::Arc;

use parking_lot::Mutex;
use rquickjs::{ArrayBuffer, Ctx, Function, Object, Result as JsResult};

use crate::context::ContextView;
use crate::sink::Sinks;

/// State shared between an isolate and its native functions.
///
/// The context slot is filled for the duration of one dispatch and empty
/// otherwise; reads outside a dispatch see a context with no fields.
pub(crate) struct Bridge {
    view: Mutex<Option<ContextView>>,
    sinks: Arc<Sinks>,
}

impl Bridge {
    pub(crate) fn new(sinks: Arc<Sinks>) -> Self {
        Self {
            view: Mutex::new(None),
            sinks,
        }
    }

    pub(crate) fn attach(&self, view: ContextView) {
        *self.view.lock() = Some(view);
    }

    pub(crate) fn detach(&self) -> Option<ContextView> {
        self.view.lock().take()
    }

    pub(crate) fn log(&self, message: &str) {
        self.sinks.log(message);
    }

    fn with_view<R>(&self, read: impl FnOnce(&mut ContextView) -> Option<R>) -> Option<R> {
        self.view.lock().as_mut().and_then(read)
    }

    fn stack(&self) -> Option<Vec<String>> {
        self.with_view(|view| view.stack(&self.sinks))
    }
}

/// Install `__rasp_native` on the global object.
///
/// `settings` is the JSON the prelude configures itself from.
pub(crate) fn register_native_bindings<'js>(
    ctx: &Ctx<'js>,
    bridge: &Arc<Bridge>,
    settings: &str,
) -> JsResult<()> {
    let native = Object::new(ctx.clone())?;

    let log = bridge.clone();
    native.set(
        "log",
        Function::new(ctx.clone(), move |message: String| {
            log.log(&message);
        })?,
    )?;

    let strings = bridge.clone();
    native.set(
        "contextString",
        Function::new(ctx.clone(), move |key: String| -> Option<String> {
            strings.with_view(|view| view.string(&key))
        })?,
    )?;

    let objects = bridge.clone();
    native.set(
        "contextObject",
        Function::new(ctx.clone(), move |key: String| -> Option<String> {
            objects.with_view(|view| view.object(&key))
        })?,
    )?;

    let buffers = bridge.clone();
    native.set(
        "contextBuffer",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, key: String| -> JsResult<Option<ArrayBuffer<'js>>> {
                match buffers.with_view(|view| view.buffer(&key)) {
                    Some(bytes) => Ok(Some(ArrayBuffer::new(ctx, bytes)?)),
                    None => Ok(None),
                }
            },
        )?,
    )?;

    let stack = bridge.clone();
    native.set(
        "stack",
        Function::new(ctx.clone(), move || -> Option<Vec<String>> { stack.stack() })?,
    )?;

    native.set("settings", settings)?;

    ctx.globals().set("__rasp_native", native)?;

    Ok(())
}
