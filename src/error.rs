//! Error types and foreign error propagation
//!
//! Every foreign operation that can set the interpreter's error indicator is
//! followed by [`check`]. A pending foreign exception is fetched (which clears
//! the indicator) and surfaced as [`Error::Python`] immediately; nothing is
//! deferred or retried.

use crate::ffi::Handle;
use crate::logging::{debug, log_ffi_error};
use crate::object::PyObject;
use crate::runtime::Context;
use std::fmt;
use std::rc::Rc;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the bridge
#[derive(Debug)]
pub enum Error {
    /// Exception raised inside the interpreter
    Python(PythonError),
    /// Host value has no foreign conversion
    UnsupportedType(&'static str),
    /// Call arguments could not be partitioned
    ArgumentCount { positional: isize },
    /// No interpreter library could be opened
    LibraryNotFound { tried: Vec<String> },
    /// Library loaded but the interpreter could not be brought up
    Initialization(String),
    /// Code execution failed without a richer foreign error
    Eval(String),
    /// Module execution failed without a richer foreign error
    ModuleLoad(String),
    /// Proxy assignment target does not exist and cannot be created
    InvalidAssignment { key: String },
    /// Name contains an interior NUL byte
    InvalidName(String),
    /// Typed accessor used on an object of another kind
    Conversion { expected: &'static str, found: String },
    /// Entry point failed without setting a foreign error
    NullResult(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python(err) => write!(f, "{}", err),
            Self::UnsupportedType(kind) => {
                write!(f, "Cannot convert host value of kind '{}' to a Python object", kind)
            }
            Self::ArgumentCount { positional } => {
                write!(f, "Invalid argument partitioning: {} positional arguments", positional)
            }
            Self::LibraryNotFound { tried } => {
                write!(f, "Could not load the Python library (tried: {})", tried.join(", "))
            }
            Self::Initialization(msg) => write!(f, "Failed to initialise Python: {}", msg),
            Self::Eval(msg) => write!(f, "Failed to run Python code: {}", msg),
            Self::ModuleLoad(msg) => write!(f, "Failed to load Python module: {}", msg),
            Self::InvalidAssignment { key } => {
                write!(f, "Cannot assign to '{}': no such attribute or item", key)
            }
            Self::InvalidName(name) => write!(f, "Invalid name (contains NUL byte): {:?}", name),
            Self::Conversion { expected, found } => {
                write!(f, "Expected a Python {}, found {}", expected, found)
            }
            Self::NullResult(function) => {
                write!(f, "{} failed without setting a Python exception", function)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<PythonError> for Error {
    fn from(err: PythonError) -> Self {
        Self::Python(err)
    }
}

/// A fetched foreign exception: type, value and optional traceback
pub struct PythonError {
    ty: PyObject,
    value: Option<PyObject>,
    traceback: Option<PyObject>,
    type_name: String,
    message: String,
}

impl PythonError {
    /// Fetch and clear the pending foreign error, if any
    pub(crate) fn fetch(ctx: &Rc<Context>) -> Option<Self> {
        let api = ctx.api();
        if api.err_occurred().is_null() {
            return None;
        }

        let (ty, value, tb) = api.err_fetch();
        if ty.is_null() {
            return None;
        }

        let ty = PyObject::steal(ctx, ty);
        let value = (!value.is_null()).then(|| PyObject::steal(ctx, value));
        let traceback = (!tb.is_null() && tb != ctx.none_handle()).then(|| PyObject::steal(ctx, tb));

        let type_name = attr_text(ctx, ty.handle(), crate::cstr!("__name__"))
            .unwrap_or_else(|| "Exception".to_string());
        let detail = value
            .as_ref()
            .and_then(|v| render(ctx, v.handle()))
            .unwrap_or_default();

        let mut message = if detail.is_empty() {
            type_name.clone()
        } else {
            format!("{}: {}", type_name, detail)
        };

        if let Some(tb) = &traceback {
            if let Some(text) = format_traceback(ctx, tb.handle()) {
                message.push_str("\nTraceback (most recent call last):\n");
                message.push_str(&text);
            }
        }

        debug!(target: "ffi", exception = %type_name, "foreign exception fetched");

        Some(Self {
            ty,
            value,
            traceback,
            type_name,
            message,
        })
    }

    /// Exception class
    pub fn ptype(&self) -> &PyObject {
        &self.ty
    }

    /// Exception instance
    pub fn value(&self) -> Option<&PyObject> {
        self.value.as_ref()
    }

    pub fn traceback(&self) -> Option<&PyObject> {
        self.traceback.as_ref()
    }

    /// Exception class name, e.g. `ZeroDivisionError`
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Rendered message including the formatted traceback when present
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-raise inside the interpreter (used when unwinding through callbacks)
    pub(crate) fn restore(&self) {
        let api = self.ty.context().api();
        let ty = self.ty.clone().into_raw();
        let value = self.value.clone().map_or(Handle::NULL, PyObject::into_raw);
        let tb = self.traceback.clone().map_or(Handle::NULL, PyObject::into_raw);
        api.err_restore(ty, value, tb);
    }
}

impl fmt::Display for PythonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for PythonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PythonError")
            .field("type", &self.type_name)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for PythonError {}

/// Raise the pending foreign error, if any
pub(crate) fn check(ctx: &Rc<Context>) -> Result<()> {
    match PythonError::fetch(ctx) {
        Some(err) => {
            log_ffi_error(err.type_name(), err.message());
            Err(Error::Python(err))
        }
        None => Ok(()),
    }
}

/// Turn a null result into the pending foreign error (or `fallback`)
pub(crate) fn check_handle(
    ctx: &Rc<Context>,
    handle: Handle,
    fallback: impl FnOnce() -> Error,
) -> Result<Handle> {
    if handle.is_null() {
        check(ctx)?;
        return Err(fallback());
    }
    Ok(handle)
}

/// Turn a nonzero status into the pending foreign error (or `fallback`)
pub(crate) fn check_status(
    ctx: &Rc<Context>,
    status: core::ffi::c_int,
    fallback: impl FnOnce() -> Error,
) -> Result<()> {
    if status != 0 {
        check(ctx)?;
        return Err(fallback());
    }
    Ok(())
}

// The helpers below run while an exception is being rendered, so they talk to
// the entry points directly and swallow their own failures.

fn text_of(ctx: &Context, s: Handle) -> Option<String> {
    let api = ctx.api();
    let out = api.unicode_as_string(s);
    if out.is_none() {
        api.err_clear();
    }
    api.decref(s);
    out
}

fn render(ctx: &Context, obj: Handle) -> Option<String> {
    let api = ctx.api();
    let s = api.object_str(obj);
    if s.is_null() {
        api.err_clear();
        return None;
    }
    text_of(ctx, s)
}

fn attr_text(ctx: &Context, obj: Handle, name: &std::ffi::CStr) -> Option<String> {
    let api = ctx.api();
    let attr = api.get_attr(obj, name);
    if attr.is_null() {
        api.err_clear();
        return None;
    }
    let out = render(ctx, attr);
    api.decref(attr);
    out
}

fn format_traceback(ctx: &Context, tb: Handle) -> Option<String> {
    let api = ctx.api();
    let module = api.import_module(crate::cstr!("traceback"));
    if module.is_null() {
        api.err_clear();
        return None;
    }
    let format_tb = api.get_attr(module, crate::cstr!("format_tb"));
    api.decref(module);
    if format_tb.is_null() {
        api.err_clear();
        return None;
    }

    let args = api.tuple_new(1);
    api.incref(tb);
    api.tuple_set_item(args, 0, tb);
    let lines = api.call(format_tb, args, Handle::NULL);
    api.decref(args);
    api.decref(format_tb);
    if lines.is_null() {
        api.err_clear();
        return None;
    }

    let mut text = String::new();
    let count = api.list_size(lines);
    for i in 0..count.max(0) {
        let line = api.list_get_item(lines, i);
        if line.is_null() {
            continue;
        }
        if let Some(s) = api.unicode_as_string(line) {
            text.push_str(&s);
        } else {
            api.err_clear();
        }
    }
    api.decref(lines);

    Some(text)
}
