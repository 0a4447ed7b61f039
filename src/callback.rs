//! Host functions exposed to foreign code
//!
//! Design: each [`Callback`] gets a `MethodDef` and a capsule, and the
//! interpreter builds a native function object over them. All callbacks share
//! one `extern "C"` trampoline which finds the host closure through a
//! thread-local table keyed by the capsule's handle.
//!
//! Lifetime: the function object can be stored anywhere inside the
//! interpreter and called long after the host dropped its wrapper, so the
//! `MethodDef` and its name are never freed. Dropping a [`Callback`] without
//! [`Callback::destroy`] keeps the closure alive for the thread's lifetime.
//! `destroy` drops the closure; later calls raise `RuntimeError`, as do calls
//! after the interpreter context is gone or from another thread.
//!
//! Errors never unwind across the boundary: a host error becomes a foreign
//! exception (the original one, if it came from the interpreter) and a panic
//! becomes `RuntimeError("callback panicked")`.

use crate::error::{Error, Result};
use crate::ffi::{CPython, ForeignApi, Handle, MethodDef, METH_KEYWORDS, METH_VARARGS};
use crate::logging::{debug, error, log_callback};
use crate::object::{convert, HostFn, Kwargs, PyObject, Value};
use crate::runtime::Context;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

const CAPSULE_NAME: &CStr = crate::cstr!("pybridge.callback");

thread_local! {
    static CALLBACKS: RefCell<HashMap<usize, Rc<CallbackState>>> = RefCell::new(HashMap::new());
}

struct CallbackState {
    name: &'static CStr,
    /// `None` once destroyed
    func: RefCell<Option<HostFn>>,
    api: Rc<dyn ForeignApi>,
    ctx: Weak<Context>,
}

/// A host function reachable from foreign code
pub struct Callback {
    object: Option<PyObject>,
    state: Rc<CallbackState>,
}

impl Callback {
    pub(crate) fn new(ctx: &Rc<Context>, name: &str, func: HostFn) -> Result<Self> {
        let name = CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))?;
        // Never freed: the function object may outlive every host handle
        let name: &'static CStr = Box::leak(name.into_boxed_c_str());
        let def = Box::into_raw(Box::new(MethodDef {
            name: name.as_ptr(),
            meth: Some(trampoline),
            flags: METH_VARARGS | METH_KEYWORDS,
            doc: core::ptr::null(),
        }));

        let api = ctx.api();
        // The capsule only anchors identity; its pointer must be non-null
        let capsule = api.capsule_new(def.cast(), CAPSULE_NAME);
        let capsule = PyObject::from_new(ctx, capsule, "PyCapsule_New")?;
        let function = api.cfunction_new(def, capsule.handle());
        let function = PyObject::from_new(ctx, function, "PyCFunction_NewEx")?;

        let state = Rc::new(CallbackState {
            name,
            func: RefCell::new(Some(func)),
            api: Rc::clone(ctx.shared_api()),
            ctx: Rc::downgrade(ctx),
        });
        CALLBACKS.with(|table| table.borrow_mut().insert(capsule.handle().addr(), Rc::clone(&state)));
        debug!(target: "callback", name = %name.to_string_lossy(), "callback created");

        Ok(Self {
            object: Some(function),
            state,
        })
    }

    /// The foreign function object
    pub fn object(&self) -> &PyObject {
        match &self.object {
            Some(object) => object,
            None => unreachable!("callback object taken before drop"),
        }
    }

    pub fn name(&self) -> &str {
        self.state.name.to_str().unwrap_or("callback")
    }

    /// Convert for passing as an argument
    pub fn value(&self) -> Value {
        Value::from(self)
    }

    /// Drop the host closure and release the host's reference
    ///
    /// Foreign code still holding the function gets `RuntimeError` when it
    /// calls it.
    pub fn destroy(mut self) {
        let func = self.state.func.borrow_mut().take();
        drop(func);
        self.object.take();
        debug!(target: "callback", name = self.name(), "callback destroyed");
    }

    /// Release the host's reference, keeping the host state alive for the
    /// lifetime of the thread; returns a new reference to the function
    pub(crate) fn leak(self) -> PyObject {
        self.object().clone()
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if self.object.is_some() {
            debug!(target: "callback", name = self.name(), "callback dropped without destroy; state leaked");
        }
    }
}

/// Number of callbacks on this thread whose closure is alive
pub fn live_callbacks() -> usize {
    CALLBACKS.with(|table| {
        table
            .borrow()
            .values()
            .filter(|state| state.func.borrow().is_some())
            .count()
    })
}

unsafe extern "C" fn trampoline(slf: Handle, args: Handle, kwargs: Handle) -> Handle {
    let state = CALLBACKS
        .try_with(|table| table.borrow().get(&slf.addr()).cloned())
        .ok()
        .flatten();
    let Some(state) = state else {
        let message = "callback invoked on a thread that does not own it";
        error!(target: "callback", "{}", message);
        if let Some(api) = CPython::current() {
            raise_runtime_error(&api, message);
        }
        return Handle::NULL;
    };
    let Some(func) = state.func.borrow().clone() else {
        let message = format!("callback '{}' was destroyed", state.name.to_string_lossy());
        error!(target: "callback", "{}", message);
        raise_runtime_error(&*state.api, &message);
        return Handle::NULL;
    };
    let Some(ctx) = state.ctx.upgrade() else {
        let message = "callback invoked after its interpreter context was dropped";
        error!(target: "callback", "{}", message);
        raise_runtime_error(&*state.api, message);
        return Handle::NULL;
    };

    match catch_unwind(AssertUnwindSafe(|| state.invoke(&ctx, &func, args, kwargs))) {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            raise(&ctx, &err);
            Handle::NULL
        }
        Err(_) => {
            raise_runtime_error(ctx.api(), "callback panicked");
            Handle::NULL
        }
    }
}

impl CallbackState {
    fn invoke(&self, ctx: &Rc<Context>, func: &HostFn, args: Handle, kwargs: Handle) -> Result<Handle> {
        let kwargs: Kwargs = if kwargs.is_null() {
            Kwargs::new()
        } else {
            PyObject::borrowed(ctx, kwargs).as_kwargs()?
        };
        let args = if args.is_null() {
            Vec::new()
        } else {
            PyObject::borrowed(ctx, args).as_tuple()?
        };

        log_callback(&self.name.to_string_lossy(), args.len(), kwargs.len());

        let result = func(kwargs, args)?;
        Ok(convert::to_object(ctx, result)?.into_raw())
    }
}

fn raise(ctx: &Rc<Context>, err: &Error) {
    match err {
        Error::Python(err) => err.restore(),
        other => raise_runtime_error(ctx.api(), &other.to_string()),
    }
}

/// Set `RuntimeError(message)` using only the entry point table
fn raise_runtime_error(api: &dyn ForeignApi, message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    let builtins = api.eval_get_builtins();
    if builtins.is_null() {
        return;
    }
    let key = api.unicode_from_str("RuntimeError");
    if key.is_null() {
        return;
    }
    let class = api.dict_get_item(builtins, key);
    api.decref(key);
    if !class.is_null() {
        api.err_set_string(class, &message);
    }
}
