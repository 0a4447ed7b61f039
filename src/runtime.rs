//! Runtime facade
//!
//! [`Python`] is the entry point: it binds the entry point table, holds the
//! interpreter lock for the current thread and hands out wrappers. Every
//! wrapper keeps the shared [`Context`] alive, so the lock is released only
//! after the last wrapper is gone.

use crate::callback::Callback;
use crate::config::BridgeConfig;
use crate::error::{check, check_handle, Error, Result};
use crate::ffi::{CPython, ForeignApi, Handle, LockState, FILE_INPUT};
use crate::logging::{debug, info, warn};
use crate::object::registry::Registry;
use crate::object::{convert, Kwargs, PyObject, Value};
use crate::proxy::Proxy;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::rc::Rc;

thread_local! {
    /// Per interpreter: contexts sharing this thread's lock and the state to restore
    static LOCKS: RefCell<HashMap<usize, (usize, LockState)>> = RefCell::new(HashMap::new());
}

/// One context's share of the calling thread's interpreter lock
///
/// The first share on a thread acquires the lock and the last one releases
/// it, so contexts may be dropped in any order.
struct LockShare {
    api: Rc<dyn ForeignApi>,
    key: usize,
}

impl LockShare {
    fn acquire(api: &Rc<dyn ForeignApi>) -> Self {
        let key = api.interpreter_key();
        let first = LOCKS.with(|locks| {
            let mut locks = locks.borrow_mut();
            match locks.get_mut(&key) {
                Some(entry) => {
                    entry.0 += 1;
                    false
                }
                None => {
                    locks.insert(key, (1, api.acquire()));
                    true
                }
            }
        });
        if first {
            debug!(target: "runtime", "interpreter lock acquired");
        }
        Self {
            api: Rc::clone(api),
            key,
        }
    }
}

impl Drop for LockShare {
    fn drop(&mut self) {
        // LOCKS may already be gone during thread-local teardown
        let released = LOCKS.try_with(|locks| {
            let mut locks = locks.borrow_mut();
            let remaining = match locks.get_mut(&self.key) {
                Some(entry) => {
                    entry.0 -= 1;
                    entry.0
                }
                None => return None,
            };
            if remaining > 0 {
                return None;
            }
            locks.remove(&self.key).map(|(_, state)| state)
        });
        let released = released.ok().flatten();
        if let Some(state) = released {
            self.api.release(state);
            debug!(target: "runtime", "interpreter lock released");
        }
    }
}

/// Built-in objects resolved once per context (owned references)
pub(crate) struct Builtins {
    pub(crate) none: Handle,
    pub(crate) ellipsis: Handle,
    pub(crate) bool: Handle,
    pub(crate) int: Handle,
    pub(crate) float: Handle,
    pub(crate) str: Handle,
    pub(crate) list: Handle,
    pub(crate) tuple: Handle,
    pub(crate) dict: Handle,
    pub(crate) set: Handle,
    pub(crate) lookup_error: Handle,
    pub(crate) type_error: Handle,
}

impl Builtins {
    fn load(api: &dyn ForeignApi) -> Result<Self> {
        let builtins = api.eval_get_builtins();
        if builtins.is_null() {
            api.err_clear();
            return Err(Error::Initialization("builtins are not available".to_string()));
        }

        let lookup = |name: &str| -> Result<Handle> {
            let key = api.unicode_from_str(name);
            if key.is_null() {
                api.err_clear();
                return Err(Error::Initialization(format!("cannot create key '{}'", name)));
            }
            let found = api.dict_get_item(builtins, key);
            api.decref(key);
            if found.is_null() {
                return Err(Error::Initialization(format!("builtin '{}' is missing", name)));
            }
            api.incref(found);
            Ok(found)
        };

        let names = [
            "None", "Ellipsis", "bool", "int", "float", "str", "list", "tuple", "dict", "set",
            "LookupError", "TypeError",
        ];
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            match lookup(name) {
                Ok(handle) => resolved.push(handle),
                Err(err) => {
                    resolved.into_iter().for_each(|h| api.decref(h));
                    return Err(err);
                }
            }
        }

        Ok(Self {
            none: resolved[0],
            ellipsis: resolved[1],
            bool: resolved[2],
            int: resolved[3],
            float: resolved[4],
            str: resolved[5],
            list: resolved[6],
            tuple: resolved[7],
            dict: resolved[8],
            set: resolved[9],
            lookup_error: resolved[10],
            type_error: resolved[11],
        })
    }

    fn release(&self, api: &dyn ForeignApi) {
        for handle in [
            self.none,
            self.ellipsis,
            self.bool,
            self.int,
            self.float,
            self.str,
            self.list,
            self.tuple,
            self.dict,
            self.set,
            self.lookup_error,
            self.type_error,
        ] {
            api.decref(handle);
        }
    }
}

/// Shared interpreter state behind every wrapper
pub(crate) struct Context {
    api: Rc<dyn ForeignApi>,
    registry: Registry,
    builtins: Builtins,
    modules: Cell<usize>,
    _lock: LockShare,
}

impl Context {
    pub(crate) fn api(&self) -> &dyn ForeignApi {
        &*self.api
    }

    pub(crate) fn shared_api(&self) -> &Rc<dyn ForeignApi> {
        &self.api
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub(crate) fn none_handle(&self) -> Handle {
        self.builtins.none
    }

    /// Take one new reference to `handle` and record it
    pub(crate) fn claim(&self, handle: Handle) {
        self.api.incref(handle);
        self.registry.register(handle);
    }

    /// Drop one recorded reference; unknown handles are refused
    pub(crate) fn release(&self, handle: Handle) {
        if self.registry.unregister(handle) {
            self.api.decref(handle);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.builtins.release(&*self.api);
        let live = self.registry.live();
        if live > 0 {
            warn!(target: "refcount", live, handles = self.registry.handles(), "references still registered at teardown");
        }
        debug!(target: "runtime", "interpreter context released");
    }
}

/// Handle on the embedded interpreter
#[derive(Clone)]
pub struct Python {
    ctx: Rc<Context>,
}

impl Python {
    /// Load libpython using the discovered configuration
    pub fn load() -> Result<Self> {
        Self::with_config(&BridgeConfig::discover())
    }

    pub fn with_config(config: &BridgeConfig) -> Result<Self> {
        let api = CPython::load(config)?;
        info!(target: "runtime", library = api.library_name(), "Python library loaded");
        Self::from_api(Rc::new(api))
    }

    /// Bind an already initialized entry point table
    pub fn from_api(api: Rc<dyn ForeignApi>) -> Result<Self> {
        if !api.is_initialized() {
            return Err(Error::Initialization("interpreter is not initialized".to_string()));
        }

        let lock = LockShare::acquire(&api);
        let builtins = Builtins::load(&*api)?;

        let ctx = Rc::new(Context {
            api,
            registry: Registry::new(),
            builtins,
            modules: Cell::new(0),
            _lock: lock,
        });
        debug!(target: "runtime", "interpreter context ready");
        Ok(Self { ctx })
    }

    pub(crate) fn from_context(ctx: Rc<Context>) -> Self {
        Self { ctx }
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    /// `import name`
    pub fn import(&self, name: &str) -> Result<Proxy> {
        let cname = CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))?;
        let module = self.ctx.api().import_module(&cname);
        Ok(PyObject::from_new(&self.ctx, module, "PyImport_ImportModule")?.into_proxy())
    }

    /// Execute statements in the `__main__` namespace
    pub fn run(&self, code: &str) -> Result<()> {
        let source = CString::new(code).map_err(|_| Error::Eval("source contains a NUL byte".to_string()))?;
        let api = self.ctx.api();

        let main = check_handle(&self.ctx, api.add_module(crate::cstr!("__main__")), || {
            Error::Eval("cannot create __main__".to_string())
        })?;
        let globals = check_handle(&self.ctx, api.module_get_dict(main), || {
            Error::Eval("__main__ has no namespace".to_string())
        })?;
        let globals = PyObject::borrowed(&self.ctx, globals).owned();

        let code = api.compile_string(&source, crate::cstr!("<string>"), FILE_INPUT);
        let code = check_handle(&self.ctx, code, || Error::Eval("compilation failed".to_string()))?;
        let code = PyObject::steal(&self.ctx, code);

        let result = api.eval_code(code.handle(), globals.handle(), globals.handle());
        let result = check_handle(&self.ctx, result, || Error::Eval("evaluation failed".to_string()))?;
        drop(PyObject::steal(&self.ctx, result));
        check(&self.ctx)
    }

    /// Execute `code` as a new module and return it
    ///
    /// Unnamed modules get a unique `__pybridge_module_N` name.
    pub fn run_module(&self, code: &str, name: Option<&str>) -> Result<Proxy> {
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let n = self.ctx.modules.get();
                self.ctx.modules.set(n + 1);
                format!("__pybridge_module_{}", n)
            }
        };
        let cname = CString::new(name.as_str()).map_err(|_| Error::InvalidName(name.clone()))?;
        let source = CString::new(code)
            .map_err(|_| Error::ModuleLoad(format!("{}: source contains a NUL byte", name)))?;
        let api = self.ctx.api();

        let code = api.compile_string(&source, &cname, FILE_INPUT);
        let code = check_handle(&self.ctx, code, || Error::ModuleLoad(format!("{}: compilation failed", name)))?;
        let code = PyObject::steal(&self.ctx, code);

        let module = api.exec_code_module(&cname, code.handle());
        let module = check_handle(&self.ctx, module, || Error::ModuleLoad(name.clone()))?;
        debug!(target: "runtime", module = %name, "module executed");
        Ok(PyObject::steal(&self.ctx, module).into_proxy())
    }

    /// The `builtins` module
    pub fn builtins(&self) -> Result<Proxy> {
        self.import("builtins")
    }

    pub fn none(&self) -> Proxy {
        PyObject::borrowed(&self.ctx, self.ctx.none_handle()).owned().into_proxy()
    }

    /// Convert any host value into a foreign object
    pub fn object(&self, value: impl Into<Value>) -> Result<PyObject> {
        convert::to_object(&self.ctx, value.into())
    }

    fn proxy(&self, value: Value) -> Result<Proxy> {
        Ok(convert::to_object(&self.ctx, value)?.into_proxy())
    }

    pub fn bool(&self, value: bool) -> Result<Proxy> {
        self.proxy(Value::Bool(value))
    }

    pub fn int(&self, value: impl Into<i128>) -> Result<Proxy> {
        self.proxy(Value::from(value.into()))
    }

    pub fn float(&self, value: f64) -> Result<Proxy> {
        self.proxy(Value::Float(value))
    }

    pub fn str(&self, value: &str) -> Result<Proxy> {
        self.proxy(Value::Str(value.to_string()))
    }

    pub fn list<T: Into<Value>>(&self, items: impl IntoIterator<Item = T>) -> Result<Proxy> {
        self.proxy(Value::List(items.into_iter().map(Into::into).collect()))
    }

    pub fn tuple<T: Into<Value>>(&self, items: impl IntoIterator<Item = T>) -> Result<Proxy> {
        self.proxy(Value::Tuple(items.into_iter().map(Into::into).collect()))
    }

    pub fn dict<K: Into<Value>, V: Into<Value>>(
        &self,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Proxy> {
        self.proxy(Value::Dict(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()))
    }

    pub fn set<T: Into<Value>>(&self, items: impl IntoIterator<Item = T>) -> Result<Proxy> {
        self.proxy(Value::Set(items.into_iter().map(Into::into).collect()))
    }

    /// Expose a host closure as a foreign callable
    pub fn callback<F>(&self, f: F) -> Result<Callback>
    where
        F: Fn(Kwargs, Vec<Value>) -> Result<Value> + 'static,
    {
        self.named_callback("callback", f)
    }

    pub fn named_callback<F>(&self, name: &str, f: F) -> Result<Callback>
    where
        F: Fn(Kwargs, Vec<Value>) -> Result<Value> + 'static,
    {
        Callback::new(&self.ctx, name, Rc::new(f))
    }

    /// Owned references currently held by wrappers of this context
    pub fn live_objects(&self) -> usize {
        self.ctx.registry().live()
    }
}

impl std::fmt::Debug for Python {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Python")
            .field("live_objects", &self.live_objects())
            .finish()
    }
}
