//! Reference-counted wrappers around foreign objects
//!
//! Design: a [`PyObject`] pairs a [`Handle`] with the interpreter context that
//! issued it, and records whether it owns a reference.
//! - Owned wrappers are registered on creation and release exactly one
//!   reference when dropped
//! - Borrowed wrappers never touch the reference count; [`PyObject::owned`]
//!   is the single way to turn one into an owned wrapper
//! - Cloning an owned or borrowed wrapper always claims a fresh reference
//!
//! Wrappers hold an `Rc` to their context and are therefore `!Send`: every
//! reference is released on the thread that holds the interpreter lock.

use crate::error::{check, check_handle, check_status, Error, Result};
use crate::ffi::{CompareOp, Handle};
use crate::logging::trace;
use crate::proxy::Proxy;
use crate::runtime::{Context, Python};
use smallvec::SmallVec;
use std::ffi::CString;
use std::fmt;
use std::rc::Rc;

pub mod convert;
pub(crate) mod registry;

pub use convert::{HostFn, Kwargs, Value};


/// Host-side reference to one foreign object
pub struct PyObject {
    ctx: Rc<Context>,
    handle: Handle,
    owned: bool,
}

impl PyObject {
    /// Wrap a new reference; the wrapper takes it over
    pub(crate) fn steal(ctx: &Rc<Context>, handle: Handle) -> Self {
        ctx.registry().register(handle);
        Self {
            ctx: Rc::clone(ctx),
            handle,
            owned: true,
        }
    }

    /// Wrap a borrowed reference without claiming it
    pub(crate) fn borrowed(ctx: &Rc<Context>, handle: Handle) -> Self {
        Self {
            ctx: Rc::clone(ctx),
            handle,
            owned: false,
        }
    }

    /// Wrap the result of an entry point returning a new reference
    pub(crate) fn from_new(
        ctx: &Rc<Context>,
        handle: Handle,
        function: &'static str,
    ) -> Result<Self> {
        let handle = check_handle(ctx, handle, || Error::NullResult(function))?;
        Ok(Self::steal(ctx, handle))
    }

    /// Claim a reference for a borrowed wrapper; owned wrappers pass through
    pub fn owned(mut self) -> Self {
        if !self.owned {
            self.ctx.claim(self.handle);
            self.owned = true;
        }
        self
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    /// Runtime facade this object belongs to
    pub fn python(&self) -> Python {
        Python::from_context(Rc::clone(&self.ctx))
    }

    /// Hand one owned reference to the caller (for stealing entry points)
    pub fn into_raw(self) -> Handle {
        let mut this = self;
        if this.owned {
            this.ctx.registry().unregister(this.handle);
            this.owned = false;
        } else {
            this.ctx.api().incref(this.handle);
        }
        this.handle
    }

    pub fn into_proxy(self) -> Proxy {
        Proxy::new(self)
    }

    fn c_name(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))
    }

    // ---- attributes -----------------------------------------------------

    /// Attribute lookup; a missing attribute is a foreign `AttributeError`
    pub fn get_attr(&self, name: &str) -> Result<PyObject> {
        let cname = Self::c_name(name)?;
        let handle = self.ctx.api().get_attr(self.handle, &cname);
        Self::from_new(&self.ctx, handle, "PyObject_GetAttrString")
    }

    /// Attribute lookup that maps any failure to `None`
    pub fn maybe_get_attr(&self, name: &str) -> Result<Option<PyObject>> {
        let cname = Self::c_name(name)?;
        let api = self.ctx.api();
        let handle = api.get_attr(self.handle, &cname);
        if handle.is_null() {
            api.err_clear();
            return Ok(None);
        }
        Ok(Some(Self::steal(&self.ctx, handle)))
    }

    pub fn set_attr(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let cname = Self::c_name(name)?;
        let value = convert::to_object(&self.ctx, value.into())?;
        let status = self.ctx.api().set_attr(self.handle, &cname, value.handle());
        check_status(&self.ctx, status, || Error::NullResult("PyObject_SetAttrString"))
    }

    /// Never raises; names with NUL bytes are reported as absent
    pub fn has_attr(&self, name: &str) -> bool {
        match CString::new(name) {
            Ok(cname) => self.ctx.api().has_attr(self.handle, &cname) == 1,
            Err(_) => false,
        }
    }

    // ---- items ----------------------------------------------------------

    pub fn get_item(&self, key: impl Into<Value>) -> Result<PyObject> {
        let key = convert::to_object(&self.ctx, key.into())?;
        let handle = self.ctx.api().get_item(self.handle, key.handle());
        Self::from_new(&self.ctx, handle, "PyObject_GetItem")
    }

    pub fn set_item(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        let key = convert::to_object(&self.ctx, key.into())?;
        let value = convert::to_object(&self.ctx, value.into())?;
        let status = self.ctx.api().set_item(self.handle, key.handle(), value.handle());
        check_status(&self.ctx, status, || Error::NullResult("PyObject_SetItem"))
    }

    pub fn contains(&self, item: impl Into<Value>) -> Result<bool> {
        let item = convert::to_object(&self.ctx, item.into())?;
        let status = self.ctx.api().contains(self.handle, item.handle());
        self.truth(status, "PySequence_Contains")
    }

    pub fn len(&self) -> Result<usize> {
        let len = self.ctx.api().length(self.handle);
        if len < 0 {
            check(&self.ctx)?;
            return Err(Error::NullResult("PyObject_Length"));
        }
        Ok(len as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ---- calls ----------------------------------------------------------

    /// Call with a mixed argument list
    ///
    /// Plain values become positional arguments in order; every
    /// [`NamedArgument`] is pulled out into the keyword set.
    pub fn call(&self, args: impl IntoIterator<Item = Arg>) -> Result<PyObject> {
        self.call_with(args, std::iter::empty::<(String, Value)>())
    }

    /// Call with a mixed argument list plus an explicit keyword record
    ///
    /// Named arguments found in `args` override entries of `kwargs` with the
    /// same name.
    pub fn call_with<K>(
        &self,
        args: impl IntoIterator<Item = Arg>,
        kwargs: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<PyObject>
    where
        K: Into<String>,
    {
        let mut positional: SmallVec<[Value; 8]> = SmallVec::new();
        let mut named: Vec<(String, Value)> = kwargs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for arg in args {
            match arg {
                Arg::Positional(value) => positional.push(value),
                Arg::Named(NamedArgument { name, value }) => named.push((name, value)),
            }
        }

        let count = isize::try_from(positional.len())
            .map_err(|_| Error::ArgumentCount { positional: isize::MAX })?;

        let api = self.ctx.api();
        let tuple = Self::from_new(&self.ctx, api.tuple_new(count), "PyTuple_New")?;
        for (i, value) in positional.into_iter().enumerate() {
            let item = convert::to_object(&self.ctx, value)?;
            let status = api.tuple_set_item(tuple.handle(), i as isize, item.into_raw());
            check_status(&self.ctx, status, || Error::NullResult("PyTuple_SetItem"))?;
        }

        let kwargs = if named.is_empty() {
            None
        } else {
            let dict = Self::from_new(&self.ctx, api.dict_new(), "PyDict_New")?;
            for (name, value) in named {
                let key = convert::to_object(&self.ctx, Value::Str(name))?;
                let value = convert::to_object(&self.ctx, value)?;
                let status = api.dict_set_item(dict.handle(), key.handle(), value.handle());
                check_status(&self.ctx, status, || Error::NullResult("PyDict_SetItem"))?;
            }
            Some(dict)
        };

        trace!(target: "interop", positional = count, keywords = kwargs.is_some(), "foreign call");

        let result = api.call(
            self.handle,
            tuple.handle(),
            kwargs.as_ref().map_or(Handle::NULL, PyObject::handle),
        );
        drop(tuple);
        drop(kwargs);

        Self::from_new(&self.ctx, result, "PyObject_Call")
    }

    // ---- comparison and types -------------------------------------------

    /// Foreign `==`
    pub fn equals(&self, other: &PyObject) -> Result<bool> {
        let status = self.ctx.api().rich_compare_bool(self.handle, other.handle, CompareOp::Eq);
        self.truth(status, "PyObject_RichCompareBool")
    }

    pub fn compare(&self, other: &PyObject, op: CompareOp) -> Result<bool> {
        let status = self.ctx.api().rich_compare_bool(self.handle, other.handle, op);
        self.truth(status, "PyObject_RichCompareBool")
    }

    pub fn is_instance(&self, class: &PyObject) -> Result<bool> {
        let status = self.ctx.api().is_instance(self.handle, class.handle);
        self.truth(status, "PyObject_IsInstance")
    }

    /// Same object, by identity
    pub fn is(&self, other: &PyObject) -> bool {
        self.handle == other.handle
    }

    pub fn is_none(&self) -> bool {
        self.handle == self.ctx.none_handle()
    }

    pub fn type_of(&self) -> Result<PyObject> {
        let handle = self.ctx.api().object_type(self.handle);
        Self::from_new(&self.ctx, handle, "PyObject_Type")
    }

    /// `type(obj).__name__`
    pub fn type_name(&self) -> String {
        self.type_of()
            .and_then(|t| t.get_attr("__name__"))
            .and_then(|n| n.as_string())
            .unwrap_or_else(|_| "object".to_string())
    }

    // ---- text -----------------------------------------------------------

    /// Foreign `str(obj)`
    pub fn str(&self) -> Result<String> {
        let handle = self.ctx.api().object_str(self.handle);
        Self::from_new(&self.ctx, handle, "PyObject_Str")?.as_string()
    }

    /// Foreign `repr(obj)`
    pub fn repr(&self) -> Result<String> {
        let handle = self.ctx.api().object_repr(self.handle);
        Self::from_new(&self.ctx, handle, "PyObject_Repr")?.as_string()
    }

    // ---- iteration ------------------------------------------------------

    /// Foreign iterator protocol over this object
    pub fn iter(&self) -> Result<ObjectIter> {
        let handle = self.ctx.api().get_iter(self.handle);
        let iter = Self::from_new(&self.ctx, handle, "PyObject_GetIter")?;
        Ok(ObjectIter { iter, done: false })
    }

    fn truth(&self, status: core::ffi::c_int, function: &'static str) -> Result<bool> {
        if status < 0 {
            check(&self.ctx)?;
            return Err(Error::NullResult(function));
        }
        Ok(status == 1)
    }
}

impl Clone for PyObject {
    fn clone(&self) -> Self {
        self.ctx.claim(self.handle);
        Self {
            ctx: Rc::clone(&self.ctx),
            handle: self.handle,
            owned: true,
        }
    }
}

impl Drop for PyObject {
    fn drop(&mut self) {
        if self.owned {
            self.ctx.release(self.handle);
        }
    }
}

impl fmt::Display for PyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.str().or_else(|_| self.repr()) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "<unprintable {} object>", self.type_name()),
        }
    }
}

impl fmt::Debug for PyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr() {
            Ok(repr) => write!(f, "PyObject({})", repr),
            Err(_) => write!(f, "PyObject({:?})", self.handle),
        }
    }
}

/// Iterator over a foreign iterable, yielding owned wrappers
pub struct ObjectIter {
    iter: PyObject,
    done: bool,
}

impl Iterator for ObjectIter {
    type Item = Result<PyObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let ctx = self.iter.context();
        let handle = ctx.api().iter_next(self.iter.handle());
        if handle.is_null() {
            self.done = true;
            return check(ctx).err().map(Err);
        }
        Some(Ok(PyObject::steal(ctx, handle)))
    }
}

/// A keyword argument carried inside a positional argument list
#[derive(Debug, Clone, PartialEq)]
pub struct NamedArgument {
    pub name: String,
    pub value: Value,
}

impl NamedArgument {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Shorthand for [`NamedArgument::new`]
pub fn kw(name: impl Into<String>, value: impl Into<Value>) -> NamedArgument {
    NamedArgument::new(name, value)
}

/// One entry of a call's argument list
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Value),
    Named(NamedArgument),
}

impl Arg {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Positional(value.into())
    }
}

macro_rules! positional_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Self::Positional(Value::from(value))
                }
            }
        )*
    };
}

positional_from!(Value, bool, i32, i64, u32, usize, f64, &str, String, PyObject, Proxy);

impl From<NamedArgument> for Arg {
    fn from(arg: NamedArgument) -> Self {
        Self::Named(arg)
    }
}
