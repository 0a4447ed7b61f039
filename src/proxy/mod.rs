//! Dynamic proxy over foreign objects
//!
//! Design: a [`Proxy`] answers string-keyed property access the way a script
//! host would expect, resolving each key in a fixed order:
//! 1. Reserved keys (`toString`, `valueOf`, `proxiedObject`, `iterator`)
//! 2. Subscript keys in the slice mini-language (`"1:"`, `"::2, 0"`, `"..."`)
//! 3. Integer keys on lists and tuples (negative counts from the end)
//! 4. Attributes
//! 5. Items of mappings, for string keys
//!
//! Attributes take precedence over items, so a `dict` subclass with a
//! `get` method answers `get` with the method, never with `d["get"]`.

use crate::error::{check_status, Error, PythonError, Result};
use crate::ffi::Handle;
use crate::object::{convert, Arg, ObjectIter, PyObject, Value};
use crate::runtime::{Context, Python};
use std::fmt;
use std::rc::Rc;

pub mod key;

pub use key::{is_subscript, parse_subscript, SliceItem};

use key::{classify, Key};


/// Keys answered by the proxy itself
pub(crate) const RESERVED: [&str; 4] = ["toString", "valueOf", "proxiedObject", "iterator"];

/// Dynamic, string-keyed access to a foreign object
pub trait Dynamic {
    /// Resolve `key`; `Ok(None)` when it names nothing
    fn get(&self, key: &str) -> Result<Option<Property>>;
    /// Assign through an existing attribute, a mapping item or a list index
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn has(&self, key: &str) -> bool;
    /// Call the object with a mixed positional/named argument list
    fn call(&self, args: Vec<Arg>) -> Result<Proxy>;
    fn iterate(&self) -> Result<ProxyIter>;
}

/// Result of a property lookup
#[derive(Debug)]
pub enum Property {
    /// Attribute, item or element of the proxied object
    Proxy(Proxy),
    /// `toString`
    Text(String),
    /// `valueOf`
    Value(Value),
    /// `proxiedObject`
    Object(PyObject),
    /// `iterator`
    Iter(ProxyIter),
}

impl Property {
    pub fn into_proxy(self) -> Option<Proxy> {
        match self {
            Self::Proxy(proxy) => Some(proxy),
            Self::Object(object) => Some(Proxy::new(object)),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }
}

/// Proxy over one foreign object
#[derive(Clone)]
pub struct Proxy {
    object: PyObject,
}

impl Proxy {
    pub fn new(object: PyObject) -> Self {
        Self { object }
    }

    /// The wrapped object
    pub fn object(&self) -> &PyObject {
        &self.object
    }

    pub fn into_object(self) -> PyObject {
        self.object
    }

    pub fn python(&self) -> Python {
        self.object.python()
    }

    pub fn value_of(&self) -> Result<Value> {
        self.object.value_of()
    }

    /// Like [`Dynamic::get`], keeping only object results
    pub fn get_proxy(&self, key: &str) -> Result<Option<Proxy>> {
        Ok(self.get(key)?.and_then(Property::into_proxy))
    }

    /// Call with mixed arguments plus an explicit keyword record
    pub fn call_with<K: Into<String>>(
        &self,
        args: Vec<Arg>,
        kwargs: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<Proxy> {
        Ok(self.object.call_with(args, kwargs)?.into_proxy())
    }

    /// `obj.name(*args)`
    pub fn call_method(&self, name: &str, args: Vec<Arg>) -> Result<Proxy> {
        let method = self.object.get_attr(name)?;
        Ok(method.call(args)?.into_proxy())
    }

    pub fn iter(&self) -> Result<ProxyIter> {
        Ok(ProxyIter {
            inner: Some(self.object.iter()?),
            error: None,
        })
    }

    fn context(&self) -> &Rc<Context> {
        self.object.context()
    }

    fn is_instance_of(&self, class: Handle) -> bool {
        let api = self.context().api();
        match api.is_instance(self.object.handle(), class) {
            1 => true,
            0 => false,
            _ => {
                api.err_clear();
                false
            }
        }
    }

    fn is_mapping(&self) -> bool {
        self.is_instance_of(self.context().builtins().dict)
    }

    fn is_list(&self) -> bool {
        self.is_instance_of(self.context().builtins().list)
    }

    /// `LookupError` and `TypeError` from a subscript mean the key names nothing
    fn is_missing(&self, err: &PythonError) -> bool {
        let Some(value) = err.value() else {
            return false;
        };
        let ctx = self.context();
        let builtins = ctx.builtins();
        [builtins.lookup_error, builtins.type_error]
            .into_iter()
            .any(|class| value.is_instance(&PyObject::borrowed(ctx, class)).unwrap_or(false))
    }

    /// Element `index` of a list or tuple
    ///
    /// The outer `None` means "not a sequence"; the inner one "out of range".
    fn sequence_item(&self, index: i64) -> Option<Option<Proxy>> {
        let ctx = self.context();
        let api = ctx.api();
        let handle = self.object.handle();

        let is_list = self.is_list();
        if !is_list && !self.is_instance_of(ctx.builtins().tuple) {
            return None;
        }

        let len = if is_list {
            api.list_size(handle)
        } else {
            api.tuple_size(handle)
        };
        let len = len as i64;
        let index = if index < 0 { index + len } else { index };
        if index < 0 || index >= len {
            return Some(None);
        }

        let item = if is_list {
            api.list_get_item(handle, index as isize)
        } else {
            api.tuple_get_item(handle, index as isize)
        };
        if item.is_null() {
            api.err_clear();
            return Some(None);
        }
        Some(Some(PyObject::borrowed(ctx, item).owned().into_proxy()))
    }

    /// Attribute first, then mapping item
    fn lookup_name(&self, key: &str) -> Result<Option<Property>> {
        if let Some(attr) = self.object.maybe_get_attr(key)? {
            return Ok(Some(Property::Proxy(attr.into_proxy())));
        }
        if !self.is_mapping() {
            return Ok(None);
        }

        let ctx = self.context();
        let api = ctx.api();
        let name = convert::to_object(ctx, Value::Str(key.to_string()))?;
        let item = api.get_item(self.object.handle(), name.handle());
        if item.is_null() {
            api.err_clear();
            return Ok(None);
        }
        Ok(Some(Property::Proxy(PyObject::steal(ctx, item).into_proxy())))
    }

    fn subscript_key(&self, items: &[SliceItem]) -> Result<PyObject> {
        let ctx = self.context();
        let mut parts = items
            .iter()
            .map(|item| slice_item_object(ctx, item))
            .collect::<Result<Vec<_>>>()?;

        if parts.len() == 1 {
            if let Some(single) = parts.pop() {
                return Ok(single);
            }
        }

        let api = ctx.api();
        let tuple = PyObject::from_new(ctx, api.tuple_new(parts.len() as isize), "PyTuple_New")?;
        for (i, part) in parts.into_iter().enumerate() {
            let status = api.tuple_set_item(tuple.handle(), i as isize, part.into_raw());
            check_status(ctx, status, || Error::NullResult("PyTuple_SetItem"))?;
        }
        Ok(tuple)
    }
}

fn slice_item_object(ctx: &Rc<Context>, item: &SliceItem) -> Result<PyObject> {
    match *item {
        SliceItem::Index(i) => convert::to_object(ctx, Value::Int(i)),
        SliceItem::Ellipsis => Ok(PyObject::borrowed(ctx, ctx.builtins().ellipsis).owned()),
        SliceItem::Range { start, stop, step } => {
            let bound = |b: Option<i64>| b.map(|n| convert::to_object(ctx, Value::Int(n))).transpose();
            let (start, stop, step) = (bound(start)?, bound(stop)?, bound(step)?);
            let raw = |b: &Option<PyObject>| b.as_ref().map_or(Handle::NULL, PyObject::handle);
            let slice = ctx.api().slice_new(raw(&start), raw(&stop), raw(&step));
            PyObject::from_new(ctx, slice, "PySlice_New")
        }
    }
}

impl Dynamic for Proxy {
    fn get(&self, key: &str) -> Result<Option<Property>> {
        match classify(key) {
            Key::Reserved("toString") => Ok(Some(Property::Text(self.to_string()))),
            Key::Reserved("valueOf") => Ok(Some(Property::Value(self.value_of()?))),
            Key::Reserved("proxiedObject") => Ok(Some(Property::Object(self.object.clone()))),
            Key::Reserved(_) => Ok(Some(Property::Iter(self.iter()?))),
            Key::Subscript(items) => {
                let key = self.subscript_key(&items)?;
                match self.object.get_item(Value::Object(key.into_proxy())) {
                    Ok(item) => Ok(Some(Property::Proxy(item.into_proxy()))),
                    Err(Error::Python(err)) if self.is_missing(&err) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Key::Index(index) => match self.sequence_item(index) {
                Some(item) => Ok(item.map(Property::Proxy)),
                None => self.lookup_name(key),
            },
            Key::Name(_) => self.lookup_name(key),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let invalid = || Error::InvalidAssignment { key: key.to_string() };
        match classify(key) {
            Key::Reserved(_) => Err(invalid()),
            Key::Subscript(items) => {
                let key = self.subscript_key(&items)?;
                self.object.set_item(Value::Object(key.into_proxy()), value)
            }
            parsed => {
                if self.object.has_attr(key) {
                    return self.object.set_attr(key, value);
                }
                if self.is_mapping() {
                    return self.object.set_item(key, value);
                }
                match parsed {
                    Key::Index(index) if self.is_list() => self.object.set_item(index, value),
                    _ => Err(invalid()),
                }
            }
        }
    }

    fn has(&self, key: &str) -> bool {
        if RESERVED.contains(&key) || self.object.has_attr(key) {
            return true;
        }
        if !self.is_mapping() {
            return false;
        }
        match self.object.contains(key) {
            Ok(found) => found,
            Err(_) => false,
        }
    }

    fn call(&self, args: Vec<Arg>) -> Result<Proxy> {
        Ok(self.object.call(args)?.into_proxy())
    }

    fn iterate(&self) -> Result<ProxyIter> {
        self.iter()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.object, f)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object.repr() {
            Ok(repr) => write!(f, "Proxy({})", repr),
            Err(_) => write!(f, "Proxy({:?})", self.object.handle()),
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.object.equals(&other.object).unwrap_or(false)
    }
}

/// Iterator yielding proxies over the elements of a foreign iterable
pub struct ProxyIter {
    inner: Option<ObjectIter>,
    error: Option<Error>,
}

impl Iterator for ProxyIter {
    type Item = Result<Proxy>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error.take() {
            return Some(Err(err));
        }
        let item = self.inner.as_mut()?.next()?;
        Some(item.map(PyObject::into_proxy))
    }
}

impl fmt::Debug for ProxyIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyIter")
            .field("active", &self.inner.is_some())
            .finish()
    }
}

impl IntoIterator for &Proxy {
    type Item = Result<Proxy>;
    type IntoIter = ProxyIter;

    fn into_iter(self) -> ProxyIter {
        match self.iter() {
            Ok(iter) => iter,
            Err(err) => ProxyIter {
                inner: None,
                error: Some(err),
            },
        }
    }
}
