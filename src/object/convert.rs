//! Value conversion - host values ↔ foreign objects
//!
//! Design: conversion is recursive and by value for the built-in kinds; anything
//! else crosses the boundary as a proxy. Integers never truncate:
//! - Host to foreign: `Int` directly, `BigInt` via its decimal digits
//! - Foreign to host: `Int` if it fits in i64, `BigInt` if it fits in i128,
//!   otherwise the integer stays a proxied object
//!
//! Kind detection compares the exact type against the cached built-in types,
//! so instances of subclasses (a `dict` subclass, a `bool`-derived enum...)
//! come back as `Value::Object`.

use super::PyObject;
use crate::callback::Callback;
use crate::error::{check, check_handle, check_status, Error, Result};
use crate::ffi::Handle;
use crate::logging::log_conversion;
use crate::proxy::Proxy;
use crate::runtime::Context;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ffi::CString;
use std::fmt;
use std::rc::Rc;

/// Keyword arguments handed to host functions
pub type Kwargs = HashMap<String, Value>;

/// Host function callable from foreign code
pub type HostFn = Rc<dyn Fn(Kwargs, Vec<Value>) -> Result<Value>>;

/// A host-side value that can cross the boundary
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Integer outside the i64 range
    BigInt(i128),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Key/value pairs in insertion order
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// Any other foreign object
    Object(Proxy),
    /// Function object of an existing callback
    Callback(PyObject),
    /// Host function, wrapped into a new callback on conversion
    Function(HostFn),
}

impl Value {
    /// Wrap a host closure; it becomes a foreign callable when converted
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Kwargs, Vec<Value>) -> Result<Value> + 'static,
    {
        Self::Function(Rc::new(f))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::BigInt(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Object(_) => "object",
            Self::Callback(_) => "callback",
            Self::Function(_) => "function",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::BigInt(i) => i64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int(i) => Some(i128::from(*i)),
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Items of a list, tuple or set
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) | Self::Tuple(items) | Self::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Value stored under `key` in a dict
    pub fn get(&self, key: impl Into<Value>) -> Option<&Value> {
        let key = key.into();
        match self {
            Self::Dict(pairs) => pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Object(proxy) => Some(proxy),
            _ => None,
        }
    }
}

fn unordered_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => unordered_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.iter().any(|(k2, v2)| k == k2 && v == v2))
            }
            (Self::Object(a), Self::Object(b)) => a.object().is(b.object()),
            (Self::Callback(a), Self::Callback(b)) => a.is(b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Int(i) => write!(f, "Int({})", i),
            Self::BigInt(i) => write!(f, "BigInt({})", i),
            Self::Float(x) => write!(f, "Float({})", x),
            Self::Str(s) => write!(f, "Str({:?})", s),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Self::Dict(pairs) => f.debug_map().entries(pairs.iter().map(|(k, v)| (k, v))).finish(),
            Self::Set(items) => f.debug_set().entries(items).finish(),
            Self::Object(proxy) => write!(f, "Object({:?})", proxy),
            Self::Callback(object) => write!(f, "Callback({:?})", object.handle()),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

// ---- host conversions -----------------------------------------------------

macro_rules! value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::Int(i64::from(value))
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! value_from_wide_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    match i64::try_from(value) {
                        Ok(small) => Self::Int(small),
                        Err(_) => Self::BigInt(value as i128),
                    }
                }
            }
        )*
    };
}

value_from_wide_int!(u64, usize, isize, i128);

impl TryFrom<u128> for Value {
    type Error = Error;

    fn try_from(value: u128) -> Result<Self> {
        i128::try_from(value)
            .map(Value::from)
            .map_err(|_| Error::UnsupportedType("u128 above i128::MAX"))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::None
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Self::Str(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::None, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<Value>, V: Into<Value>> From<HashMap<K, V>> for Value {
    fn from(map: HashMap<K, V>) -> Self {
        Self::Dict(map.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<Value>, V: Into<Value>> From<BTreeMap<K, V>> for Value {
    fn from(map: BTreeMap<K, V>) -> Self {
        Self::Dict(map.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<T: Into<Value>> From<HashSet<T>> for Value {
    fn from(set: HashSet<T>) -> Self {
        Self::Set(set.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeSet<T>> for Value {
    fn from(set: BTreeSet<T>) -> Self {
        Self::Set(set.into_iter().map(Into::into).collect())
    }
}

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Value {
    fn from((a, b): (A, B)) -> Self {
        Self::Tuple(vec![a.into(), b.into()])
    }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>> From<(A, B, C)> for Value {
    fn from((a, b, c): (A, B, C)) -> Self {
        Self::Tuple(vec![a.into(), b.into(), c.into()])
    }
}

impl From<PyObject> for Value {
    fn from(object: PyObject) -> Self {
        Self::Object(Proxy::new(object))
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Self::Object(proxy)
    }
}

impl From<&Callback> for Value {
    fn from(callback: &Callback) -> Self {
        Self::Callback(callback.object().clone())
    }
}

// ---- host to foreign --------------------------------------------------------

/// Convert a host value into an owned foreign object
pub(crate) fn to_object(ctx: &Rc<Context>, value: Value) -> Result<PyObject> {
    let api = ctx.api();
    let kind = value.kind_name();

    let object = match value {
        Value::None => PyObject::borrowed(ctx, ctx.none_handle()).owned(),
        Value::Bool(b) => PyObject::from_new(ctx, api.bool_from_long(i64::from(b)), "PyBool_FromLong")?,
        Value::Int(i) => PyObject::from_new(ctx, api.long_from_i64(i), "PyLong_FromLongLong")?,
        Value::BigInt(i) => match i64::try_from(i) {
            Ok(small) => PyObject::from_new(ctx, api.long_from_i64(small), "PyLong_FromLongLong")?,
            Err(_) => {
                let digits = CString::new(i.to_string())
                    .map_err(|_| Error::UnsupportedType("int"))?;
                PyObject::from_new(ctx, api.long_from_str(&digits, 10), "PyLong_FromString")?
            }
        },
        Value::Float(f) => PyObject::from_new(ctx, api.float_from_f64(f), "PyFloat_FromDouble")?,
        Value::Str(s) => PyObject::from_new(ctx, api.unicode_from_str(&s), "PyUnicode_DecodeUTF8")?,
        Value::List(items) => {
            let list = PyObject::from_new(ctx, api.list_new(items.len() as isize), "PyList_New")?;
            for (i, item) in items.into_iter().enumerate() {
                let item = to_object(ctx, item)?;
                let status = api.list_set_item(list.handle(), i as isize, item.into_raw());
                check_status(ctx, status, || Error::NullResult("PyList_SetItem"))?;
            }
            list
        }
        Value::Tuple(items) => {
            let tuple = PyObject::from_new(ctx, api.tuple_new(items.len() as isize), "PyTuple_New")?;
            for (i, item) in items.into_iter().enumerate() {
                let item = to_object(ctx, item)?;
                let status = api.tuple_set_item(tuple.handle(), i as isize, item.into_raw());
                check_status(ctx, status, || Error::NullResult("PyTuple_SetItem"))?;
            }
            tuple
        }
        Value::Dict(pairs) => {
            let dict = PyObject::from_new(ctx, api.dict_new(), "PyDict_New")?;
            for (key, value) in pairs {
                let key = to_object(ctx, key)?;
                let value = to_object(ctx, value)?;
                let status = api.dict_set_item(dict.handle(), key.handle(), value.handle());
                check_status(ctx, status, || Error::NullResult("PyDict_SetItem"))?;
            }
            dict
        }
        Value::Set(items) => {
            let set = PyObject::from_new(ctx, api.set_new(Handle::NULL), "PySet_New")?;
            for item in items {
                let item = to_object(ctx, item)?;
                let status = api.set_add(set.handle(), item.handle());
                check_status(ctx, status, || Error::NullResult("PySet_Add"))?;
            }
            set
        }
        Value::Object(proxy) => same_context(ctx, proxy.into_object())?,
        Value::Callback(object) => same_context(ctx, object)?,
        Value::Function(f) => Callback::new(ctx, "host_function", f)?.leak(),
    };

    log_conversion(kind, "PyObject");
    Ok(object)
}

fn same_context(ctx: &Rc<Context>, object: PyObject) -> Result<PyObject> {
    if Rc::ptr_eq(object.context(), ctx) {
        Ok(object)
    } else {
        Err(Error::UnsupportedType("object from another interpreter context"))
    }
}

// ---- foreign to host --------------------------------------------------------

/// Exact built-in kind of a foreign object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    None,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Set,
    Other,
}

pub(crate) fn kind_of(ctx: &Rc<Context>, handle: Handle) -> Kind {
    let builtins = ctx.builtins();
    if handle == builtins.none {
        return Kind::None;
    }

    let ty = ctx.api().object_type(handle);
    if ty.is_null() {
        ctx.api().err_clear();
        return Kind::Other;
    }
    let ty = PyObject::steal(ctx, ty);

    match ty.handle() {
        h if h == builtins.bool => Kind::Bool,
        h if h == builtins.int => Kind::Int,
        h if h == builtins.float => Kind::Float,
        h if h == builtins.str => Kind::Str,
        h if h == builtins.list => Kind::List,
        h if h == builtins.tuple => Kind::Tuple,
        h if h == builtins.dict => Kind::Dict,
        h if h == builtins.set => Kind::Set,
        _ => Kind::Other,
    }
}

impl PyObject {
    /// Convert to the closest host value
    pub fn value_of(&self) -> Result<Value> {
        let kind = kind_of(self.context(), self.handle());
        let value = match kind {
            Kind::None => Value::None,
            Kind::Bool => Value::Bool(self.as_bool()?),
            Kind::Int => self.int_value()?,
            Kind::Float => Value::Float(self.as_f64()?),
            Kind::Str => Value::Str(self.as_string()?),
            Kind::List => Value::List(self.as_list()?),
            Kind::Tuple => Value::Tuple(self.as_tuple()?),
            Kind::Dict => Value::Dict(self.as_dict()?),
            Kind::Set => Value::Set(self.as_set()?),
            Kind::Other => Value::Object(self.clone().into_proxy()),
        };
        log_conversion("PyObject", value.kind_name());
        Ok(value)
    }

    fn int_value(&self) -> Result<Value> {
        let api = self.context().api();
        let small = api.long_as_i64(self.handle());
        if small != -1 || api.err_occurred().is_null() {
            return Ok(Value::Int(small));
        }
        api.err_clear();

        let digits = self.str()?;
        Ok(match digits.parse::<i128>() {
            Ok(big) => Value::BigInt(big),
            Err(_) => Value::Object(self.clone().into_proxy()),
        })
    }

    /// Foreign truthiness
    pub fn as_bool(&self) -> Result<bool> {
        let status = self.context().api().is_true(self.handle());
        if status < 0 {
            check(self.context())?;
            return Err(Error::NullResult("PyObject_IsTrue"));
        }
        Ok(status == 1)
    }

    /// Integer value; raises the foreign `OverflowError` outside i64
    pub fn as_i64(&self) -> Result<i64> {
        let api = self.context().api();
        let value = api.long_as_i64(self.handle());
        if value == -1 && !api.err_occurred().is_null() {
            check(self.context())?;
        }
        Ok(value)
    }

    pub fn as_i128(&self) -> Result<i128> {
        match self.int_value()? {
            Value::Int(i) => Ok(i128::from(i)),
            Value::BigInt(i) => Ok(i),
            _ => Err(Error::Conversion {
                expected: "int within i128",
                found: self.type_name(),
            }),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        let api = self.context().api();
        let value = api.float_as_f64(self.handle());
        if value == -1.0 && !api.err_occurred().is_null() {
            check(self.context())?;
        }
        Ok(value)
    }

    /// Contents of a foreign `str`
    pub fn as_string(&self) -> Result<String> {
        match self.context().api().unicode_as_string(self.handle()) {
            Some(text) => Ok(text),
            None => {
                check(self.context())?;
                Err(Error::Conversion {
                    expected: "str",
                    found: self.type_name(),
                })
            }
        }
    }

    /// Elements of any iterable; lists and tuples are read by index
    pub fn as_list(&self) -> Result<Vec<Value>> {
        let ctx = self.context();
        let api = ctx.api();
        match kind_of(ctx, self.handle()) {
            Kind::List => {
                let len = api.list_size(self.handle());
                let mut out = Vec::with_capacity(len.max(0) as usize);
                for i in 0..len {
                    let item = check_handle(ctx, api.list_get_item(self.handle(), i), || {
                        Error::NullResult("PyList_GetItem")
                    })?;
                    out.push(PyObject::borrowed(ctx, item).value_of()?);
                }
                Ok(out)
            }
            Kind::Tuple => self.as_tuple(),
            _ => self.iter()?.map(|item| item?.value_of()).collect(),
        }
    }

    pub fn as_tuple(&self) -> Result<Vec<Value>> {
        let ctx = self.context();
        let api = ctx.api();
        if kind_of(ctx, self.handle()) != Kind::Tuple {
            return self.as_list();
        }

        let len = api.tuple_size(self.handle());
        let mut out = Vec::with_capacity(len.max(0) as usize);
        for i in 0..len {
            let item = check_handle(ctx, api.tuple_get_item(self.handle(), i), || {
                Error::NullResult("PyTuple_GetItem")
            })?;
            out.push(PyObject::borrowed(ctx, item).value_of()?);
        }
        Ok(out)
    }

    /// Key/value pairs of an exact `dict`
    pub fn as_dict(&self) -> Result<Vec<(Value, Value)>> {
        let ctx = self.context();
        let api = ctx.api();
        if kind_of(ctx, self.handle()) != Kind::Dict {
            return Err(Error::Conversion {
                expected: "dict",
                found: self.type_name(),
            });
        }

        let keys = PyObject::from_new(ctx, api.dict_keys(self.handle()), "PyDict_Keys")?;
        let len = api.list_size(keys.handle());
        let mut out = Vec::with_capacity(len.max(0) as usize);
        for i in 0..len {
            let key = api.list_get_item(keys.handle(), i);
            if key.is_null() {
                check(ctx)?;
                continue;
            }
            let value = api.dict_get_item(self.handle(), key);
            if value.is_null() {
                continue;
            }
            out.push((
                PyObject::borrowed(ctx, key).value_of()?,
                PyObject::borrowed(ctx, value).value_of()?,
            ));
        }
        Ok(out)
    }

    /// Dict with string keys, as handed to host functions
    pub fn as_kwargs(&self) -> Result<Kwargs> {
        self.as_dict()?
            .into_iter()
            .map(|(key, value)| match key {
                Value::Str(name) => Ok((name, value)),
                other => Err(Error::Conversion {
                    expected: "str keyword",
                    found: other.kind_name().to_string(),
                }),
            })
            .collect()
    }

    pub fn as_set(&self) -> Result<Vec<Value>> {
        self.iter()?.map(|item| item?.value_of()).collect()
    }
}
