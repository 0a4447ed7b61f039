//! In-memory interpreter implementing [`ForeignApi`] for unit tests
//!
//! Objects live in a slot heap and a handle is the slot index plus one.
//! Freed slots are tombstoned, never reused, so any use after free or
//! refcount underflow panics. Types, singletons and modules are immortal.
//!
//! Code objects do not parse anything: `compile_string` looks the source up in
//! the scripts registered with [`FakePython::script`] and evaluation runs the
//! registered closure against the target namespace.

use super::{CompareOp, ForeignApi, Handle, LockState, MethodDef};
use crate::runtime::Python;
use core::ffi::{c_int, c_void};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CStr;
use std::rc::Rc;

/// Native function: borrowed positional and keyword arguments, `None` when it raised
pub(crate) type NativeImpl = Rc<dyn Fn(&FakePython, &[Handle], &[(String, Handle)]) -> Option<Handle>>;

/// Body of a registered code object; `false` when it raised
pub(crate) type Script = Rc<dyn Fn(&FakePython, Handle) -> bool>;

#[derive(Clone)]
enum Obj {
    None,
    Ellipsis,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    List(Vec<Handle>),
    Tuple(Vec<Handle>),
    Dict(Vec<(Handle, Handle)>),
    Set(Vec<Handle>),
    Type { name: String, base: Handle, user: bool },
    Module { name: String, dict: Handle },
    Instance,
    Native { name: String, f: NativeImpl },
    CFunction { def: *mut MethodDef, slf: Handle },
    Capsule,
    Iter { items: Vec<Handle>, pos: usize },
    Slice { start: Handle, stop: Handle, step: Handle },
    Exception { message: String },
    Traceback { frames: Vec<String> },
    Code { source: String },
    Matrix(Vec<Vec<i64>>),
}

impl Obj {
    fn children(&self) -> Vec<Handle> {
        match self {
            Obj::List(items) | Obj::Tuple(items) | Obj::Set(items) => items.clone(),
            Obj::Iter { items, .. } => items.clone(),
            Obj::Dict(pairs) => pairs.iter().flat_map(|(k, v)| [*k, *v]).collect(),
            Obj::Module { dict, .. } => vec![*dict],
            Obj::CFunction { slf, .. } => vec![*slf],
            Obj::Slice { start, stop, step } => vec![*start, *stop, *step],
            _ => Vec::new(),
        }
    }
}

struct Slot {
    refcnt: isize,
    class: Handle,
    attrs: Vec<(String, Handle)>,
    obj: Obj,
    immortal: bool,
    freed: bool,
}

/// Handles of the built-in types
pub(crate) struct Types {
    pub(crate) type_: Handle,
    pub(crate) object: Handle,
    pub(crate) none: Handle,
    pub(crate) bool: Handle,
    pub(crate) int: Handle,
    pub(crate) float: Handle,
    pub(crate) str: Handle,
    pub(crate) list: Handle,
    pub(crate) tuple: Handle,
    pub(crate) dict: Handle,
    pub(crate) set: Handle,
    pub(crate) module: Handle,
    pub(crate) function: Handle,
    pub(crate) capsule: Handle,
    pub(crate) iterator: Handle,
    pub(crate) slice: Handle,
    pub(crate) ellipsis: Handle,
    pub(crate) traceback: Handle,
    pub(crate) code: Handle,
    pub(crate) matrix: Handle,
    pub(crate) exception: Handle,
    pub(crate) runtime_error: Handle,
    pub(crate) zero_division: Handle,
    pub(crate) type_error: Handle,
    pub(crate) lookup_error: Handle,
    pub(crate) key_error: Handle,
    pub(crate) index_error: Handle,
    pub(crate) attribute_error: Handle,
    pub(crate) value_error: Handle,
    pub(crate) overflow_error: Handle,
    pub(crate) module_not_found: Handle,
    pub(crate) syntax_error: Handle,
    pub(crate) system_error: Handle,
}

pub(crate) struct FakePython {
    heap: RefCell<Vec<Slot>>,
    error: RefCell<Option<(Handle, Handle, Handle)>>,
    increfs: Cell<usize>,
    decrefs: Cell<usize>,
    decref_log: RefCell<HashMap<usize, usize>>,
    scripts: RefCell<HashMap<String, Script>>,
    modules: RefCell<HashMap<String, Handle>>,
    lock_depth: Cell<i32>,
    initialized: Cell<bool>,
    pub(crate) types: Types,
    none: Handle,
    true_: Handle,
    false_: Handle,
    ellipsis: Handle,
    builtins: Handle,
}

fn handle_at(index: usize) -> Handle {
    Handle::from_raw((index + 1) as *mut c_void)
}

fn index_of(handle: Handle) -> usize {
    assert!(!handle.is_null(), "null handle passed to the fake interpreter");
    handle.addr() - 1
}

fn push(heap: &mut Vec<Slot>, class: Handle, obj: Obj, immortal: bool) -> Handle {
    heap.push(Slot {
        refcnt: 1,
        class,
        attrs: Vec::new(),
        obj,
        immortal,
        freed: false,
    });
    handle_at(heap.len() - 1)
}

/// Python facade bound to a fresh fake interpreter
pub(crate) fn interpreter() -> (Python, Rc<FakePython>) {
    let fake = FakePython::new();
    let py = match Python::from_api(fake.clone()) {
        Ok(py) => py,
        Err(err) => panic!("fake interpreter rejected: {}", err),
    };
    (py, fake)
}

impl FakePython {
    pub(crate) fn new() -> Rc<Self> {
        let mut heap = Vec::with_capacity(256);

        let type_ = push(&mut heap, Handle::NULL, Obj::None, true);
        heap[0].class = type_;
        let object = push(&mut heap, type_, Obj::None, true);
        heap[0].obj = Obj::Type { name: "type".into(), base: object, user: false };
        heap[1].obj = Obj::Type { name: "object".into(), base: Handle::NULL, user: false };

        let mut ty = |name: &str, base: Handle| {
            push(&mut heap, type_, Obj::Type { name: name.into(), base, user: false }, true)
        };
        let int = ty("int", object);
        let base_exception = ty("BaseException", object);
        let exception = ty("Exception", base_exception);
        let lookup_error = ty("LookupError", exception);
        let types = Types {
            type_,
            object,
            none: ty("NoneType", object),
            bool: ty("bool", int),
            int,
            float: ty("float", object),
            str: ty("str", object),
            list: ty("list", object),
            tuple: ty("tuple", object),
            dict: ty("dict", object),
            set: ty("set", object),
            module: ty("module", object),
            function: ty("builtin_function_or_method", object),
            capsule: ty("PyCapsule", object),
            iterator: ty("iterator", object),
            slice: ty("slice", object),
            ellipsis: ty("ellipsis", object),
            traceback: ty("traceback", object),
            code: ty("code", object),
            matrix: ty("matrix", object),
            exception,
            runtime_error: ty("RuntimeError", exception),
            zero_division: ty("ZeroDivisionError", exception),
            type_error: ty("TypeError", exception),
            lookup_error,
            key_error: ty("KeyError", lookup_error),
            index_error: ty("IndexError", lookup_error),
            attribute_error: ty("AttributeError", exception),
            value_error: ty("ValueError", exception),
            overflow_error: ty("OverflowError", exception),
            module_not_found: ty("ModuleNotFoundError", exception),
            syntax_error: ty("SyntaxError", exception),
            system_error: ty("SystemError", exception),
        };

        let none = push(&mut heap, types.none, Obj::None, true);
        let true_ = push(&mut heap, types.bool, Obj::Bool(true), true);
        let false_ = push(&mut heap, types.bool, Obj::Bool(false), true);
        let ellipsis = push(&mut heap, types.ellipsis, Obj::Ellipsis, true);
        let builtins = push(&mut heap, types.dict, Obj::Dict(Vec::new()), true);

        let fake = Self {
            heap: RefCell::new(heap),
            error: RefCell::new(None),
            increfs: Cell::new(0),
            decrefs: Cell::new(0),
            decref_log: RefCell::new(HashMap::new()),
            scripts: RefCell::new(HashMap::new()),
            modules: RefCell::new(HashMap::new()),
            lock_depth: Cell::new(0),
            initialized: Cell::new(true),
            types,
            none,
            true_,
            false_,
            ellipsis,
            builtins,
        };
        fake.install_builtins();
        fake.install_traceback();
        Rc::new(fake)
    }

    fn install_builtins(&self) {
        let t = &self.types;
        let entries = [
            ("None", self.none),
            ("Ellipsis", self.ellipsis),
            ("True", self.true_),
            ("False", self.false_),
            ("type", t.type_),
            ("object", t.object),
            ("bool", t.bool),
            ("int", t.int),
            ("float", t.float),
            ("str", t.str),
            ("list", t.list),
            ("tuple", t.tuple),
            ("dict", t.dict),
            ("set", t.set),
            ("Exception", t.exception),
            ("RuntimeError", t.runtime_error),
            ("ZeroDivisionError", t.zero_division),
            ("TypeError", t.type_error),
            ("LookupError", t.lookup_error),
            ("KeyError", t.key_error),
            ("IndexError", t.index_error),
            ("AttributeError", t.attribute_error),
            ("ValueError", t.value_error),
            ("OverflowError", t.overflow_error),
            ("ModuleNotFoundError", t.module_not_found),
            ("SyntaxError", t.syntax_error),
        ];
        for (name, value) in entries {
            self.dict_store(self.builtins, name, value);
        }

        let module = self.alloc(self.types.module, Obj::Module { name: "builtins".into(), dict: self.builtins });
        self.make_immortal(module);
        self.modules.borrow_mut().insert("builtins".into(), module);
    }

    fn install_traceback(&self) {
        let module = self.module("traceback");
        let format_tb = self.native("format_tb", |fake, args, _| {
            let frames = match args.first().map(|h| fake.obj(*h)) {
                Some(Obj::Traceback { frames }) => frames,
                _ => Vec::new(),
            };
            let lines = frames
                .iter()
                .map(|frame| fake.new_str(&format!("  File \"<string>\", line 1, in {}\n", frame)))
                .collect();
            Some(fake.new_list(lines))
        });
        self.set_global(module, "format_tb", format_tb);
    }

    // ---- heap -----------------------------------------------------------

    fn alloc(&self, class: Handle, obj: Obj) -> Handle {
        push(&mut self.heap.borrow_mut(), class, obj, false)
    }

    fn make_immortal(&self, handle: Handle) {
        self.heap.borrow_mut()[index_of(handle)].immortal = true;
    }

    fn slot<R>(&self, handle: Handle, f: impl FnOnce(&Slot) -> R) -> R {
        let heap = self.heap.borrow();
        let slot = &heap[index_of(handle)];
        assert!(!slot.freed, "use after free of {:?}", handle);
        f(slot)
    }

    fn slot_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut heap = self.heap.borrow_mut();
        let slot = &mut heap[index_of(handle)];
        assert!(!slot.freed, "use after free of {:?}", handle);
        f(slot)
    }

    fn obj(&self, handle: Handle) -> Obj {
        self.slot(handle, |s| s.obj.clone())
    }

    fn class_of(&self, handle: Handle) -> Handle {
        self.slot(handle, |s| s.class)
    }

    fn inc(&self, handle: Handle) {
        if handle.is_null() {
            return;
        }
        self.slot_mut(handle, |s| {
            if !s.immortal {
                s.refcnt += 1;
            }
        });
    }

    fn dec(&self, handle: Handle) {
        if handle.is_null() {
            return;
        }
        let free = self.slot_mut(handle, |s| {
            if s.immortal {
                return false;
            }
            s.refcnt -= 1;
            assert!(s.refcnt >= 0, "refcount underflow on {:?}", handle);
            s.refcnt == 0
        });
        if free {
            self.free(handle);
        }
    }

    fn free(&self, handle: Handle) {
        let (obj, attrs) = self.slot_mut(handle, |s| {
            s.freed = true;
            (std::mem::replace(&mut s.obj, Obj::None), std::mem::take(&mut s.attrs))
        });
        for child in obj.children() {
            self.dec(child);
        }
        for (_, value) in attrs {
            self.dec(value);
        }
    }

    // ---- inspection for tests -------------------------------------------

    pub(crate) fn increfs(&self) -> usize {
        self.increfs.get()
    }

    pub(crate) fn decrefs(&self) -> usize {
        self.decrefs.get()
    }

    /// Decrefs issued through the entry point table for one handle
    pub(crate) fn decrefs_of(&self, handle: Handle) -> usize {
        self.decref_log.borrow().get(&handle.addr()).copied().unwrap_or(0)
    }

    pub(crate) fn refcount(&self, handle: Handle) -> isize {
        self.heap.borrow()[index_of(handle)].refcnt
    }

    pub(crate) fn is_freed(&self, handle: Handle) -> bool {
        self.heap.borrow()[index_of(handle)].freed
    }

    /// Mortal objects still alive
    pub(crate) fn live_objects(&self) -> usize {
        self.heap.borrow().iter().filter(|s| !s.immortal && !s.freed).count()
    }

    pub(crate) fn lock_depth(&self) -> i32 {
        self.lock_depth.get()
    }

    pub(crate) fn set_initialized(&self, initialized: bool) {
        self.initialized.set(initialized);
    }

    pub(crate) fn error_pending(&self) -> bool {
        self.error.borrow().is_some()
    }

    pub(crate) fn type_name(&self, handle: Handle) -> String {
        match self.obj(self.class_of(handle)) {
            Obj::Type { name, .. } => name,
            _ => "object".to_string(),
        }
    }

    pub(crate) fn int_value(&self, handle: Handle) -> Option<i128> {
        match self.obj(handle) {
            Obj::Int(i) => Some(i),
            Obj::Bool(b) => Some(i128::from(b)),
            _ => None,
        }
    }

    pub(crate) fn str_value(&self, handle: Handle) -> Option<String> {
        match self.obj(handle) {
            Obj::Str(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn repr(&self, handle: Handle) -> String {
        self.render_repr(handle)
    }

    // ---- construction for tests -----------------------------------------

    /// Register the body run when `source` is evaluated
    pub(crate) fn script(&self, source: &str, f: impl Fn(&FakePython, Handle) -> bool + 'static) {
        self.scripts.borrow_mut().insert(source.to_string(), Rc::new(f));
    }

    /// New reference to `None`
    pub(crate) fn none_ref(&self) -> Handle {
        self.none
    }

    pub(crate) fn new_int(&self, value: i128) -> Handle {
        self.alloc(self.types.int, Obj::Int(value))
    }

    pub(crate) fn new_str(&self, value: &str) -> Handle {
        self.alloc(self.types.str, Obj::Str(value.to_string()))
    }

    /// Steals `items`
    pub(crate) fn new_list(&self, items: Vec<Handle>) -> Handle {
        self.alloc(self.types.list, Obj::List(items))
    }

    pub(crate) fn new_matrix(&self, rows: Vec<Vec<i64>>) -> Handle {
        self.alloc(self.types.matrix, Obj::Matrix(rows))
    }

    /// New native function object
    pub(crate) fn native(
        &self,
        name: &str,
        f: impl Fn(&FakePython, &[Handle], &[(String, Handle)]) -> Option<Handle> + 'static,
    ) -> Handle {
        self.alloc(self.types.function, Obj::Native { name: name.to_string(), f: Rc::new(f) })
    }

    /// New user class deriving from `base`
    pub(crate) fn new_class(&self, name: &str, base: Handle) -> Handle {
        let class = self.alloc(self.types.type_, Obj::Type { name: name.to_string(), base, user: true });
        self.make_immortal(class);
        class
    }

    /// Store an attribute on a class or instance, stealing `value`
    pub(crate) fn set_attribute(&self, target: Handle, name: &str, value: Handle) {
        let old = self.slot_mut(target, |s| match s.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                s.attrs.push((name.to_string(), value));
                None
            }
        });
        if let Some(old) = old {
            self.dec(old);
        }
    }

    /// Instance of a user class; `dict` subclasses start with `pairs`
    pub(crate) fn new_instance(&self, class: Handle, pairs: Vec<(Handle, Handle)>) -> Handle {
        let obj = if self.is_subclass(class, self.types.dict) {
            Obj::Dict(pairs)
        } else if self.is_subclass(class, self.types.int) {
            Obj::Int(0)
        } else {
            Obj::Instance
        };
        self.alloc(class, obj)
    }

    /// Drop a name from the builtins namespace
    pub(crate) fn remove_builtin(&self, name: &str) {
        let key = self.new_str(name);
        let position = self.dict_find(self.builtins, key);
        self.dec(key);
        let removed = self.slot_mut(self.builtins, |s| match (&mut s.obj, position) {
            (Obj::Dict(pairs), Some(i)) => Some(pairs.remove(i)),
            _ => None,
        });
        if let Some((key, value)) = removed {
            self.dec(key);
            self.dec(value);
        }
    }

    /// Module by name, created on first use (borrowed)
    pub(crate) fn module(&self, name: &str) -> Handle {
        if let Some(module) = self.modules.borrow().get(name) {
            return *module;
        }
        self.create_module(name)
    }

    fn create_module(&self, name: &str) -> Handle {
        let dict = self.alloc(self.types.dict, Obj::Dict(Vec::new()));
        let module_name = self.new_str(name);
        self.dict_store(dict, "__name__", module_name);
        self.dec(module_name);
        let module = self.alloc(self.types.module, Obj::Module { name: name.to_string(), dict });
        self.make_immortal(module);
        self.modules.borrow_mut().insert(name.to_string(), module);
        module
    }

    fn namespace(&self, target: Handle) -> Handle {
        match self.obj(target) {
            Obj::Module { dict, .. } => dict,
            _ => target,
        }
    }

    /// Bind `name` in a module or namespace dict, stealing `value`
    pub(crate) fn set_global(&self, target: Handle, name: &str, value: Handle) {
        self.dict_store(self.namespace(target), name, value);
        self.dec(value);
    }

    /// Borrowed lookup of `name` in a module or namespace dict
    pub(crate) fn global(&self, target: Handle, name: &str) -> Option<Handle> {
        self.dict_lookup(self.namespace(target), name)
    }

    /// Call `callable` with owned `args` (stolen); new reference or null
    pub(crate) fn call_object(&self, callable: Handle, args: Vec<Handle>, kwargs: Vec<(&str, Handle)>) -> Handle {
        let tuple = self.alloc(self.types.tuple, Obj::Tuple(args));
        let dict = if kwargs.is_empty() {
            Handle::NULL
        } else {
            let dict = self.alloc(self.types.dict, Obj::Dict(Vec::new()));
            for (name, value) in kwargs {
                self.dict_store(dict, name, value);
                self.dec(value);
            }
            dict
        };
        let result = self.call(callable, tuple, dict);
        self.dec(tuple);
        self.dec(dict);
        result
    }

    // ---- raising --------------------------------------------------------

    fn set_error(&self, ty: Handle, value: Handle, traceback: Handle) {
        let old = self.error.borrow_mut().replace((ty, value, traceback));
        if let Some((t, v, tb)) = old {
            self.dec(t);
            self.dec(v);
            self.dec(tb);
        }
    }

    pub(crate) fn raise(&self, ty: Handle, message: &str) {
        let value = self.alloc(ty, Obj::Exception { message: message.to_string() });
        self.set_error(ty, value, Handle::NULL);
    }

    pub(crate) fn raise_with_traceback(&self, ty: Handle, message: &str, frames: &[&str]) {
        let value = self.alloc(ty, Obj::Exception { message: message.to_string() });
        let frames = frames.iter().map(|f| f.to_string()).collect();
        let tb = self.alloc(self.types.traceback, Obj::Traceback { frames });
        self.set_error(ty, value, tb);
    }

    fn type_error<T>(&self, message: String) -> Option<T> {
        self.raise(self.types.type_error, &message);
        None
    }

    // ---- object semantics -----------------------------------------------

    fn is_subclass(&self, class: Handle, target: Handle) -> bool {
        let mut current = class;
        loop {
            if current == target {
                return true;
            }
            match self.obj(current) {
                Obj::Type { base, .. } if !base.is_null() => current = base,
                _ => return false,
            }
        }
    }

    fn is_user_class(&self, class: Handle) -> bool {
        matches!(self.obj(class), Obj::Type { user: true, .. })
    }

    fn eq(&self, a: Handle, b: Handle) -> bool {
        if a == b {
            return true;
        }
        match (self.obj(a), self.obj(b)) {
            (Obj::Str(x), Obj::Str(y)) => x == y,
            (Obj::Float(x), Obj::Float(y)) => x == y,
            (Obj::List(x), Obj::List(y)) | (Obj::Tuple(x), Obj::Tuple(y)) => {
                x.len() == y.len() && x.iter().zip(&y).all(|(p, q)| self.eq(*p, *q))
            }
            (Obj::Set(x), Obj::Set(y)) => {
                x.len() == y.len() && x.iter().all(|p| y.iter().any(|q| self.eq(*p, *q)))
            }
            (Obj::Dict(x), Obj::Dict(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, v)| y.iter().any(|(k2, v2)| self.eq(*k, *k2) && self.eq(*v, *v2)))
            }
            (Obj::Float(x), _) => self.int_value(b).map_or(false, |y| x == y as f64),
            (_, Obj::Float(y)) => self.int_value(a).map_or(false, |x| x as f64 == y),
            _ => match (self.int_value(a), self.int_value(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    fn number(&self, handle: Handle) -> Option<f64> {
        match self.obj(handle) {
            Obj::Float(f) => Some(f),
            _ => self.int_value(handle).map(|i| i as f64),
        }
    }

    fn dict_lookup(&self, dict: Handle, name: &str) -> Option<Handle> {
        match self.obj(dict) {
            Obj::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| self.str_value(*k).as_deref() == Some(name))
                .map(|(_, v)| *v),
            _ => None,
        }
    }

    fn dict_find(&self, dict: Handle, key: Handle) -> Option<usize> {
        match self.obj(dict) {
            Obj::Dict(pairs) => pairs.iter().position(|(k, _)| self.eq(*k, key)),
            _ => None,
        }
    }

    /// Insert or replace; takes new references to key and value
    fn dict_insert(&self, dict: Handle, key: Handle, value: Handle) {
        let position = self.dict_find(dict, key);
        self.inc(value);
        let old = self.slot_mut(dict, |s| match &mut s.obj {
            Obj::Dict(pairs) => match position {
                Some(i) => Some(std::mem::replace(&mut pairs[i].1, value)),
                None => {
                    pairs.push((key, value));
                    None
                }
            },
            _ => None,
        });
        match old {
            Some(old) => self.dec(old),
            None => self.inc(key),
        }
    }

    fn dict_store(&self, dict: Handle, name: &str, value: Handle) {
        let key = self.new_str(name);
        self.dict_insert(dict, key, value);
        self.dec(key);
    }

    fn lookup_attr(&self, obj: Handle, name: &str) -> Option<Handle> {
        let own = self.slot(obj, |s| s.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| *v));
        if let Some(found) = own {
            self.inc(found);
            return Some(found);
        }

        match self.obj(obj) {
            Obj::Module { dict, .. } => {
                if let Some(found) = self.dict_lookup(dict, name) {
                    self.inc(found);
                    return Some(found);
                }
            }
            Obj::Type { name: type_name, .. } if name == "__name__" => {
                return Some(self.new_str(&type_name));
            }
            Obj::Exception { message } if name == "args" => {
                let message = self.new_str(&message);
                return Some(self.alloc(self.types.tuple, Obj::Tuple(vec![message])));
            }
            _ => {}
        }

        let mut class = self.class_of(obj);
        loop {
            let found = self.slot(class, |s| s.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| *v));
            if let Some(found) = found {
                self.inc(found);
                return Some(found);
            }
            match self.obj(class) {
                Obj::Type { base, .. } if !base.is_null() => class = base,
                _ => return None,
            }
        }
    }

    fn render_repr(&self, handle: Handle) -> String {
        let join = |items: &[Handle]| items.iter().map(|h| self.render_repr(*h)).collect::<Vec<_>>().join(", ");
        match self.obj(handle) {
            Obj::None => "None".into(),
            Obj::Ellipsis => "Ellipsis".into(),
            Obj::Bool(true) => "True".into(),
            Obj::Bool(false) => "False".into(),
            Obj::Int(i) => i.to_string(),
            Obj::Float(f) if f.is_finite() && f.fract() == 0.0 => format!("{:.1}", f),
            Obj::Float(f) => f.to_string(),
            Obj::Str(s) => format!("'{}'", s),
            Obj::List(items) => format!("[{}]", join(&items)),
            Obj::Tuple(items) if items.len() == 1 => format!("({},)", join(&items)),
            Obj::Tuple(items) => format!("({})", join(&items)),
            Obj::Set(items) if items.is_empty() => "set()".into(),
            Obj::Set(items) => format!("{{{}}}", join(&items)),
            Obj::Dict(pairs) => {
                let body = pairs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.render_repr(*k), self.render_repr(*v)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{}}}", body)
            }
            Obj::Type { name, .. } => format!("<class '{}'>", name),
            Obj::Module { name, .. } => format!("<module '{}'>", name),
            Obj::Native { name, .. } => format!("<built-in function {}>", name),
            Obj::CFunction { .. } => "<built-in function callback>".into(),
            Obj::Exception { message } => format!("{}('{}')", self.type_name(handle), message),
            Obj::Matrix(rows) => format!("matrix({:?})", rows),
            _ => format!("<{} object>", self.type_name(handle)),
        }
    }

    fn render_str(&self, handle: Handle) -> String {
        match self.obj(handle) {
            Obj::Str(s) => s,
            Obj::Exception { message } => message,
            _ => self.render_repr(handle),
        }
    }

    fn optional_int(&self, handle: Handle) -> Option<Option<i64>> {
        if handle.is_null() || handle == self.none {
            return Some(None);
        }
        self.int_value(handle).map(|i| Some(i as i64))
    }

    /// Python slice semantics over a sequence of `len` elements
    fn slice_indices(&self, start: Handle, stop: Handle, step: Handle, len: usize) -> Option<Vec<usize>> {
        let (Some(start), Some(stop), Some(step)) =
            (self.optional_int(start), self.optional_int(stop), self.optional_int(step))
        else {
            return self.type_error("slice indices must be integers or None".into());
        };
        let step = step.unwrap_or(1);
        if step == 0 {
            self.raise(self.types.value_error, "slice step cannot be zero");
            return None;
        }

        let len = len as i64;
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |bound: Option<i64>, default: i64| match bound {
            None => default,
            Some(v) if v < 0 => (v + len).max(lower),
            Some(v) => v.min(upper),
        };
        let mut i = clamp(start, if step < 0 { upper } else { lower });
        let stop = clamp(stop, if step < 0 { lower } else { upper });

        let mut out = Vec::new();
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            i += step;
        }
        Some(out)
    }

    fn normalize(index: i128, len: usize) -> Option<usize> {
        let len = len as i128;
        let index = if index < 0 { index + len } else { index };
        (0..len).contains(&index).then_some(index as usize)
    }

    fn select(&self, key: Handle, len: usize) -> Option<Selection> {
        match self.obj(key) {
            Obj::Ellipsis => Some(Selection::Many((0..len).collect())),
            Obj::Slice { start, stop, step } => self.slice_indices(start, stop, step, len).map(Selection::Many),
            _ => match self.int_value(key) {
                Some(i) => match Self::normalize(i, len) {
                    Some(i) => Some(Selection::One(i)),
                    None => {
                        self.raise(self.types.index_error, "index out of range");
                        None
                    }
                },
                None => self.type_error(format!("indices must be integers or slices, not {}", self.type_name(key))),
            },
        }
    }

    fn int_list(&self, values: impl Iterator<Item = i64>) -> Handle {
        let items = values.map(|v| self.new_int(i128::from(v))).collect();
        self.new_list(items)
    }

    fn matrix_item(&self, rows: &[Vec<i64>], key: Handle) -> Option<Handle> {
        let (row_key, col_key) = match self.obj(key) {
            Obj::Tuple(parts) if parts.len() == 2 => (parts[0], Some(parts[1])),
            Obj::Tuple(_) => return self.type_error("too many indices for matrix".into()),
            _ => (key, None),
        };

        let row_sel = self.select(row_key, rows.len())?;
        let Some(col_key) = col_key else {
            return Some(match row_sel {
                Selection::One(r) => self.int_list(rows[r].iter().copied()),
                Selection::Many(rs) => self.new_matrix(rs.iter().map(|r| rows[*r].clone()).collect()),
            });
        };

        let width = rows.first().map_or(0, Vec::len);
        let col_sel = self.select(col_key, width)?;
        Some(match (row_sel, col_sel) {
            (Selection::One(r), Selection::One(c)) => self.new_int(i128::from(rows[r][c])),
            (Selection::One(r), Selection::Many(cs)) => self.int_list(cs.iter().map(|c| rows[r][*c])),
            (Selection::Many(rs), Selection::One(c)) => self.int_list(rs.iter().map(|r| rows[*r][c])),
            (Selection::Many(rs), Selection::Many(cs)) => self.new_matrix(
                rs.iter().map(|r| cs.iter().map(|c| rows[*r][*c]).collect()).collect(),
            ),
        })
    }

    fn sequence_item(&self, items: &[Handle], key: Handle, tuple: bool) -> Option<Handle> {
        if let Obj::Slice { start, stop, step } = self.obj(key) {
            let picked: Vec<Handle> = self
                .slice_indices(start, stop, step, items.len())?
                .into_iter()
                .map(|i| {
                    self.inc(items[i]);
                    items[i]
                })
                .collect();
            let (class, obj) = if tuple {
                (self.types.tuple, Obj::Tuple(picked))
            } else {
                (self.types.list, Obj::List(picked))
            };
            return Some(self.alloc(class, obj));
        }

        let Some(index) = self.int_value(key) else {
            return self.type_error(format!("indices must be integers or slices, not {}", self.type_name(key)));
        };
        match Self::normalize(index, items.len()) {
            Some(i) => {
                self.inc(items[i]);
                Some(items[i])
            }
            None => {
                self.raise(self.types.index_error, "list index out of range");
                None
            }
        }
    }

    fn iter_items(&self, handle: Handle) -> Option<Vec<Handle>> {
        let items = match self.obj(handle) {
            Obj::List(items) | Obj::Tuple(items) | Obj::Set(items) => {
                items.iter().for_each(|h| self.inc(*h));
                items
            }
            Obj::Dict(pairs) => pairs
                .iter()
                .map(|(k, _)| {
                    self.inc(*k);
                    *k
                })
                .collect(),
            Obj::Str(s) => s.chars().map(|c| self.new_str(&c.to_string())).collect(),
            Obj::Matrix(rows) => rows.iter().map(|row| self.int_list(row.iter().copied())).collect(),
            _ => return None,
        };
        Some(items)
    }
}

enum Selection {
    One(usize),
    Many(Vec<usize>),
}

fn status(ok: bool) -> c_int {
    if ok {
        0
    } else {
        -1
    }
}

fn text(s: &CStr) -> String {
    s.to_string_lossy().into_owned()
}

impl ForeignApi for FakePython {
    fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    fn acquire(&self) -> LockState {
        self.lock_depth.set(self.lock_depth.get() + 1);
        self.lock_depth.get()
    }

    fn release(&self, state: LockState) {
        assert_eq!(state, self.lock_depth.get(), "lock released out of order");
        self.lock_depth.set(self.lock_depth.get() - 1);
    }

    fn incref(&self, obj: Handle) {
        self.increfs.set(self.increfs.get() + 1);
        self.inc(obj);
    }

    fn decref(&self, obj: Handle) {
        self.decrefs.set(self.decrefs.get() + 1);
        *self.decref_log.borrow_mut().entry(obj.addr()).or_insert(0) += 1;
        self.dec(obj);
    }

    fn err_occurred(&self) -> Handle {
        let error = *self.error.borrow();
        error.map_or(Handle::NULL, |(ty, _, _)| ty)
    }

    fn err_fetch(&self) -> (Handle, Handle, Handle) {
        self.error.borrow_mut().take().unwrap_or((Handle::NULL, Handle::NULL, Handle::NULL))
    }

    fn err_restore(&self, ty: Handle, value: Handle, traceback: Handle) {
        if ty.is_null() {
            self.err_clear();
        } else {
            self.set_error(ty, value, traceback);
        }
    }

    fn err_clear(&self) {
        if let Some((ty, value, tb)) = self.error.borrow_mut().take() {
            self.dec(ty);
            self.dec(value);
            self.dec(tb);
        }
    }

    fn err_set_string(&self, ty: Handle, message: &CStr) {
        self.raise(ty, &text(message));
    }

    fn import_module(&self, name: &CStr) -> Handle {
        let name = text(name);
        let found = self.modules.borrow().get(&name).copied();
        match found {
            Some(module) => module,
            None => {
                self.raise(self.types.module_not_found, &format!("No module named '{}'", name));
                Handle::NULL
            }
        }
    }

    fn add_module(&self, name: &CStr) -> Handle {
        self.module(&text(name))
    }

    fn exec_code_module(&self, name: &CStr, code: Handle) -> Handle {
        let Obj::Code { source } = self.obj(code) else {
            return self.type_error(format!("expected code, got {}", self.type_name(code))).unwrap_or(Handle::NULL);
        };
        let name = text(name);
        let module = self.create_module(&name);
        let script = self.scripts.borrow().get(&source).cloned();
        let ok = script.map_or(false, |script| script(self, self.namespace(module)));
        if ok {
            module
        } else {
            self.modules.borrow_mut().remove(&name);
            Handle::NULL
        }
    }

    fn module_get_dict(&self, module: Handle) -> Handle {
        match self.obj(module) {
            Obj::Module { dict, .. } => dict,
            _ => {
                self.raise(self.types.system_error, "bad argument to internal function");
                Handle::NULL
            }
        }
    }

    fn compile_string(&self, source: &CStr, filename: &CStr, _start: c_int) -> Handle {
        let source = text(source);
        if !self.scripts.borrow().contains_key(&source) {
            self.raise(self.types.syntax_error, &format!("invalid syntax ({}, line 1)", text(filename)));
            return Handle::NULL;
        }
        self.alloc(self.types.code, Obj::Code { source })
    }

    fn eval_code(&self, code: Handle, globals: Handle, _locals: Handle) -> Handle {
        let Obj::Code { source } = self.obj(code) else {
            return self.type_error(format!("expected code, got {}", self.type_name(code))).unwrap_or(Handle::NULL);
        };
        let script = self.scripts.borrow().get(&source).cloned();
        match script {
            Some(script) if script(self, globals) => self.none,
            _ => Handle::NULL,
        }
    }

    fn eval_get_builtins(&self) -> Handle {
        self.builtins
    }

    fn object_type(&self, obj: Handle) -> Handle {
        let class = self.class_of(obj);
        self.inc(class);
        class
    }

    fn object_str(&self, obj: Handle) -> Handle {
        let text = self.render_str(obj);
        self.new_str(&text)
    }

    fn object_repr(&self, obj: Handle) -> Handle {
        let text = self.render_repr(obj);
        self.new_str(&text)
    }

    fn get_attr(&self, obj: Handle, name: &CStr) -> Handle {
        let name = text(name);
        match self.lookup_attr(obj, &name) {
            Some(found) => found,
            None => {
                let message = format!("'{}' object has no attribute '{}'", self.type_name(obj), name);
                self.raise(self.types.attribute_error, &message);
                Handle::NULL
            }
        }
    }

    fn set_attr(&self, obj: Handle, name: &CStr, value: Handle) -> c_int {
        let name = text(name);
        if let Obj::Module { dict, .. } = self.obj(obj) {
            self.dict_store(dict, &name, value);
            return 0;
        }
        let writable = matches!(self.obj(obj), Obj::Instance | Obj::Type { user: true, .. })
            || self.is_user_class(self.class_of(obj));
        if !writable {
            let message = format!("'{}' object attribute '{}' is read-only", self.type_name(obj), name);
            self.raise(self.types.attribute_error, &message);
            return -1;
        }
        self.inc(value);
        self.set_attribute(obj, &name, value);
        0
    }

    fn has_attr(&self, obj: Handle, name: &CStr) -> c_int {
        match self.lookup_attr(obj, &text(name)) {
            Some(found) => {
                self.dec(found);
                1
            }
            None => 0,
        }
    }

    fn get_item(&self, obj: Handle, key: Handle) -> Handle {
        let result = match self.obj(obj) {
            Obj::List(items) => self.sequence_item(&items, key, false),
            Obj::Tuple(items) => self.sequence_item(&items, key, true),
            Obj::Dict(pairs) => match pairs.iter().find(|(k, _)| self.eq(*k, key)) {
                Some((_, value)) => {
                    self.inc(*value);
                    Some(*value)
                }
                None => {
                    self.raise(self.types.key_error, &self.render_repr(key));
                    None
                }
            },
            Obj::Matrix(rows) => self.matrix_item(&rows, key),
            _ => self.type_error(format!("'{}' object is not subscriptable", self.type_name(obj))),
        };
        result.unwrap_or(Handle::NULL)
    }

    fn set_item(&self, obj: Handle, key: Handle, value: Handle) -> c_int {
        match self.obj(obj) {
            Obj::List(items) => {
                let Some(index) = self.int_value(key) else {
                    self.raise(self.types.type_error, "list indices must be integers");
                    return -1;
                };
                let Some(index) = Self::normalize(index, items.len()) else {
                    self.raise(self.types.index_error, "list assignment index out of range");
                    return -1;
                };
                self.inc(value);
                let old = self.slot_mut(obj, |s| match &mut s.obj {
                    Obj::List(items) => std::mem::replace(&mut items[index], value),
                    _ => Handle::NULL,
                });
                self.dec(old);
                0
            }
            Obj::Dict(_) => {
                self.dict_insert(obj, key, value);
                0
            }
            _ => {
                let message = format!("'{}' object does not support item assignment", self.type_name(obj));
                self.raise(self.types.type_error, &message);
                -1
            }
        }
    }

    fn call(&self, callable: Handle, args: Handle, kwargs: Handle) -> Handle {
        let positional = match (args.is_null(), self.obj_or_none(args)) {
            (true, _) => Vec::new(),
            (false, Obj::Tuple(items)) => items,
            _ => return self.type_error("argument list must be a tuple".into()).unwrap_or(Handle::NULL),
        };
        let keywords: Vec<(String, Handle)> = match (kwargs.is_null(), self.obj_or_none(kwargs)) {
            (true, _) => Vec::new(),
            (false, Obj::Dict(pairs)) => pairs
                .iter()
                .map(|(k, v)| (self.str_value(*k).unwrap_or_default(), *v))
                .collect(),
            _ => return self.type_error("keyword arguments must be a dict".into()).unwrap_or(Handle::NULL),
        };

        match self.obj(callable) {
            Obj::Native { f, .. } => f(self, &positional, &keywords).unwrap_or(Handle::NULL),
            // SAFETY: `def` outlives the function object by contract of cfunction_new
            Obj::CFunction { def, slf } => match unsafe { (*def).meth } {
                Some(meth) => unsafe { meth(slf, args, kwargs) },
                None => Handle::NULL,
            },
            Obj::Type { user: true, .. } => self.new_instance(callable, Vec::new()),
            _ => self
                .type_error(format!("'{}' object is not callable", self.type_name(callable)))
                .unwrap_or(Handle::NULL),
        }
    }

    fn get_iter(&self, obj: Handle) -> Handle {
        if let Obj::Iter { .. } = self.obj(obj) {
            self.inc(obj);
            return obj;
        }
        match self.iter_items(obj) {
            Some(items) => self.alloc(self.types.iterator, Obj::Iter { items, pos: 0 }),
            None => self
                .type_error(format!("'{}' object is not iterable", self.type_name(obj)))
                .unwrap_or(Handle::NULL),
        }
    }

    fn iter_next(&self, iter: Handle) -> Handle {
        let next = self.slot_mut(iter, |s| match &mut s.obj {
            Obj::Iter { items, pos } => {
                let item = items.get(*pos).copied();
                *pos += 1;
                Ok(item)
            }
            _ => Err(()),
        });
        match next {
            Ok(Some(item)) => {
                self.inc(item);
                item
            }
            Ok(None) => Handle::NULL,
            Err(()) => self.type_error("object is not an iterator".into()).unwrap_or(Handle::NULL),
        }
    }

    fn rich_compare_bool(&self, a: Handle, b: Handle, op: CompareOp) -> c_int {
        match op {
            CompareOp::Eq => c_int::from(self.eq(a, b)),
            CompareOp::Ne => c_int::from(!self.eq(a, b)),
            _ => match (self.number(a), self.number(b)) {
                (Some(x), Some(y)) => c_int::from(match op {
                    CompareOp::Lt => x < y,
                    CompareOp::Le => x <= y,
                    CompareOp::Gt => x > y,
                    _ => x >= y,
                }),
                _ => {
                    self.raise(self.types.type_error, "'<' not supported between these instances");
                    -1
                }
            },
        }
    }

    fn is_instance(&self, obj: Handle, class: Handle) -> c_int {
        let object_class = self.class_of(obj);
        let hit = match self.obj(class) {
            Obj::Tuple(classes) => classes.iter().any(|c| self.is_subclass(object_class, *c)),
            _ => self.is_subclass(object_class, class),
        };
        c_int::from(hit)
    }

    fn is_true(&self, obj: Handle) -> c_int {
        let truth = match self.obj(obj) {
            Obj::None => false,
            Obj::Bool(b) => b,
            Obj::Int(i) => i != 0,
            Obj::Float(f) => f != 0.0,
            Obj::Str(s) => !s.is_empty(),
            Obj::List(items) | Obj::Tuple(items) | Obj::Set(items) => !items.is_empty(),
            Obj::Dict(pairs) => !pairs.is_empty(),
            _ => true,
        };
        c_int::from(truth)
    }

    fn length(&self, obj: Handle) -> isize {
        match self.obj(obj) {
            Obj::List(items) | Obj::Tuple(items) | Obj::Set(items) => items.len() as isize,
            Obj::Dict(pairs) => pairs.len() as isize,
            Obj::Str(s) => s.chars().count() as isize,
            Obj::Matrix(rows) => rows.len() as isize,
            _ => {
                let message = format!("object of type '{}' has no len()", self.type_name(obj));
                self.raise(self.types.type_error, &message);
                -1
            }
        }
    }

    fn contains(&self, container: Handle, item: Handle) -> c_int {
        match self.obj(container) {
            Obj::Dict(pairs) => c_int::from(pairs.iter().any(|(k, _)| self.eq(*k, item))),
            Obj::List(items) | Obj::Tuple(items) | Obj::Set(items) => {
                c_int::from(items.iter().any(|h| self.eq(*h, item)))
            }
            Obj::Str(s) => match self.str_value(item) {
                Some(needle) => c_int::from(s.contains(&needle)),
                None => {
                    self.raise(self.types.type_error, "'in <string>' requires string as left operand");
                    -1
                }
            },
            _ => {
                let message = format!("argument of type '{}' is not iterable", self.type_name(container));
                self.raise(self.types.type_error, &message);
                -1
            }
        }
    }

    fn bool_from_long(&self, value: i64) -> Handle {
        if value != 0 {
            self.true_
        } else {
            self.false_
        }
    }

    fn long_from_i64(&self, value: i64) -> Handle {
        self.new_int(i128::from(value))
    }

    fn long_as_i64(&self, obj: Handle) -> i64 {
        match self.int_value(obj) {
            Some(value) => match i64::try_from(value) {
                Ok(value) => value,
                Err(_) => {
                    self.raise(self.types.overflow_error, "Python int too large to convert to C long");
                    -1
                }
            },
            None => {
                let message = format!("an integer is required, not '{}'", self.type_name(obj));
                self.raise(self.types.type_error, &message);
                -1
            }
        }
    }

    fn long_from_str(&self, digits: &CStr, base: c_int) -> Handle {
        let digits = text(digits);
        match i128::from_str_radix(digits.trim(), base as u32) {
            Ok(value) => self.new_int(value),
            Err(_) => {
                let message = format!("invalid literal for int() with base {}: '{}'", base, digits);
                self.raise(self.types.value_error, &message);
                Handle::NULL
            }
        }
    }

    fn float_from_f64(&self, value: f64) -> Handle {
        self.alloc(self.types.float, Obj::Float(value))
    }

    fn float_as_f64(&self, obj: Handle) -> f64 {
        match self.number(obj) {
            Some(value) => value,
            None => {
                let message = format!("must be real number, not {}", self.type_name(obj));
                self.raise(self.types.type_error, &message);
                -1.0
            }
        }
    }

    fn unicode_from_str(&self, value: &str) -> Handle {
        self.new_str(value)
    }

    fn unicode_as_string(&self, obj: Handle) -> Option<String> {
        let found = self.str_value(obj);
        if found.is_none() {
            let message = format!("bad argument type: expected str, got {}", self.type_name(obj));
            self.raise(self.types.type_error, &message);
        }
        found
    }

    fn list_new(&self, len: isize) -> Handle {
        self.new_list(vec![Handle::NULL; len.max(0) as usize])
    }

    fn list_size(&self, list: Handle) -> isize {
        match self.obj(list) {
            Obj::List(items) => items.len() as isize,
            _ => {
                self.raise(self.types.system_error, "bad argument to internal function");
                -1
            }
        }
    }

    fn list_get_item(&self, list: Handle, index: isize) -> Handle {
        match self.obj(list) {
            Obj::List(items) => match items.get(index as usize) {
                Some(item) if index >= 0 => *item,
                _ => {
                    self.raise(self.types.index_error, "list index out of range");
                    Handle::NULL
                }
            },
            _ => {
                self.raise(self.types.system_error, "bad argument to internal function");
                Handle::NULL
            }
        }
    }

    fn list_set_item(&self, list: Handle, index: isize, item: Handle) -> c_int {
        self.store_in_sequence(list, index, item)
    }

    fn tuple_new(&self, len: isize) -> Handle {
        self.alloc(self.types.tuple, Obj::Tuple(vec![Handle::NULL; len.max(0) as usize]))
    }

    fn tuple_size(&self, tuple: Handle) -> isize {
        match self.obj(tuple) {
            Obj::Tuple(items) => items.len() as isize,
            _ => {
                self.raise(self.types.system_error, "bad argument to internal function");
                -1
            }
        }
    }

    fn tuple_get_item(&self, tuple: Handle, index: isize) -> Handle {
        match self.obj(tuple) {
            Obj::Tuple(items) => match items.get(index as usize) {
                Some(item) if index >= 0 => *item,
                _ => {
                    self.raise(self.types.index_error, "tuple index out of range");
                    Handle::NULL
                }
            },
            _ => {
                self.raise(self.types.system_error, "bad argument to internal function");
                Handle::NULL
            }
        }
    }

    fn tuple_set_item(&self, tuple: Handle, index: isize, item: Handle) -> c_int {
        self.store_in_sequence(tuple, index, item)
    }

    fn dict_new(&self) -> Handle {
        self.alloc(self.types.dict, Obj::Dict(Vec::new()))
    }

    fn dict_keys(&self, dict: Handle) -> Handle {
        match self.obj(dict) {
            Obj::Dict(pairs) => {
                let keys = pairs
                    .iter()
                    .map(|(k, _)| {
                        self.inc(*k);
                        *k
                    })
                    .collect();
                self.new_list(keys)
            }
            _ => {
                self.raise(self.types.system_error, "bad argument to internal function");
                Handle::NULL
            }
        }
    }

    fn dict_get_item(&self, dict: Handle, key: Handle) -> Handle {
        match self.obj(dict) {
            Obj::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| self.eq(*k, key))
                .map_or(Handle::NULL, |(_, v)| *v),
            _ => Handle::NULL,
        }
    }

    fn dict_set_item(&self, dict: Handle, key: Handle, value: Handle) -> c_int {
        match self.obj(dict) {
            Obj::Dict(_) => {
                self.dict_insert(dict, key, value);
                0
            }
            _ => {
                self.raise(self.types.system_error, "bad argument to internal function");
                -1
            }
        }
    }

    fn set_new(&self, iterable: Handle) -> Handle {
        let set = self.alloc(self.types.set, Obj::Set(Vec::new()));
        if !iterable.is_null() {
            for item in self.iter_items(iterable).unwrap_or_default() {
                self.set_add(set, item);
                self.dec(item);
            }
        }
        set
    }

    fn set_add(&self, set: Handle, key: Handle) -> c_int {
        let Obj::Set(items) = self.obj(set) else {
            self.raise(self.types.system_error, "bad argument to internal function");
            return -1;
        };
        if items.iter().any(|h| self.eq(*h, key)) {
            return 0;
        }
        self.inc(key);
        self.slot_mut(set, |s| {
            if let Obj::Set(items) = &mut s.obj {
                items.push(key);
            }
        });
        0
    }

    fn slice_new(&self, start: Handle, stop: Handle, step: Handle) -> Handle {
        let part = |h: Handle| {
            let h = if h.is_null() { self.none } else { h };
            self.inc(h);
            h
        };
        let (start, stop, step) = (part(start), part(stop), part(step));
        self.alloc(self.types.slice, Obj::Slice { start, stop, step })
    }

    fn capsule_new(&self, _pointer: *mut c_void, _name: &'static CStr) -> Handle {
        self.alloc(self.types.capsule, Obj::Capsule)
    }

    fn cfunction_new(&self, def: *mut MethodDef, slf: Handle) -> Handle {
        self.inc(slf);
        self.alloc(self.types.function, Obj::CFunction { def, slf })
    }
}

impl FakePython {
    fn obj_or_none(&self, handle: Handle) -> Obj {
        if handle.is_null() {
            Obj::None
        } else {
            self.obj(handle)
        }
    }

    /// Steals `item`, also on failure
    fn store_in_sequence(&self, target: Handle, index: isize, item: Handle) -> c_int {
        let old = self.slot_mut(target, |s| match &mut s.obj {
            Obj::List(items) | Obj::Tuple(items) => match items.get_mut(index as usize) {
                Some(slot) if index >= 0 => Ok(std::mem::replace(slot, item)),
                _ => Err(()),
            },
            _ => Err(()),
        });
        match old {
            Ok(old) => {
                self.dec(old);
                0
            }
            Err(()) => {
                self.dec(item);
                self.raise(self.types.index_error, "assignment index out of range");
                status(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_lifecycle() {
        let fake = FakePython::new();
        let s = fake.unicode_from_str("hello");
        assert_eq!(fake.refcount(s), 1);

        fake.incref(s);
        assert_eq!(fake.refcount(s), 2);
        fake.decref(s);
        fake.decref(s);
        assert!(fake.is_freed(s));
        assert_eq!(fake.decrefs_of(s), 2);
    }

    #[test]
    #[should_panic(expected = "use after free")]
    fn test_use_after_free_panics() {
        let fake = FakePython::new();
        let s = fake.unicode_from_str("gone");
        fake.decref(s);
        fake.incref(s);
    }

    #[test]
    fn test_container_frees_children() {
        let fake = FakePython::new();
        let item = fake.new_int(7);
        fake.incref(item);
        let list = fake.new_list(vec![item]);
        fake.decref(list);
        assert!(!fake.is_freed(item));
        fake.decref(item);
        assert!(fake.is_freed(item));
    }

    #[test]
    fn test_slice_semantics() {
        let fake = FakePython::new();
        let items: Vec<Handle> = (0..9).map(|i| fake.new_int(i)).collect();
        let list = fake.new_list(items);

        let start = fake.new_int(1);
        let slice = fake.slice_new(start, Handle::NULL, Handle::NULL);
        let picked = fake.get_item(list, slice);
        assert_eq!(fake.length(picked), 8);

        let step = fake.new_int(-2);
        let reverse = fake.slice_new(Handle::NULL, Handle::NULL, step);
        let picked = fake.get_item(list, reverse);
        assert_eq!(fake.repr(picked), "[8, 6, 4, 2, 0]");
    }

    #[test]
    fn test_error_indicator() {
        let fake = FakePython::new();
        assert!(fake.err_occurred().is_null());
        fake.raise(fake.types.key_error, "'k'");
        assert_eq!(fake.err_occurred(), fake.types.key_error);
        fake.err_clear();
        assert!(!fake.error_pending());
    }
}
