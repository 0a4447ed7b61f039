//! CPython backend - entry points resolved from a loaded libpython
//!
//! The interpreter is loaded and initialised at most once per process; every
//! [`CPython`] value is a cheap view onto that shared table.

use super::library::load_library;
use super::{CompareOp, ForeignApi, Handle, LockState, MethodDef};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::logging::{info, log_ffi_error};
use core::ffi::{c_char, c_int, c_long, c_longlong, c_void};
use once_cell::sync::OnceCell;
use std::ffi::CStr;

macro_rules! entry_points {
    ($( $field:ident = $symbol:literal : fn($($arg:ty),*) $(-> $ret:ty)?; )*) => {
        /// Resolved C API function pointers
        struct EntryPoints {
            $( $field: unsafe extern "C" fn($($arg),*) $(-> $ret)?, )*
        }

        impl EntryPoints {
            fn resolve(lib: &libloading::Library) -> Result<Self> {
                // Safety: each symbol is declared with its C API signature
                unsafe {
                    Ok(Self {
                        $(
                            $field: *lib
                                .get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                                    concat!($symbol, "\0").as_bytes(),
                                )
                                .map_err(|e| {
                                    Error::Initialization(format!("missing symbol {}: {}", $symbol, e))
                                })?,
                        )*
                    })
                }
            }
        }
    };
}

entry_points! {
    initialize_ex = "Py_InitializeEx": fn(c_int);
    is_initialized = "Py_IsInitialized": fn() -> c_int;
    save_thread = "PyEval_SaveThread": fn() -> *mut c_void;
    gil_ensure = "PyGILState_Ensure": fn() -> c_int;
    gil_release = "PyGILState_Release": fn(c_int);

    incref = "Py_IncRef": fn(Handle);
    decref = "Py_DecRef": fn(Handle);

    err_occurred = "PyErr_Occurred": fn() -> Handle;
    err_fetch = "PyErr_Fetch": fn(*mut Handle, *mut Handle, *mut Handle);
    err_normalize = "PyErr_NormalizeException": fn(*mut Handle, *mut Handle, *mut Handle);
    err_restore = "PyErr_Restore": fn(Handle, Handle, Handle);
    err_clear = "PyErr_Clear": fn();
    err_set_string = "PyErr_SetString": fn(Handle, *const c_char);

    import_module = "PyImport_ImportModule": fn(*const c_char) -> Handle;
    add_module = "PyImport_AddModule": fn(*const c_char) -> Handle;
    exec_code_module = "PyImport_ExecCodeModule": fn(*const c_char, Handle) -> Handle;
    module_get_dict = "PyModule_GetDict": fn(Handle) -> Handle;
    compile_string = "Py_CompileString": fn(*const c_char, *const c_char, c_int) -> Handle;
    eval_code = "PyEval_EvalCode": fn(Handle, Handle, Handle) -> Handle;
    eval_get_builtins = "PyEval_GetBuiltins": fn() -> Handle;

    object_type = "PyObject_Type": fn(Handle) -> Handle;
    object_str = "PyObject_Str": fn(Handle) -> Handle;
    object_repr = "PyObject_Repr": fn(Handle) -> Handle;
    get_attr = "PyObject_GetAttrString": fn(Handle, *const c_char) -> Handle;
    set_attr = "PyObject_SetAttrString": fn(Handle, *const c_char, Handle) -> c_int;
    has_attr = "PyObject_HasAttrString": fn(Handle, *const c_char) -> c_int;
    get_item = "PyObject_GetItem": fn(Handle, Handle) -> Handle;
    set_item = "PyObject_SetItem": fn(Handle, Handle, Handle) -> c_int;
    call = "PyObject_Call": fn(Handle, Handle, Handle) -> Handle;
    get_iter = "PyObject_GetIter": fn(Handle) -> Handle;
    iter_next = "PyIter_Next": fn(Handle) -> Handle;
    rich_compare_bool = "PyObject_RichCompareBool": fn(Handle, Handle, c_int) -> c_int;
    is_instance = "PyObject_IsInstance": fn(Handle, Handle) -> c_int;
    is_true = "PyObject_IsTrue": fn(Handle) -> c_int;
    length = "PyObject_Size": fn(Handle) -> isize;
    contains = "PySequence_Contains": fn(Handle, Handle) -> c_int;

    bool_from_long = "PyBool_FromLong": fn(c_long) -> Handle;
    long_from_longlong = "PyLong_FromLongLong": fn(c_longlong) -> Handle;
    long_as_longlong = "PyLong_AsLongLong": fn(Handle) -> c_longlong;
    long_from_string = "PyLong_FromString": fn(*const c_char, *mut *mut c_char, c_int) -> Handle;
    float_from_double = "PyFloat_FromDouble": fn(f64) -> Handle;
    float_as_double = "PyFloat_AsDouble": fn(Handle) -> f64;
    unicode_decode_utf8 = "PyUnicode_DecodeUTF8": fn(*const c_char, isize, *const c_char) -> Handle;
    unicode_as_utf8 = "PyUnicode_AsUTF8AndSize": fn(Handle, *mut isize) -> *const c_char;

    list_new = "PyList_New": fn(isize) -> Handle;
    list_size = "PyList_Size": fn(Handle) -> isize;
    list_get_item = "PyList_GetItem": fn(Handle, isize) -> Handle;
    list_set_item = "PyList_SetItem": fn(Handle, isize, Handle) -> c_int;
    tuple_new = "PyTuple_New": fn(isize) -> Handle;
    tuple_size = "PyTuple_Size": fn(Handle) -> isize;
    tuple_get_item = "PyTuple_GetItem": fn(Handle, isize) -> Handle;
    tuple_set_item = "PyTuple_SetItem": fn(Handle, isize, Handle) -> c_int;
    dict_new = "PyDict_New": fn() -> Handle;
    dict_keys = "PyDict_Keys": fn(Handle) -> Handle;
    dict_get_item = "PyDict_GetItem": fn(Handle, Handle) -> Handle;
    dict_set_item = "PyDict_SetItem": fn(Handle, Handle, Handle) -> c_int;
    set_new = "PySet_New": fn(Handle) -> Handle;
    set_add = "PySet_Add": fn(Handle, Handle) -> c_int;
    slice_new = "PySlice_New": fn(Handle, Handle, Handle) -> Handle;

    capsule_new = "PyCapsule_New": fn(*mut c_void, *const c_char, Option<unsafe extern "C" fn(Handle)>) -> Handle;
    cfunction_new = "PyCFunction_NewEx": fn(*mut MethodDef, Handle, Handle) -> Handle;
}

/// Loaded library plus its resolved table; lives for the rest of the process
struct Loaded {
    _library: libloading::Library,
    entry: EntryPoints,
    name: String,
}

static LOADED: OnceCell<Loaded> = OnceCell::new();

/// View onto the process-wide interpreter
#[derive(Clone, Copy)]
pub struct CPython {
    loaded: &'static Loaded,
}

impl CPython {
    /// Load and initialise the interpreter, or reuse the one already running
    pub fn load(config: &BridgeConfig) -> Result<Self> {
        let loaded = LOADED.get_or_try_init(|| {
            let (library, name) = load_library(config)?;
            let entry = EntryPoints::resolve(&library)?;

            // Safety: symbols resolved above; this runs once per process
            unsafe {
                if (entry.is_initialized)() == 0 {
                    (entry.initialize_ex)(c_int::from(config.runtime.install_signal_handlers));
                    if (entry.is_initialized)() == 0 {
                        log_ffi_error("Py_InitializeEx", "interpreter did not initialise");
                        return Err(Error::Initialization(format!(
                            "{name} failed to initialise"
                        )));
                    }
                    // Hand the lock back so any thread can enter through PyGILState_Ensure
                    (entry.save_thread)();
                }
            }

            info!(target: "ffi", library = %name, "interpreter initialised");
            Ok(Loaded {
                _library: library,
                entry,
                name,
            })
        })?;

        Ok(Self { loaded })
    }

    /// The interpreter already loaded by this process, if any
    pub fn current() -> Option<Self> {
        LOADED.get().map(|loaded| Self { loaded })
    }

    /// Name or path the interpreter library was loaded from
    pub fn library_name(&self) -> &str {
        &self.loaded.name
    }

    #[inline(always)]
    fn ep(&self) -> &'static EntryPoints {
        &self.loaded.entry
    }
}

// Safety (applies to every call below): the table was resolved from a real
// libpython and handles are live per the `ForeignApi` contract.
impl ForeignApi for CPython {
    fn is_initialized(&self) -> bool {
        unsafe { (self.ep().is_initialized)() != 0 }
    }

    fn acquire(&self) -> LockState {
        unsafe { (self.ep().gil_ensure)() }
    }

    fn release(&self, state: LockState) {
        unsafe { (self.ep().gil_release)(state) }
    }

    fn interpreter_key(&self) -> usize {
        self.loaded as *const Loaded as usize
    }

    fn incref(&self, obj: Handle) {
        unsafe { (self.ep().incref)(obj) }
    }

    fn decref(&self, obj: Handle) {
        unsafe { (self.ep().decref)(obj) }
    }

    fn err_occurred(&self) -> Handle {
        unsafe { (self.ep().err_occurred)() }
    }

    fn err_fetch(&self) -> (Handle, Handle, Handle) {
        let (mut ty, mut value, mut tb) = (Handle::NULL, Handle::NULL, Handle::NULL);
        unsafe {
            (self.ep().err_fetch)(&mut ty, &mut value, &mut tb);
            if !ty.is_null() {
                (self.ep().err_normalize)(&mut ty, &mut value, &mut tb);
            }
        }
        (ty, value, tb)
    }

    fn err_restore(&self, ty: Handle, value: Handle, traceback: Handle) {
        unsafe { (self.ep().err_restore)(ty, value, traceback) }
    }

    fn err_clear(&self) {
        unsafe { (self.ep().err_clear)() }
    }

    fn err_set_string(&self, ty: Handle, message: &CStr) {
        unsafe { (self.ep().err_set_string)(ty, message.as_ptr()) }
    }

    fn import_module(&self, name: &CStr) -> Handle {
        unsafe { (self.ep().import_module)(name.as_ptr()) }
    }

    fn add_module(&self, name: &CStr) -> Handle {
        unsafe { (self.ep().add_module)(name.as_ptr()) }
    }

    fn exec_code_module(&self, name: &CStr, code: Handle) -> Handle {
        unsafe { (self.ep().exec_code_module)(name.as_ptr(), code) }
    }

    fn module_get_dict(&self, module: Handle) -> Handle {
        unsafe { (self.ep().module_get_dict)(module) }
    }

    fn compile_string(&self, source: &CStr, filename: &CStr, start: c_int) -> Handle {
        unsafe { (self.ep().compile_string)(source.as_ptr(), filename.as_ptr(), start) }
    }

    fn eval_code(&self, code: Handle, globals: Handle, locals: Handle) -> Handle {
        unsafe { (self.ep().eval_code)(code, globals, locals) }
    }

    fn eval_get_builtins(&self) -> Handle {
        unsafe { (self.ep().eval_get_builtins)() }
    }

    fn object_type(&self, obj: Handle) -> Handle {
        unsafe { (self.ep().object_type)(obj) }
    }

    fn object_str(&self, obj: Handle) -> Handle {
        unsafe { (self.ep().object_str)(obj) }
    }

    fn object_repr(&self, obj: Handle) -> Handle {
        unsafe { (self.ep().object_repr)(obj) }
    }

    fn get_attr(&self, obj: Handle, name: &CStr) -> Handle {
        unsafe { (self.ep().get_attr)(obj, name.as_ptr()) }
    }

    fn set_attr(&self, obj: Handle, name: &CStr, value: Handle) -> c_int {
        unsafe { (self.ep().set_attr)(obj, name.as_ptr(), value) }
    }

    fn has_attr(&self, obj: Handle, name: &CStr) -> c_int {
        unsafe { (self.ep().has_attr)(obj, name.as_ptr()) }
    }

    fn get_item(&self, obj: Handle, key: Handle) -> Handle {
        unsafe { (self.ep().get_item)(obj, key) }
    }

    fn set_item(&self, obj: Handle, key: Handle, value: Handle) -> c_int {
        unsafe { (self.ep().set_item)(obj, key, value) }
    }

    fn call(&self, callable: Handle, args: Handle, kwargs: Handle) -> Handle {
        unsafe { (self.ep().call)(callable, args, kwargs) }
    }

    fn get_iter(&self, obj: Handle) -> Handle {
        unsafe { (self.ep().get_iter)(obj) }
    }

    fn iter_next(&self, iter: Handle) -> Handle {
        unsafe { (self.ep().iter_next)(iter) }
    }

    fn rich_compare_bool(&self, a: Handle, b: Handle, op: CompareOp) -> c_int {
        unsafe { (self.ep().rich_compare_bool)(a, b, op as c_int) }
    }

    fn is_instance(&self, obj: Handle, class: Handle) -> c_int {
        unsafe { (self.ep().is_instance)(obj, class) }
    }

    fn is_true(&self, obj: Handle) -> c_int {
        unsafe { (self.ep().is_true)(obj) }
    }

    fn length(&self, obj: Handle) -> isize {
        unsafe { (self.ep().length)(obj) }
    }

    fn contains(&self, container: Handle, item: Handle) -> c_int {
        unsafe { (self.ep().contains)(container, item) }
    }

    fn bool_from_long(&self, value: i64) -> Handle {
        unsafe { (self.ep().bool_from_long)(c_long::from(value != 0)) }
    }

    fn long_from_i64(&self, value: i64) -> Handle {
        unsafe { (self.ep().long_from_longlong)(value) }
    }

    fn long_as_i64(&self, obj: Handle) -> i64 {
        unsafe { (self.ep().long_as_longlong)(obj) }
    }

    fn long_from_str(&self, digits: &CStr, base: c_int) -> Handle {
        unsafe { (self.ep().long_from_string)(digits.as_ptr(), core::ptr::null_mut(), base) }
    }

    fn float_from_f64(&self, value: f64) -> Handle {
        unsafe { (self.ep().float_from_double)(value) }
    }

    fn float_as_f64(&self, obj: Handle) -> f64 {
        unsafe { (self.ep().float_as_double)(obj) }
    }

    fn unicode_from_str(&self, value: &str) -> Handle {
        unsafe {
            (self.ep().unicode_decode_utf8)(
                value.as_ptr() as *const c_char,
                value.len() as isize,
                crate::cstr!("strict").as_ptr(),
            )
        }
    }

    fn unicode_as_string(&self, obj: Handle) -> Option<String> {
        let mut size: isize = 0;
        unsafe {
            let ptr = (self.ep().unicode_as_utf8)(obj, &mut size);
            if ptr.is_null() {
                return None;
            }
            let bytes = core::slice::from_raw_parts(ptr as *const u8, size as usize);
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    fn list_new(&self, len: isize) -> Handle {
        unsafe { (self.ep().list_new)(len) }
    }

    fn list_size(&self, list: Handle) -> isize {
        unsafe { (self.ep().list_size)(list) }
    }

    fn list_get_item(&self, list: Handle, index: isize) -> Handle {
        unsafe { (self.ep().list_get_item)(list, index) }
    }

    fn list_set_item(&self, list: Handle, index: isize, item: Handle) -> c_int {
        unsafe { (self.ep().list_set_item)(list, index, item) }
    }

    fn tuple_new(&self, len: isize) -> Handle {
        unsafe { (self.ep().tuple_new)(len) }
    }

    fn tuple_size(&self, tuple: Handle) -> isize {
        unsafe { (self.ep().tuple_size)(tuple) }
    }

    fn tuple_get_item(&self, tuple: Handle, index: isize) -> Handle {
        unsafe { (self.ep().tuple_get_item)(tuple, index) }
    }

    fn tuple_set_item(&self, tuple: Handle, index: isize, item: Handle) -> c_int {
        unsafe { (self.ep().tuple_set_item)(tuple, index, item) }
    }

    fn dict_new(&self) -> Handle {
        unsafe { (self.ep().dict_new)() }
    }

    fn dict_keys(&self, dict: Handle) -> Handle {
        unsafe { (self.ep().dict_keys)(dict) }
    }

    fn dict_get_item(&self, dict: Handle, key: Handle) -> Handle {
        unsafe { (self.ep().dict_get_item)(dict, key) }
    }

    fn dict_set_item(&self, dict: Handle, key: Handle, value: Handle) -> c_int {
        unsafe { (self.ep().dict_set_item)(dict, key, value) }
    }

    fn set_new(&self, iterable: Handle) -> Handle {
        unsafe { (self.ep().set_new)(iterable) }
    }

    fn set_add(&self, set: Handle, key: Handle) -> c_int {
        unsafe { (self.ep().set_add)(set, key) }
    }

    fn slice_new(&self, start: Handle, stop: Handle, step: Handle) -> Handle {
        unsafe { (self.ep().slice_new)(start, stop, step) }
    }

    fn capsule_new(&self, pointer: *mut c_void, name: &'static CStr) -> Handle {
        unsafe { (self.ep().capsule_new)(pointer, name.as_ptr(), None) }
    }

    fn cfunction_new(&self, def: *mut MethodDef, slf: Handle) -> Handle {
        unsafe { (self.ep().cfunction_new)(def, slf, Handle::NULL) }
    }
}
