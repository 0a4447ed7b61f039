//! Foreign entry point table
//!
//! Design: the bridge never links against the interpreter. Every operation it
//! needs is one method on [`ForeignApi`], mirroring a single C API entry point:
//! 1. Handles are opaque machine words, never dereferenced on this side
//! 2. Failure is signalled by a null handle or a nonzero status
//! 3. Reference semantics (new, borrowed, stolen) follow the C API exactly
//!
//! `cpython` resolves the table from a loaded libpython; tests plug in an
//! in-memory interpreter instead.

use core::ffi::{c_char, c_int, c_void};
use std::ffi::CStr;

pub mod cpython;
pub mod library;

#[cfg(test)]
pub(crate) mod fake;

pub use cpython::CPython;
pub use library::{candidates, load_library};

/// Build a `&'static CStr` from a string literal.
#[macro_export]
macro_rules! cstr {
    ($s:expr) => {{
        const CSTR: &::std::ffi::CStr =
            match ::std::ffi::CStr::from_bytes_with_nul(concat!($s, "\0").as_bytes()) {
                Ok(cstr) => cstr,
                Err(_) => panic!("string literal contains a NUL byte"),
            };
        CSTR
    }};
}

/// Opaque reference to one foreign object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(*mut c_void);

impl Handle {
    /// The "no object" sentinel
    pub const NULL: Handle = Handle(core::ptr::null_mut());

    #[inline]
    pub const fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    #[inline]
    pub const fn as_raw(self) -> *mut c_void {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Address used as a key in host-side tables
    #[inline]
    pub fn addr(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Handle({:#x})", self.addr())
    }
}

/// Native function signature for `METH_VARARGS | METH_KEYWORDS` callables
pub type NativeFn = unsafe extern "C" fn(slf: Handle, args: Handle, kwargs: Handle) -> Handle;

/// Layout-compatible `PyMethodDef`
#[repr(C)]
pub struct MethodDef {
    pub name: *const c_char,
    pub meth: Option<NativeFn>,
    pub flags: c_int,
    pub doc: *const c_char,
}

pub const METH_VARARGS: c_int = 0x0001;
pub const METH_KEYWORDS: c_int = 0x0002;

/// `Py_file_input` start token for `Py_CompileString`
pub const FILE_INPUT: c_int = 257;

/// Rich comparison operator codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CompareOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
}

/// Opaque token returned by [`ForeignApi::acquire`]
pub type LockState = c_int;

/// The fixed set of interpreter operations the bridge consumes.
///
/// Handles passed in must be live. Methods returning a [`Handle`] document
/// whether the result is a new or a borrowed reference; a null result means a
/// foreign error may be pending and must be checked.
pub trait ForeignApi {
    // ---- lifecycle -------------------------------------------------------

    fn is_initialized(&self) -> bool;

    /// Acquire the interpreter's global lock for the calling thread
    fn acquire(&self) -> LockState {
        0
    }

    /// Release a lock obtained from [`ForeignApi::acquire`]
    fn release(&self, _state: LockState) {}

    /// Identity of the interpreter behind this table
    ///
    /// Tables driving the same interpreter must answer the same key.
    fn interpreter_key(&self) -> usize {
        self as *const Self as *const () as usize
    }

    // ---- reference counting ---------------------------------------------

    fn incref(&self, obj: Handle);
    fn decref(&self, obj: Handle);

    // ---- error indicator ------------------------------------------------

    /// Borrowed exception type, or null when no error is pending
    fn err_occurred(&self) -> Handle;
    /// Fetch and clear the pending error as normalized new references
    fn err_fetch(&self) -> (Handle, Handle, Handle);
    /// Set the pending error, stealing all three references
    fn err_restore(&self, ty: Handle, value: Handle, traceback: Handle);
    fn err_clear(&self);
    fn err_set_string(&self, ty: Handle, message: &CStr);

    // ---- modules and code -----------------------------------------------

    /// New reference
    fn import_module(&self, name: &CStr) -> Handle;
    /// Borrowed reference
    fn add_module(&self, name: &CStr) -> Handle;
    /// New reference
    fn exec_code_module(&self, name: &CStr, code: Handle) -> Handle;
    /// Borrowed reference
    fn module_get_dict(&self, module: Handle) -> Handle;
    /// New reference
    fn compile_string(&self, source: &CStr, filename: &CStr, start: c_int) -> Handle;
    /// New reference
    fn eval_code(&self, code: Handle, globals: Handle, locals: Handle) -> Handle;
    /// Borrowed reference to the builtins mapping
    fn eval_get_builtins(&self) -> Handle;

    // ---- object protocol ------------------------------------------------

    fn object_type(&self, obj: Handle) -> Handle;
    fn object_str(&self, obj: Handle) -> Handle;
    fn object_repr(&self, obj: Handle) -> Handle;
    fn get_attr(&self, obj: Handle, name: &CStr) -> Handle;
    fn set_attr(&self, obj: Handle, name: &CStr, value: Handle) -> c_int;
    fn has_attr(&self, obj: Handle, name: &CStr) -> c_int;
    fn get_item(&self, obj: Handle, key: Handle) -> Handle;
    fn set_item(&self, obj: Handle, key: Handle, value: Handle) -> c_int;
    fn call(&self, callable: Handle, args: Handle, kwargs: Handle) -> Handle;
    fn get_iter(&self, obj: Handle) -> Handle;
    /// New reference, or null on exhaustion (no error) or failure (error set)
    fn iter_next(&self, iter: Handle) -> Handle;
    fn rich_compare_bool(&self, a: Handle, b: Handle, op: CompareOp) -> c_int;
    fn is_instance(&self, obj: Handle, class: Handle) -> c_int;
    fn is_true(&self, obj: Handle) -> c_int;
    fn length(&self, obj: Handle) -> isize;
    fn contains(&self, container: Handle, item: Handle) -> c_int;

    // ---- scalars --------------------------------------------------------

    fn bool_from_long(&self, value: i64) -> Handle;
    fn long_from_i64(&self, value: i64) -> Handle;
    fn long_as_i64(&self, obj: Handle) -> i64;
    fn long_from_str(&self, digits: &CStr, base: c_int) -> Handle;
    fn float_from_f64(&self, value: f64) -> Handle;
    fn float_as_f64(&self, obj: Handle) -> f64;
    fn unicode_from_str(&self, value: &str) -> Handle;
    /// Copy a foreign string out as UTF-8; `None` with an error set on failure
    fn unicode_as_string(&self, obj: Handle) -> Option<String>;

    // ---- collections ----------------------------------------------------

    fn list_new(&self, len: isize) -> Handle;
    fn list_size(&self, list: Handle) -> isize;
    /// Borrowed reference
    fn list_get_item(&self, list: Handle, index: isize) -> Handle;
    /// Steals `item`
    fn list_set_item(&self, list: Handle, index: isize, item: Handle) -> c_int;
    fn tuple_new(&self, len: isize) -> Handle;
    fn tuple_size(&self, tuple: Handle) -> isize;
    /// Borrowed reference
    fn tuple_get_item(&self, tuple: Handle, index: isize) -> Handle;
    /// Steals `item`
    fn tuple_set_item(&self, tuple: Handle, index: isize, item: Handle) -> c_int;
    fn dict_new(&self) -> Handle;
    /// New list of keys
    fn dict_keys(&self, dict: Handle) -> Handle;
    /// Borrowed reference, null without error when missing
    fn dict_get_item(&self, dict: Handle, key: Handle) -> Handle;
    fn dict_set_item(&self, dict: Handle, key: Handle, value: Handle) -> c_int;
    fn set_new(&self, iterable: Handle) -> Handle;
    fn set_add(&self, set: Handle, key: Handle) -> c_int;
    fn slice_new(&self, start: Handle, stop: Handle, step: Handle) -> Handle;

    // ---- native callables -----------------------------------------------

    fn capsule_new(&self, pointer: *mut c_void, name: &'static CStr) -> Handle;
    /// New callable object over `def`; `def` must outlive the returned object
    fn cfunction_new(&self, def: *mut MethodDef, slf: Handle) -> Handle;
}
