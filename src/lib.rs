//! pybridge - embed a CPython interpreter and work with its objects
//!
//! The interpreter library is opened at runtime; nothing links against
//! libpython at build time. Foreign objects are reached through
//! reference-counted [`PyObject`] wrappers and script-style [`Proxy`] access,
//! and host closures become foreign callables through [`Callback`].

// Core modules
pub mod callback;
pub mod config;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod object;
pub mod proxy;
pub mod runtime;

// Re-export commonly used items
pub use callback::{live_callbacks, Callback};
pub use config::BridgeConfig;
pub use error::{Error, PythonError, Result};
pub use ffi::{CompareOp, ForeignApi, Handle};
pub use logging::{init_logging, LogConfig, LogFormat, LogOutput};
pub use object::{kw, Arg, HostFn, Kwargs, NamedArgument, ObjectIter, PyObject, Value};
pub use proxy::{Dynamic, Property, Proxy, ProxyIter, SliceItem};
pub use runtime::Python;
