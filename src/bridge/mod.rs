//! Bridge between host components and the embedded Lua interpreter.
//!
//! - [`InterpreterHandle`]: the shared runtime, acquired once per process
//! - [`ConfigurationResolver`]: role keys to script classes
//! - [`ManagedInstance`]: one script object with detected capabilities

pub mod convert;
pub mod error;
pub mod instance;
pub mod interpreter;
pub mod resolver;

pub use error::BridgeError;
pub use instance::{Capability, CapabilitySet, ManagedInstance};
pub use interpreter::{Arg, InterpreterHandle, InterpreterOptions, OpaqueValue, LOAD_PATH_ENV};
pub use resolver::{ClassRef, ConfigurationResolver, Role, DEFAULT_FACTORY, JOB_SETUP_SCRIPT_KEY};
