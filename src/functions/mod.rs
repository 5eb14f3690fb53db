//! Functions: criteria assembly, routing, pinning and execution.

pub mod criteria;
pub mod executor;
pub mod group;
pub mod model;
pub mod router;
pub mod types;

pub use executor::FunctionExecutor;
pub use group::{FunctionGroup, Lease};
pub use model::{
    Attachment, Bindings, CallSite, ErrorKind, Function, InputMessage, Measurement,
    OutputError, OutputMessage,
};
pub use router::{FunctionRouter, Routed};
pub use types::{FunctionType, FunctionTypeRegistry, RuntimeFunctionType};
