//! Function types: per-type routing requirements and handler wiring.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{FileProviderError, RoutingError};
use crate::files::FileServer;
use crate::functions::model::{Function, HANDLER_PACKAGE_KEY};
use crate::grid::{Interest, SelectionCriteria};

/// Token attribute naming the runtime a worker supports.
pub const RUNTIME_ATTRIBUTE: &str = "$runtime";

/// Function property pointing at a local file or folder shipped to the worker.
pub const PACKAGE_PROPERTY: &str = "package";

/// Strategy describing how functions of one type are routed and handled.
pub trait FunctionType: Send + Sync {
    /// Registry key, matched against [`Function::function_type`].
    fn name(&self) -> &str;

    /// Criteria every worker running this type must satisfy.
    fn criteria(&self, _function: &Function) -> SelectionCriteria {
        SelectionCriteria::new()
    }

    /// Name of the worker-side handler.
    fn handler(&self, function: &Function) -> String;

    /// Extra input properties for the handler.
    fn handler_properties(
        &self,
        _function: &Function,
    ) -> Result<HashMap<String, String>, FileProviderError> {
        Ok(HashMap::new())
    }
}

/// A function type bound to one runtime and one handler.
///
/// Functions with a [`PACKAGE_PROPERTY`] get that path registered with the
/// file server and its version passed to the handler.
pub struct RuntimeFunctionType {
    name: String,
    runtime: String,
    handler: String,
    files: Option<Arc<FileServer>>,
}

impl RuntimeFunctionType {
    pub fn new(
        name: impl Into<String>,
        runtime: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            runtime: runtime.into(),
            handler: handler.into(),
            files: None,
        }
    }

    pub fn with_file_server(mut self, files: Arc<FileServer>) -> Self {
        self.files = Some(files);
        self
    }
}

impl FunctionType for RuntimeFunctionType {
    fn name(&self) -> &str {
        &self.name
    }

    fn criteria(&self, _function: &Function) -> SelectionCriteria {
        let mut criteria = SelectionCriteria::new();
        criteria.insert(
            RUNTIME_ATTRIBUTE.to_string(),
            Interest::exact(&self.runtime, true),
        );
        criteria
    }

    fn handler(&self, _function: &Function) -> String {
        self.handler.clone()
    }

    fn handler_properties(
        &self,
        function: &Function,
    ) -> Result<HashMap<String, String>, FileProviderError> {
        let mut properties = HashMap::new();
        let Some(package) = function.properties.get(PACKAGE_PROPERTY) else {
            return Ok(properties);
        };
        let path = Path::new(package);
        let files = self
            .files
            .as_ref()
            .ok_or_else(|| FileProviderError::Unreadable {
                path: path.to_path_buf(),
                reason: format!("function type {} has no file server", self.name),
            })?;
        files
            .register_file(path)?
            .to_properties(HANDLER_PACKAGE_KEY, &mut properties);
        Ok(properties)
    }
}

/// Registry of function types, filled at startup.
pub struct FunctionTypeRegistry {
    types: RwLock<HashMap<String, Arc<dyn FunctionType>>>,
}

impl FunctionTypeRegistry {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
        }
    }

    /// Register a type. A later registration under the same name replaces it.
    pub fn register(&self, function_type: Arc<dyn FunctionType>) {
        let name = function_type.name().to_string();
        if self
            .types
            .write()
            .insert(name.clone(), function_type)
            .is_some()
        {
            tracing::warn!(function_type = %name, "Replaced function type registration");
        } else {
            tracing::debug!("Registered function type: {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionType>> {
        self.types.read().get(name).cloned()
    }

    /// Type of `function`, or [`RoutingError::UnknownFunctionType`].
    pub fn resolve(&self, function: &Function) -> Result<Arc<dyn FunctionType>, RoutingError> {
        self.get(&function.function_type)
            .ok_or_else(|| RoutingError::UnknownFunctionType {
                name: function.function_type.clone(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.types.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.types.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.types.read().len()
    }
}

impl Default for FunctionTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
