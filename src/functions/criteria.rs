//! Assembly of the selection criteria of one call.
//!
//! Sources are merged first-writer-wins in priority order: call site,
//! function, group, function type. A later source only fills keys that are
//! still unset.

use crate::error::RoutingError;
use crate::functions::model::{Bindings, CallSite};
use crate::grid::{Interest, SelectionCriteria};

/// Prefix of bindings that add a required interest on the named attribute.
pub const ROUTE_TO_PREFIX: &str = "route_to_";

/// Merge `sources`, highest priority first.
pub fn merge<'a>(sources: impl IntoIterator<Item = &'a SelectionCriteria>) -> SelectionCriteria {
    let mut merged = SelectionCriteria::new();
    for source in sources {
        for (key, interest) in source {
            merged
                .entry(key.clone())
                .or_insert_with(|| interest.clone());
        }
    }
    merged
}

/// Call-site criteria with `${name}` placeholders resolved against
/// `bindings`, plus one required interest per `route_to_<attr>` binding.
/// Explicit call-site entries win over `route_to_` bindings.
pub fn call_site_criteria(
    call_site: &CallSite,
    bindings: &Bindings,
) -> Result<SelectionCriteria, RoutingError> {
    let mut criteria = SelectionCriteria::new();
    for (key, template) in &call_site.criteria {
        let pattern = resolve_placeholders(key, template, bindings)?;
        criteria.insert(key.clone(), Interest::required(key, &pattern)?);
    }

    for (name, value) in bindings {
        let Some(attribute) = name.strip_prefix(ROUTE_TO_PREFIX) else {
            continue;
        };
        if attribute.is_empty() || criteria.contains_key(attribute) {
            continue;
        }
        let pattern = binding_text(value);
        criteria.insert(
            attribute.to_string(),
            Interest::required(attribute, &pattern)?,
        );
    }
    Ok(criteria)
}

fn binding_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_placeholders(
    key: &str,
    template: &str,
    bindings: &Bindings,
) -> Result<String, RoutingError> {
    let invalid = |reason: String| RoutingError::InvalidCriteria {
        key: key.to_string(),
        reason,
    };

    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| invalid(format!("unterminated placeholder in {template:?}")))?;
        let name = after[..end].trim();
        let value = bindings
            .get(name)
            .ok_or_else(|| invalid(format!("no binding named {name:?}")))?;
        resolved.push_str(&binding_text(value));
        rest = &after[end + 1..];
    }
    resolved.push_str(rest);
    Ok(resolved)
}
