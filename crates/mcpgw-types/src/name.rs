use std::sync::LazyLock;

use regex::Regex;

use crate::error::GatewayError;

/// Delimiter between a service name and a tool's original name in a
/// composite/qualified tool name. Reserved: service names may not contain it.
pub const QUALIFIED_NAME_DELIMITER: &str = "__";

static SERVICE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

/// Validate a service name: non-empty, `[A-Za-z0-9_-]+`, and must not
/// contain the reserved `__` delimiter (spec.md §4.4 tightens this to a
/// hard validation rather than the source's unenforced convention).
pub fn validate_service_name(name: &str) -> Result<(), GatewayError> {
    if name.is_empty() {
        return Err(GatewayError::Config {
            service: name.to_string(),
            message: "service name must not be empty".to_string(),
        });
    }
    if !SERVICE_NAME_RE.is_match(name) {
        return Err(GatewayError::Config {
            service: name.to_string(),
            message: "service name must match [A-Za-z0-9_-]+".to_string(),
        });
    }
    if name.contains(QUALIFIED_NAME_DELIMITER) {
        return Err(GatewayError::Config {
            service: name.to_string(),
            message: format!(
                "service name must not contain the reserved delimiter '{QUALIFIED_NAME_DELIMITER}'"
            ),
        });
    }
    Ok(())
}

/// Build the composite/qualified name `serviceName__toolName`.
pub fn qualify(service_name: &str, original_name: &str) -> String {
    format!("{service_name}{QUALIFIED_NAME_DELIMITER}{original_name}")
}

/// Split a composite name into `(service, tool)`. Returns `None` if the
/// delimiter is absent or either half is empty.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (service, tool) = name.split_once(QUALIFIED_NAME_DELIMITER)?;
    if service.is_empty() || tool.is_empty() {
        return None;
    }
    Some((service, tool))
}
