use serde::{Deserialize, Serialize};

/// Default separator between a group and a member in a service name.
pub const DEFAULT_GROUP_SEPARATOR: &str = "/";

/// One entry of the directory as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Opaque service name, optionally `group<sep>member`
    pub name: String,

    /// Resolved `ip:port`
    pub address: String,
}

impl From<(String, String)> for ServiceEntry {
    fn from((name, address): (String, String)) -> Self {
        Self { name, address }
    }
}

/// Whether `name` belongs to `group`, i.e. starts with `group` followed by `separator`.
pub fn in_group(name: &str, group: &str, separator: &str) -> bool {
    name.strip_prefix(group)
        .is_some_and(|rest| rest.starts_with(separator))
}

/// Keep the pairs that belong to `group`, dropping any name in `exclude`.
pub fn filter_group(
    services: impl IntoIterator<Item = (String, String)>,
    group: &str,
    separator: &str,
    exclude: &[&str],
) -> Vec<(String, String)> {
    services
        .into_iter()
        .filter(|(name, _)| in_group(name, group, separator) && !exclude.contains(&name.as_str()))
        .collect()
}
