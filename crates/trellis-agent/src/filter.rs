//! Interface name filtering shared by the link watcher and the sampler.

/// Decides which interfaces the agent monitors.
///
/// An explicit allow-list wins over the exclusion prefixes; with no
/// allow-list, anything matching an exclusion prefix (or equal to it) is
/// skipped. Loopback is always excluded.
#[derive(Debug, Clone)]
pub struct InterfaceFilter {
    allow: Option<Vec<String>>,
    exclude_prefixes: Vec<String>,
}

impl Default for InterfaceFilter {
    fn default() -> Self {
        Self {
            allow: None,
            exclude_prefixes: ["lo", "docker", "br-", "veth", "virbr"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl InterfaceFilter {
    /// Filter that only admits the listed interfaces.
    pub fn allow_list(interfaces: Vec<String>) -> Self {
        Self {
            allow: Some(interfaces),
            ..Self::default()
        }
    }

    /// Replace the exclusion prefix set.
    pub fn with_exclude_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.exclude_prefixes = prefixes;
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        if name == "lo" {
            return false;
        }
        if let Some(allow) = &self.allow {
            return allow.iter().any(|a| a == name);
        }
        !self
            .exclude_prefixes
            .iter()
            .any(|p| name == p || name.starts_with(p.as_str()))
    }
}
