use std::collections::BTreeSet;

use race_detection::MemoryLocation;
use serde::{Deserialize, Serialize};

/// Filters out accesses that should never produce usage points.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct VariableSkipper {
    names: BTreeSet<String>,
    name_prefixes: BTreeSet<String>,
    functions: BTreeSet<String>,
    function_prefixes: BTreeSet<String>,
}

impl VariableSkipper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_name(mut self, name: &str) -> Self {
        self.names.insert(name.to_string());
        self
    }

    pub fn skip_name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefixes.insert(prefix.to_string());
        self
    }

    pub fn skip_function(mut self, function: &str) -> Self {
        self.functions.insert(function.to_string());
        self
    }

    pub fn skip_function_prefix(mut self, prefix: &str) -> Self {
        self.function_prefixes.insert(prefix.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
            && self.name_prefixes.is_empty()
            && self.functions.is_empty()
            && self.function_prefixes.is_empty()
    }

    pub fn should_skip(&self, location: &MemoryLocation, function: &str) -> bool {
        let name = location.as_str();

        self.names.contains(name)
            || self.name_prefixes.iter().any(|p| name.starts_with(p.as_str()))
            || self.functions.contains(function)
            || self
                .function_prefixes
                .iter()
                .any(|p| function.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use race_detection::MemoryLocation;

    use super::VariableSkipper;

    #[test]
    fn skip_by_name_and_function() {
        let skipper = VariableSkipper::new()
            .skip_name("errno")
            .skip_name_prefix("__")
            .skip_function("printf")
            .skip_function_prefix("ldv_");

        assert!(skipper.should_skip(&MemoryLocation::new("errno"), "main"));
        assert!(skipper.should_skip(&MemoryLocation::new("__stack"), "main"));
        assert!(skipper.should_skip(&MemoryLocation::new("g"), "printf"));
        assert!(skipper.should_skip(&MemoryLocation::new("g"), "ldv_main"));
        assert!(!skipper.should_skip(&MemoryLocation::new("g"), "main"));
        assert!(!skipper.is_empty());
        assert!(VariableSkipper::new().is_empty());
    }

    #[test]
    fn skipper_from_partial_json() -> Result<(), serde_json::Error> {
        let skipper: VariableSkipper = serde_json::from_str(r#"{"names": ["c"]}"#)?;
        assert!(skipper.should_skip(&MemoryLocation::new("c"), "thread2"));
        assert!(!skipper.should_skip(&MemoryLocation::new("g"), "thread2"));
        Ok(())
    }
}
