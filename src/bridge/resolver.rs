//! Role to configuration key mapping and class resolution.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::bridge::error::BridgeError;
use crate::bridge::interpreter::{split_class_path, InterpreterHandle, OpaqueValue};
use crate::host::conf::Configuration;

/// Script executed before any role class is resolved
pub const JOB_SETUP_SCRIPT_KEY: &str = "luadoop.job_setup_script";

/// Creation entry point used when a role has no `.factory` override
pub const DEFAULT_FACTORY: &str = "new";

/// Host component roles a script class can fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Mapper,
    Reducer,
    Combiner,
    Partitioner,
    GroupingComparator,
    SortComparator,
    InputFormat,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Mapper,
        Role::Reducer,
        Role::Combiner,
        Role::Partitioner,
        Role::GroupingComparator,
        Role::SortComparator,
        Role::InputFormat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Role::Mapper => "mapper",
            Role::Reducer => "reducer",
            Role::Combiner => "combiner",
            Role::Partitioner => "partitioner",
            Role::GroupingComparator => "grouping_comparator",
            Role::SortComparator => "sort_comparator",
            Role::InputFormat => "input_format",
        }
    }

    /// Configuration key holding the role's class name
    pub fn config_key(self) -> &'static str {
        match self {
            Role::Mapper => "luadoop.mapper",
            Role::Reducer => "luadoop.reducer",
            Role::Combiner => "luadoop.combiner",
            Role::Partitioner => "luadoop.partitioner",
            Role::GroupingComparator => "luadoop.grouping_comparator",
            Role::SortComparator => "luadoop.sort_comparator",
            Role::InputFormat => "luadoop.input_format",
        }
    }

    pub fn factory_key(self) -> String {
        format!("{}.factory", self.config_key())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A resolved class and the name it was resolved from
#[derive(Debug)]
pub struct ClassRef {
    pub name: String,
    pub value: OpaqueValue,
}

fn segment_pattern() -> Result<&'static Regex, BridgeError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"))
        .as_ref()
        .map_err(|e| BridgeError::configuration(format!("Invalid class name pattern: {}", e)))
}

/// Check that every segment of a class name is a Lua identifier
pub fn validate_class_name(name: &str) -> Result<(), BridgeError> {
    let pattern = segment_pattern()?;
    for segment in split_class_path(name) {
        if !pattern.is_match(segment) {
            return Err(BridgeError::configuration(format!(
                "Cannot load class {}: \"invalid name segment '{}'\"",
                name, segment
            )));
        }
    }
    Ok(())
}

/// Resolves configured role classes inside one interpreter
pub struct ConfigurationResolver {
    interpreter: Arc<InterpreterHandle>,
}

impl ConfigurationResolver {
    pub fn new(interpreter: Arc<InterpreterHandle>) -> Self {
        Self { interpreter }
    }

    pub fn interpreter(&self) -> &Arc<InterpreterHandle> {
        &self.interpreter
    }

    /// Read a key that must be present.
    ///
    /// # Errors
    /// `BridgeError::Configuration("Missing required configuration key <key>")`
    pub fn require_key<'c>(conf: &'c Configuration, key: &str) -> Result<&'c str, BridgeError> {
        conf.get(key).ok_or_else(|| {
            BridgeError::configuration(format!("Missing required configuration key {}", key))
        })
    }

    /// Creation entry point for a role, `new` unless overridden
    pub fn factory_for(conf: &Configuration, role: Role) -> String {
        conf.get(&role.factory_key())
            .unwrap_or(DEFAULT_FACTORY)
            .to_string()
    }

    /// Resolve the class configured for `role`.
    ///
    /// The setup script key is checked before the role key, so a job without
    /// a setup script fails on that key whatever role is being resolved.
    ///
    /// # Example
    /// ```ignore
    /// let resolver = ConfigurationResolver::new(InterpreterHandle::acquire()?);
    /// let class = resolver.resolve_class(&conf, Role::Mapper)?;
    /// println!("resolved {}", class.name);
    /// ```
    pub fn resolve_class(&self, conf: &Configuration, role: Role) -> Result<ClassRef, BridgeError> {
        let script = Self::require_key(conf, JOB_SETUP_SCRIPT_KEY)?;
        let class_name = Self::require_key(conf, role.config_key())?;
        self.load_class(script, class_name)
    }

    /// Load the setup script (once) and walk `class_name`
    pub fn load_class(&self, script: &str, class_name: &str) -> Result<ClassRef, BridgeError> {
        self.interpreter.load_setup_script_once(Path::new(script))?;
        validate_class_name(class_name)?;

        let value = self.interpreter.lookup_path(class_name).map_err(|e| {
            BridgeError::configuration(format!(
                "Cannot load class {}: \"{}\"",
                class_name,
                e.message()
            ))
        })?;

        tracing::debug!(class = class_name, kind = value.type_name(), "resolved class");
        Ok(ClassRef {
            name: class_name.to_string(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("setup.lua");
        fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    fn conf_with(script: &str, pairs: &[(&str, &str)]) -> Configuration {
        let mut conf = Configuration::new();
        conf.set(JOB_SETUP_SCRIPT_KEY, script);
        for (k, v) in pairs {
            conf.set(*k, *v);
        }
        conf
    }

    #[test]
    fn test_missing_setup_script_key_is_reported_first() {
        let resolver = ConfigurationResolver::new(InterpreterHandle::isolated().unwrap());
        let conf = Configuration::new();
        let err = resolver.resolve_class(&conf, Role::Mapper).unwrap_err();
        assert_eq!(
            err,
            BridgeError::Configuration(
                "Missing required configuration key luadoop.job_setup_script".to_string()
            )
        );
    }

    #[test]
    fn test_missing_role_key() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "Counter = { runs = 0 }");
        let resolver = ConfigurationResolver::new(InterpreterHandle::isolated().unwrap());
        let err = resolver
            .resolve_class(&conf_with(&script, &[]), Role::Partitioner)
            .unwrap_err();
        assert!(err.message().contains("luadoop.partitioner"));
    }

    #[test]
    fn test_setup_script_runs_once_per_handle() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            &dir,
            "LOADS = (LOADS or 0) + 1
             Jobs = { Mapper = luadoop.class() }",
        );
        let interp = InterpreterHandle::isolated().unwrap();
        let resolver = ConfigurationResolver::new(Arc::clone(&interp));
        let conf = conf_with(&script, &[("luadoop.mapper", "Jobs.Mapper")]);

        let first = resolver.resolve_class(&conf, Role::Mapper).unwrap();
        let second = resolver.resolve_class(&conf, Role::Mapper).unwrap();
        assert_eq!(first.name, "Jobs.Mapper");
        assert_eq!(second.value.type_name(), "table");
        assert_eq!(interp.evaluate_datum("return LOADS").unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_undefined_segment_names_class() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "Jobs = {}");
        let resolver = ConfigurationResolver::new(InterpreterHandle::isolated().unwrap());
        let conf = conf_with(&script, &[("luadoop.reducer", "Jobs::Missing")]);
        let err = resolver.resolve_class(&conf, Role::Reducer).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.message().starts_with("Cannot load class Jobs::Missing"));
    }

    #[test]
    fn test_invalid_segment_is_rejected() {
        assert!(validate_class_name("Good.Name_2").is_ok());
        assert!(validate_class_name("Bad.2name").is_err());
        assert!(validate_class_name("with space").is_err());
        assert!(validate_class_name("Trailing.").is_err());
    }

    #[test]
    fn test_broken_setup_script_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "this is not lua");
        let resolver = ConfigurationResolver::new(InterpreterHandle::isolated().unwrap());
        let conf = conf_with(&script, &[("luadoop.mapper", "M")]);
        let err = resolver.resolve_class(&conf, Role::Mapper).unwrap_err();
        assert!(err.message().starts_with("Could not load job setup script"));
    }

    #[test]
    fn test_factory_override() {
        let mut conf = Configuration::new();
        assert_eq!(ConfigurationResolver::factory_for(&conf, Role::Mapper), "new");
        conf.set("luadoop.mapper.factory", "create");
        assert_eq!(ConfigurationResolver::factory_for(&conf, Role::Mapper), "create");
        assert_eq!(ConfigurationResolver::factory_for(&conf, Role::Reducer), "new");
    }
}
