//! Key function registry - tracks native key functions by name

use crate::datum::Datum;
use crate::error::{Error, Result};
use crate::keyfn::NativeKeyFn;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Named native key functions.
///
/// Index configurations persist only the function name, so a database
/// reopened later must register the same names before the indexes using
/// them can be opened.
pub struct KeyFnRegistry {
    functions: RwLock<HashMap<String, NativeKeyFn>>,
}

impl KeyFnRegistry {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a function. Registering a name again replaces the function.
    pub fn register<F>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(&Datum) -> Vec<String> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "Key function name is empty".to_string(),
            ));
        }

        let mut functions = self
            .functions
            .write()
            .map_err(|e| Error::Internal(format!("Lock error: {}", e)))?;
        functions.insert(name.to_string(), Arc::new(func));
        Ok(())
    }

    /// Remove a function
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut functions = self
            .functions
            .write()
            .map_err(|e| Error::Internal(format!("Lock error: {}", e)))?;

        functions
            .remove(name)
            .ok_or_else(|| Error::UnknownKeyFunction(name.to_string()))?;
        Ok(())
    }

    /// Look up a function
    pub fn get(&self, name: &str) -> Result<NativeKeyFn> {
        let functions = self
            .functions
            .read()
            .map_err(|e| Error::Internal(format!("Lock error: {}", e)))?;
        functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownKeyFunction(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Default for KeyFnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_call() -> Result<()> {
        let registry = KeyFnRegistry::new();
        registry.register("initial", |doc: &Datum| {
            doc.get("name")
                .and_then(Datum::as_str)
                .and_then(|s| s.chars().next())
                .map(|c| vec![c.to_string()])
                .unwrap_or_default()
        })?;

        let func = registry.get("initial")?;
        assert_eq!(func(&Datum::from(json!({"name": "Tom"}))), vec!["T"]);
        assert_eq!(registry.names(), vec!["initial".to_string()]);
        Ok(())
    }

    #[test]
    fn test_unknown_function() {
        let registry = KeyFnRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(Error::UnknownKeyFunction(_))
        ));
        assert!(registry.unregister("missing").is_err());
    }
}
