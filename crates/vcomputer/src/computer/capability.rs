use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::{ScriptError, Value, WorkerContext};

/// Named module a script can call into, e.g. `term` or `robot`.
///
/// Calls arrive on the computer's worker thread. Anything that must touch the
/// world goes through [`WorkerContext::execute_command`].
pub trait Capability<W>: Send + Sync {
    fn names(&self) -> &[&'static str];

    fn call(
        &self,
        ctx: &mut WorkerContext<W>,
        method: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, ScriptError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability name '{0}' is already registered")]
    DuplicateName(String),
    #[error("capabilities are frozen once the computer has booted")]
    Frozen,
}

pub struct CapabilityTable<W> {
    entries: BTreeMap<&'static str, Arc<dyn Capability<W>>>,
}

impl<W> Default for CapabilityTable<W> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<W> fmt::Debug for CapabilityTable<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

impl<W> CapabilityTable<W> {
    /// Registers `capability` under every name it reports. Nothing is
    /// registered if any name is taken.
    pub fn insert(&mut self, capability: Arc<dyn Capability<W>>) -> Result<(), CapabilityError> {
        if let Some(taken) = capability
            .names()
            .iter()
            .find(|name| self.entries.contains_key(*name))
        {
            return Err(CapabilityError::DuplicateName((*taken).to_string()));
        }
        for name in capability.names() {
            self.entries.insert(*name, Arc::clone(&capability));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability<W>>> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static [&'static str]);

    impl Capability<()> for Named {
        fn names(&self) -> &[&'static str] {
            self.0
        }

        fn call(
            &self,
            _ctx: &mut WorkerContext<()>,
            method: &str,
            _args: &[Value],
        ) -> Result<Vec<Value>, ScriptError> {
            Err(ScriptError::UnknownMethod {
                capability: self.0[0].to_string(),
                method: method.to_string(),
            })
        }
    }

    #[test]
    fn aliases_share_one_capability() {
        let mut table = CapabilityTable::<()>::default();
        table
            .insert(Arc::new(Named(&["term", "terminal"])))
            .expect("insert");

        assert_eq!(table.len(), 2);
        let by_alias = table.get("terminal").expect("alias");
        let by_name = table.get("term").expect("name");
        assert!(Arc::ptr_eq(by_alias, by_name));
    }

    #[test]
    fn duplicate_name_rejects_whole_capability() {
        let mut table = CapabilityTable::<()>::default();
        table.insert(Arc::new(Named(&["os"]))).expect("insert");

        let result = table.insert(Arc::new(Named(&["fs", "os"])));
        assert_eq!(result, Err(CapabilityError::DuplicateName("os".to_string())));
        assert!(table.get("fs").is_none());
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["os"]);
    }
}
