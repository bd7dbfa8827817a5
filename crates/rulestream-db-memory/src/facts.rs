use async_trait::async_trait;
use papaya::HashMap as PapayaHashMap;
use rulestream_core::{Fact, FactId};
use rulestream_storage::{FactStore, StorageError};

/// Fact definitions kept in a papaya lock-free map.
#[derive(Debug, Default)]
pub struct InMemoryFactStore {
    facts: PapayaHashMap<FactId, Fact>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_facts(facts: impl IntoIterator<Item = Fact>) -> Self {
        let store = Self::new();
        for fact in facts {
            store.insert(fact);
        }
        store
    }

    pub fn insert(&self, fact: Fact) {
        self.facts.pin().insert(fact.id, fact);
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn get_fact(&self, id: FactId) -> Result<Option<Fact>, StorageError> {
        Ok(self.facts.pin().get(&id).cloned())
    }
}
