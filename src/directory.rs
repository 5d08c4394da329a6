use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::LaborFacts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    UnknownLabor(Ulid),
    /// The lookup itself failed; nothing was read and retrying is safe.
    Unavailable(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::UnknownLabor(id) => write!(f, "unknown labor: {id}"),
            DirectoryError::Unavailable(msg) => write!(f, "labor directory unavailable: {msg}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Resolves a labor's state and program (via its lot).
///
/// Results may be reused within one allocation call but never across calls,
/// since a lot can be moved to another program.
#[async_trait]
pub trait LaborDirectory: Send + Sync {
    async fn labor(&self, id: Ulid) -> Result<LaborFacts, DirectoryError>;
}

/// Labor facts pushed by the Labor service and replayed from the ledger log.
#[derive(Default)]
pub struct LaborTable {
    labors: DashMap<Ulid, LaborFacts>,
}

impl LaborTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, facts: LaborFacts) {
        self.labors.insert(facts.id, facts);
    }

    pub fn get(&self, id: &Ulid) -> Option<LaborFacts> {
        self.labors.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.labors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.labors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labors.is_empty()
    }

    pub fn snapshot(&self) -> Vec<LaborFacts> {
        self.labors.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl LaborDirectory for LaborTable {
    async fn labor(&self, id: Ulid) -> Result<LaborFacts, DirectoryError> {
        self.get(&id).ok_or(DirectoryError::UnknownLabor(id))
    }
}
