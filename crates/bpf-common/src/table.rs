//! Named tables shared between kernel-resident probes and user space.
//!
//! A [`TableSpec`] describes the key and value layout of a BPF map. The
//! [`TableRegistry`] validates every declaration against the ones already
//! present and asks a [`TableBackend`] to allocate the backing region.
//! Tables are never updated or resized: they live until [`TableRegistry::teardown`].

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use thiserror::Error;

/// Layout of a key or value: the kernel structure it mirrors and its size.
///
/// Two declarations naming the same structure must agree on its size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Layout {
    name: Cow<'static, str>,
    size: usize,
}

impl Layout {
    pub const fn new(name: &'static str, size: usize) -> Self {
        Self {
            name: Cow::Borrowed(name),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.size)
    }
}

/// How user space reads a table written by kernel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadDiscipline {
    /// Raw reads. Torn or stale entries are tolerated, last writer wins.
    #[default]
    Snapshot,
    /// Entries carry a generation counter, bumped by the writer before and
    /// after an update. Readers retry until they see the same even value.
    Generation,
}

impl fmt::Display for ReadDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadDiscipline::Snapshot => write!(f, "snapshot"),
            ReadDiscipline::Generation => write!(f, "generation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSpec {
    pub name: Cow<'static, str>,
    pub key_layout: Layout,
    pub value_layout: Layout,
    pub max_entries: u32,
    pub read_discipline: ReadDiscipline,
}

impl TableSpec {
    pub const fn new(
        name: &'static str,
        key_layout: Layout,
        value_layout: Layout,
        max_entries: u32,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            key_layout,
            value_layout,
            max_entries,
            read_discipline: ReadDiscipline::Snapshot,
        }
    }

    pub const fn with_read_discipline(mut self, read_discipline: ReadDiscipline) -> Self {
        self.read_discipline = read_discipline;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compare the declaration with the dimensions of the map backing it.
    pub fn check_dimensions(
        &self,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Result<(), TableError> {
        let mismatch = [
            ("key size", self.key_layout.size() as u64, key_size),
            ("value size", self.value_layout.size() as u64, value_size),
            ("max_entries", u64::from(self.max_entries), max_entries),
        ]
        .into_iter()
        .find(|(_, declared, actual)| *declared != u64::from(*actual));

        match mismatch {
            Some((field, declared, actual)) => Err(TableError::InvalidLayout {
                table: self.name().to_string(),
                reason: format!("{field} is {actual} in the loaded map, {declared} declared"),
            }),
            None => Ok(()),
        }
    }

    fn layouts(&self) -> [&Layout; 2] {
        [&self.key_layout, &self.value_layout]
    }
}

#[derive(Error, Debug)]
pub enum TableError {
    #[error("table {0} already declared")]
    Duplicate(String),
    #[error("invalid layout for table {table}: {reason}")]
    InvalidLayout { table: String, reason: String },
    #[error("table {0} is not declared")]
    Unknown(String),
    #[error("backend failure on table {table}")]
    Backend {
        table: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// Allocates and reclaims the storage behind declared tables.
pub trait TableBackend: Send {
    fn allocate(&mut self, table: &TableSpec) -> Result<(), TableError>;
    fn release(&mut self, table: &TableSpec) -> Result<(), TableError>;
}

pub struct TableRegistry {
    tables: Vec<TableSpec>,
    index: HashMap<String, usize>,
    backend: Box<dyn TableBackend>,
}

impl TableRegistry {
    pub fn new(backend: impl TableBackend + 'static) -> Self {
        Self {
            tables: Vec::new(),
            index: HashMap::new(),
            backend: Box::new(backend),
        }
    }

    /// Declare a new table and allocate its backing storage.
    pub fn declare(&mut self, spec: TableSpec) -> Result<&TableSpec, TableError> {
        if self.index.contains_key(spec.name()) {
            return Err(TableError::Duplicate(spec.name().to_string()));
        }
        self.check_layout(&spec)?;
        self.backend.allocate(&spec)?;

        log::debug!(
            "declared table {} key={} value={} max_entries={} ({})",
            spec.name,
            spec.key_layout,
            spec.value_layout,
            spec.max_entries,
            spec.read_discipline
        );
        let position = self.tables.len();
        self.index.insert(spec.name().to_string(), position);
        self.tables.push(spec);
        Ok(&self.tables[position])
    }

    pub fn lookup(&self, name: &str) -> Result<&TableSpec, TableError> {
        self.index
            .get(name)
            .map(|&position| &self.tables[position])
            .ok_or_else(|| TableError::Unknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declared tables, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Release every table in reverse declaration order.
    ///
    /// Failures are logged and returned, they never stop the teardown of the
    /// remaining tables. Calling this on an empty registry is a no-op.
    pub fn teardown(&mut self) -> Vec<TableError> {
        let mut failures = Vec::new();
        while let Some(table) = self.tables.pop() {
            self.index.remove(table.name());
            if let Err(err) = self.backend.release(&table) {
                log::warn!("Error releasing table {}: {err}", table.name);
                failures.push(err);
            }
        }
        failures
    }

    fn check_layout(&self, spec: &TableSpec) -> Result<(), TableError> {
        let invalid = |reason: String| TableError::InvalidLayout {
            table: spec.name().to_string(),
            reason,
        };

        if spec.max_entries == 0 {
            return Err(invalid("max_entries must be greater than 0".to_string()));
        }
        for layout in spec.layouts() {
            if layout.size() == 0 {
                return Err(invalid(format!("{} has size 0", layout.name())));
            }
        }
        if spec.key_layout.name() == spec.value_layout.name()
            && spec.key_layout.size() != spec.value_layout.size()
        {
            return Err(invalid(format!(
                "key and value disagree on the size of {}",
                spec.key_layout.name()
            )));
        }

        for existing in &self.tables {
            for layout in spec.layouts() {
                if let Some(other) = existing
                    .layouts()
                    .into_iter()
                    .find(|other| other.name() == layout.name() && other.size() != layout.size())
                {
                    return Err(invalid(format!(
                        "{} is {} bytes but table {} declares it as {} bytes",
                        layout.name(),
                        layout.size(),
                        existing.name,
                        other.size()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Drop for TableRegistry {
    fn drop(&mut self) {
        if !self.tables.is_empty() {
            log::debug!("releasing {} table(s) on drop", self.tables.len());
            let _ = self.teardown();
        }
    }
}

/// In-process backend keeping a ledger of allocations.
///
/// Used when no kernel object is loaded (catalog inspection, tests).
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    ledger: Arc<Mutex<TableLedger>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableLedger {
    pub live: Vec<String>,
    pub released: Vec<String>,
}

impl MemoryTables {
    pub fn ledger(&self) -> TableLedger {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TableBackend for MemoryTables {
    fn allocate(&mut self, table: &TableSpec) -> Result<(), TableError> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.live.push(table.name().to_string());
        Ok(())
    }

    fn release(&mut self, table: &TableSpec) -> Result<(), TableError> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.live.retain(|name| name != table.name());
        ledger.released.push(table.name().to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: Layout = Layout::new("pid_t", 4);
    const SCRATCH: Layout = Layout::new("struct exec_scratch", 4096);

    fn registry() -> (TableRegistry, MemoryTables) {
        let backend = MemoryTables::default();
        (TableRegistry::new(backend.clone()), backend)
    }

    #[test]
    fn declare_and_lookup() {
        let (mut registry, backend) = registry();
        registry
            .declare(TableSpec::new("exec_scratch", PID, SCRATCH, 1024))
            .unwrap();
        assert_eq!(registry.lookup("exec_scratch").unwrap().max_entries, 1024);
        assert!(matches!(
            registry.lookup("missing"),
            Err(TableError::Unknown(name)) if name == "missing"
        ));
        assert_eq!(backend.ledger().live, vec!["exec_scratch".to_string()]);
    }

    #[test]
    fn duplicate_name() {
        let (mut registry, _) = registry();
        registry
            .declare(TableSpec::new("exec_scratch", PID, SCRATCH, 1024))
            .unwrap();
        assert!(matches!(
            registry.declare(TableSpec::new("exec_scratch", PID, SCRATCH, 8)),
            Err(TableError::Duplicate(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn inconsistent_layout() {
        let (mut registry, backend) = registry();
        registry
            .declare(TableSpec::new("exec_scratch", PID, SCRATCH, 1024))
            .unwrap();
        let err = registry
            .declare(TableSpec::new(
                "exec_scratch_v2",
                PID,
                Layout::new("struct exec_scratch", 2048),
                1024,
            ))
            .unwrap_err();
        assert!(matches!(err, TableError::InvalidLayout { .. }));
        // rejected tables are never allocated
        assert_eq!(backend.ledger().live.len(), 1);
    }

    #[test]
    fn zero_sized() {
        let (mut registry, _) = registry();
        assert!(matches!(
            registry.declare(TableSpec::new("empty", PID, SCRATCH, 0)),
            Err(TableError::InvalidLayout { .. })
        ));
        assert!(matches!(
            registry.declare(TableSpec::new("empty", Layout::new("void", 0), SCRATCH, 1)),
            Err(TableError::InvalidLayout { .. })
        ));
    }

    #[test]
    fn loaded_map_dimensions() {
        let spec = TableSpec::new("exec_scratch", PID, SCRATCH, 1024);
        assert!(spec.check_dimensions(4, 4096, 1024).is_ok());
        for (key, value, entries) in [(8, 4096, 1024), (4, 2048, 1024), (4, 4096, 512)] {
            assert!(matches!(
                spec.check_dimensions(key, value, entries),
                Err(TableError::InvalidLayout { table, .. }) if table == "exec_scratch"
            ));
        }
    }

    #[test]
    fn teardown_reverse_order() {
        let (mut registry, backend) = registry();
        registry
            .declare(TableSpec::new("first", PID, SCRATCH, 1))
            .unwrap();
        registry
            .declare(TableSpec::new("second", PID, Layout::new("u64", 8), 1))
            .unwrap();
        assert!(registry.teardown().is_empty());
        assert!(registry.is_empty());
        assert_eq!(
            backend.ledger(),
            TableLedger {
                live: vec![],
                released: vec!["second".to_string(), "first".to_string()],
            }
        );
        // second teardown has nothing left to release
        assert!(registry.teardown().is_empty());
        assert_eq!(backend.ledger().released.len(), 2);
    }

    #[test]
    fn drop_releases() {
        let (mut registry, backend) = registry();
        registry
            .declare(TableSpec::new("first", PID, SCRATCH, 1))
            .unwrap();
        drop(registry);
        assert!(backend.ledger().live.is_empty());
    }
}
