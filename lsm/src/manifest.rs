use std::{
    collections::{HashMap, HashSet},
    io,
};

use parking_lot::Mutex;
use vela_traits::{ChangeOp, Manifest, ManifestChange, TableManifest};

/// A [`Manifest`] kept in memory only.
///
/// Batches are validated as a whole before any edit is applied, so a
/// rejected batch leaves the catalog untouched.
#[derive(Debug, Default)]
pub struct MemoryManifest {
    tables: Mutex<HashMap<u64, TableManifest>>,
}

impl MemoryManifest {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns where a live table belongs.
    #[inline]
    pub fn get(&self, id: u64) -> Option<TableManifest> {
        self.tables.lock().get(&id).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tables.lock().is_empty()
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

impl Manifest for MemoryManifest {
    fn log_changes(&self, changes: &[ManifestChange]) -> io::Result<()> {
        let mut tables = self.tables.lock();

        let mut created = HashSet::new();
        let mut deleted = HashSet::new();
        for c in changes {
            match c.op {
                ChangeOp::Create => {
                    if (tables.contains_key(&c.id) && !deleted.contains(&c.id)) || !created.insert(c.id) {
                        return Err(invalid(format!("table {} already exists", c.id)));
                    }
                }
                ChangeOp::Delete => {
                    let live = (tables.contains_key(&c.id) || created.contains(&c.id))
                        && !deleted.contains(&c.id);
                    if !live {
                        return Err(invalid(format!("table {} does not exist", c.id)));
                    }
                    deleted.insert(c.id);
                }
            }
        }

        for c in changes {
            match c.op {
                ChangeOp::Create => {
                    tables.insert(
                        c.id,
                        TableManifest {
                            level: c.level,
                            ingest: c.ingest,
                        },
                    );
                }
                ChangeOp::Delete => {
                    tables.remove(&c.id);
                }
            }
        }
        Ok(())
    }

    fn tables(&self) -> HashMap<u64, TableManifest> {
        self.tables.lock().clone()
    }
}
