//! Stack reference ids: integer handles for (thread, frame, path) triplets.
//!
//! The DAP vocabulary wants stable integer handles (`frameId`,
//! `variablesReference`) while the target only speaks indices valid at
//! stop time. This map biject ids with
//! `(thread_index, frame_index, variable_path)` triplets; ids are
//! allocated sparsely on first use and live for the whole session.
//!
//! Thread-safe; reads dominate after the first stop.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::ClientError;

/// A `(thread_index, frame_index, variable_path)` triplet.
pub type StackRefTriplet = (u32, u32, Vec<String>);

#[derive(Debug, Default)]
struct Tables {
    next_id: u32,
    id_to_triplet: HashMap<u32, StackRefTriplet>,
    key_to_id: HashMap<String, u32>,
}

/// Allocator and resolver for stack reference ids. All ids are positive;
/// 0 is reserved for "no reference".
#[derive(Debug)]
pub struct StackReferenceIds {
    tables: Mutex<Tables>,
}

impl Default for StackReferenceIds {
    fn default() -> Self {
        Self::new()
    }
}

impl StackReferenceIds {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_id: 1, // 0 is invalid
                id_to_triplet: HashMap::new(),
                key_to_id: HashMap::new(),
            }),
        }
    }

    /// Return the id for a triplet, allocating one on first use.
    pub fn get_or_allocate(&self, thread_index: u32, frame_index: u32, path: &[String]) -> u32 {
        let key = encode_key(thread_index, frame_index, path);
        let mut tables = lock_tables(&self.tables);
        if let Some(id) = tables.key_to_id.get(&key) {
            return *id;
        }
        let id = tables.next_id;
        tables.next_id += 1;
        tables.key_to_id.insert(key, id);
        tables.id_to_triplet.insert(id, (thread_index, frame_index, path.to_vec()));
        id
    }

    /// Return the id for a triplet without allocating.
    pub fn lookup(&self, thread_index: u32, frame_index: u32, path: &[String]) -> Option<u32> {
        let key = encode_key(thread_index, frame_index, path);
        lock_tables(&self.tables).key_to_id.get(&key).copied()
    }

    /// Id for a child of an existing reference (one more path component).
    pub fn get_child(&self, parent_id: u32, child_name: &str) -> Result<u32, ClientError> {
        let (thread_index, frame_index, mut path) = self.decode(parent_id)?;
        path.push(child_name.to_string());
        Ok(self.get_or_allocate(thread_index, frame_index, &path))
    }

    /// Resolve an id back to its triplet. Unknown ids are an error; the
    /// front-end handed us a handle this session never produced.
    pub fn decode(&self, id: u32) -> Result<StackRefTriplet, ClientError> {
        lock_tables(&self.tables)
            .id_to_triplet
            .get(&id)
            .cloned()
            .ok_or(ClientError::UnknownStackRefId(id))
    }
}

fn lock_tables(tables: &Mutex<Tables>) -> std::sync::MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Key encoding must disambiguate every triplet. Path entries can be AA
/// keys containing any character, including the `|` separator, so the
/// separator is escaped inside entries.
fn encode_key(thread_index: u32, frame_index: u32, path: &[String]) -> String {
    let mut key = format!("{thread_index}|{frame_index}");
    for entry in path {
        key.push('|');
        key.push_str(&entry.replace('|', "|vbar;"));
    }
    key
}
