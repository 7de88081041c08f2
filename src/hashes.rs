//! Hash id registrar and hash-equivalence relations.
//!
//! Grounded on `hashidregistrar.cpp/h` (bijective map, atomic
//! get-or-create across concurrent callers) and `hashrelations.cpp/h`
//! (shared-group equivalence, not a classic union-find: merging regroups
//! every member onto one shared set rather than pointing at a root).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use rusqlite::Connection;

use crate::wire::WireFileHash;

/// Bijective `FileHash <-> HashId` store. `0` is never assigned; it means
/// "unset" at call sites that haven't looked a hash up yet.
pub struct HashIdRegistrar {
    inner: Mutex<RegistrarInner>,
}

struct RegistrarInner {
    hash_to_id: HashMap<WireFileHash, u32>,
    id_to_hash: HashMap<u32, WireFileHash>,
    next_id: u32,
}

impl HashIdRegistrar {
    /// Load all existing assignments from the `hash` table so in-memory and
    /// persisted state start out consistent.
    pub fn load_from_db(db: &Connection) -> Result<Self> {
        let mut stmt = db.prepare("SELECT id, length, sha1, md5 FROM hash")?;
        let mut hash_to_id = HashMap::new();
        let mut id_to_hash = HashMap::new();
        let mut max_id = 0u32;

        let rows = stmt.query_map([], |row| {
            let id: u32 = row.get(0)?;
            let length: i64 = row.get(1)?;
            let sha1: Vec<u8> = row.get(2)?;
            let md5: Vec<u8> = row.get(3)?;
            Ok((id, length as u64, sha1, md5))
        })?;

        for row in rows {
            let (id, length, sha1, md5) = row?;
            let mut hash = WireFileHash { length, sha1: [0; 20], md5: [0; 16] };
            hash.sha1.copy_from_slice(&sha1);
            hash.md5.copy_from_slice(&md5);
            hash_to_id.insert(hash, id);
            id_to_hash.insert(id, hash);
            max_id = max_id.max(id);
        }

        Ok(HashIdRegistrar {
            inner: Mutex::new(RegistrarInner { hash_to_id, id_to_hash, next_id: max_id + 1 }),
        })
    }

    /// Idempotent and atomic across concurrent callers asking for the same
    /// hash: the lock is held for the whole lookup-or-insert-and-persist
    /// sequence, matching the original's single `registerHash` critical
    /// section.
    pub fn get_or_create_id(&self, db: &Connection, hash: WireFileHash) -> Result<u32> {
        if hash.is_zero() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.hash_to_id.get(&hash) {
            return Ok(id);
        }
        let id = inner.next_id;
        db.execute(
            "INSERT INTO hash (id, length, sha1, md5) VALUES (?1, ?2, ?3, ?4)",
            (id, hash.length as i64, hash.sha1.as_slice(), hash.md5.as_slice()),
        )?;
        inner.hash_to_id.insert(hash, id);
        inner.id_to_hash.insert(id, hash);
        inner.next_id += 1;
        Ok(id)
    }

    /// Order-preserving bulk variant.
    pub fn get_or_create_ids(&self, db: &Connection, hashes: &[WireFileHash]) -> Result<Vec<u32>> {
        hashes.iter().map(|&h| self.get_or_create_id(db, h)).collect()
    }

    pub fn get_id_for_hash(&self, hash: WireFileHash) -> Option<u32> {
        self.inner.lock().unwrap().hash_to_id.get(&hash).copied()
    }

    pub fn get_hash_for_id(&self, id: u32) -> Option<WireFileHash> {
        self.inner.lock().unwrap().id_to_hash.get(&id).copied()
    }

    pub fn is_registered(&self, hash: WireFileHash) -> bool {
        self.inner.lock().unwrap().hash_to_id.contains_key(&hash)
    }

    pub fn get_all_loaded(&self) -> Vec<u32> {
        self.inner.lock().unwrap().id_to_hash.keys().copied().collect()
    }
}

/// Equivalence classes over `HashId`s. Groups are represented as shared,
/// mutex-guarded sets; joining two groups re-points every member of both at
/// one new set, the same trick the original's `QSharedPointer<Entry>`
/// sharing achieves, expressed here with `Arc<Mutex<HashSet<u32>>>`.
#[derive(Default)]
pub struct HashRelations {
    entries: Mutex<HashMap<u32, Arc<Mutex<HashSet<u32>>>>>,
}

impl HashRelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union all given ids (and any groups they already belonged to) into
    /// one group. A repeat call with the same or a subset of ids is a
    /// no-op: the members are already in one set.
    pub fn mark_as_equivalent(&self, ids: &[u32]) {
        if ids.len() < 2 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();

        let mut merged = HashSet::new();
        merged.extend(ids.iter().copied());
        let mut existing_groups: Vec<Arc<Mutex<HashSet<u32>>>> = Vec::new();
        for id in ids {
            if let Some(group) = entries.get(id) {
                existing_groups.push(Arc::clone(group));
            }
        }
        for group in &existing_groups {
            merged.extend(group.lock().unwrap().iter().copied());
        }

        let new_group = Arc::new(Mutex::new(merged.clone()));
        for member in &merged {
            entries.insert(*member, Arc::clone(&new_group));
        }
    }

    /// Every member of `id`'s group, including `id` itself. A hash with no
    /// recorded relations is its own singleton group.
    pub fn group_of(&self, id: u32) -> HashSet<u32> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(group) => group.lock().unwrap().clone(),
            None => HashSet::from([id]),
        }
    }

    pub fn others_equivalent_to(&self, id: u32) -> HashSet<u32> {
        let mut group = self.group_of(id);
        group.remove(&id);
        group
    }

    /// Load equivalence pairs recorded in the `hash_equivalence` table (one
    /// row per pairwise link, the simplest schema that reconstructs groups
    /// on startup via repeated `mark_as_equivalent` calls).
    pub fn load_from_db(db: &Connection) -> Result<Self> {
        let relations = Self::new();
        let mut stmt = db.prepare("SELECT hash_id_a, hash_id_b FROM hash_equivalence")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)))?;
        for row in rows {
            let (a, b) = row?;
            relations.mark_as_equivalent(&[a, b]);
        }
        Ok(relations)
    }

    pub fn persist_link(&self, db: &Connection, a: u32, b: u32) -> Result<()> {
        db.execute(
            "INSERT OR IGNORE INTO hash_equivalence (hash_id_a, hash_id_b) VALUES (?1, ?2)",
            (a, b),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE hash (id INTEGER PRIMARY KEY, length INTEGER, sha1 BLOB, md5 BLOB);
             CREATE TABLE hash_equivalence (hash_id_a INTEGER, hash_id_b INTEGER);",
        )
        .unwrap();
        db
    }

    fn fake_hash(n: u8) -> WireFileHash {
        WireFileHash { length: n as u64, sha1: [n; 20], md5: [n; 16] }
    }

    #[test]
    fn get_or_create_id_is_idempotent() {
        let db = test_db();
        let registrar = HashIdRegistrar::load_from_db(&db).unwrap();
        let h = fake_hash(1);
        let id1 = registrar.get_or_create_id(&db, h).unwrap();
        let id2 = registrar.get_or_create_id(&db, h).unwrap();
        assert_eq!(id1, id2);
        assert_ne!(id1, 0);
    }

    #[test]
    fn zero_hash_never_gets_an_id() {
        let db = test_db();
        let registrar = HashIdRegistrar::load_from_db(&db).unwrap();
        assert_eq!(registrar.get_or_create_id(&db, WireFileHash::ZERO).unwrap(), 0);
    }

    #[test]
    fn bulk_ids_preserve_order() {
        let db = test_db();
        let registrar = HashIdRegistrar::load_from_db(&db).unwrap();
        let hashes = vec![fake_hash(1), fake_hash(2), fake_hash(1), fake_hash(3)];
        let ids = registrar.get_or_create_ids(&db, &hashes).unwrap();
        assert_eq!(ids[0], ids[2]);
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[3]);
    }

    #[test]
    fn equivalence_is_transitive_and_idempotent() {
        let relations = HashRelations::new();
        relations.mark_as_equivalent(&[1, 2]);
        relations.mark_as_equivalent(&[2, 3]);
        let expected = HashSet::from([1, 2, 3]);
        assert_eq!(relations.group_of(1), expected);
        assert_eq!(relations.group_of(3), expected);

        // repeat call is a no-op
        relations.mark_as_equivalent(&[1, 2]);
        assert_eq!(relations.group_of(2), expected);
    }

    #[test]
    fn singleton_group_contains_only_itself() {
        let relations = HashRelations::new();
        assert_eq!(relations.group_of(42), HashSet::from([42]));
        assert!(relations.others_equivalent_to(42).is_empty());
    }
}
