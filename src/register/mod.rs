//! In-memory deduplicating object register.
//!
//! Two-level index: identifiers map to a payload digest, digests map to a
//! reference-counted entry holding the shared payload bytes. Identifiers
//! with byte-equal payloads share one allocation; the entry is dropped when
//! the last identifier pointing at it goes away. `Bytes` clones handed out
//! by `get`/`set`/`duplicate` keep the allocation alive while responses are
//! still transmitting it, even after the entry itself is deleted.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::protocol::ObjectId;

/// SHA-256 digest of a payload. Byte-equal payloads always collide here and
/// byte-distinct payloads never do in practice, so the digest alone decides
/// storage sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PayloadHash([u8; 32]);

impl PayloadHash {
    fn digest(payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        Self(hasher.finalize().into())
    }
}

struct RegisteredObject {
    use_count: usize,
    payload: Bytes,
}

/// The deduplicating identifier -> payload index.
///
/// Invariants: every digest in `id_to_hash` is a key of `hash_to_object`,
/// each entry's `use_count` equals the number of identifiers pointing at it,
/// and an entry with `use_count == 0` is removed before control returns to
/// the caller.
#[derive(Default)]
pub struct ObjectRegister {
    id_to_hash: BTreeMap<ObjectId, PayloadHash>,
    hash_to_object: HashMap<PayloadHash, RegisteredObject>,
}

impl ObjectRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `payload` under `id`, overwriting any previous mapping.
    ///
    /// If a byte-equal payload is already stored, the supplied buffer is
    /// dropped and the existing one is shared. Returns the payload now
    /// associated with `id`.
    pub fn set(&mut self, id: ObjectId, payload: Bytes) -> Bytes {
        if self.id_to_hash.contains_key(&id) {
            self.delete(&id);
        }

        let hash = PayloadHash::digest(&payload);
        self.id_to_hash.insert(id, hash);

        let entry = self
            .hash_to_object
            .entry(hash)
            .or_insert_with(|| RegisteredObject {
                use_count: 0,
                payload,
            });
        entry.use_count += 1;

        entry.payload.clone()
    }

    /// Returns the payload registered under `id`, if any. Does not alter
    /// reference counts.
    pub fn get(&self, id: &ObjectId) -> Option<Bytes> {
        let hash = self.id_to_hash.get(id)?;
        self.hash_to_object
            .get(hash)
            .map(|entry| entry.payload.clone())
    }

    /// Remove `id` from the register. Returns `false` if it was not mapped.
    pub fn delete(&mut self, id: &ObjectId) -> bool {
        let Some(hash) = self.id_to_hash.remove(id) else {
            return false;
        };

        if let Some(entry) = self.hash_to_object.get_mut(&hash) {
            entry.use_count -= 1;
            if entry.use_count == 0 {
                self.hash_to_object.remove(&hash);
            }
        }

        true
    }

    /// Register `target` as another name for `source`'s payload without
    /// copying bytes. Overwrites `target` if it is already mapped. Returns
    /// `None` if `source` is not mapped.
    pub fn duplicate(&mut self, source: &ObjectId, target: &ObjectId) -> Option<Bytes> {
        let hash = *self.id_to_hash.get(source)?;

        if source == target {
            // Duplicating an id onto itself must not bounce the entry
            // through use_count == 0.
            return self.get(source);
        }

        if self.id_to_hash.contains_key(target) {
            self.delete(target);
        }
        self.id_to_hash.insert(*target, hash);

        let entry = self
            .hash_to_object
            .get_mut(&hash)
            .expect("id_to_hash points at a missing entry");
        entry.use_count += 1;

        Some(entry.payload.clone())
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.id_to_hash.contains_key(id)
    }

    /// Number of registered identifiers.
    pub fn len(&self) -> usize {
        self.id_to_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_hash.is_empty()
    }

    /// Number of distinct payloads (duplicates counted once).
    pub fn unique_len(&self) -> usize {
        self.hash_to_object.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"Hello";

    fn payload() -> Bytes {
        // A fresh allocation each time, so sharing is observable through
        // pointer identity.
        Bytes::from(PAYLOAD.to_vec())
    }

    /// The bookkeeping invariants that must hold after every operation.
    fn assert_invariants(register: &ObjectRegister) {
        let mut use_counts: HashMap<PayloadHash, usize> = HashMap::new();
        for hash in register.id_to_hash.values() {
            assert!(register.hash_to_object.contains_key(hash));
            *use_counts.entry(*hash).or_default() += 1;
        }
        assert_eq!(use_counts.len(), register.hash_to_object.len());
        for (hash, entry) in &register.hash_to_object {
            assert!(entry.use_count >= 1);
            assert_eq!(entry.use_count, use_counts[hash]);
        }
        assert_eq!(
            register.len(),
            register
                .hash_to_object
                .values()
                .map(|e| e.use_count)
                .sum::<usize>()
        );
        assert!(register.unique_len() <= register.len());
    }

    #[test]
    fn test_set_object() {
        let mut register = ObjectRegister::new();
        let id1 = ObjectId([0, 1, 2, 3]);

        assert!(!register.has(&id1));
        assert_eq!(register.len(), 0);
        assert_eq!(register.unique_len(), 0);

        register.set(id1, payload());

        assert!(register.has(&id1));
        assert_eq!(register.len(), 1);
        assert_eq!(register.unique_len(), 1);
        assert_invariants(&register);

        let id2 = ObjectId([3, 2, 1, 0]);
        register.set(id2, payload());

        assert!(register.has(&id2));
        assert_eq!(register.len(), 2);
        assert_eq!(register.unique_len(), 1);
        assert_invariants(&register);
    }

    #[test]
    fn test_get_object() {
        let mut register = ObjectRegister::new();
        let id = ObjectId([0, 1, 2, 3]);

        assert!(register.get(&id).is_none());

        register.set(id, payload());

        assert_eq!(register.get(&id).unwrap().as_ref(), PAYLOAD);
    }

    #[test]
    fn test_delete_object() {
        let mut register = ObjectRegister::new();
        let id = ObjectId([0, 1, 2, 3]);

        register.set(id, payload());

        assert!(register.delete(&id));
        assert!(!register.has(&id));
        assert!(register.get(&id).is_none());
        assert_eq!(register.len(), 0);
        assert_eq!(register.unique_len(), 0);
        assert_invariants(&register);

        assert!(!register.delete(&id));
    }

    #[test]
    fn test_duplicate_object() {
        let mut register = ObjectRegister::new();
        let id1 = ObjectId([0, 1, 2, 3]);
        let id2 = ObjectId([0, 1, 2, 4]);

        assert!(register.duplicate(&id1, &id2).is_none());

        register.set(id1, payload());

        let duplicated = register.duplicate(&id1, &id2).unwrap();
        assert_eq!(duplicated.as_ref(), PAYLOAD);
        assert_invariants(&register);

        // Deleting the original does not remove the duplicate.
        register.delete(&id1);
        assert!(register.has(&id2));
        assert_eq!(register.len(), 1);
        assert_eq!(register.unique_len(), 1);
        assert_eq!(register.get(&id2).unwrap().as_ref(), PAYLOAD);
        assert_invariants(&register);
    }

    #[test]
    fn test_duplicate_onto_itself() {
        let mut register = ObjectRegister::new();
        let id = ObjectId([7, 7, 7, 7]);
        register.set(id, payload());

        let duplicated = register.duplicate(&id, &id).unwrap();
        assert_eq!(duplicated.as_ref(), PAYLOAD);
        assert_eq!(register.len(), 1);
        assert_eq!(register.unique_len(), 1);
        assert_invariants(&register);
    }

    #[test]
    fn test_duplicate_overwrites_target() {
        let mut register = ObjectRegister::new();
        let src = ObjectId([1, 0, 0, 0]);
        let dst = ObjectId([2, 0, 0, 0]);

        register.set(src, payload());
        register.set(dst, Bytes::from_static(b"other"));
        assert_eq!(register.unique_len(), 2);

        register.duplicate(&src, &dst).unwrap();
        assert_eq!(register.get(&dst).unwrap().as_ref(), PAYLOAD);
        assert_eq!(register.len(), 2);
        assert_eq!(register.unique_len(), 1);
        assert_invariants(&register);
    }

    #[test]
    fn test_reference_count() {
        let mut register = ObjectRegister::new();

        let id1 = ObjectId([11, 0, 0, 0]);
        register.set(id1, payload());

        let id2 = ObjectId([12, 0, 0, 0]);
        register.set(id2, payload());

        assert_eq!(register.len(), 2);
        assert_eq!(register.unique_len(), 1);

        // Both identifiers share one buffer.
        let p1 = register.get(&id1).unwrap();
        let p2 = register.get(&id2).unwrap();
        assert_eq!(p1.as_ptr(), p2.as_ptr());

        register.delete(&id1);
        assert_eq!(register.len(), 1);
        assert_eq!(register.unique_len(), 1);
        assert_invariants(&register);

        register.delete(&id2);
        assert_eq!(register.len(), 0);
        assert_eq!(register.unique_len(), 0);
        assert_invariants(&register);
    }

    #[test]
    fn test_set_returns_shared_buffer() {
        let mut register = ObjectRegister::new();
        let id1 = ObjectId([1, 1, 1, 1]);
        let id2 = ObjectId([2, 2, 2, 2]);

        let first = register.set(id1, payload());
        // Second set with equal bytes drops its own allocation and shares
        // the first.
        let second = register.set(id2, payload());
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let mut register = ObjectRegister::new();
        let id = ObjectId([0, 0, 0, 1]);

        register.set(id, Bytes::from_static(b"first"));
        register.set(id, Bytes::from_static(b"second"));

        assert_eq!(register.get(&id).unwrap().as_ref(), b"second");
        assert_eq!(register.len(), 1);
        assert_eq!(register.unique_len(), 1);
        assert_invariants(&register);
    }

    #[test]
    fn test_overwrite_with_same_payload() {
        let mut register = ObjectRegister::new();
        let id = ObjectId([0, 0, 0, 2]);

        register.set(id, payload());
        register.set(id, payload());

        assert_eq!(register.get(&id).unwrap().as_ref(), PAYLOAD);
        assert_eq!(register.len(), 1);
        assert_eq!(register.unique_len(), 1);
        assert_invariants(&register);
    }

    #[test]
    fn test_payload_outlives_entry() {
        let mut register = ObjectRegister::new();
        let id = ObjectId([9, 9, 9, 9]);

        let shared = register.set(id, payload());
        register.delete(&id);

        // An in-flight response still holds the bytes after deletion.
        assert_eq!(shared.as_ref(), PAYLOAD);
    }

    #[test]
    fn test_empty_payload() {
        let mut register = ObjectRegister::new();
        let id = ObjectId([4, 4, 4, 4]);

        register.set(id, Bytes::new());
        assert!(register.has(&id));
        assert_eq!(register.get(&id).unwrap().len(), 0);
        assert_invariants(&register);
    }

    #[test]
    fn test_mixed_operation_sequence_invariants() {
        let mut register = ObjectRegister::new();
        let ids: Vec<ObjectId> = (0..8).map(|i| ObjectId([i, 0, 0, 0])).collect();

        for (i, id) in ids.iter().enumerate() {
            // Two distinct payloads spread across eight ids.
            let bytes = if i % 2 == 0 { b"even".to_vec() } else { b"odd".to_vec() };
            register.set(*id, Bytes::from(bytes));
            assert_invariants(&register);
        }
        assert_eq!(register.len(), 8);
        assert_eq!(register.unique_len(), 2);

        register.duplicate(&ids[0], &ids[1]);
        assert_invariants(&register);
        assert_eq!(register.unique_len(), 2);

        for id in &ids {
            register.delete(id);
            assert_invariants(&register);
        }
        assert_eq!(register.len(), 0);
        assert_eq!(register.unique_len(), 0);
    }
}
