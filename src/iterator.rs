//! Iteration over the live key-value pairs.

use std::collections::VecDeque;

use crate::db::{Db, State};
use crate::error::Result;

/// Iterator over every live `(key, value)` pair of a database, each exactly
/// once, in an unspecified order.
///
/// The iterator walks the index bucket by bucket, materializing one chain's
/// worth of pairs at a time under the shared read lock; memory use stays
/// bounded no matter how large the database is.  Pairs are copied out, so
/// items remain valid after the iterator or the lock is gone.  Mutating the
/// database mid-iteration keeps the iterator safe but the exactly-once
/// guarantee only holds without concurrent writers.
pub struct ItemIterator<'a> {
    db: &'a Db,
    next_bucket: u32,
    queue: VecDeque<(Vec<u8>, Vec<u8>)>,
    failed: bool,
}

impl<'a> ItemIterator<'a> {
    pub(crate) fn new(db: &'a Db) -> Self {
        Self {
            db,
            next_bucket: 0,
            queue: VecDeque::new(),
            failed: false,
        }
    }

    fn fetch_bucket(&mut self) -> Result<bool> {
        let state = self.db.shared.state.read();
        let State { index, datalog } = &*state;
        if self.next_bucket >= index.num_buckets() {
            return Ok(false);
        }
        for slot in index.bucket_slots(self.next_bucket)? {
            let (key, value) = datalog.read_key_value(&slot)?;
            self.queue.push_back((key.to_vec(), value.to_vec()));
        }
        self.next_bucket += 1;
        Ok(true)
    }
}

impl Iterator for ItemIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(Ok(item));
            }
            match self.fetch_bucket() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Db;
    use crate::error::Result;
    use crate::options::Options;
    use std::collections::BTreeMap;

    #[test]
    fn empty_db_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), Options::default()).unwrap();
        assert_eq!(db.items().count(), 0);
    }

    #[test]
    fn covers_every_pair_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), Options::default()).unwrap();
        let mut expected = BTreeMap::new();
        for i in 0..1_000u32 {
            let key = i.to_le_bytes().to_vec();
            let value = format!("v{}", i).into_bytes();
            db.put(&key, &value).unwrap();
            expected.insert(key, value);
        }
        // Overwrites and deletes must not produce duplicates or ghosts.
        for i in 0..100u32 {
            let key = i.to_le_bytes().to_vec();
            db.put(&key, b"new").unwrap();
            expected.insert(key, b"new".to_vec());
        }
        for i in 100..150u32 {
            let key = i.to_le_bytes().to_vec();
            db.delete(&key).unwrap();
            expected.remove(&key);
        }

        let items: Vec<_> = db.items().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(items.len(), expected.len());
        let got: BTreeMap<Vec<u8>, Vec<u8>> = items.into_iter().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn iterates_across_segment_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), Options::default().max_segment_size(1024)).unwrap();
        for i in 0..100u8 {
            db.put(&[i], &[i]).unwrap();
        }
        assert!(db.shared.state.read().datalog.segment_count() > 1);
        let mut keys: Vec<u8> = db
            .items()
            .map(|item| item.unwrap().0[0])
            .collect();
        keys.sort_unstable();
        let expected: Vec<u8> = (0..100).collect();
        assert_eq!(keys, expected);
    }
}
