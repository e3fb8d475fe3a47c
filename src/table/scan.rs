//! Ordered scans over primary and index keyspaces

use super::query::{IndexEntry, Predicate};
use super::TableSettings;
use crate::document::{Document, Oid};
use crate::error::Result;
use crate::storage::cursor::key_successor;
use crate::storage::{Cursor, Entry};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

/// Key bounds of a scan
#[derive(Debug, Clone)]
pub(crate) struct KeyRange {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
    pub inclusive: bool,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lower: None,
            upper: None,
            inclusive: true,
        }
    }

    pub fn exact(key: Vec<u8>) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            inclusive: true,
        }
    }

    fn below_lower(&self, key: &[u8]) -> bool {
        match &self.lower {
            Some(lower) if self.inclusive => key < lower.as_slice(),
            Some(lower) => key <= lower.as_slice(),
            None => false,
        }
    }

    fn above_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Some(upper) if self.inclusive => key > upper.as_slice(),
            Some(upper) => key >= upper.as_slice(),
            None => false,
        }
    }
}

/// Resume strictly after (forward) or before (backward) this entry. The
/// value is absent for primary keyspaces, which hold one entry per key.
pub(crate) type ResumePoint = (Vec<u8>, Option<Vec<u8>>);

/// Raw entries of one keyspace within a key range
pub(crate) struct RawScan<'t> {
    cursor: Cursor<'t>,
    direction: Direction,
    range: KeyRange,
    nodup: bool,
    resume: Option<ResumePoint>,
    started: bool,
    done: bool,
}

impl<'t> RawScan<'t> {
    pub fn new(
        cursor: Cursor<'t>,
        direction: Direction,
        range: KeyRange,
        nodup: bool,
        resume: Option<ResumePoint>,
    ) -> Self {
        Self {
            cursor,
            direction,
            range,
            nodup,
            resume,
            started: false,
            done: false,
        }
    }

    /// Walking backwards with `nodup`, report the first duplicate of a key
    fn first_dup(&mut self, entry: Option<Entry>) -> Result<Option<Entry>> {
        match entry {
            Some((key, _)) if self.nodup => self.cursor.set_key(&key),
            other => Ok(other),
        }
    }

    fn seek_start(&mut self) -> Result<Option<Entry>> {
        match (self.direction, self.resume.take()) {
            (Direction::Forward, Some((key, value))) => match value {
                Some(value) if !self.nodup => self.cursor.set_after(&key, &value),
                _ => self.cursor.set_range(&key_successor(&key)),
            },
            (Direction::Backward, Some((key, value))) => match value {
                Some(value) if !self.nodup => self.cursor.set_before(&key, &value),
                _ => {
                    let entry = self.cursor.set_before(&key, &[])?;
                    self.first_dup(entry)
                }
            },
            (Direction::Forward, None) => match self.range.lower.clone() {
                Some(lower) => self.cursor.set_range(&lower),
                None => self.cursor.first(),
            },
            (Direction::Backward, None) => {
                let entry = match self.range.upper.clone() {
                    Some(upper) => self.cursor.set_range_back(&upper)?,
                    None => self.cursor.last()?,
                };
                self.first_dup(entry)
            }
        }
    }

    fn step(&mut self) -> Result<Option<Entry>> {
        match (self.direction, self.nodup) {
            (Direction::Forward, false) => self.cursor.next(),
            (Direction::Forward, true) => self.cursor.next_nodup(),
            (Direction::Backward, false) => self.cursor.prev(),
            (Direction::Backward, true) => {
                let entry = self.cursor.prev_nodup()?;
                self.first_dup(entry)
            }
        }
    }
}

impl Iterator for RawScan<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        while !self.done {
            let entry = if self.started {
                self.step()
            } else {
                self.started = true;
                self.seek_start()
            };
            let entry = match entry {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let (past_end, before_start) = match self.direction {
                Direction::Forward => (
                    self.range.above_upper(&entry.0),
                    self.range.below_lower(&entry.0),
                ),
                Direction::Backward => (
                    self.range.below_lower(&entry.0),
                    self.range.above_upper(&entry.0),
                ),
            };
            if past_end {
                self.done = true;
                break;
            }
            if !before_start {
                return Some(Ok(entry));
            }
        }
        None
    }
}

/// Lazy iterator over documents. Borrows the scope it was created from, so
/// it cannot outlive the transaction.
pub struct Documents<'t> {
    scan: Option<RawScan<'t>>,
    /// Primary keyspace for index scans, which yield oids
    primary: Option<Cursor<'t>>,
    settings: TableSettings,
    predicate: Option<Predicate>,
    skip: usize,
    remaining: Option<usize>,
    position: Option<(Vec<u8>, Oid)>,
}

impl<'t> Documents<'t> {
    pub(crate) fn new(
        scan: RawScan<'t>,
        primary: Option<Cursor<'t>>,
        settings: TableSettings,
        predicate: Option<Predicate>,
        skip: usize,
        remaining: Option<usize>,
    ) -> Self {
        Self {
            scan: Some(scan),
            primary,
            settings,
            predicate,
            skip,
            remaining,
            position: None,
        }
    }

    /// An iterator with nothing to yield
    pub(crate) fn empty(settings: TableSettings) -> Self {
        Self {
            scan: None,
            primary: None,
            settings,
            predicate: None,
            skip: 0,
            remaining: None,
            position: None,
        }
    }

    /// The last `(key, oid)` examined, filtered out or not
    pub(crate) fn position(&self) -> Option<&(Vec<u8>, Oid)> {
        self.position.as_ref()
    }

    fn load(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<Option<Document>> {
        let (oid, encoded) = match self.primary.as_mut() {
            None => (Oid::from_bytes(&key)?, value),
            Some(primary) => {
                let oid = Oid::from_bytes(&value)?;
                match primary.set_key(&value)? {
                    Some((_, encoded)) => (oid, encoded),
                    None => {
                        warn!(%oid, "Index entry points at a missing document");
                        self.position = Some((key, oid));
                        return Ok(None);
                    }
                }
            }
        };
        self.position = Some((key, oid));
        let content = self.settings.decode(&encoded)?;
        Ok(Some(Document {
            oid: Some(oid),
            content,
        }))
    }
}

impl Iterator for Documents<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Result<Document>> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            let (key, value) = match self.scan.as_mut()?.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let doc = match self.load(key, value) {
                Ok(Some(doc)) => doc,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            if let Some(predicate) = &self.predicate {
                if !predicate(&doc) {
                    continue;
                }
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            return Some(Ok(doc));
        }
    }
}

/// Lazy iterator over index entries without loading documents
pub struct IndexEntries<'t> {
    scan: Option<RawScan<'t>>,
    skip: usize,
    remaining: Option<usize>,
}

impl<'t> IndexEntries<'t> {
    pub(crate) fn new(scan: Option<RawScan<'t>>, skip: usize, remaining: Option<usize>) -> Self {
        Self {
            scan,
            skip,
            remaining,
        }
    }
}

impl Iterator for IndexEntries<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Result<IndexEntry>> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            let (key, value) = match self.scan.as_mut()?.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            return Some(Oid::from_bytes(&value).map(|oid| IndexEntry {
                key: String::from_utf8_lossy(&key).into_owned(),
                oid,
            }));
        }
    }
}
