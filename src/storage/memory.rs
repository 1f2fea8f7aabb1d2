use super::Catalog;
use crate::core::{BaseId, BaseSchema, DbError, DbObject, FieldId, Invid, Result, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

/// A reference held by `holder.field` whose `target` no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingRef {
    pub holder: Invid,
    pub field: FieldId,
    pub target: Invid,
}

/// Serializable image of the whole store. Back-links are derived and rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreImage {
    pub catalog: Catalog,
    pub objects: Vec<DbObject>,
    pub counters: BTreeMap<BaseId, u32>,
    pub last_change: BTreeMap<BaseId, DateTime<Utc>>,
}

#[derive(Default)]
struct StoreInner {
    catalog: Catalog,
    objects: BTreeMap<Invid, DbObject>,
    counters: HashMap<BaseId, u32>,
    /// target -> objects pointing at it
    backlinks: HashMap<Invid, BTreeSet<Invid>>,
    last_change: HashMap<BaseId, DateTime<Utc>>,
}

impl StoreInner {
    fn link(&mut self, holder: &DbObject) {
        for (_, target) in holder.references() {
            self.backlinks.entry(target).or_default().insert(holder.invid());
        }
    }

    fn unlink(&mut self, holder: &DbObject) {
        for (_, target) in holder.references() {
            if let Some(set) = self.backlinks.get_mut(&target) {
                set.remove(&holder.invid());
                if set.is_empty() {
                    self.backlinks.remove(&target);
                }
            }
        }
    }

    fn expected_backlinks(&self) -> HashMap<Invid, BTreeSet<Invid>> {
        let mut expected: HashMap<Invid, BTreeSet<Invid>> = HashMap::new();
        for obj in self.objects.values() {
            for (_, target) in obj.references() {
                expected.entry(target).or_default().insert(obj.invid());
            }
        }
        expected
    }
}

/// The in-memory object store.
///
/// The internal `RwLock` only protects memory safety of individual calls.
/// Logical isolation between sessions (who may read or mutate which base
/// and when) is the job of the lock manager; callers are expected to hold
/// the appropriate lock before touching the store.
pub struct ObjectStore {
    inner: RwLock<StoreInner>,
}

impl ObjectStore {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                catalog,
                ..Default::default()
            }),
        }
    }

    pub fn from_image(image: StoreImage) -> Self {
        let mut inner = StoreInner {
            catalog: image.catalog,
            counters: image.counters.into_iter().collect(),
            last_change: image.last_change.into_iter().collect(),
            ..Default::default()
        };
        for obj in image.objects {
            inner.link(&obj);
            let counter = inner.counters.entry(obj.invid().base).or_insert(0);
            *counter = (*counter).max(obj.invid().num);
            inner.objects.insert(obj.invid(), obj);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn image(&self) -> Result<StoreImage> {
        let inner = self.inner.read()?;
        Ok(StoreImage {
            catalog: inner.catalog.clone(),
            objects: inner.objects.values().cloned().collect(),
            counters: inner.counters.iter().map(|(k, v)| (*k, *v)).collect(),
            last_change: inner.last_change.iter().map(|(k, v)| (*k, *v)).collect(),
        })
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    pub fn add_base(&self, schema: BaseSchema) -> Result<()> {
        self.inner.write()?.catalog.add_base(schema)
    }

    pub fn schema(&self, base: BaseId) -> Result<BaseSchema> {
        self.inner.read()?.catalog.base(base).cloned()
    }

    pub fn catalog(&self) -> Result<Catalog> {
        Ok(self.inner.read()?.catalog.clone())
    }

    pub fn base_ids(&self) -> Result<Vec<BaseId>> {
        Ok(self.inner.read()?.catalog.base_ids())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.read()?.objects.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, invid: Invid) -> Result<bool> {
        Ok(self.inner.read()?.objects.contains_key(&invid))
    }

    pub fn get(&self, invid: Invid) -> Result<Option<DbObject>> {
        Ok(self.inner.read()?.objects.get(&invid).cloned())
    }

    pub fn require(&self, invid: Invid) -> Result<DbObject> {
        self.get(invid)?.ok_or(DbError::ObjectNotFound(invid))
    }

    pub fn objects_in(&self, base: BaseId) -> Result<Vec<DbObject>> {
        let inner = self.inner.read()?;
        let range = Invid::new(base, 0)..=Invid::new(base, u32::MAX);
        Ok(inner.objects.range(range).map(|(_, o)| o.clone()).collect())
    }

    pub fn query<F>(&self, base: BaseId, mut predicate: F) -> Result<Vec<DbObject>>
    where
        F: FnMut(&DbObject) -> bool,
    {
        Ok(self
            .objects_in(base)?
            .into_iter()
            .filter(|o| predicate(o))
            .collect())
    }

    /// Objects in `base` whose label text matches `label`, ignoring case.
    /// More than one match is possible when labels are not unique.
    pub fn find_by_label(&self, base: BaseId, label: &str) -> Result<Vec<DbObject>> {
        let schema = self.schema(base)?;
        let Some(label_field) = schema.label_field() else {
            return Ok(Vec::new());
        };
        self.query(base, |o| {
            o.get(label_field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.eq_ignore_ascii_case(label))
        })
    }

    /// Objects currently pointing at `target`.
    pub fn backlinks(&self, target: Invid) -> Result<Vec<Invid>> {
        Ok(self
            .inner
            .read()?
            .backlinks
            .get(&target)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }

    pub fn last_change(&self, base: BaseId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.read()?.last_change.get(&base).copied())
    }

    /// True when any of `bases` was committed to after `since`.
    /// A `None` reference time counts as "never checked", so any recorded change matches.
    pub fn changed_since(&self, bases: &[BaseId], since: Option<DateTime<Utc>>) -> Result<bool> {
        let inner = self.inner.read()?;
        Ok(bases.iter().any(|b| match (inner.last_change.get(b), since) {
            (Some(changed), Some(since)) => *changed > since,
            (Some(_), None) => true,
            (None, _) => false,
        }))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Hand out the next object number in `base`. Numbers are never reused,
    /// even when the creating transaction is discarded.
    pub fn reserve_invid(&self, base: BaseId) -> Result<Invid> {
        let mut inner = self.inner.write()?;
        if !inner.catalog.contains(base) {
            return Err(DbError::BaseNotFound(base));
        }
        let counter = inner.counters.entry(base).or_insert(0);
        *counter += 1;
        Ok(Invid::new(base, *counter))
    }

    /// Install a batch of final object states in one critical section.
    /// `None` deletes the object.
    pub fn apply(&self, batch: Vec<(Invid, Option<DbObject>)>, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write()?;
        for (invid, next) in batch {
            if let Some(old) = inner.objects.remove(&invid) {
                inner.unlink(&old);
            }
            if let Some(obj) = next {
                inner.link(&obj);
                let counter = inner.counters.entry(invid.base).or_insert(0);
                *counter = (*counter).max(invid.num);
                inner.objects.insert(invid, obj);
            }
            inner.last_change.insert(invid.base, now);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integrity scans
    // ------------------------------------------------------------------

    pub fn dangling_references(&self) -> Result<Vec<DanglingRef>> {
        let inner = self.inner.read()?;
        let mut dangling = Vec::new();
        for obj in inner.objects.values() {
            for (field, target) in obj.references() {
                if !inner.objects.contains_key(&target) {
                    dangling.push(DanglingRef {
                        holder: obj.invid(),
                        field,
                        target,
                    });
                }
            }
        }
        Ok(dangling)
    }

    /// Targets whose recorded back-links disagree with the forward references.
    pub fn backlink_mismatches(&self) -> Result<Vec<Invid>> {
        let inner = self.inner.read()?;
        let expected = inner.expected_backlinks();
        let mut bad: BTreeSet<Invid> = BTreeSet::new();
        for (target, holders) in &expected {
            if inner.backlinks.get(target) != Some(holders) {
                bad.insert(*target);
            }
        }
        for target in inner.backlinks.keys() {
            if !expected.contains_key(target) {
                bad.insert(*target);
            }
        }
        Ok(bad.into_iter().collect())
    }

    /// Strip every reference to a missing object. Scalar references are
    /// cleared, vectors are filtered and removed once empty. Returns the
    /// number of references removed.
    pub fn sweep_dangling(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write()?;
        let live: BTreeSet<Invid> = inner.objects.keys().copied().collect();
        let mut removed = 0;
        let mut touched = Vec::new();

        for obj in inner.objects.values_mut() {
            let mut changed = false;
            obj.fields_mut().retain(|_, value| match value {
                Value::Reference(target) if !live.contains(&*target) => {
                    removed += 1;
                    changed = true;
                    false
                }
                Value::References(targets) => {
                    let before = targets.len();
                    targets.retain(|t| live.contains(t));
                    if targets.len() != before {
                        removed += before - targets.len();
                        changed = true;
                    }
                    !targets.is_empty()
                }
                _ => true,
            });
            if changed {
                touched.push(obj.invid());
            }
        }

        for invid in &touched {
            inner.last_change.insert(invid.base, now);
        }
        inner.backlinks = inner.expected_backlinks();
        Ok(removed)
    }
}
