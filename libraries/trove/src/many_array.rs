//! The collection behind a hasMany field. One instance exists per (record, field) for the life of
//! the record; membership changes update it in place, so holders of the array always see the
//! current members.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::graph::{Layer, Members};
use crate::identity::ResourceKey;
use crate::record::{Mode, Record, upgrade};
use crate::store::StoreInner;

pub struct ManyArray {
    store: Weak<StoreInner>,
    owner: Weak<Record>,
    owner_key: ResourceKey,
    type_name: String,
    field: String,
    mode: Mode,
    members: RefCell<Members>,
}

impl fmt::Debug for ManyArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManyArray")
            .field("owner", &self.owner_key)
            .field("field", &self.field)
            .field("members", &self.members.borrow())
            .finish()
    }
}

impl ManyArray {
    pub(crate) fn new(
        store: Weak<StoreInner>,
        owner: Weak<Record>,
        owner_key: ResourceKey,
        type_name: String,
        field: String,
        mode: Mode,
    ) -> Rc<Self> {
        Rc::new(Self {
            store,
            owner,
            owner_key,
            type_name,
            field,
            mode,
            members: RefCell::new(Members::new()),
        })
    }

    /// Returns whether the membership changed.
    pub(crate) fn replace(&self, members: Members) -> bool {
        let mut current = self.members.borrow_mut();
        if *current == members {
            return false;
        }
        *current = members;
        true
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Reads the owning field so the members are current (and the read is tracked).
    fn sync(&self) -> Result<Rc<StoreInner>> {
        upgrade(&self.owner)?.get(&self.field)?;
        upgrade(&self.store)
    }

    pub fn len(&self) -> Result<usize> {
        self.sync()?;
        Ok(self.members.borrow().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn keys(&self) -> Result<Vec<ResourceKey>> {
        self.sync()?;
        Ok(self.members.borrow().iter().copied().collect())
    }

    pub fn contains(&self, record: &Record) -> Result<bool> {
        self.sync()?;
        Ok(self.members.borrow().contains(&record.key()))
    }

    /// Members are handed out as immutable records.
    pub fn get(&self, index: usize) -> Result<Option<Rc<Record>>> {
        let store = self.sync()?;
        let member = self.members.borrow().get(index).copied();
        member
            .map(|key| store.projection(key, Mode::Immutable))
            .transpose()
    }

    pub fn records(&self) -> Result<Vec<Rc<Record>>> {
        let store = self.sync()?;
        let members = self.members.borrow().clone();
        members
            .into_iter()
            .map(|key| store.projection(key, Mode::Immutable))
            .collect()
    }

    pub fn push(&self, record: &Record) -> Result<()> {
        let key = record.key();
        self.edit(|members| {
            members.retain(|m| *m != key);
            members.push_back(key);
            None
        })
        .map(drop)
    }

    pub fn unshift(&self, record: &Record) -> Result<()> {
        let key = record.key();
        self.edit(|members| {
            members.retain(|m| *m != key);
            members.push_front(key);
            None
        })
        .map(drop)
    }

    pub fn pop(&self) -> Result<Option<Rc<Record>>> {
        self.edit(Members::pop_back)
    }

    pub fn shift(&self) -> Result<Option<Rc<Record>>> {
        self.edit(Members::pop_front)
    }

    /// Returns whether the record was a member.
    pub fn remove(&self, record: &Record) -> Result<bool> {
        let key = record.key();
        let mut found = false;
        self.edit(|members| {
            found = members.contains(&key);
            members.retain(|m| *m != key);
            None
        })?;
        Ok(found)
    }

    fn edit(
        &self,
        change: impl FnOnce(&mut Members) -> Option<ResourceKey>,
    ) -> Result<Option<Rc<Record>>> {
        if self.mode != Mode::Editable {
            return Err(Error::NotEditable {
                field: self.field.clone(),
                type_name: self.type_name.clone(),
            });
        }
        let store = self.sync()?;
        let mut members = self.members.borrow().clone();
        let removed = change(&mut members);
        store.replace_membership(self.owner_key, &self.field, members, Layer::Local)?;
        removed
            .map(|key| store.projection(key, Mode::Immutable))
            .transpose()
    }
}
