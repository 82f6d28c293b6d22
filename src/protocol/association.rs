use hashbrown::HashMap;

use super::registry::Registry;
use crate::{error::Failure, ClassId, Id, MethodId, NOT_ASSOCIATED};

/// Result of asking the controller for a name's id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Association {
    /// Already associated; nothing has to be sent.
    Cached(Id),
    /// Just allocated; the caller must broadcast the association.
    Fresh(Id),
}

impl Association {
    pub fn id(self) -> Id {
        match self {
            Association::Cached(id) | Association::Fresh(id) => id,
        }
    }
}

/// Dense id allocator for one namespace. Never hands out `NOT_ASSOCIATED`.
#[derive(Default, Debug)]
struct Namespace {
    ids: HashMap<&'static str, Id>,
    next: Id,
}

impl Namespace {
    fn associate(&mut self, name: &'static str) -> Option<Association> {
        if let Some(id) = self.ids.get(name) {
            return Some(Association::Cached(*id));
        }
        if self.next == NOT_ASSOCIATED {
            return None;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(name, id);
        Some(Association::Fresh(id))
    }
}

/// Controller-side cache of class and method ids. Classes and methods count
/// independently, both from zero.
#[derive(Default, Debug)]
pub struct Associations {
    classes: Namespace,
    methods: Namespace,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` once the id space is exhausted.
    pub fn associate_class(&mut self, name: &'static str) -> Option<Association> {
        self.classes.associate(name)
    }

    pub fn associate_method(&mut self, name: &'static str) -> Option<Association> {
        self.methods.associate(name)
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.classes.ids.get(name).copied()
    }

    pub fn method_id(&self, name: &str) -> Option<MethodId> {
        self.methods.ids.get(name).copied()
    }
}

/// Worker-side id tables, filled from `AssociateClass`/`AssociateMethod`
/// commands. Index is the id.
#[derive(Default, Debug)]
pub struct AssociationTable {
    classes: Vec<&'static str>,
    methods: Vec<&'static str>,
}

impl AssociationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate_class(
        &mut self,
        registry: &Registry,
        name: &str,
        id: ClassId,
    ) -> Result<(), Failure> {
        let key = registry
            .class_key(name)
            .ok_or_else(|| Failure::NotRegistered(name.to_owned()))?;
        Self::push("class", &mut self.classes, key, id)
    }

    pub fn associate_method(
        &mut self,
        registry: &Registry,
        name: &str,
        id: MethodId,
    ) -> Result<(), Failure> {
        let key = registry
            .method_key(name)
            .ok_or_else(|| Failure::NotRegistered(name.to_owned()))?;
        Self::push("method", &mut self.methods, key, id)
    }

    fn push(
        kind: &str,
        table: &mut Vec<&'static str>,
        name: &'static str,
        id: Id,
    ) -> Result<(), Failure> {
        if let Some(previous) = table.iter().position(|known| *known == name) {
            return Err(Failure::Internal(format!(
                "{kind} \"{name}\" is already associated to id {previous}, received id {id}"
            )));
        }
        if table.len() != id as usize {
            return Err(Failure::Internal(format!(
                "has {} associated {kind}s, but received id {id} as the next id",
                table.len()
            )));
        }
        table.push(name);
        Ok(())
    }

    pub fn class_name(&self, id: ClassId) -> Option<&'static str> {
        self.classes.get(id as usize).copied()
    }

    pub fn method_name(&self, id: MethodId) -> Option<&'static str> {
        self.methods.get(id as usize).copied()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}
