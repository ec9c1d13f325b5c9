//! The dependency view handed to definitions.

use smallvec::SmallVec;

use crate::value::{DepValue, Value};

static ABSENT: DepValue = DepValue::Absent;

/// One named dependency as seen by a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DepEntry<'a> {
    pub name: &'a str,
    pub value: DepValue,
    /// Per-member modifiability: whether the inverse solver may push a value
    /// into the producer. One entry for single-target dependencies.
    pub modifiable: SmallVec<[bool; 2]>,
}

/// Named dependency values in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deps<'a> {
    entries: SmallVec<[DepEntry<'a>; 4]>,
}

impl<'a> Deps<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'a str, value: DepValue, modifiable: SmallVec<[bool; 2]>) {
        self.entries.push(DepEntry {
            name,
            value,
            modifiable,
        });
    }

    /// Builder form of [`push`](Self::push) for tests and ad-hoc callers.
    pub fn with(mut self, name: &'a str, value: DepValue, modifiable: bool) -> Self {
        let members = value.members().len().max(1);
        self.push(name, value, SmallVec::from_elem(modifiable, members));
        self
    }

    pub fn entries(&self) -> &[DepEntry<'a>] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&DepEntry<'a>> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// The dependency value; undeclared names read as absent.
    pub fn get(&self, name: &str) -> &DepValue {
        self.entry(name).map(|e| &e.value).unwrap_or(&ABSENT)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).value()
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).number()
    }

    pub fn members(&self, name: &str) -> &[Value] {
        self.get(name).members()
    }

    /// Whether the solver may push a value into `name` (or one member of it).
    pub fn is_modifiable(&self, name: &str, member: Option<usize>) -> bool {
        self.entry(name)
            .and_then(|e| e.modifiable.get(member.unwrap_or(0)).copied())
            .unwrap_or(false)
    }

    /// Values of all dependencies, for input-change detection.
    pub(crate) fn snapshot(&self) -> Vec<DepValue> {
        self.entries.iter().map(|e| e.value.clone()).collect()
    }
}
