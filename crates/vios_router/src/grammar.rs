use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::message::InstanceId;

#[derive(Debug, Default)]
struct GrammarEntry {
    choices: Vec<String>,
    disabled: bool,
}

#[derive(Debug, Default)]
struct MapperState {
    // Ordered by id so lookups scan sessions in registration order.
    entries: BTreeMap<InstanceId, GrammarEntry>,
    active: Option<InstanceId>,
}

/// Tracks every session's recognition vocabulary and the single active
/// session.
///
/// The effective grammar announced to the recognizer is the root session's
/// vocabulary followed by the active session's, with duplicates removed.
/// An empty effective grammar means "dictation": free-form input.
#[derive(Debug)]
pub struct GrammarMapper {
    root: InstanceId,
    state: RwLock<MapperState>,
}

impl GrammarMapper {
    pub fn new(root: InstanceId) -> Self {
        Self {
            root,
            state: RwLock::new(MapperState::default()),
        }
    }

    pub fn root(&self) -> InstanceId {
        self.root
    }

    /// Give a new instance an empty vocabulary.
    pub fn register_instance(&self, id: InstanceId) {
        self.write().entries.entry(id).or_default();
    }

    /// Forget an instance's vocabulary, clearing the active reference if it
    /// pointed there.
    pub fn remove_instance(&self, id: InstanceId) {
        let mut state = self.write();
        state.entries.remove(&id);
        if state.active == Some(id) {
            state.active = None;
        }
    }

    pub fn is_registered(&self, id: InstanceId) -> bool {
        self.read().entries.contains_key(&id)
    }

    /// Replace an instance's vocabulary.
    pub fn set_grammar<I, S>(&self, id: InstanceId, choices: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let choices = choices.into_iter().map(Into::into).collect();
        self.write().entries.entry(id).or_default().choices = choices;
    }

    /// An instance's vocabulary, duplicates removed.
    pub fn grammar(&self, id: InstanceId) -> Vec<String> {
        let state = self.read();
        state
            .entries
            .get(&id)
            .map(|entry| dedup(entry.choices.iter()))
            .unwrap_or_default()
    }

    pub fn set_disabled(&self, id: InstanceId, disabled: bool) {
        self.write().entries.entry(id).or_default().disabled = disabled;
    }

    pub fn is_disabled(&self, id: InstanceId) -> bool {
        self.read()
            .entries
            .get(&id)
            .is_some_and(|entry| entry.disabled)
    }

    /// Replace the active session. Callers keep this consistent with their
    /// own foreground/background state.
    pub fn set_active(&self, id: Option<InstanceId>) {
        self.write().active = id;
    }

    pub fn active(&self) -> Option<InstanceId> {
        self.read().active
    }

    /// Vocabulary to announce to the recognizer.
    ///
    /// Returns an empty list (dictation) when the active session has an
    /// empty vocabulary that is not merely disabled, or when there is no
    /// active session and the root vocabulary is empty.
    pub fn effective_grammar(&self) -> Vec<String> {
        let state = self.read();

        let root = state
            .entries
            .get(&self.root)
            .map(|entry| entry.choices.as_slice())
            .unwrap_or_default();
        let active = state.active.and_then(|id| state.entries.get(&id));

        match active {
            Some(entry) if entry.choices.is_empty() && !entry.disabled => return Vec::new(),
            None if root.is_empty() => return Vec::new(),
            _ => {}
        }

        let active_choices = active.map(|entry| entry.choices.as_slice()).unwrap_or_default();
        dedup(root.iter().chain(active_choices))
    }

    /// The first session, in ascending id order, whose vocabulary contains
    /// `text` exactly.
    ///
    /// Overlapping vocabularies are not disambiguated; the lowest id wins.
    pub fn resolve_instance(&self, text: &str) -> Option<InstanceId> {
        self.read()
            .entries
            .iter()
            .find(|(_, entry)| entry.choices.iter().any(|choice| choice == text))
            .map(|(id, _)| *id)
    }

    /// Human-readable snapshot for diagnostics.
    pub fn dump(&self) -> String {
        let state = self.read();
        let mut out = match state.active {
            Some(id) => format!("active={id}\n"),
            None => "active=none\n".to_string(),
        };
        for (id, entry) in &state.entries {
            let _ = writeln!(
                out,
                "\tinstance={id} disabled={} choices=[{}]",
                entry.disabled,
                entry.choices.join(", ")
            );
        }
        out
    }

    fn read(&self) -> RwLockReadGuard<'_, MapperState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MapperState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stable de-duplication: keeps the first occurrence of each choice.
fn dedup<'a>(choices: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for choice in choices {
        if seen.insert(choice.as_str()) {
            unique.push(choice.clone());
        }
    }
    unique
}
