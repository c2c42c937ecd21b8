// ── Client-simulated states ──

use std::collections::HashMap;

use crate::model::State;

/// In-memory values for the ids handled purely client-side.
#[derive(Debug, Default)]
pub(crate) struct SimulatedStates {
    ignored: Option<String>,
    states: HashMap<String, State>,
}

impl SimulatedStates {
    /// Mark `id` as simulated. Only one id is simulated at a time.
    pub fn set_ignored(&mut self, id: &str) {
        self.ignored = Some(id.to_owned());
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignored.as_deref() == Some(id)
    }

    pub fn get(&self, id: &str) -> Option<&State> {
        self.states.get(id)
    }

    pub fn set(&mut self, id: &str, state: State) {
        self.states.insert(id.to_owned(), state);
    }
}
