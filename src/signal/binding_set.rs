//! Per-script tracking of bindings and dynamic registrations.

use tracing::{debug, warn};

use super::dispatch::{BindingRecord, Dispatcher};

/// What one [`ScriptBindingSet::teardown`] released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    pub bindings: usize,
    pub registrations: usize,
    /// Registrations the registry refused to release.
    pub failed: usize,
}

/// Everything one script has installed.
///
/// Bindings and registrations are kept in the order they were made and
/// released in that order.
#[derive(Debug, Default)]
pub struct ScriptBindingSet {
    bindings: Vec<BindingRecord>,
    registrations: Vec<String>,
}

impl ScriptBindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(&mut self, record: BindingRecord) {
        self.bindings.push(record);
    }

    /// Track a registration that took a reference in the registry.
    pub fn add_registration(&mut self, name: impl Into<String>) {
        self.registrations.push(name.into());
    }

    pub fn bindings(&self) -> &[BindingRecord] {
        &self.bindings
    }

    pub fn registrations(&self) -> &[String] {
        &self.registrations
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.registrations.is_empty()
    }

    /// Remove and return the bindings matching `predicate`, in order.
    pub fn take_bindings<F>(&mut self, mut predicate: F) -> Vec<BindingRecord>
    where
        F: FnMut(&BindingRecord) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.bindings)
            .into_iter()
            .partition(|record| predicate(record));
        self.bindings = kept;
        taken
    }

    /// Stop tracking one registration of `name`.
    ///
    /// Returns false if this script holds no registration of `name`.
    pub fn remove_registration(&mut self, name: &str) -> bool {
        match self.registrations.iter().rposition(|tracked| tracked == name) {
            Some(index) => {
                self.registrations.remove(index);
                true
            }
            None => false,
        }
    }

    /// Unbind every binding, then unregister every registration.
    ///
    /// Calling it again on an emptied set does nothing.
    pub fn teardown(&mut self, dispatcher: &Dispatcher) -> TeardownSummary {
        let mut summary = TeardownSummary::default();

        for record in std::mem::take(&mut self.bindings) {
            dispatcher.unbind(record);
            summary.bindings += 1;
        }

        for name in std::mem::take(&mut self.registrations) {
            match dispatcher.registry().unregister(&name) {
                Ok(()) => summary.registrations += 1,
                Err(e) => {
                    warn!(signal = %name, "failed to release registration: {}", e);
                    summary.failed += 1;
                }
            }
        }

        if summary != TeardownSummary::default() {
            debug!(
                bindings = summary.bindings,
                registrations = summary.registrations,
                "binding set torn down"
            );
        }
        summary
    }
}
