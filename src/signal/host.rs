//! Host event system contract and an in-process implementation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use super::codec::{NativeSlot, ObjectRef};
use super::types::MAX_SIGNAL_ARGS;

/// Argument slots of one emission.
pub type SignalArgs = [NativeSlot; MAX_SIGNAL_ARGS];

/// A handler installed with the host.
pub type HostHandler = Rc<dyn Fn(&mut SignalArgs)>;

/// Token returned by an install call, needed to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Argument slots with every position null.
pub fn empty_args() -> SignalArgs {
    Default::default()
}

/// The host event system as seen by the dispatcher.
///
/// Everything runs on the host's single thread. Implementations must allow
/// handlers to install, remove and emit while an emission is in progress.
pub trait SignalHost {
    /// Add `handler` to the signal table under the concrete `name`.
    ///
    /// Lower priorities run first.
    fn install_signal_handler(&self, name: &str, priority: i32, handler: HostHandler) -> HandlerId;

    /// Returns false when no such installation exists.
    fn remove_signal_handler(&self, name: &str, id: HandlerId) -> bool;

    fn install_command_handler(
        &self,
        name: &str,
        priority: i32,
        category: Option<&str>,
        handler: HostHandler,
    ) -> HandlerId;

    fn remove_command_handler(&self, name: &str, id: HandlerId) -> bool;

    /// Raise `name` with the first `arity` slots of `args`.
    fn raw_emit(&self, name: &str, arity: usize, args: &mut SignalArgs);

    /// Pass new arguments to the handlers left in the current emission, then
    /// stop it. Returns false when nothing is being emitted.
    fn continue_emission(&self, arity: usize, args: &mut SignalArgs) -> bool;

    /// Stop the innermost emission after the running handler returns.
    fn stop_emission(&self);

    /// Stop the innermost emission of `name`.
    fn stop_emission_by_name(&self, name: &str);

    /// Name of the innermost emission.
    fn current_emission(&self) -> Option<String>;

    /// Report a problem to the user.
    fn diagnostic(&self, message: &str);
}

struct Installed {
    id: HandlerId,
    priority: i32,
    handler: HostHandler,
}

/// Insert keeping the table sorted by priority, stable on ties.
fn insert_sorted(handlers: &mut Vec<Installed>, installed: Installed) {
    let position = handlers.partition_point(|h| h.priority <= installed.priority);
    handlers.insert(position, installed);
}

fn remove_by_id(handlers: &mut Vec<Installed>, id: HandlerId) -> Option<Installed> {
    let index = handlers.iter().position(|h| h.id == id)?;
    Some(handlers.remove(index))
}

#[derive(Default)]
struct CommandEntry {
    category: Option<String>,
    handlers: Vec<Installed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Signals,
    Commands,
}

struct Emission {
    /// Name reported by `current_emission`.
    name: String,
    table: Table,
    /// Key into `table`.
    key: String,
    handlers: Vec<(HandlerId, HostHandler)>,
    position: usize,
    stopped: bool,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    signals: HashMap<String, Vec<Installed>>,
    commands: HashMap<String, CommandEntry>,
    emissions: Vec<Emission>,
    diagnostics: Vec<String>,
}

impl HostState {
    fn allocate_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    fn is_installed(&self, table: Table, key: &str, id: HandlerId) -> bool {
        let handlers = match table {
            Table::Signals => self.signals.get(key),
            Table::Commands => self.commands.get(key).map(|entry| &entry.handlers),
        };
        handlers.is_some_and(|handlers| handlers.iter().any(|h| h.id == id))
    }

    /// Next live handler of emission `depth`, advancing its cursor.
    fn next_handler(&mut self, depth: usize) -> Option<HostHandler> {
        loop {
            let frame = self.emissions.get_mut(depth)?;
            if frame.stopped || frame.position >= frame.handlers.len() {
                return None;
            }
            let (id, handler) = frame.handlers[frame.position].clone();
            frame.position += 1;

            let (table, key) = (frame.table, frame.key.clone());
            if self.is_installed(table, &key, id) {
                return Some(handler);
            }
            trace!(emission = %key, "skipping handler removed during emission");
        }
    }
}

/// Single-threaded host with signal and command tables.
#[derive(Default)]
pub struct LocalHost {
    state: RefCell<HostState>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the handlers of emission `depth` until it ends or is stopped.
    ///
    /// No borrow of the state is held while a handler runs.
    fn run_emission(&self, depth: usize, args: &mut SignalArgs) {
        loop {
            let next = self.state.borrow_mut().next_handler(depth);
            match next {
                Some(handler) => handler(args),
                None => break,
            }
        }
    }

    fn emit_frame(&self, frame: Emission, args: &mut SignalArgs) {
        let depth = {
            let mut state = self.state.borrow_mut();
            state.emissions.push(frame);
            state.emissions.len() - 1
        };

        self.run_emission(depth, args);

        // Snapshots may hold the last reference to a removed handler.
        let finished: Vec<Emission> = self.state.borrow_mut().emissions.drain(depth..).collect();
        drop(finished);
    }

    /// Dispatch a user command, the way typing `/name data` would.
    ///
    /// Returns false when no handler is bound to `name`.
    pub fn run_command(
        &self,
        name: &str,
        data: &str,
        server: Option<ObjectRef>,
        item: Option<ObjectRef>,
    ) -> bool {
        let handlers = {
            let state = self.state.borrow();
            match state.commands.get(name) {
                Some(entry) if !entry.handlers.is_empty() => snapshot(&entry.handlers),
                _ => return false,
            }
        };

        debug!(command = name, "running command");
        let mut args = empty_args();
        args[0] = NativeSlot::Str(data.to_string());
        args[1] = server.map_or(NativeSlot::Null, NativeSlot::Object);
        args[2] = item.map_or(NativeSlot::Null, NativeSlot::Object);

        self.emit_frame(
            Emission {
                name: format!("command {name}"),
                table: Table::Commands,
                key: name.to_string(),
                handlers,
                position: 0,
                stopped: false,
            },
            &mut args,
        );
        true
    }

    /// Number of handlers installed for the signal `name`.
    pub fn handler_count(&self, name: &str) -> usize {
        self.state.borrow().signals.get(name).map_or(0, Vec::len)
    }

    pub fn command_handler_count(&self, name: &str) -> usize {
        self.state
            .borrow()
            .commands
            .get(name)
            .map_or(0, |entry| entry.handlers.len())
    }

    pub fn command_category(&self, name: &str) -> Option<String> {
        self.state
            .borrow()
            .commands
            .get(name)
            .and_then(|entry| entry.category.clone())
    }

    /// Commands with at least one handler, sorted.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.borrow().commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages passed to [`SignalHost::diagnostic`] so far.
    pub fn diagnostics(&self) -> Vec<String> {
        self.state.borrow().diagnostics.clone()
    }

    pub fn take_diagnostics(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().diagnostics)
    }

    /// Number of nested emissions in progress.
    pub fn emission_depth(&self) -> usize {
        self.state.borrow().emissions.len()
    }
}

fn snapshot(handlers: &[Installed]) -> Vec<(HandlerId, HostHandler)> {
    handlers
        .iter()
        .map(|h| (h.id, Rc::clone(&h.handler)))
        .collect()
}

fn clear_beyond(arity: usize, args: &mut SignalArgs) {
    for slot in args.iter_mut().skip(arity) {
        *slot = NativeSlot::Null;
    }
}

impl SignalHost for LocalHost {
    fn install_signal_handler(&self, name: &str, priority: i32, handler: HostHandler) -> HandlerId {
        let mut state = self.state.borrow_mut();
        let id = state.allocate_id();
        insert_sorted(
            state.signals.entry(name.to_string()).or_default(),
            Installed {
                id,
                priority,
                handler,
            },
        );
        trace!(signal = name, priority, "signal handler installed");
        id
    }

    fn remove_signal_handler(&self, name: &str, id: HandlerId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            let Some(handlers) = state.signals.get_mut(name) else {
                return false;
            };
            let removed = remove_by_id(handlers, id);
            if handlers.is_empty() {
                state.signals.remove(name);
            }
            removed
        };
        removed.is_some()
    }

    fn install_command_handler(
        &self,
        name: &str,
        priority: i32,
        category: Option<&str>,
        handler: HostHandler,
    ) -> HandlerId {
        let mut state = self.state.borrow_mut();
        let id = state.allocate_id();
        let entry = state.commands.entry(name.to_string()).or_default();
        if let Some(category) = category {
            entry.category = Some(category.to_string());
        }
        insert_sorted(
            &mut entry.handlers,
            Installed {
                id,
                priority,
                handler,
            },
        );
        trace!(command = name, priority, "command handler installed");
        id
    }

    fn remove_command_handler(&self, name: &str, id: HandlerId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.commands.get_mut(name) else {
                return false;
            };
            let removed = remove_by_id(&mut entry.handlers, id);
            if entry.handlers.is_empty() {
                state.commands.remove(name);
            }
            removed
        };
        removed.is_some()
    }

    fn raw_emit(&self, name: &str, arity: usize, args: &mut SignalArgs) {
        clear_beyond(arity, args);

        let handlers = match self.state.borrow().signals.get(name) {
            Some(handlers) => snapshot(handlers),
            None => return,
        };

        self.emit_frame(
            Emission {
                name: name.to_string(),
                table: Table::Signals,
                key: name.to_string(),
                handlers,
                position: 0,
                stopped: false,
            },
            args,
        );
    }

    fn continue_emission(&self, arity: usize, args: &mut SignalArgs) -> bool {
        let depth = match self.state.borrow().emissions.len() {
            0 => return false,
            len => len - 1,
        };

        clear_beyond(arity, args);
        self.run_emission(depth, args);

        if let Some(frame) = self.state.borrow_mut().emissions.get_mut(depth) {
            frame.stopped = true;
        }
        true
    }

    fn stop_emission(&self) {
        match self.state.borrow_mut().emissions.last_mut() {
            Some(frame) => frame.stopped = true,
            None => trace!("stop requested with no active emission"),
        }
    }

    fn stop_emission_by_name(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        match state.emissions.iter_mut().rev().find(|frame| frame.name == name) {
            Some(frame) => frame.stopped = true,
            None => trace!(signal = name, "stop requested for a signal not being emitted"),
        }
    }

    fn current_emission(&self) -> Option<String> {
        self.state
            .borrow()
            .emissions
            .last()
            .map(|frame| frame.name.clone())
    }

    fn diagnostic(&self, message: &str) {
        warn!("{}", message);
        self.state.borrow_mut().diagnostics.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::types::ObjectKind;
    use std::cell::Cell;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, tag: &str) -> HostHandler {
        let log = Rc::clone(log);
        let tag = tag.to_string();
        Rc::new(move |_args: &mut SignalArgs| log.borrow_mut().push(tag.clone()))
    }

    #[test]
    fn test_emit_runs_handlers_by_priority() {
        let host = LocalHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        host.install_signal_handler("test", 10, recorder(&log, "late"));
        host.install_signal_handler("test", -5, recorder(&log, "early"));
        host.install_signal_handler("test", 10, recorder(&log, "late2"));
        host.install_signal_handler("test", 0, recorder(&log, "middle"));

        host.raw_emit("test", 0, &mut empty_args());
        assert_eq!(*log.borrow(), vec!["early", "middle", "late", "late2"]);
    }

    #[test]
    fn test_emit_unknown_signal_is_noop() {
        let host = LocalHost::new();
        host.raw_emit("nobody listens", 2, &mut empty_args());
        assert_eq!(host.emission_depth(), 0);
    }

    #[test]
    fn test_handler_sees_arguments_and_may_write() {
        let host = LocalHost::new();
        host.install_signal_handler(
            "test",
            0,
            Rc::new(|args: &mut SignalArgs| {
                assert_eq!(args[0].as_str(), Some("hello"));
                args[1] = NativeSlot::Int(99);
            }),
        );

        let mut args = empty_args();
        args[0] = NativeSlot::Str("hello".to_string());
        args[2] = NativeSlot::Int(5);
        host.raw_emit("test", 2, &mut args);

        assert_eq!(args[1], NativeSlot::Int(99));
        // Slots beyond the arity are cleared.
        assert!(args[2].is_null());
    }

    #[test]
    fn test_remove_handler() {
        let host = LocalHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let id = host.install_signal_handler("test", 0, recorder(&log, "a"));

        assert!(host.remove_signal_handler("test", id));
        assert!(!host.remove_signal_handler("test", id));
        assert_eq!(host.handler_count("test"), 0);

        host.raw_emit("test", 0, &mut empty_args());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_handler_removed_mid_emission_is_skipped() {
        let host = Rc::new(LocalHost::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let victim = Rc::new(Cell::new(None));

        let host_ref = Rc::downgrade(&host);
        let victim_ref = Rc::clone(&victim);
        host.install_signal_handler(
            "test",
            0,
            Rc::new(move |_args: &mut SignalArgs| {
                if let (Some(host), Some(id)) = (host_ref.upgrade(), victim_ref.get()) {
                    host.remove_signal_handler("test", id);
                }
            }),
        );
        victim.set(Some(host.install_signal_handler("test", 1, recorder(&log, "victim"))));

        host.raw_emit("test", 0, &mut empty_args());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_handler_installed_mid_emission_waits_for_next() {
        let host = Rc::new(LocalHost::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let host_ref = Rc::downgrade(&host);
        let log_ref = Rc::clone(&log);
        let installed = Rc::new(Cell::new(false));
        host.install_signal_handler(
            "test",
            0,
            Rc::new(move |_args: &mut SignalArgs| {
                if !installed.replace(true) {
                    if let Some(host) = host_ref.upgrade() {
                        host.install_signal_handler("test", 1, recorder(&log_ref, "new"));
                    }
                }
            }),
        );

        host.raw_emit("test", 0, &mut empty_args());
        assert!(log.borrow().is_empty());
        host.raw_emit("test", 0, &mut empty_args());
        assert_eq!(*log.borrow(), vec!["new"]);
    }

    #[test]
    fn test_stop_emission() {
        let host = Rc::new(LocalHost::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let host_ref = Rc::downgrade(&host);
        host.install_signal_handler(
            "test",
            0,
            Rc::new(move |_args: &mut SignalArgs| {
                if let Some(host) = host_ref.upgrade() {
                    assert_eq!(host.current_emission().as_deref(), Some("test"));
                    host.stop_emission();
                }
            }),
        );
        host.install_signal_handler("test", 1, recorder(&log, "after"));

        host.raw_emit("test", 0, &mut empty_args());
        assert!(log.borrow().is_empty());
        assert!(host.current_emission().is_none());
    }

    #[test]
    fn test_stop_emission_by_name_reaches_outer_signal() {
        let host = Rc::new(LocalHost::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let host_ref = Rc::downgrade(&host);
        host.install_signal_handler(
            "outer",
            0,
            Rc::new(move |_args: &mut SignalArgs| {
                if let Some(host) = host_ref.upgrade() {
                    host.raw_emit("inner", 0, &mut empty_args());
                }
            }),
        );
        host.install_signal_handler("outer", 1, recorder(&log, "outer after"));

        let host_ref = Rc::downgrade(&host);
        host.install_signal_handler(
            "inner",
            0,
            Rc::new(move |_args: &mut SignalArgs| {
                if let Some(host) = host_ref.upgrade() {
                    host.stop_emission_by_name("outer");
                }
            }),
        );
        host.install_signal_handler("inner", 1, recorder(&log, "inner after"));

        host.raw_emit("outer", 0, &mut empty_args());
        assert_eq!(*log.borrow(), vec!["inner after"]);
    }

    #[test]
    fn test_continue_emission_passes_new_arguments() {
        let host = Rc::new(LocalHost::new());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let host_ref = Rc::downgrade(&host);
        host.install_signal_handler(
            "test",
            0,
            Rc::new(move |_args: &mut SignalArgs| {
                if let Some(host) = host_ref.upgrade() {
                    let mut args = empty_args();
                    args[0] = NativeSlot::Str("rewritten".to_string());
                    assert!(host.continue_emission(1, &mut args));
                }
            }),
        );
        let seen_ref = Rc::clone(&seen);
        host.install_signal_handler(
            "test",
            1,
            Rc::new(move |args: &mut SignalArgs| {
                seen_ref
                    .borrow_mut()
                    .push(args[0].as_str().unwrap_or_default().to_string());
            }),
        );

        let mut args = empty_args();
        args[0] = NativeSlot::Str("original".to_string());
        host.raw_emit("test", 1, &mut args);

        assert_eq!(*seen.borrow(), vec!["rewritten"]);
    }

    #[test]
    fn test_continue_without_emission() {
        let host = LocalHost::new();
        assert!(!host.continue_emission(0, &mut empty_args()));
    }

    #[test]
    fn test_command_table() {
        let host = LocalHost::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_ref = Rc::clone(&seen);
        let id = host.install_command_handler(
            "hello",
            0,
            Some("Greetings"),
            Rc::new(move |args: &mut SignalArgs| {
                seen_ref.borrow_mut().push((
                    args[0].as_str().unwrap_or_default().to_string(),
                    args[1].as_object(),
                ));
            }),
        );

        let server = ObjectRef::new(ObjectKind::Server, 1);
        assert!(host.run_command("hello", "world", Some(server), None));
        assert!(!host.run_command("missing", "", None, None));
        assert_eq!(*seen.borrow(), vec![("world".to_string(), Some(server))]);
        assert_eq!(host.command_category("hello").as_deref(), Some("Greetings"));
        assert_eq!(host.command_names(), vec!["hello".to_string()]);

        assert!(host.remove_command_handler("hello", id));
        assert!(!host.run_command("hello", "again", None, None));
        assert_eq!(host.command_handler_count("hello"), 0);
    }

    #[test]
    fn test_command_emission_name() {
        let host = Rc::new(LocalHost::new());
        let name = Rc::new(RefCell::new(None));
        let host_ref = Rc::downgrade(&host);
        let name_ref = Rc::clone(&name);
        host.install_command_handler(
            "greet",
            0,
            None,
            Rc::new(move |_args: &mut SignalArgs| {
                if let Some(host) = host_ref.upgrade() {
                    *name_ref.borrow_mut() = host.current_emission();
                }
            }),
        );

        host.run_command("greet", "", None, None);
        assert_eq!(name.borrow().as_deref(), Some("command greet"));
    }

    #[test]
    fn test_diagnostics_recorded() {
        let host = LocalHost::new();
        host.diagnostic("something failed");
        assert_eq!(host.diagnostics(), vec!["something failed".to_string()]);
        assert_eq!(host.take_diagnostics().len(), 1);
        assert!(host.diagnostics().is_empty());
    }
}
