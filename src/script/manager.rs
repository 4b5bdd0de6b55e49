//! Loading and unloading of scripts.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::FromLua;
use tracing::{info, warn};

use super::api::BridgeApi;
use super::engine::{ResourceLimits, ScriptEngine};
use crate::config::Config;
use crate::signal::{Dispatcher, ScriptBindingSet, SignalHost, SignalRegistry, TeardownSummary};
use crate::{BridgeError, Result};

/// Summary of a loaded script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    pub name: String,
    /// Number of signal and command bindings.
    pub bindings: usize,
    /// Dynamic signals the script registered.
    pub registrations: Vec<String>,
}

struct LoadedScript {
    name: String,
    // Dropped after the binding set so the Lua state outlives the records.
    bindings: Rc<RefCell<ScriptBindingSet>>,
    engine: ScriptEngine,
}

impl LoadedScript {
    fn info(&self) -> ScriptInfo {
        let set = self.bindings.borrow();
        ScriptInfo {
            name: self.name.clone(),
            bindings: set.bindings().len(),
            registrations: set.registrations().to_vec(),
        }
    }
}

/// Owns the loaded scripts and the dispatcher they bind through.
pub struct ScriptManager {
    // Scripts go first so their bindings are released while the dispatcher is alive.
    scripts: Vec<LoadedScript>,
    dispatcher: Dispatcher,
    limits: ResourceLimits,
    script_dir: PathBuf,
}

impl ScriptManager {
    /// Create a manager with the built-in signal table installed.
    pub fn new(config: &Config, host: Rc<dyn SignalHost>) -> Result<Self> {
        let registry = SignalRegistry::with_builtins()?;
        let dispatcher =
            Dispatcher::with_options(registry, host, config.bridge.dispatch_options());

        Ok(Self::with_dispatcher(
            dispatcher,
            config.scripts.resource_limits(),
            &config.scripts.path,
        ))
    }

    pub fn with_dispatcher<P: AsRef<Path>>(
        dispatcher: Dispatcher,
        limits: ResourceLimits,
        script_dir: P,
    ) -> Self {
        Self {
            scripts: Vec::new(),
            dispatcher,
            limits,
            script_dir: script_dir.as_ref().to_path_buf(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &SignalRegistry {
        self.dispatcher.registry()
    }

    /// Load a script from source and run its main chunk.
    ///
    /// If the chunk fails, everything it bound or registered is released
    /// before the error is returned.
    pub fn load(&mut self, name: &str, source: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(BridgeError::InvalidName("script name is empty".to_string()));
        }
        if self.is_loaded(name) {
            return Err(BridgeError::ScriptExists(name.to_string()));
        }

        let engine = ScriptEngine::with_limits(self.limits.clone())?;
        let bindings = Rc::new(RefCell::new(ScriptBindingSet::new()));
        BridgeApi::new(name, &self.dispatcher, &bindings).register(engine.lua())?;

        if let Err(e) = engine.execute(name, source) {
            let summary = bindings.borrow_mut().teardown(&self.dispatcher);
            warn!(
                script = name,
                bindings = summary.bindings,
                registrations = summary.registrations,
                "script failed to load: {}",
                e
            );
            return Err(e);
        }

        let loaded = LoadedScript {
            name: name.to_string(),
            bindings,
            engine,
        };
        let info = loaded.info();
        info!(
            script = name,
            bindings = info.bindings,
            registrations = info.registrations.len(),
            "script loaded"
        );
        self.scripts.push(loaded);
        Ok(())
    }

    /// Load a script file. Relative paths are taken from the script directory.
    ///
    /// The script is named after the file stem. Returns that name.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<String> {
        let path = path.as_ref();
        let path = if path.is_relative() {
            self.script_dir.join(path)
        } else {
            path.to_path_buf()
        };

        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| {
                BridgeError::InvalidName(format!("no script name in '{}'", path.display()))
            })?
            .to_string();
        let source = fs::read_to_string(&path)?;

        self.load(&name, &source)?;
        Ok(name)
    }

    /// Load each file, logging the ones that fail. Returns how many loaded.
    pub fn autoload(&mut self, files: &[String]) -> usize {
        let mut loaded = 0;
        for file in files {
            match self.load_file(file) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(file = %file, "autoload failed: {}", e),
            }
        }
        loaded
    }

    /// Release everything the script installed and drop its Lua state.
    pub fn unload(&mut self, name: &str) -> Result<TeardownSummary> {
        let index = self
            .scripts
            .iter()
            .position(|script| script.name == name)
            .ok_or_else(|| BridgeError::ScriptNotFound(name.to_string()))?;

        let script = self.scripts.remove(index);
        let summary = script.bindings.borrow_mut().teardown(&self.dispatcher);
        drop(script);

        info!(
            script = name,
            bindings = summary.bindings,
            registrations = summary.registrations,
            "script unloaded"
        );
        Ok(summary)
    }

    /// Loaded scripts in load order.
    pub fn list(&self) -> Vec<ScriptInfo> {
        self.scripts.iter().map(LoadedScript::info).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.scripts.iter().any(|script| script.name == name)
    }

    /// Read a global variable of a loaded script.
    pub fn global<V: FromLua>(&self, script: &str, name: &str) -> Result<V> {
        self.scripts
            .iter()
            .find(|loaded| loaded.name == script)
            .ok_or_else(|| BridgeError::ScriptNotFound(script.to_string()))?
            .engine
            .get_global(name)
    }

    /// Unload every script, then shut the registry down.
    ///
    /// # Panics
    ///
    /// Panics if a signal registered outside of any script is still in the
    /// registry, or a built-in signal is still referenced.
    pub fn shutdown(&mut self) {
        let names: Vec<String> = self.scripts.iter().map(|s| s.name.clone()).collect();
        for name in names {
            if let Err(e) = self.unload(&name) {
                warn!(script = %name, "failed to unload: {}", e);
            }
        }
        self.registry().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::LocalHost;

    fn setup() -> (Rc<LocalHost>, ScriptManager) {
        let host = Rc::new(LocalHost::new());
        let manager = ScriptManager::new(&Config::default(), host.clone()).unwrap();
        (host, manager)
    }

    #[test]
    fn test_load_and_list() {
        let (_host, mut manager) = setup();
        manager
            .load(
                "greeter",
                r#"
                bridge.signal_register("greeting", "s")
                bridge.signal_add("greeting", function(text) end)
            "#,
            )
            .unwrap();

        let scripts = manager.list();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "greeter");
        assert_eq!(scripts[0].bindings, 1);
        assert_eq!(scripts[0].registrations, vec!["greeting".to_string()]);
        assert!(manager.is_loaded("greeter"));
    }

    #[test]
    fn test_global() {
        let (_host, mut manager) = setup();
        manager.load("vars", "answer = 42").unwrap();

        let answer: i64 = manager.global("vars", "answer").unwrap();
        assert_eq!(answer, 42);
        assert!(matches!(
            manager.global::<i64>("nobody", "answer"),
            Err(BridgeError::ScriptNotFound(_))
        ));
    }

    #[test]
    fn test_load_rejects_duplicate_and_empty_names() {
        let (_host, mut manager) = setup();
        manager.load("one", "").unwrap();

        assert!(matches!(
            manager.load("one", ""),
            Err(BridgeError::ScriptExists(name)) if name == "one"
        ));
        assert!(matches!(
            manager.load("  ", ""),
            Err(BridgeError::InvalidName(_))
        ));
    }

    #[test]
    fn test_failed_load_releases_everything() {
        let (host, mut manager) = setup();
        let result = manager.load(
            "broken",
            r#"
            bridge.signal_register("half done", "s")
            bridge.signal_add("message public", function() end)
            error("gave up")
        "#,
        );

        assert!(matches!(result, Err(BridgeError::Script(msg)) if msg.contains("gave up")));
        assert!(!manager.is_loaded("broken"));
        assert!(!manager.registry().contains("half done"));
        assert_eq!(host.handler_count("message public"), 0);
        assert_eq!(manager.registry().refcount("message public"), Some(1));
    }

    #[test]
    fn test_unload() {
        let (host, mut manager) = setup();
        manager
            .load(
                "away",
                r#"
                bridge.signal_add("message private", function() end)
                bridge.command_bind("away", function() end)
            "#,
            )
            .unwrap();
        assert_eq!(host.handler_count("message private"), 1);

        let summary = manager.unload("away").unwrap();
        assert_eq!(summary.bindings, 2);
        assert_eq!(summary.registrations, 0);
        assert_eq!(host.handler_count("message private"), 0);
        assert!(!host.run_command("away", "", None, None));

        assert!(matches!(
            manager.unload("away"),
            Err(BridgeError::ScriptNotFound(_))
        ));
    }

    #[test]
    fn test_shutdown_unloads_all() {
        let (_host, mut manager) = setup();
        manager
            .load("a", r#"bridge.signal_register("shared sig", "i")"#)
            .unwrap();
        manager
            .load("b", r#"bridge.signal_register("shared sig", "i")"#)
            .unwrap();
        assert_eq!(manager.registry().refcount("shared sig"), Some(2));

        manager.shutdown();
        assert!(manager.list().is_empty());
        assert!(!manager.registry().is_initialized());
    }

    #[test]
    fn test_load_file_and_autoload() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hello.lua"),
            r#"bridge.command_bind("hello", function() end)"#,
        )
        .unwrap();
        fs::write(dir.path().join("bad.lua"), "this is not lua").unwrap();

        let host = Rc::new(LocalHost::new());
        let registry = SignalRegistry::with_builtins().unwrap();
        let dispatcher = Dispatcher::new(registry, host.clone());
        let mut manager =
            ScriptManager::with_dispatcher(dispatcher, ResourceLimits::default(), dir.path());

        let loaded = manager.autoload(&[
            "hello.lua".to_string(),
            "bad.lua".to_string(),
            "missing.lua".to_string(),
        ]);
        assert_eq!(loaded, 1);
        assert!(manager.is_loaded("hello"));
        assert!(!manager.is_loaded("bad"));
        assert_eq!(host.command_handler_count("hello"), 1);

        manager.unload("hello").unwrap();
        let name = manager.load_file(dir.path().join("hello.lua")).unwrap();
        assert_eq!(name, "hello");
    }

    #[test]
    fn test_instruction_limit_applies_to_load() {
        let host = Rc::new(LocalHost::new());
        let mut config = Config::default();
        config.scripts.max_instructions = 10_000;
        let mut manager = ScriptManager::new(&config, host).unwrap();

        let result = manager.load(
            "spinner",
            r#"
            bridge.signal_add("message public", function() end)
            while true do end
        "#,
        );
        assert!(result.is_err());
        assert_eq!(manager.registry().refcount("message public"), Some(1));
    }

    #[test]
    fn test_instruction_limit_skips_handlers() {
        let host = Rc::new(LocalHost::new());
        let mut config = Config::default();
        config.scripts.max_instructions = 10_000;
        let mut manager = ScriptManager::new(&config, host).unwrap();

        manager
            .load(
                "busy",
                r#"
                bridge.signal_register("busy work", "")
                bridge.signal_add("busy work", function()
                    for i = 1, 200000 do count = i end
                end)
            "#,
            )
            .unwrap();
        manager.dispatcher().emit("busy work", &[]).unwrap();

        let count: i64 = manager.global("busy", "count").unwrap();
        assert_eq!(count, 200_000);
        manager.shutdown();
    }
}
