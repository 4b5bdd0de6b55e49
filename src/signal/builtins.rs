//! Signals the host raises on its own, present from startup.
//!
//! Names ending in a space are parametric families: `"event "` matches
//! `"event privmsg"`, `"event 001"` and so on.

/// Name of the spec every command binding dispatches through.
pub const SEND_COMMAND: &str = "send command";

/// `(name, type signature)` for every built-in signal.
pub const BUILTIN_SIGNALS: &[(&str, &str)] = &[
    // core
    ("gui exit", ""),
    ("gui dialog", "ss"),
    (SEND_COMMAND, "sSW"),
    ("send text", "sSW"),
    ("command ", "sSW"),
    ("default command", "sSW"),
    ("error command", "is"),
    ("chat protocol created", "?"),
    ("chatnet created", "c"),
    ("chatnet destroyed", "c"),
    ("commandlist new", "o"),
    ("commandlist remove", "o"),
    ("module loaded", "??"),
    ("module unloaded", "??"),
    ("module error", "isss"),
    ("pidwait", "ii"),
    ("setup changed", ""),
    ("setup reread", "s"),
    ("setup saved", "?i"),
    ("settings errors", "s"),
    // channels, queries, nicks
    ("channel created", "Ci"),
    ("channel destroyed", "C"),
    ("channel joined", "C"),
    ("channel wholist", "C"),
    ("channel sync", "C"),
    ("channel topic changed", "C"),
    ("channel mode changed", "Cs"),
    ("query created", "qi"),
    ("query destroyed", "q"),
    ("query nick changed", "qs"),
    ("query address changed", "q"),
    ("query server changed", "qS"),
    ("nicklist new", "Cn"),
    ("nicklist remove", "Cn"),
    ("nicklist changed", "Cns"),
    ("nicklist host changed", "Cn"),
    ("nicklist gone changed", "Cn"),
    ("nicklist serverop changed", "Cn"),
    ("nick mode changed", "Cnsss"),
    ("massjoin", "CL"),
    // servers
    ("server looking", "S"),
    ("server connecting", "Su"),
    ("server connected", "S"),
    ("server connect failed", "S"),
    ("server disconnected", "S"),
    ("server quit", "Ss"),
    ("server sendmsg", "Sssi"),
    ("server incoming", "Ss"),
    ("server nick changed", "S"),
    ("server event", "Ssss"),
    ("server reconnect remove", "r"),
    ("server reconnect not found", "s"),
    ("user mode changed", "Ss"),
    ("away mode changed", "S"),
    ("event ", "Ssss"),
    ("redir ", "Ssss"),
    ("default event", "Ssss"),
    // messages
    ("message public", "Sssss"),
    ("message private", "Ssss"),
    ("message own_public", "Sss"),
    ("message own_private", "Ssss"),
    ("message join", "Ssss"),
    ("message part", "Sssss"),
    ("message quit", "Ssss"),
    ("message kick", "Ssssss"),
    ("message nick", "Ssss"),
    ("message own_nick", "Ssss"),
    ("message invite", "Ssss"),
    ("message topic", "Sssss"),
    ("ctcp msg", "Sssss"),
    ("ctcp msg ", "Sssss"),
    ("ctcp reply", "Sssss"),
    ("ctcp reply ", "Sssss"),
    ("ctcp action", "Sssss"),
    // irc records
    ("ban new", "Cb"),
    ("ban remove", "Cbs"),
    ("netsplit new", "N"),
    ("netsplit remove", "N"),
    ("netsplit server new", "Se"),
    ("netsplit server remove", "Se"),
    ("notifylist new", "O"),
    ("notifylist remove", "O"),
    ("notifylist joined", "Ssssss"),
    ("notifylist away changed", "Ssssss"),
    ("notifylist left", "Ssssss"),
    ("ignore created", "g"),
    ("ignore destroyed", "g"),
    ("ignore changed", "g"),
    ("log new", "l"),
    ("log remove", "l"),
    ("log create failed", "l"),
    ("log locked", "l"),
    ("log started", "l"),
    ("log stopped", "l"),
    ("log rotated", "l"),
    ("log written", "ls"),
    ("rawlog", "as"),
    ("exec new", "p"),
    ("exec remove", "pi"),
    ("exec input", "ps"),
    // dcc
    ("dcc created", "d"),
    ("dcc destroyed", "d"),
    ("dcc connected", "d"),
    ("dcc rejecting", "d"),
    ("dcc closed", "d"),
    ("dcc chat message", "ds"),
    ("dcc ctcp ", "sd"),
    ("dcc error connect", "d"),
    // fe-common
    ("print text", "tss"),
    ("window created", "w"),
    ("window destroyed", "w"),
    ("window changed", "ww"),
    ("window name changed", "w"),
    ("window item new", "wW"),
    ("window item remove", "wW"),
    ("window item changed", "wW"),
    ("window item name changed", "W"),
    ("complete word", "GwssI"),
    ("theme created", "?"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::types::{is_prefix_name, TypeSignature};
    use std::collections::HashSet;

    #[test]
    fn test_builtin_signatures_parse() {
        for (name, signature) in BUILTIN_SIGNALS {
            assert!(
                signature.parse::<TypeSignature>().is_ok(),
                "bad signature for '{name}'"
            );
        }
    }

    #[test]
    fn test_builtin_names_unique() {
        let mut seen = HashSet::new();
        for (name, _) in BUILTIN_SIGNALS {
            assert!(seen.insert(*name), "duplicate builtin '{name}'");
        }
    }

    #[test]
    fn test_builtin_prefixes_do_not_nest() {
        let prefixes: Vec<&str> = BUILTIN_SIGNALS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| is_prefix_name(name))
            .collect();

        for a in &prefixes {
            for b in &prefixes {
                if a != b {
                    assert!(!b.starts_with(a), "'{a}' nests '{b}'");
                }
            }
        }
    }

    #[test]
    fn test_send_command_present() {
        assert!(BUILTIN_SIGNALS
            .iter()
            .any(|(name, sig)| *name == SEND_COMMAND && *sig == "sSW"));
    }
}
