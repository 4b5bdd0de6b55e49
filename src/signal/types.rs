//! Type codes and type signatures for signal arguments.

use std::fmt;
use std::str::FromStr;

use crate::{BridgeError, Result};

/// Maximum number of arguments the host passes to a signal handler.
pub const MAX_SIGNAL_ARGS: usize = 6;

/// Character terminating the name of a parametric (prefix) signal.
pub const PREFIX_SEPARATOR: char = ' ';

/// Kind of a wrapped host record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Chatnet,
    Server,
    Channel,
    Query,
    Nick,
    WindowItem,
    Dcc,
    Reconnect,
    Command,
    Log,
    Rawlog,
    Ignore,
    Ban,
    Netsplit,
    NetsplitServer,
    Notifylist,
    Process,
    TextDest,
    Window,
}

impl ObjectKind {
    /// Human readable name, also used as the `kind` field of script handles.
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Chatnet => "chatnet",
            ObjectKind::Server => "server",
            ObjectKind::Channel => "channel",
            ObjectKind::Query => "query",
            ObjectKind::Nick => "nick",
            ObjectKind::WindowItem => "window item",
            ObjectKind::Dcc => "dcc",
            ObjectKind::Reconnect => "reconnect",
            ObjectKind::Command => "command",
            ObjectKind::Log => "log",
            ObjectKind::Rawlog => "rawlog",
            ObjectKind::Ignore => "ignore",
            ObjectKind::Ban => "ban",
            ObjectKind::Netsplit => "netsplit",
            ObjectKind::NetsplitServer => "netsplit server",
            ObjectKind::Notifylist => "notifylist",
            ObjectKind::Process => "process",
            ObjectKind::TextDest => "text destination",
            ObjectKind::Window => "window",
        }
    }

    /// Whether a record of kind `other` may stand in an argument of this kind.
    ///
    /// Channels and queries are window items.
    pub fn accepts(self, other: ObjectKind) -> bool {
        self == other
            || (self == ObjectKind::WindowItem
                && matches!(other, ObjectKind::Channel | ObjectKind::Query))
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One argument position of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    /// `s`: text.
    Str,
    /// `i`: small integer passed by value.
    Int,
    /// `u`: unsigned long.
    ULong,
    /// `I`: integer passed by reference, written back from handler returns.
    IntRef,
    /// `G`: mutable list of strings, written back after the handler runs.
    StrList,
    /// `L`: list of nick records.
    NickList,
    /// A wrapped host record.
    Object(ObjectKind),
    /// `?`: record the bridge does not wrap, always seen as nil.
    Opaque,
}

impl TypeCode {
    /// Every code of the alphabet, in signature-character order.
    pub const ALL: [TypeCode; 25] = [
        TypeCode::Str,
        TypeCode::Int,
        TypeCode::ULong,
        TypeCode::IntRef,
        TypeCode::StrList,
        TypeCode::NickList,
        TypeCode::Object(ObjectKind::Chatnet),
        TypeCode::Object(ObjectKind::Server),
        TypeCode::Object(ObjectKind::Channel),
        TypeCode::Object(ObjectKind::Query),
        TypeCode::Object(ObjectKind::Nick),
        TypeCode::Object(ObjectKind::WindowItem),
        TypeCode::Object(ObjectKind::Dcc),
        TypeCode::Object(ObjectKind::Reconnect),
        TypeCode::Object(ObjectKind::Command),
        TypeCode::Object(ObjectKind::Log),
        TypeCode::Object(ObjectKind::Rawlog),
        TypeCode::Object(ObjectKind::Ignore),
        TypeCode::Object(ObjectKind::Ban),
        TypeCode::Object(ObjectKind::Netsplit),
        TypeCode::Object(ObjectKind::NetsplitServer),
        TypeCode::Object(ObjectKind::Notifylist),
        TypeCode::Object(ObjectKind::Process),
        TypeCode::Object(ObjectKind::TextDest),
        TypeCode::Object(ObjectKind::Window),
    ];

    /// Parse a single signature character.
    pub fn from_char(c: char) -> Option<Self> {
        let code = match c {
            's' => TypeCode::Str,
            'i' => TypeCode::Int,
            'u' => TypeCode::ULong,
            'I' => TypeCode::IntRef,
            'G' => TypeCode::StrList,
            'L' => TypeCode::NickList,
            'c' => TypeCode::Object(ObjectKind::Chatnet),
            'S' => TypeCode::Object(ObjectKind::Server),
            'C' => TypeCode::Object(ObjectKind::Channel),
            'q' => TypeCode::Object(ObjectKind::Query),
            'n' => TypeCode::Object(ObjectKind::Nick),
            'W' => TypeCode::Object(ObjectKind::WindowItem),
            'd' => TypeCode::Object(ObjectKind::Dcc),
            'r' => TypeCode::Object(ObjectKind::Reconnect),
            'o' => TypeCode::Object(ObjectKind::Command),
            'l' => TypeCode::Object(ObjectKind::Log),
            'a' => TypeCode::Object(ObjectKind::Rawlog),
            'g' => TypeCode::Object(ObjectKind::Ignore),
            'b' => TypeCode::Object(ObjectKind::Ban),
            'N' => TypeCode::Object(ObjectKind::Netsplit),
            'e' => TypeCode::Object(ObjectKind::NetsplitServer),
            'O' => TypeCode::Object(ObjectKind::Notifylist),
            'p' => TypeCode::Object(ObjectKind::Process),
            't' => TypeCode::Object(ObjectKind::TextDest),
            'w' => TypeCode::Object(ObjectKind::Window),
            '?' => TypeCode::Opaque,
            _ => return None,
        };
        Some(code)
    }

    /// The signature character for this code.
    pub fn as_char(self) -> char {
        match self {
            TypeCode::Str => 's',
            TypeCode::Int => 'i',
            TypeCode::ULong => 'u',
            TypeCode::IntRef => 'I',
            TypeCode::StrList => 'G',
            TypeCode::NickList => 'L',
            TypeCode::Opaque => '?',
            TypeCode::Object(kind) => match kind {
                ObjectKind::Chatnet => 'c',
                ObjectKind::Server => 'S',
                ObjectKind::Channel => 'C',
                ObjectKind::Query => 'q',
                ObjectKind::Nick => 'n',
                ObjectKind::WindowItem => 'W',
                ObjectKind::Dcc => 'd',
                ObjectKind::Reconnect => 'r',
                ObjectKind::Command => 'o',
                ObjectKind::Log => 'l',
                ObjectKind::Rawlog => 'a',
                ObjectKind::Ignore => 'g',
                ObjectKind::Ban => 'b',
                ObjectKind::Netsplit => 'N',
                ObjectKind::NetsplitServer => 'e',
                ObjectKind::Notifylist => 'O',
                ObjectKind::Process => 'p',
                ObjectKind::TextDest => 't',
                ObjectKind::Window => 'w',
            },
        }
    }

    /// What a script value must be to fill this position, for error messages.
    pub fn expected(self) -> &'static str {
        match self {
            TypeCode::Str => "string",
            TypeCode::Int => "integer",
            TypeCode::ULong => "unsigned integer",
            TypeCode::IntRef => "integer",
            TypeCode::StrList => "string list",
            TypeCode::NickList => "nick list",
            TypeCode::Object(kind) => kind.name(),
            TypeCode::Opaque => "nil",
        }
    }

    /// Positions whose native slot a handler may overwrite.
    pub fn is_reference(self) -> bool {
        matches!(self, TypeCode::IntRef | TypeCode::StrList)
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Ordered argument types of a signal, at most [`MAX_SIGNAL_ARGS`] long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TypeSignature(Vec<TypeCode>);

impl TypeSignature {
    /// Number of argument positions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn codes(&self) -> &[TypeCode] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = TypeCode> + '_ {
        self.0.iter().copied()
    }

    /// Whether any position is written back after dispatch.
    pub fn has_references(&self) -> bool {
        self.0.iter().any(|code| code.is_reference())
    }
}

impl FromStr for TypeSignature {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let mut codes = Vec::with_capacity(s.len());
        for c in s.chars() {
            let code = TypeCode::from_char(c).ok_or_else(|| {
                BridgeError::InvalidSignature(format!("unknown type code '{c}' in \"{s}\""))
            })?;
            codes.push(code);
        }

        if codes.len() > MAX_SIGNAL_ARGS {
            return Err(BridgeError::InvalidSignature(format!(
                "\"{s}\" has {} positions, at most {MAX_SIGNAL_ARGS} allowed",
                codes.len()
            )));
        }

        Ok(Self(codes))
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for code in &self.0 {
            write!(f, "{code}")?;
        }
        Ok(())
    }
}

/// Whether `name` declares a parametric signal family.
pub fn is_prefix_name(name: &str) -> bool {
    !name.is_empty() && name.ends_with(PREFIX_SEPARATOR)
}
