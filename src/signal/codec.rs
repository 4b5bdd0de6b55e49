//! Conversion between native argument slots and Lua values.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use mlua::{Lua, MetaMethod, Table, UserData, UserDataFields, UserDataMethods, Value};
use tracing::trace;

use super::types::{ObjectKind, TypeCode};
use crate::{BridgeError, Result};

/// Identity of a host record, as carried through signal arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: u64,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} #{}>", self.kind, self.id)
    }
}

/// One argument slot as the host passes it.
///
/// `IntRef` and `StrList` are shared so a handler's write-back is visible to
/// the emitter after the emission returns.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NativeSlot {
    #[default]
    Null,
    Str(String),
    Int(i64),
    ULong(u64),
    IntRef(Rc<Cell<i64>>),
    StrList(Rc<RefCell<Vec<String>>>),
    NickList(Vec<ObjectRef>),
    Object(ObjectRef),
}

impl NativeSlot {
    pub fn int_ref(value: i64) -> Self {
        NativeSlot::IntRef(Rc::new(Cell::new(value)))
    }

    pub fn str_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NativeSlot::StrList(Rc::new(RefCell::new(
            items.into_iter().map(Into::into).collect(),
        )))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NativeSlot::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeSlot::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value of an `Int` or `IntRef` slot.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            NativeSlot::Int(v) => Some(*v),
            NativeSlot::IntRef(cell) => Some(cell.get()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            NativeSlot::Object(obj) => Some(*obj),
            _ => None,
        }
    }

    /// Snapshot of a `StrList` slot.
    pub fn to_string_list(&self) -> Option<Vec<String>> {
        match self {
            NativeSlot::StrList(list) => Some(list.borrow().clone()),
            _ => None,
        }
    }
}

/// Lua-side wrapper for a host record.
///
/// Exposes `kind` and `id`; two handles compare equal when they wrap the same
/// record.
#[derive(Debug, Clone, Copy)]
pub struct ObjectHandle(pub ObjectRef);

impl UserData for ObjectHandle {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("kind", |_, this| Ok(this.0.kind.name()));
        fields.add_field_method_get("id", |_, this| {
            i64::try_from(this.0.id).map_err(mlua::Error::external)
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: Value| {
            Ok(handle_ref(&other) == Some(this.0))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
    }
}

/// The record behind a Lua value, if it is an [`ObjectHandle`].
pub fn handle_ref(value: &Value) -> Option<ObjectRef> {
    match value {
        Value::UserData(ud) => ud.borrow::<ObjectHandle>().ok().map(|handle| handle.0),
        _ => None,
    }
}

fn handle_value(lua: &Lua, obj: ObjectRef) -> mlua::Result<Value> {
    lua.create_userdata(ObjectHandle(obj)).map(Value::UserData)
}

/// Describe a Lua value for a type mismatch message.
pub fn describe(value: &Value) -> String {
    if let Some(obj) = handle_ref(value) {
        return obj.kind.name().to_string();
    }
    match value {
        Value::Number(n) if n.fract() != 0.0 => "non-integer number".to_string(),
        Value::String(s) if s.to_str().is_err() => "non-UTF-8 string".to_string(),
        _ => value.type_name().to_string(),
    }
}

/// Convert a native slot to the Lua value a handler sees.
///
/// A null slot is nil for every code. A slot whose variant does not fit the
/// code is also passed as nil.
pub fn to_script(lua: &Lua, code: TypeCode, slot: &NativeSlot) -> mlua::Result<Value> {
    let value = match (code, slot) {
        (_, NativeSlot::Null) | (TypeCode::Opaque, _) => Value::Nil,
        (TypeCode::Str, NativeSlot::Str(s)) => Value::String(lua.create_string(s)?),
        (TypeCode::Int | TypeCode::IntRef, NativeSlot::Int(v)) => Value::Integer(*v),
        (TypeCode::Int | TypeCode::IntRef, NativeSlot::IntRef(cell)) => Value::Integer(cell.get()),
        // Same bit pattern; values past i64::MAX show up negative in Lua.
        (TypeCode::ULong, NativeSlot::ULong(v)) => Value::Integer(*v as i64),
        (TypeCode::StrList, NativeSlot::StrList(list)) => {
            let list = list.borrow();
            Value::Table(lua.create_sequence_from(list.iter().map(String::as_str))?)
        }
        (TypeCode::NickList, NativeSlot::NickList(nicks)) => {
            let table = lua.create_table_with_capacity(nicks.len(), 0)?;
            for nick in nicks {
                table.raw_push(handle_value(lua, *nick)?)?;
            }
            Value::Table(table)
        }
        (TypeCode::Object(kind), NativeSlot::Object(obj)) if kind.accepts(obj.kind) => {
            handle_value(lua, *obj)?
        }
        (code, slot) => {
            trace!(code = %code, ?slot, "slot does not fit type code, passing nil");
            Value::Nil
        }
    };
    Ok(value)
}

/// Convert a Lua value to the native slot for argument `position`.
///
/// nil is accepted for every code and yields a null slot.
pub fn to_native(code: TypeCode, value: &Value, position: usize) -> Result<NativeSlot> {
    if value.is_nil() || code == TypeCode::Opaque {
        return Ok(NativeSlot::Null);
    }

    let mismatch = || BridgeError::TypeMismatch {
        position,
        expected: code.expected(),
        actual: describe(value),
    };

    let slot = match code {
        TypeCode::Str => match value {
            Value::String(s) => match s.to_str() {
                Ok(text) => NativeSlot::Str(text.to_string()),
                Err(_) => return Err(mismatch()),
            },
            _ => return Err(mismatch()),
        },
        TypeCode::Int => NativeSlot::Int(integer_of(value).ok_or_else(mismatch)?),
        TypeCode::IntRef => NativeSlot::int_ref(integer_of(value).ok_or_else(mismatch)?),
        TypeCode::ULong => NativeSlot::ULong(unsigned_of(value).ok_or_else(mismatch)?),
        TypeCode::StrList => match value {
            Value::Table(table) => {
                NativeSlot::StrList(Rc::new(RefCell::new(string_list(table, position)?)))
            }
            _ => return Err(mismatch()),
        },
        TypeCode::NickList => match value {
            Value::Table(table) => NativeSlot::NickList(nick_list(table, position)?),
            _ => return Err(mismatch()),
        },
        TypeCode::Object(kind) => match handle_ref(value) {
            Some(obj) if kind.accepts(obj.kind) => NativeSlot::Object(obj),
            _ => return Err(mismatch()),
        },
        TypeCode::Opaque => NativeSlot::Null,
    };
    Ok(slot)
}

/// Elements of a Lua sequence of strings.
pub fn string_list(table: &Table, position: usize) -> Result<Vec<String>> {
    let mut items = Vec::with_capacity(table.raw_len());
    for index in 1..=table.raw_len() {
        let item: Value = table.raw_get(index)?;
        let text = match &item {
            Value::String(s) => s.to_str().ok().map(|text| text.to_string()),
            _ => None,
        };
        match text {
            Some(text) => items.push(text),
            None => {
                return Err(BridgeError::TypeMismatch {
                    position,
                    expected: TypeCode::StrList.expected(),
                    actual: format!("table containing {}", describe(&item)),
                })
            }
        }
    }
    Ok(items)
}

fn nick_list(table: &Table, position: usize) -> Result<Vec<ObjectRef>> {
    let mut nicks = Vec::with_capacity(table.raw_len());
    for index in 1..=table.raw_len() {
        let item: Value = table.raw_get(index)?;
        match handle_ref(&item) {
            Some(obj) if obj.kind == ObjectKind::Nick => nicks.push(obj),
            _ => {
                return Err(BridgeError::TypeMismatch {
                    position,
                    expected: TypeCode::NickList.expected(),
                    actual: format!("table containing {}", describe(&item)),
                })
            }
        }
    }
    Ok(nicks)
}

/// Integer value of a Lua integer or an integral float.
pub fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Number(n) if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 => {
            Some(*n as i64)
        }
        _ => None,
    }
}

/// Unsigned value of a Lua integer or a non-negative integral float.
///
/// Integers are reinterpreted bit for bit, so negatives wrap.
fn unsigned_of(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => Some(*i as u64),
        Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n < u64::MAX as f64 => {
            Some(*n as u64)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_slot(code: TypeCode) -> NativeSlot {
        match code {
            TypeCode::Str => NativeSlot::Str("hello world".to_string()),
            TypeCode::Int => NativeSlot::Int(-42),
            TypeCode::ULong => NativeSlot::ULong(u64::from(u32::MAX) + 7),
            TypeCode::IntRef => NativeSlot::int_ref(17),
            TypeCode::StrList => NativeSlot::str_list(["alpha", "beta", "gamma"]),
            TypeCode::NickList => NativeSlot::NickList(vec![
                ObjectRef::new(ObjectKind::Nick, 1),
                ObjectRef::new(ObjectKind::Nick, 2),
            ]),
            TypeCode::Object(kind) => NativeSlot::Object(ObjectRef::new(kind, 9)),
            TypeCode::Opaque => NativeSlot::Null,
        }
    }

    #[test]
    fn test_every_code_survives_script_round_trip() {
        let lua = Lua::new();
        for code in TypeCode::ALL {
            let slot = sample_slot(code);
            let value = to_script(&lua, code, &slot).unwrap();
            let back = to_native(code, &value, 0).unwrap();
            assert_eq!(back, slot, "round trip through '{code}'");
        }
    }

    #[test]
    fn test_null_slot_is_nil_for_every_code() {
        let lua = Lua::new();
        for code in TypeCode::ALL {
            let value = to_script(&lua, code, &NativeSlot::Null).unwrap();
            assert!(value.is_nil(), "'{code}' should yield nil");
        }
        assert!(to_script(&lua, TypeCode::Opaque, &NativeSlot::Int(3))
            .unwrap()
            .is_nil());
    }

    #[test]
    fn test_nil_accepted_for_every_code() {
        for code in TypeCode::ALL {
            assert_eq!(to_native(code, &Value::Nil, 3).unwrap(), NativeSlot::Null);
        }
    }

    #[test]
    fn test_object_handle_fields_in_lua() {
        let lua = Lua::new();
        let obj = ObjectRef::new(ObjectKind::Channel, 3);
        let value = to_script(&lua, TypeCode::Object(ObjectKind::Channel), &NativeSlot::Object(obj))
            .unwrap();
        lua.globals().set("chan", value).unwrap();

        let kind: String = lua.load("return chan.kind").eval().unwrap();
        let id: i64 = lua.load("return chan.id").eval().unwrap();
        let text: String = lua.load("return tostring(chan)").eval().unwrap();
        assert_eq!(kind, "channel");
        assert_eq!(id, 3);
        assert_eq!(text, "<channel #3>");
    }

    #[test]
    fn test_object_handles_compare_by_record() {
        let lua = Lua::new();
        let a = ObjectRef::new(ObjectKind::Server, 1);
        let b = ObjectRef::new(ObjectKind::Server, 2);
        lua.globals().set("a1", ObjectHandle(a)).unwrap();
        lua.globals().set("a2", ObjectHandle(a)).unwrap();
        lua.globals().set("b", ObjectHandle(b)).unwrap();

        assert!(lua.load("return a1 == a2").eval::<bool>().unwrap());
        assert!(!lua.load("return a1 == b").eval::<bool>().unwrap());
    }

    #[test]
    fn test_window_item_accepts_channel() {
        let lua = Lua::new();
        let chan = ObjectRef::new(ObjectKind::Channel, 5);
        let value = lua.create_userdata(ObjectHandle(chan)).unwrap();
        let slot = to_native(
            TypeCode::Object(ObjectKind::WindowItem),
            &Value::UserData(value),
            2,
        )
        .unwrap();
        assert_eq!(slot, NativeSlot::Object(chan));
    }

    #[test]
    fn test_wrong_object_kind_rejected() {
        let lua = Lua::new();
        let server = ObjectRef::new(ObjectKind::Server, 1);
        let value = Value::UserData(lua.create_userdata(ObjectHandle(server)).unwrap());

        let err = to_native(TypeCode::Object(ObjectKind::Channel), &value, 1).unwrap_err();
        match err {
            BridgeError::TypeMismatch {
                position,
                expected,
                actual,
            } => {
                assert_eq!(position, 1);
                assert_eq!(expected, "channel");
                assert_eq!(actual, "server");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_string_rejects_integer() {
        let err = to_native(TypeCode::Str, &Value::Integer(5), 0).unwrap_err();
        assert_eq!(err.to_string(), "argument 0: expected string, got integer");
    }

    #[test]
    fn test_integer_accepts_integral_float() {
        assert_eq!(
            to_native(TypeCode::Int, &Value::Number(4.0), 0).unwrap(),
            NativeSlot::Int(4)
        );
        let err = to_native(TypeCode::Int, &Value::Number(4.5), 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument 1: expected integer, got non-integer number"
        );
    }

    #[test]
    fn test_unsigned_integer_wraps() {
        assert_eq!(
            to_native(TypeCode::ULong, &Value::Integer(-1), 0).unwrap(),
            NativeSlot::ULong(u64::MAX)
        );
        assert_eq!(
            to_native(TypeCode::ULong, &Value::Integer(12), 0).unwrap(),
            NativeSlot::ULong(12)
        );
        assert!(to_native(TypeCode::ULong, &Value::Number(-1.0), 0).is_err());
        assert!(to_native(TypeCode::ULong, &Value::Number(1.5), 0).is_err());
    }

    #[test]
    fn test_large_unsigned_survives_round_trip() {
        let lua = Lua::new();
        for v in [u64::MAX, (1 << 63) + 1, 1 << 63, i64::MAX as u64] {
            let value = to_script(&lua, TypeCode::ULong, &NativeSlot::ULong(v)).unwrap();
            assert!(matches!(value, Value::Integer(_)));
            assert_eq!(
                to_native(TypeCode::ULong, &value, 0).unwrap(),
                NativeSlot::ULong(v)
            );
        }

        // Lua sees the two's complement value.
        let value = to_script(&lua, TypeCode::ULong, &NativeSlot::ULong(u64::MAX)).unwrap();
        lua.globals().set("big", value).unwrap();
        let is_minus_one: bool = lua.load("return big == -1").eval().unwrap();
        assert!(is_minus_one);
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let lua = Lua::new();
        let value = Value::String(lua.create_string(b"ab\xffcd").unwrap());
        let err = to_native(TypeCode::Str, &value, 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument 2: expected string, got non-UTF-8 string"
        );

        let table = lua.create_table().unwrap();
        table.raw_push("fine").unwrap();
        table.raw_push(lua.create_string(b"\xc3\x28").unwrap()).unwrap();
        let err = to_native(TypeCode::StrList, &Value::Table(table), 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument 0: expected string list, got table containing non-UTF-8 string"
        );
    }

    #[test]
    fn test_string_list_rejects_mixed_table() {
        let lua = Lua::new();
        let table: Table = lua.load(r#"return {"a", 2, "c"}"#).eval().unwrap();
        let err = to_native(TypeCode::StrList, &Value::Table(table), 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument 0: expected string list, got table containing integer"
        );
    }

    #[test]
    fn test_nick_list_rejects_other_kinds() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        table
            .raw_push(ObjectHandle(ObjectRef::new(ObjectKind::Channel, 1)))
            .unwrap();
        let err = to_native(TypeCode::NickList, &Value::Table(table), 4).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch { position: 4, .. }));
    }

    #[test]
    fn test_int_ref_value_visible_to_script() {
        let lua = Lua::new();
        let slot = NativeSlot::int_ref(8);
        let value = to_script(&lua, TypeCode::IntRef, &slot).unwrap();
        assert_eq!(value, Value::Integer(8));
    }

    #[test]
    fn test_mismatched_slot_passes_nil() {
        let lua = Lua::new();
        let value = to_script(&lua, TypeCode::Str, &NativeSlot::Int(1)).unwrap();
        assert!(value.is_nil());
        let value = to_script(
            &lua,
            TypeCode::Object(ObjectKind::Channel),
            &NativeSlot::Object(ObjectRef::new(ObjectKind::Server, 1)),
        )
        .unwrap();
        assert!(value.is_nil());
    }

    #[test]
    fn test_slot_accessors() {
        assert_eq!(NativeSlot::Str("x".into()).as_str(), Some("x"));
        assert_eq!(NativeSlot::int_ref(3).as_int(), Some(3));
        assert_eq!(
            NativeSlot::str_list(["a"]).to_string_list(),
            Some(vec!["a".to_string()])
        );
        assert!(NativeSlot::default().is_null());
    }
}
