// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Dynamic values exchanged between modules
//!
//! A module's exports, the arguments handed to a factory and the values
//! carried by promises are all [`Value`]s. The model is deliberately close to
//! what an AMD module can export: primitives, arrays, mutable objects shared
//! by reference, promises, loader plugins and local `require` handles.

use crate::module_system::{LoaderPlugin, LocalRequire};
use crate::runtime::Promise;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// A module value
#[derive(Clone, Default)]
pub enum Value {
    /// undefined
    #[default]
    Undefined,
    /// null
    Null,
    /// Boolean value
    Boolean(bool),
    /// Number (IEEE 754 double)
    Number(f64),
    /// String
    String(String),
    /// Immutable array
    Array(Rc<Vec<Value>>),
    /// Mutable object shared by reference
    Object(Object),
    /// A thenable; resolving a promise with it adopts its state
    Promise(Promise),
    /// A loader plugin implementing `load()`
    Plugin(Rc<dyn LoaderPlugin>),
    /// The local `require` synthesized for the reserved `require` dependency
    Require(LocalRequire),
}

impl Value {
    /// Check for undefined
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Borrow as an array
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow as an object
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Borrow as a loader plugin
    pub fn as_plugin(&self) -> Option<&Rc<dyn LoaderPlugin>> {
        match self {
            Value::Plugin(plugin) => Some(plugin),
            _ => None,
        }
    }

    /// Borrow as a local require handle
    pub fn as_require(&self) -> Option<&LocalRequire> {
        match self {
            Value::Require(req) => Some(req),
            _ => None,
        }
    }

    /// Build an array value
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    /// Wrap a plugin implementation
    pub fn plugin(plugin: impl LoaderPlugin + 'static) -> Self {
        Value::Plugin(Rc::new(plugin))
    }

    /// Name of the value's type, as used in messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Promise(_) => "promise",
            Value::Plugin(_) => "plugin",
            Value::Require(_) => "require",
        }
    }

    /// Convert from JSON
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(arr) => Value::array(arr.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(obj) => {
                let map = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect();
                Value::Object(Object::from_map(map))
            }
        }
    }

    /// Convert to JSON; values without a JSON form become descriptive strings
    ///
    /// An object reached again while it is still being written becomes
    /// `"[Circular]"`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_with(&mut Vec::new())
    }

    fn to_json_with(&self, visiting: &mut Vec<*const ()>) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items.iter().map(|item| item.to_json_with(visiting)).collect(),
            ),
            Value::Object(obj) => {
                let addr = obj.addr();
                if visiting.contains(&addr) {
                    return serde_json::Value::String(CIRCULAR.to_string());
                }
                visiting.push(addr);
                let map = obj
                    .entries()
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json_with(visiting)))
                    .collect();
                visiting.pop();
                serde_json::Value::Object(map)
            }
            other => serde_json::Value::String(format!("[{}]", other.type_name())),
        }
    }
}

const CIRCULAR: &str = "[Circular]";

/// Integral numbers in `i64` range are written without a fraction
fn number_to_json(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        return serde_json::Value::Number(serde_json::Number::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Structural equality that treats a pair of objects already under
/// comparison as equal
fn values_eq(a: &Value, b: &Value, comparing: &mut Vec<(*const (), *const ())>) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            Rc::ptr_eq(a, b)
                || (a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| values_eq(x, y, comparing)))
        }
        (Value::Object(a), Value::Object(b)) => {
            if a.ptr_eq(b) {
                return true;
            }
            let pair = (a.addr(), b.addr());
            if comparing.contains(&pair) {
                return true;
            }
            let (left, right) = (a.entries(), b.entries());
            if left.len() != right.len() {
                return false;
            }
            comparing.push(pair);
            let equal = left
                .iter()
                .zip(right.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && values_eq(va, vb, comparing));
            comparing.pop();
            equal
        }
        (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
        (Value::Plugin(a), Value::Plugin(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

thread_local! {
    /// Objects currently being written by `Debug`
    static DEBUG_VISITING: RefCell<Vec<*const ()>> = const { RefCell::new(Vec::new()) };
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_eq(self, other, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(obj) => fmt::Debug::fmt(obj, f),
            Value::Promise(p) => fmt::Debug::fmt(p, f),
            Value::Plugin(_) => write!(f, "Plugin"),
            Value::Require(req) => fmt::Debug::fmt(req, f),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
            other => write!(f, "[{}]", other.type_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<Object> for Value {
    fn from(obj: Object) -> Self {
        Value::Object(obj)
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Value::Promise(p)
    }
}

/// A mutable, reference-counted property bag
///
/// Cloning an `Object` clones the handle; CommonJS `exports` relies on every
/// holder seeing the same properties.
#[derive(Clone, Default)]
pub struct Object(Rc<RefCell<BTreeMap<String, Value>>>);

impl Object {
    /// Create an empty object
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object from a property map
    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(Rc::new(RefCell::new(map)))
    }

    /// Read a property
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.borrow().get(key).cloned()
    }

    /// Write a property
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.borrow_mut().insert(key.into(), value.into());
    }

    /// Check for a property
    pub fn has(&self, key: &str) -> bool {
        self.0.borrow().contains_key(key)
    }

    /// Property names in order
    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    /// Snapshot of all properties
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Check whether the object has no properties
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        values_eq(
            &Value::Object(self.clone()),
            &Value::Object(other.clone()),
            &mut Vec::new(),
        )
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.addr();
        let entered = DEBUG_VISITING.with(|visiting| {
            let mut visiting = visiting.borrow_mut();
            if visiting.contains(&addr) {
                false
            } else {
                visiting.push(addr);
                true
            }
        });
        if !entered {
            return write!(f, "{}", CIRCULAR);
        }

        let result = match self.0.try_borrow() {
            Ok(map) => f.debug_map().entries(map.iter()).finish(),
            Err(_) => write!(f, "Object(<borrowed>)"),
        };
        DEBUG_VISITING.with(|visiting| {
            visiting.borrow_mut().pop();
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"name": "a", "deps": [1, 2], "ok": true});
        let value = Value::from_json(&json);
        let obj = value.as_object().unwrap();
        assert_eq!(obj.get("name"), Some(Value::from("a")));
        assert_eq!(
            obj.get("deps"),
            Some(Value::array(vec![Value::from(1), Value::from(2)]))
        );
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_integral_numbers_stay_integers() {
        assert_eq!(Value::from(42).to_json().to_string(), "42");
        assert_eq!(Value::from(-3.0).to_json().to_string(), "-3");
        assert_eq!(Value::from(1.5).to_json().to_string(), "1.5");
        assert_eq!(Value::from(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::from(1e300).to_json().to_string(), "1e300");
    }

    #[test]
    fn test_cyclic_objects() {
        // a.b = b and b.a = a, the shape CommonJS cycles leave behind
        let a = Object::new();
        let b = Object::new();
        a.set("name", "a");
        b.set("name", "b");
        a.set("b", b.clone());
        b.set("a", a.clone());

        let value = Value::Object(a);
        assert_eq!(
            value.to_json(),
            serde_json::json!({"b": {"a": "[Circular]", "name": "b"}, "name": "a"})
        );
        assert_eq!(
            value.to_string(),
            r#"{"b":{"a":"[Circular]","name":"b"},"name":"a"}"#
        );
        assert!(format!("{:?}", value).contains("[Circular]"));

        // A structurally identical but distinct cycle compares equal
        let c = Object::new();
        let d = Object::new();
        c.set("name", "a");
        d.set("name", "b");
        c.set("b", d.clone());
        d.set("a", c.clone());
        let other = Value::Object(c);
        assert_eq!(value, other);
        assert_eq!(value, value.clone());

        d.set("name", "other");
        assert_ne!(value, other);
    }

    #[test]
    fn test_objects_share_state() {
        let exports = Object::new();
        let alias = exports.clone();
        alias.set("answer", 42);
        assert_eq!(exports.get("answer"), Some(Value::from(42)));
        assert!(exports.ptr_eq(&alias));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from(43).to_string(), "43");
        assert_eq!(Value::from(1.5).to_string(), "1.5");
        assert_eq!(Value::Undefined.to_string(), "undefined");
        assert_eq!(Value::array(vec![Value::from("x")]).to_string(), "[\"x\"]");
    }
}
