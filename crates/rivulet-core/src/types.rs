use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Location of an offloaded value in the object store
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectStoreRef {
    /// Container (bucket) name
    pub container: String,
    /// Object key inside the container
    pub key: String,
}

/// In-place stand-in for a context value that was too large to keep inline.
///
/// Serialized as `{ "objectStoreRef": { "container": ..., "key": ... } }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeValuePointer {
    /// Where the value lives
    pub object_store_ref: ObjectStoreRef,
}

impl LargeValuePointer {
    /// Create a pointer to `container/key`
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            object_store_ref: ObjectStoreRef {
                container: container.into(),
                key: key.into(),
            },
        }
    }

    /// Recognise a pointer in a JSON value.
    ///
    /// Only an object with the single `objectStoreRef` key qualifies, so that
    /// ordinary data carrying extra fields is never mistaken for a pointer.
    pub fn detect(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let reference = obj.get("objectStoreRef")?.as_object()?;
        let container = reference.get("container")?.as_str()?;
        let key = reference.get("key")?.as_str()?;
        Some(Self::new(container, key))
    }

    /// Convert the pointer into its JSON representation
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "objectStoreRef": {
                "container": self.object_store_ref.container,
                "key": self.object_store_ref.key,
            }
        })
    }
}

/// Outcome of resolving a query: either a value or the explicit
/// "undefined" sentinel for missing data.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolved {
    /// Nothing at the requested location
    Undefined,
    /// A concrete JSON value (which may itself be `null`)
    Value(Value),
}

impl Resolved {
    /// Whether the resolution found nothing
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Resolved::Undefined)
    }

    /// Borrow the value, if any
    #[inline]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Resolved::Undefined => None,
            Resolved::Value(v) => Some(v),
        }
    }

    /// Take the value, if any
    #[inline]
    pub fn into_option(self) -> Option<Value> {
        match self {
            Resolved::Undefined => None,
            Resolved::Value(v) => Some(v),
        }
    }

    /// Take the value, mapping undefined to `null`
    #[inline]
    pub fn into_value_or_null(self) -> Value {
        self.into_option().unwrap_or(Value::Null)
    }

    /// JS-style truthiness, except that an empty array is falsy
    pub fn is_truthy(&self) -> bool {
        match self {
            Resolved::Undefined => false,
            Resolved::Value(value) => match value {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
                Value::String(s) => !s.is_empty(),
                Value::Array(items) => !items.is_empty(),
                Value::Object(_) => true,
            },
        }
    }
}

impl From<Value> for Resolved {
    fn from(value: Value) -> Self {
        Resolved::Value(value)
    }
}

impl From<Option<Value>> for Resolved {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(v) => Resolved::Value(v),
            None => Resolved::Undefined,
        }
    }
}

/// Size of a value once serialized to compact JSON
pub fn serialized_size(value: &Value) -> Result<usize, serde_json::Error> {
    serde_json::to_vec(value).map(|bytes| bytes.len())
}
