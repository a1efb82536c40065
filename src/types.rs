use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A type-erased value flowing between tasks.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Identifies a type in the dependency graph.
///
/// Two keys are equal when they refer to the same Rust type. The type name
/// is only kept for diagnostics.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A bag of values keyed by their type.
///
/// Tasks receive their inputs as `Values` and hand back their outputs the
/// same way. Cloning is cheap: only the `Arc`s are copied.
#[derive(Clone, Default)]
pub struct Values {
    inner: HashMap<TypeKey, Value>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Stores `value` under its type, returning the previous value if any.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<Value> {
        self.inner.insert(TypeKey::of::<T>(), Arc::new(value))
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.inner
            .get(&TypeKey::of::<T>())
            .and_then(|v| (**v).downcast_ref::<T>())
    }

    pub fn cloned<T: Any + Clone>(&self) -> Option<T> {
        self.get::<T>().cloned()
    }

    /// Like [`Values::get`], but a missing value is an error naming the type.
    pub fn require<T: Any>(&self) -> anyhow::Result<&T> {
        self.get::<T>()
            .ok_or_else(|| anyhow::anyhow!("no value of type {}", std::any::type_name::<T>()))
    }

    pub fn contains(&self, key: &TypeKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TypeKey> {
        self.inner.keys()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub(crate) fn get_value(&self, key: &TypeKey) -> Option<&Value> {
        self.inner.get(key)
    }

    pub(crate) fn insert_value(&mut self, key: TypeKey, value: Value) {
        self.inner.insert(key, value);
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (TypeKey, Value)> {
        self.inner.into_iter()
    }
}

impl fmt::Debug for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.inner.keys()).finish()
    }
}

/// Externally supplied values for a flow.
///
/// Supplying the same type twice is not rejected here; the graph builder
/// reports it together with every other validation problem.
#[derive(Clone, Default)]
pub struct ParamSet {
    entries: Vec<(TypeKey, Value)>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.push((TypeKey::of::<T>(), Arc::new(value)));
    }

    /// Moves every entry of `other` into this set.
    pub fn append(&mut self, other: ParamSet) {
        self.entries.extend(other.entries);
    }

    pub fn keys(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The supplied values. For a type given twice the last one wins, but
    /// such a set never makes it past graph validation.
    pub(crate) fn values(&self) -> Values {
        let mut values = Values::new();
        for (key, value) in &self.entries {
            values.insert_value(*key, Arc::clone(value));
        }
        values
    }
}

impl fmt::Debug for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

/// The output slots a caller wants filled once a flow finishes.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    keys: Vec<TypeKey>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot<T: Any>(mut self) -> Self {
        self.add(TypeKey::of::<T>());
        self
    }

    pub fn add(&mut self, key: TypeKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    pub fn keys(&self) -> &[TypeKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
