//! Scoped environments with strict LIFO push/pop.

use std::hash::Hash;

use hashbrown::HashMap;

/// A stack of hash maps. Lookups search innermost-first; insertions go to
/// the innermost scope; popping a scope drops its bindings.
#[derive(Debug)]
pub struct ScopedMap<K, V> {
  scopes: Vec<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> ScopedMap<K, V> {
  /// A map with a single root scope.
  #[must_use] pub fn new() -> ScopedMap<K, V> {
    ScopedMap { scopes: vec![HashMap::new()] }
  }

  /// Enter a new scope.
  pub fn push(&mut self) { self.scopes.push(HashMap::new()) }

  /// Leave the innermost scope, dropping its bindings.
  pub fn pop(&mut self) {
    self.scopes.pop();
    assert!(!self.scopes.is_empty(), "popped the root scope");
  }

  /// Bind `k` in the innermost scope.
  pub fn insert(&mut self, k: K, v: V) {
    self.scopes.last_mut().expect("root scope").insert(k, v);
  }

  /// Innermost binding of `k`, if any scope binds it.
  pub fn get(&self, k: &K) -> Option<&V> {
    self.scopes.iter().rev().find_map(|s| s.get(k))
  }

  /// Whether any scope binds `k`.
  pub fn contains(&self, k: &K) -> bool { self.get(k).is_some() }
}

impl<K: Eq + Hash, V> Default for ScopedMap<K, V> {
  fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn inner_scope_shadows_and_pops() {
    let mut m = ScopedMap::new();
    m.insert("x", 1);
    m.push();
    m.insert("x", 2);
    m.insert("y", 3);
    assert_eq!(m.get(&"x"), Some(&2));
    assert_eq!(m.get(&"y"), Some(&3));
    m.pop();
    assert_eq!(m.get(&"x"), Some(&1));
    assert_eq!(m.get(&"y"), None);
  }

  #[test]
  #[should_panic(expected = "popped the root scope")]
  fn root_scope_is_protected() {
    let mut m: ScopedMap<&str, ()> = ScopedMap::new();
    m.pop();
  }
}
