//! String interning for script-visible strings.
//!
//! Every distinct byte sequence gets one shared allocation per interpreter
//! state. Handles are `Rc<str>`, so cloning a handle is the `ref` operation
//! and the live reference count is observable through `Rc::strong_count`.

use std::rc::Rc;

use indexmap::IndexSet;

/// The content-keyed intern table.
///
/// The table itself holds one reference to each entry; an entry whose only
/// remaining reference is the table's is released by [`StringPool::unref`].
#[derive(Default)]
pub struct StringPool {
    interns: IndexSet<Rc<str>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning a shared handle. Repeated calls with equal
    /// content return handles to the same allocation.
    pub fn add(&mut self, s: &str) -> Rc<str> {
        if let Some(existing) = self.interns.get(s) {
            return existing.clone();
        }
        let handle: Rc<str> = Rc::from(s);
        self.interns.insert(handle.clone());
        handle
    }

    /// Adopt an already-built buffer as the canonical content, folding into
    /// an existing entry when the content is already interned.
    pub fn steal(&mut self, s: String) -> Rc<str> {
        if let Some(existing) = self.interns.get(s.as_str()) {
            return existing.clone();
        }
        let handle: Rc<str> = Rc::from(s);
        self.interns.insert(handle.clone());
        handle
    }

    /// Look up without creating.
    pub fn find(&self, s: &str) -> Option<Rc<str>> {
        self.interns.get(s).cloned()
    }

    /// Release one handle. When the table's own reference is the only one
    /// left, the entry is removed and the allocation freed.
    pub fn unref(&mut self, handle: Rc<str>) {
        // the passed handle plus the table entry
        if Rc::strong_count(&handle) == 2 {
            self.interns.swap_remove(&*handle);
        }
    }

    pub fn len(&self) -> usize {
        self.interns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_returns_shared_handle() {
        let mut pool = StringPool::new();
        let a = pool.add("hello");
        let b = pool.add("hello");
        assert!(Rc::ptr_eq(&a, &b));
        // table + a + b
        assert_eq!(Rc::strong_count(&a), 3);
    }

    #[test]
    fn distinct_content_distinct_handles() {
        let mut pool = StringPool::new();
        let a = pool.add("one");
        let b = pool.add("two");
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn unref_to_zero_removes_entry() {
        let mut pool = StringPool::new();
        let a = pool.add("gone");
        let b = pool.add("gone");
        pool.unref(a);
        assert!(pool.find("gone").is_some());
        pool.unref(b);
        assert!(pool.find("gone").is_none());
    }

    #[test]
    fn steal_folds_into_existing() {
        let mut pool = StringPool::new();
        let a = pool.add("dup");
        let b = pool.steal(String::from("dup"));
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn find_does_not_create() {
        let pool = StringPool::new();
        assert!(pool.find("missing").is_none());
    }
}
