//! Per-task scope stack.
//!
//! The scope stack is the ordered list of regions a task has entered, from
//! the outermost to the current one. Its top is the task's current
//! allocation context; an empty stack means the heap context.

use std::cell::RefCell;
use std::fmt;

use crate::region::{Region, RegionId};

/// An allocation context: the heap, or a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    /// The root context outside every region.
    Heap,
    /// A region's object area.
    Region(RegionId),
}

impl ContextId {
    /// The region, if this context is one.
    pub fn region(&self) -> Option<RegionId> {
        match self {
            ContextId::Heap => None,
            ContextId::Region(id) => Some(*id),
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Heap => write!(f, "heap"),
            ContextId::Region(id) => write!(f, "{}", id),
        }
    }
}

thread_local! {
    static SCOPE_STACK: RefCell<Vec<Region>> = const { RefCell::new(Vec::new()) };
}

/// The region at the top of the calling task's scope stack.
pub fn current() -> Option<Region> {
    SCOPE_STACK.with(|s| s.borrow().last().cloned())
}

/// The calling task's current allocation context.
pub fn current_context() -> ContextId {
    SCOPE_STACK.with(|s| {
        s.borrow()
            .last()
            .map_or(ContextId::Heap, |r| ContextId::Region(r.id()))
    })
}

/// Number of entered regions.
pub fn depth() -> usize {
    SCOPE_STACK.with(|s| s.borrow().len())
}

/// The IDs on the scope stack, outermost first.
pub fn stack() -> Vec<RegionId> {
    SCOPE_STACK.with(|s| s.borrow().iter().map(Region::id).collect())
}

/// Whether `region` is on the calling task's scope stack.
pub fn contains(region: RegionId) -> bool {
    SCOPE_STACK.with(|s| s.borrow().iter().any(|r| r.id() == region))
}

/// Allocate `value` in the current allocation context.
///
/// Fails with [`Error::InvalidArgument`](crate::Error::InvalidArgument) in
/// the heap context.
pub fn alloc<T: std::any::Any + Send + Sync>(value: T) -> crate::Result<crate::RegionRef<T>> {
    match current() {
        Some(region) => region.alloc(value),
        None => Err(crate::Error::InvalidArgument(
            "no region is entered; the heap context has no object area".into(),
        )),
    }
}

pub(crate) fn push(region: Region) {
    SCOPE_STACK.with(|s| s.borrow_mut().push(region));
}

pub(crate) fn pop(expected: RegionId) {
    // Dropped outside the borrow; the last handle may retire the region.
    let popped = SCOPE_STACK.with(|s| s.borrow_mut().pop());
    debug_assert_eq!(popped.as_ref().map(Region::id), Some(expected));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_context_by_default() {
        std::thread::spawn(|| {
            assert_eq!(current_context(), ContextId::Heap);
            assert_eq!(depth(), 0);
            assert!(current().is_none());
            assert!(alloc(1u32).is_err());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_context_display() {
        assert_eq!(ContextId::Heap.to_string(), "heap");
        assert_eq!(ContextId::Region(RegionId(3)).to_string(), "region#3");
        assert_eq!(ContextId::Region(RegionId(3)).region(), Some(RegionId(3)));
    }
}
