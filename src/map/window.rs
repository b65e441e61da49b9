//! Sliding keyframe window: the bounded, ordered set of active
//! viewpoints.
//!
//! The window assigns viewpoint ids sequentially and evicts oldest
//! first. Iteration order is insertion order, which downstream code
//! relies on as the tie-break when several active viewpoints match a
//! new frame equally well.

use super::types::ViewpointId;

/// Ordered active set of viewpoint ids with FIFO eviction.
#[derive(Debug, Default)]
pub struct KeyframeWindow {
    next_id: u64,
    active: Vec<ViewpointId>,
}

impl KeyframeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next accepted frame will receive. Does not consume
    /// the id; rejected frames must not advance the sequence.
    pub fn peek_next(&self) -> ViewpointId {
        ViewpointId::new(self.next_id)
    }

    /// Assign the next sequential id and append it to the active set.
    pub fn add_new(&mut self) -> ViewpointId {
        let id = ViewpointId::new(self.next_id);
        self.next_id += 1;
        self.active.push(id);
        id
    }

    /// Evict the oldest viewpoint if the active count exceeds
    /// `max_active`. Returns the evicted id so the caller can prune its
    /// observation bindings.
    pub fn evict_if_over(&mut self, max_active: usize) -> Option<ViewpointId> {
        if self.active.len() > max_active {
            Some(self.active.remove(0))
        } else {
            None
        }
    }

    /// Active viewpoints, oldest first.
    pub fn active(&self) -> &[ViewpointId] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, id: ViewpointId) -> bool {
        self.active.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let mut window = KeyframeWindow::new();

        assert_eq!(window.add_new(), ViewpointId::new(0));
        assert_eq!(window.add_new(), ViewpointId::new(1));
        assert_eq!(window.add_new(), ViewpointId::new(2));
        assert_eq!(window.active(), &[
            ViewpointId::new(0),
            ViewpointId::new(1),
            ViewpointId::new(2),
        ]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut window = KeyframeWindow::new();

        assert_eq!(window.peek_next(), ViewpointId::new(0));
        assert_eq!(window.peek_next(), ViewpointId::new(0));
        assert_eq!(window.add_new(), ViewpointId::new(0));
        assert_eq!(window.peek_next(), ViewpointId::new(1));
    }

    #[test]
    fn test_evict_is_noop_at_or_below_limit() {
        let mut window = KeyframeWindow::new();
        window.add_new();
        window.add_new();

        assert_eq!(window.evict_if_over(2), None);
        assert_eq!(window.evict_if_over(3), None);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_evict_oldest_first() {
        let mut window = KeyframeWindow::new();
        for _ in 0..4 {
            window.add_new();
        }

        assert_eq!(window.evict_if_over(3), Some(ViewpointId::new(0)));
        assert_eq!(window.evict_if_over(3), None);
        assert!(!window.contains(ViewpointId::new(0)));

        window.add_new();
        assert_eq!(window.evict_if_over(3), Some(ViewpointId::new(1)));
        assert_eq!(window.active(), &[
            ViewpointId::new(2),
            ViewpointId::new(3),
            ViewpointId::new(4),
        ]);
    }
}
