use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock_or_recover;

/// Opaque handle for "this renderable needs a refresh".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirtyToken(pub u64);

pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct DirtySet {
    order: Vec<DirtyToken>,
    members: HashSet<DirtyToken>,
}

/// Coalescing notifier shared by every renderable in one context.
///
/// Producers on any thread call [`DirtyScheduler::mark`]; the world thread
/// calls [`DirtyScheduler::drain`] once per tick. Marking only touches the
/// token set, so it is safe to call while a renderer reads the buffer the
/// token stands for.
#[derive(Debug, Clone, Default)]
pub struct DirtyScheduler {
    set: Arc<Mutex<DirtySet>>,
    next_token: Arc<AtomicU64>,
}

impl DirtyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_token(&self) -> DirtyToken {
        DirtyToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns `true` when the token was not already dirty.
    pub fn mark(&self, token: DirtyToken) -> bool {
        let mut set = lock_or_recover(&self.set, "dirty_set");
        if !set.members.insert(token) {
            return false;
        }
        set.order.push(token);
        true
    }

    /// Takes every token marked since the previous drain, in first-mark order.
    pub fn drain(&self) -> Vec<DirtyToken> {
        let mut set = lock_or_recover(&self.set, "dirty_set");
        set.members.clear();
        std::mem::take(&mut set.order)
    }

    pub fn is_dirty(&self, token: DirtyToken) -> bool {
        lock_or_recover(&self.set, "dirty_set")
            .members
            .contains(&token)
    }

    pub fn pending_len(&self) -> usize {
        lock_or_recover(&self.set, "dirty_set").order.len()
    }

    /// Builds a change listener that marks `token` when invoked.
    pub fn listener(&self, token: DirtyToken) -> ChangeListener {
        let scheduler = self.clone();
        Arc::new(move || {
            scheduler.mark(token);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn repeated_marks_coalesce_into_one_drain_entry() {
        let scheduler = DirtyScheduler::new();
        let token = scheduler.allocate_token();

        assert!(scheduler.mark(token));
        for _ in 0..10 {
            assert!(!scheduler.mark(token));
        }

        assert_eq!(scheduler.drain(), vec![token]);
        assert!(scheduler.drain().is_empty());
    }

    #[test]
    fn drain_preserves_first_mark_order() {
        let scheduler = DirtyScheduler::new();
        let a = scheduler.allocate_token();
        let b = scheduler.allocate_token();
        let c = scheduler.allocate_token();

        scheduler.mark(c);
        scheduler.mark(a);
        scheduler.mark(c);
        scheduler.mark(b);

        assert_eq!(scheduler.drain(), vec![c, a, b]);
    }

    #[test]
    fn token_can_be_marked_again_after_drain() {
        let scheduler = DirtyScheduler::new();
        let token = scheduler.allocate_token();

        scheduler.mark(token);
        assert_eq!(scheduler.drain(), vec![token]);
        assert!(!scheduler.is_dirty(token));

        scheduler.mark(token);
        assert!(scheduler.is_dirty(token));
        assert_eq!(scheduler.drain(), vec![token]);
    }

    #[test]
    fn concurrent_marks_lose_no_token() {
        let scheduler = DirtyScheduler::new();
        let tokens: Vec<DirtyToken> = (0..8).map(|_| scheduler.allocate_token()).collect();

        thread::scope(|scope| {
            for token in &tokens {
                let scheduler = scheduler.clone();
                let token = *token;
                scope.spawn(move || {
                    for _ in 0..100 {
                        scheduler.mark(token);
                    }
                });
            }
        });

        let mut drained = scheduler.drain();
        drained.sort();
        assert_eq!(drained, tokens);
    }

    #[test]
    fn listener_marks_its_token() {
        let scheduler = DirtyScheduler::new();
        let token = scheduler.allocate_token();
        let listener = scheduler.listener(token);

        listener();
        listener();

        assert_eq!(scheduler.pending_len(), 1);
        assert_eq!(scheduler.drain(), vec![token]);
    }
}
