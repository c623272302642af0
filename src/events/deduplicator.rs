use std::num::NonZeroUsize;

use lru::LruCache;

use crate::Context;

/// Remembers recently seen contexts so that an index event is sent only once per context per
/// flush interval.
pub(crate) struct ContextDeduplicator {
    keys: LruCache<String, ()>,
}

impl ContextDeduplicator {
    pub fn new(capacity: usize) -> ContextDeduplicator {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        ContextDeduplicator {
            keys: LruCache::new(capacity),
        }
    }

    /// Record a context. Returns `true` if it has not been seen since the last flush (or has been
    /// evicted).
    pub fn process_context(&mut self, context: &Context) -> bool {
        self.keys.put(context.canonical_key().to_owned(), ()).is_none()
    }

    /// Forget all contexts.
    pub fn flush(&mut self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::ContextDeduplicator;
    use crate::ContextBuilder;

    fn user(key: &str) -> crate::Context {
        ContextBuilder::new(key).build().unwrap()
    }

    #[test]
    fn reports_new_contexts_once() {
        let mut dedup = ContextDeduplicator::new(10);
        assert!(dedup.process_context(&user("a")));
        assert!(!dedup.process_context(&user("a")));
        assert!(dedup.process_context(&user("b")));
    }

    #[test]
    fn distinguishes_kinds() {
        let mut dedup = ContextDeduplicator::new(10);
        assert!(dedup.process_context(&user("a")));
        let org = ContextBuilder::new("a").kind("org").build().unwrap();
        assert!(dedup.process_context(&org));
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut dedup = ContextDeduplicator::new(2);
        dedup.process_context(&user("a"));
        dedup.process_context(&user("b"));
        // touch "a" so that "b" is the oldest
        assert!(!dedup.process_context(&user("a")));
        dedup.process_context(&user("c"));
        assert!(dedup.process_context(&user("b")));
        assert!(!dedup.process_context(&user("c")));
    }

    #[test]
    fn flush_forgets_everything() {
        let mut dedup = ContextDeduplicator::new(10);
        dedup.process_context(&user("a"));
        dedup.flush();
        assert!(dedup.process_context(&user("a")));
    }
}
