use kvstructs::{iterator::Iterator as BableIterator, Key, Value};

/// MergeIterator merges multiple iterators into one ascending stream.
///
/// Sources are given newest first. When several sources hold the exact same
/// internal key, only the entry of the newest source is yielded.
pub struct MergeIterator {
    iters: Vec<Box<dyn BableIterator + Send>>,
    cur: Option<usize>,
}

impl MergeIterator {
    pub fn new(iters: Vec<Box<dyn BableIterator + Send>>) -> Self {
        Self { iters, cur: None }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.iters.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.iters.is_empty()
    }

    /// Picks the smallest key, the lowest index wins on ties.
    fn pick(&mut self) {
        let mut best: Option<(usize, &Key)> = None;
        for (idx, it) in self.iters.iter().enumerate() {
            let Some(k) = it.key() else { continue };
            match best {
                Some((_, bk)) if k >= bk => {}
                _ => best = Some((idx, k)),
            }
        }
        self.cur = best.map(|(idx, _)| idx);
    }
}

impl BableIterator for MergeIterator {
    fn next(&mut self) {
        let Some(cur) = self.cur else { return };
        let Some(key) = self.iters[cur].key().cloned() else {
            self.cur = None;
            return;
        };

        for it in self.iters.iter_mut() {
            if it.key() == Some(&key) {
                it.next();
            }
        }
        self.pick();
    }

    fn rewind(&mut self) {
        for it in self.iters.iter_mut() {
            it.rewind();
        }
        self.pick();
    }

    fn seek(&mut self, key: &[u8]) {
        for it in self.iters.iter_mut() {
            it.seek(key);
        }
        self.pick();
    }

    #[inline]
    fn key(&self) -> Option<&Key> {
        self.cur.and_then(|idx| self.iters[idx].key())
    }

    #[inline]
    fn val(&self) -> Option<&Value> {
        self.cur.and_then(|idx| self.iters[idx].val())
    }
}
