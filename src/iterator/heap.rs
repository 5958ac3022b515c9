//! Binary heap of child indices ordered by an external predicate.
//!
//! `std::collections::BinaryHeap` needs `Ord` on its elements, but the order
//! here depends on the children's current keys, which live outside the heap.
//! Every mutating call therefore takes the "sorts before" predicate.

#[derive(Debug, Default)]
pub(crate) struct IndexHeap {
    data: Vec<usize>,
}

impl IndexHeap {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            data: Vec::with_capacity(n),
        }
    }

    pub fn top(&self) -> Option<usize> {
        self.data.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn push<F: Fn(usize, usize) -> bool>(&mut self, idx: usize, before: F) {
        self.data.push(idx);
        self.sift_up(self.data.len() - 1, &before);
    }

    pub fn pop<F: Fn(usize, usize) -> bool>(&mut self, before: F) -> Option<usize> {
        if self.data.is_empty() {
            return None;
        }
        let top = self.data.swap_remove(0);
        if !self.data.is_empty() {
            self.sift_down(0, &before);
        }
        Some(top)
    }

    /// Restore heap order after the top element's key changed in place
    pub fn update_top<F: Fn(usize, usize) -> bool>(&mut self, before: F) {
        if !self.data.is_empty() {
            self.sift_down(0, &before);
        }
    }

    fn sift_up<F: Fn(usize, usize) -> bool>(&mut self, mut pos: usize, before: &F) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !before(self.data[pos], self.data[parent]) {
                break;
            }
            self.data.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down<F: Fn(usize, usize) -> bool>(&mut self, mut pos: usize, before: &F) {
        let len = self.data.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < len && before(self.data[right], self.data[left]) {
                best = right;
            }
            if !before(self.data[best], self.data[pos]) {
                break;
            }
            self.data.swap(pos, best);
            pos = best;
        }
    }
}
