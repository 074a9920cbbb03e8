#![warn(clippy::pedantic)]

/// Square table of which pair tests are done. Only entries with `j > i` carry meaning; a
/// `true` entry has been measured or excluded. Out-of-range indices read as done and
/// are never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMatrix {
    n: usize,
    cells: Vec<bool>,
}

impl CompletionMatrix {
    #[must_use]
    pub fn new(n: usize) -> Self {
        let mut cells = vec![false; n * n];
        for i in 0..n {
            for j in 0..=i {
                cells[i * n + j] = true;
            }
        }
        CompletionMatrix { n, cells }
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.n
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> bool {
        if i < self.n && j < self.n {
            self.cells[i * self.n + j]
        } else {
            true
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize) {
        if i < self.n && j < self.n {
            self.cells[i * self.n + j] = true;
        }
    }

    pub fn complete_row(&mut self, i: usize) {
        for j in 0..self.n {
            self.set(i, j);
        }
    }

    /// First untested partner of line `i`.
    #[must_use]
    pub fn first_untested_in_row(&self, i: usize) -> Option<usize> {
        (i + 1..self.n).find(|&j| !self.get(i, j))
    }

    /// First untested pair in row-major order.
    #[must_use]
    pub fn first_untested(&self) -> Option<(usize, usize)> {
        (0..self.n).find_map(|i| self.first_untested_in_row(i).map(|j| (i, j)))
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.first_untested().is_none()
    }

    /// Number of meaningful (`j > i`) entries.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.n * self.n.saturating_sub(1) / 2
    }

    #[must_use]
    pub fn completed_pairs(&self) -> usize {
        (0..self.n)
            .map(|i| (i + 1..self.n).filter(|&j| self.get(i, j)).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_triangle_starts_done() {
        let m = CompletionMatrix::new(3);
        assert!(m.get(0, 0) && m.get(2, 1));
        assert!(!m.get(0, 1) && !m.get(1, 2));
        assert_eq!(m.pair_count(), 3);
        assert_eq!(m.completed_pairs(), 0);
        assert_eq!(m.first_untested(), Some((0, 1)));
    }

    #[test]
    fn completes_in_row_major_order() {
        let mut m = CompletionMatrix::new(3);
        m.complete_row(0);
        assert_eq!(m.first_untested(), Some((1, 2)));
        assert_eq!(m.first_untested_in_row(0), None);
        m.set(1, 2);
        assert!(m.is_complete());
        assert_eq!(m.completed_pairs(), 3);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut m = CompletionMatrix::new(2);
        m.set(5, 7);
        assert!(m.get(5, 7));
        assert!(!m.is_complete());
        assert!(CompletionMatrix::new(0).is_complete());
        assert!(CompletionMatrix::new(1).is_complete());
    }
}
