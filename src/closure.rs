// SPDX-License-Identifier: BSD-3-Clause
//! Transitive closure over signature indices. Each relation is kept both as
//! a boolean matrix (for membership tests) and as an adjacency list (for
//! iteration); closing iterates until no new edge appears, so running it
//! again is a no-op.

#[derive(Clone, Debug, Default)]
pub struct Relation {
    mat: Vec<Vec<bool>>,
    list: Vec<Vec<u32>>,
}

impl Relation {
    pub fn new() -> Self {
        Relation::default()
    }

    pub fn len(&self) -> usize {
        self.mat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mat.is_empty()
    }

    pub fn grow(&mut self, n: usize) {
        if n <= self.mat.len() {
            return;
        }
        for row in &mut self.mat {
            row.resize(n, false);
        }
        self.mat.resize_with(n, || vec![false; n]);
        self.list.resize_with(n, Vec::new);
    }

    pub fn add(&mut self, i: u32, j: u32) {
        let n = (i.max(j) as usize) + 1;
        self.grow(n);
        if !self.mat[i as usize][j as usize] {
            self.mat[i as usize][j as usize] = true;
            self.list[i as usize].push(j);
        }
    }

    pub fn contains(&self, i: u32, j: u32) -> bool {
        self.mat
            .get(i as usize)
            .map(|row| row.get(j as usize).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn edges_from(&self, i: u32) -> &[u32] {
        self.list
            .get(i as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Adds `(i, k)` whenever `(i, j)` and `(j, k)` hold, to a fixed point.
    pub fn close(&mut self) {
        let n = self.len();
        let mut added = true;
        while added {
            added = false;
            for i in 0..n {
                let mut jidx = 0;
                while jidx < self.list[i].len() {
                    let j = self.list[i][jidx] as usize;
                    jidx += 1;
                    if i == j {
                        continue;
                    }
                    let mut kidx = 0;
                    while kidx < self.list[j].len() {
                        let k = self.list[j][kidx] as usize;
                        kidx += 1;
                        if j == k {
                            continue;
                        }
                        if !self.mat[i][k] {
                            self.mat[i][k] = true;
                            self.list[i].push(k as u32);
                            added = true;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Relation;

    #[test]
    fn closes_chains() {
        let mut r = Relation::new();
        r.add(0, 1);
        r.add(1, 2);
        r.add(2, 3);
        r.close();
        assert!(r.contains(0, 2));
        assert!(r.contains(0, 3));
        assert!(r.contains(1, 3));
        assert!(!r.contains(3, 0));
    }

    #[test]
    fn closure_is_idempotent() {
        let mut r = Relation::new();
        r.add(0, 1);
        r.add(1, 0);
        r.add(1, 2);
        r.close();
        let edges: Vec<Vec<u32>> = (0..r.len() as u32)
            .map(|i| {
                let mut e = r.edges_from(i).to_vec();
                e.sort_unstable();
                e
            })
            .collect();
        r.close();
        let again: Vec<Vec<u32>> = (0..r.len() as u32)
            .map(|i| {
                let mut e = r.edges_from(i).to_vec();
                e.sort_unstable();
                e
            })
            .collect();
        assert_eq!(edges, again);
    }

    #[test]
    fn cycles_terminate() {
        let mut r = Relation::new();
        r.add(0, 1);
        r.add(1, 0);
        r.close();
        assert!(r.contains(0, 0));
        assert!(r.contains(1, 1));
    }
}
