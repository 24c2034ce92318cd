//! Neighbour search: a reference brute-force search and an accelerated
//! cell-linked-list search that must produce identical neighbour sets.
//!
//! The cell list uses intrusive singly-linked chains (`head`/`next` index
//! arrays, sentinel `-1`) rather than a sorted/bucketed structure — cheap to
//! rebuild every step since particles move a fraction of a cell per
//! time-step.

use crate::error::{MpsError, MpsResult};
use crate::particle::{Kind, ParticleSystem};
use crate::vector::Vector;

/// Flat neighbour index: a `[count * max_neighbours]` buffer plus a
/// per-particle occupancy count. Ghost particles and particles beyond `re`
/// are never listed.
pub struct NeighbourList {
    max_neighbours: usize,
    indices: Vec<u32>,
    counts: Vec<u32>,
}

impl NeighbourList {
    pub fn new(capacity: usize, max_neighbours: usize) -> Self {
        Self {
            max_neighbours,
            indices: vec![0; capacity * max_neighbours],
            counts: vec![0; capacity],
        }
    }

    pub fn max_neighbours(&self) -> usize {
        self.max_neighbours
    }

    pub fn neighbours(&self, i: usize) -> &[u32] {
        let start = i * self.max_neighbours;
        let n = self.counts[i] as usize;
        &self.indices[start..start + n]
    }

    pub fn count(&self, i: usize) -> usize {
        self.counts[i] as usize
    }

    fn clear(&mut self) {
        for c in self.counts.iter_mut() {
            *c = 0;
        }
    }

    fn push(&mut self, i: usize, j: usize) -> MpsResult<()> {
        let found = self.counts[i] as usize;
        if found >= self.max_neighbours {
            return Err(MpsError::CapacityExceeded {
                particle: i,
                found: found + 1,
                max: self.max_neighbours,
            });
        }
        self.indices[i * self.max_neighbours + found] = j as u32;
        self.counts[i] = (found + 1) as u32;
        Ok(())
    }
}

/// Reference O(N^2) neighbour search. Used both directly (small systems) and
/// as the ground truth that `neighbor_search_cell_linked_list` is checked
/// against in tests.
pub fn neighbor_search_brute_force<V: Vector>(
    system: &ParticleSystem<V>,
    re: f64,
    max_neighbours: usize,
) -> MpsResult<NeighbourList> {
    let n = system.count();
    let mut list = NeighbourList::new(n, max_neighbours);
    list.clear();

    for i in 0..n {
        if system.kind[i] == Kind::Ghost {
            continue;
        }
        for j in 0..n {
            if i == j || system.kind[j] == Kind::Ghost {
                continue;
            }
            let r2 = (system.position[j] - system.position[i]).length_squared();
            if r2 < re * re {
                list.push(i, j)?;
            }
        }
    }
    Ok(list)
}

/// Uniform grid over the domain, cell size `re`, with one intrusive
/// singly-linked particle chain per cell (`head[cell]` is the first particle
/// index or `-1`, `next[i]` is the next particle in `i`'s cell or `-1`).
///
/// Sized with a `4*re` margin beyond the nominal domain bounds, following the
/// original's allowance for particles that briefly push past the declared
/// domain before `boundary::remove_out_of_bounds` retires them.
pub struct CellList<V: Vector> {
    origin: V,
    cell_size: f64,
    dims: [usize; 3],
    head: Vec<i32>,
    next: Vec<i32>,
}

impl<V: Vector> CellList<V> {
    pub fn new(domain_min: V, domain_max: V, re: f64, capacity: usize) -> Self {
        let margin = 4.0 * re;
        let mut dims = [1usize; 3];
        let origin = domain_min - V::splat(margin);
        for axis in 0..V::DIM {
            let span = domain_max.get(axis) - domain_min.get(axis) + 2.0 * margin;
            dims[axis] = ((span / re).ceil() as usize + 2).max(1);
        }
        let n_cells = dims[0] * dims[1] * dims[2];
        Self {
            origin,
            cell_size: re,
            dims,
            head: vec![-1; n_cells],
            next: vec![-1; capacity],
        }
    }

    fn coords(&self, pos: V) -> [i32; 3] {
        let mut c = [0i32; 3];
        for axis in 0..V::DIM {
            let rel = pos.get(axis) - self.origin.get(axis);
            c[axis] = (rel / self.cell_size).floor() as i32;
        }
        c
    }

    fn linear_index(&self, c: [i32; 3]) -> Option<usize> {
        let mut idx = 0usize;
        let mut stride = 1usize;
        for axis in 0..3 {
            if c[axis] < 0 || c[axis] as usize >= self.dims[axis] {
                return None;
            }
            idx += c[axis] as usize * stride;
            stride *= self.dims[axis];
        }
        Some(idx)
    }

    /// Rebuild the chains from scratch. Ghost particles are excluded so they
    /// never appear in a subsequent query.
    pub fn build(&mut self, system: &ParticleSystem<V>) {
        for h in self.head.iter_mut() {
            *h = -1;
        }
        if self.next.len() < system.count() {
            self.next.resize(system.count(), -1);
        }
        for i in 0..system.count() {
            self.next[i] = -1;
            if system.kind[i] == Kind::Ghost {
                continue;
            }
            let c = self.coords(system.position[i]);
            let cell = self
                .linear_index(c)
                .expect("particle outside cell list bounds; domain/margin too small");
            self.next[i] = self.head[cell];
            self.head[cell] = i as i32;
        }
    }

    /// Invoke `visit` for every particle sharing the 3x3 (2D) or 3x3x3 (3D)
    /// neighbourhood of `pos`'s cell, including `pos`'s own cell.
    pub fn for_each_in_neighbourhood<F: FnMut(usize)>(&self, pos: V, mut visit: F) {
        let c = self.coords(pos);
        let z_range = if V::DIM == 3 { -1..=1 } else { 0..=0 };
        for dz in z_range {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let neighbour = [c[0] + dx, c[1] + dy, c[2] + dz];
                    if let Some(cell) = self.linear_index(neighbour) {
                        let mut j = self.head[cell];
                        while j >= 0 {
                            visit(j as usize);
                            j = self.next[j as usize];
                        }
                    }
                }
            }
        }
    }
}

/// Accelerated neighbour search via a prebuilt `CellList`. Produces the same
/// neighbour sets as `neighbor_search_brute_force` for the same `re`.
pub fn neighbor_search_cell_linked_list<V: Vector>(
    system: &ParticleSystem<V>,
    cells: &CellList<V>,
    re: f64,
    max_neighbours: usize,
) -> MpsResult<NeighbourList> {
    let n = system.count();
    let mut list = NeighbourList::new(n, max_neighbours);
    list.clear();

    for i in 0..n {
        if system.kind[i] == Kind::Ghost {
            continue;
        }
        let pos_i = system.position[i];
        let mut err = None;
        cells.for_each_in_neighbourhood(pos_i, |j| {
            if err.is_some() || j == i {
                return;
            }
            let r2 = (system.position[j] - pos_i).length_squared();
            if r2 < re * re {
                if let Err(e) = list.push(i, j) {
                    err = Some(e);
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
    }
    Ok(list)
}
