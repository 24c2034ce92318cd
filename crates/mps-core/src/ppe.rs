//! The pressure Poisson equation (PPE): sparse SPD system assembly and two
//! solvers, plain conjugate gradient and IC(0)-preconditioned CG (ICCG).
//!
//! The original assembles a dense `n x n` array sized to the whole particle
//! count. That's wasteful once particle counts grow past a few thousand —
//! the system is symmetric and only interior (non-surface) fluid particles
//! are unknowns, with at most `max_neighbours` nonzeros per row. Row-major
//! sparse storage (`rows: Vec<Vec<(u32, f64)>>` plus a separate `diag`)
//! keeps `y <- A*x` linear in nonzero count and is the natural fit for an
//! incomplete factorization that must preserve `A`'s sparsity pattern
//! exactly — no intermediate dense buffer for the factorization to fill in.

use crate::kernel::kernel_weight;
use crate::neighbors::NeighbourList;
use crate::particle::{Kind, ParticleSystem};
use crate::vector::Vector;

/// Symmetric sparse matrix: `diag[i]` is `A[i][i]`; `rows[i]` holds every
/// off-diagonal nonzero `(j, A[i][j])` in that row, in ascending `j` order.
/// Symmetry means `rows[i]` containing `(j, v)` implies `rows[j]` contains
/// `(i, v)` — callers build both sides explicitly (see `assemble`), nothing
/// here mirrors automatically.
#[derive(Clone)]
pub struct SparseMatrix {
    pub diag: Vec<f64>,
    pub rows: Vec<Vec<(u32, f64)>>,
}

impl SparseMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            diag: vec![0.0; n],
            rows: vec![Vec::new(); n],
        }
    }

    pub fn len(&self) -> usize {
        self.diag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diag.is_empty()
    }

    fn push(&mut self, i: usize, j: usize, v: f64) {
        self.rows[i].push((j as u32, v));
    }

    fn finish_assembly(&mut self) {
        for row in self.rows.iter_mut() {
            row.sort_unstable_by_key(|&(col, _)| col);
        }
    }

    /// `y <- A * x`.
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        for i in 0..self.len() {
            let mut acc = self.diag[i] * x[i];
            for &(j, v) in &self.rows[i] {
                acc += v * x[j as usize];
            }
            y[i] = acc;
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Maps every interior (non-surface) fluid particle to a `0..n_eq` equation
/// index; every other particle maps to `None` and is treated as a Dirichlet
/// boundary held at its current pressure (zero for a free surface, by
/// `boundary::apply_surface_pressure`'s convention).
pub struct EquationMap {
    pub eq_of_particle: Vec<Option<u32>>,
    pub particle_of_eq: Vec<usize>,
}

/// Assemble the PPE system for the current particle configuration.
///
/// Uses the same Laplacian model as `operators::viscosity`
/// (`coeff = 2*DIM / (n0*lambda)`), which is the standard MPS choice: the
/// pressure Poisson operator and the velocity Laplacian share one
/// discretization of `sum_j (f_j - f_i) * w(r_ij, re_lap)`.
///
/// `b_i = (density / dt^2) * (n_i - n0) / n0 * relaxation_coeff` — the
/// source term driving the local number density back toward `n0`: a
/// compressed particle (`n_i > n0`) gets a positive source, which the
/// Laplacian operator on the left resolves to positive pressure.
pub fn assemble<V: Vector>(
    system: &ParticleSystem<V>,
    neighbours: &NeighbourList,
    re_lap: f64,
    l0: f64,
    density: f64,
    dt: f64,
    relaxation_coeff: f64,
) -> (SparseMatrix, Vec<f64>, EquationMap) {
    let mut eq_of_particle = vec![None; system.count()];
    let mut particle_of_eq = Vec::new();
    for i in 0..system.count() {
        if system.kind[i] == Kind::Fluid && !system.on_surface[i] {
            eq_of_particle[i] = Some(particle_of_eq.len() as u32);
            particle_of_eq.push(i);
        }
    }
    let n_eq = particle_of_eq.len();

    let coeff = 2.0 * V::DIM as f64 / (system.n0 * system.lambda);
    let mut matrix = SparseMatrix::new(n_eq);
    let mut rhs = vec![0.0; n_eq];

    for ei in 0..n_eq {
        let i = particle_of_eq[ei];
        let pos_i = system.position[i];
        let mut diag_accum = 0.0;
        for &j in neighbours.neighbours(i) {
            let j = j as usize;
            let r = (system.position[j] - pos_i).length();
            let w = kernel_weight(r, re_lap, l0);
            if w <= 0.0 {
                continue;
            }
            diag_accum += w;
            if let Some(ej) = eq_of_particle[j] {
                let ej = ej as usize;
                if ej != ei {
                    matrix.push(ei, ej, -coeff * w);
                }
            }
        }
        matrix.diag[ei] = coeff * diag_accum.max(1.0e-12);
        rhs[ei] =
            (density / (dt * dt)) * (system.n[i] - system.n0) / system.n0 * relaxation_coeff;
    }
    matrix.finish_assembly();

    (
        matrix,
        rhs,
        EquationMap {
            eq_of_particle,
            particle_of_eq,
        },
    )
}

/// Outcome of an iterative solve: whether it converged to `tolerance`
/// within `max_iterations`, and how many iterations it actually ran.
/// A solve that runs out of iterations isn't an error — spec.md treats
/// solver stall as a transient numerical event, not a fatal one — but the
/// caller should count it (`Driver::stalled_steps`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub residual: f64,
    pub converged: bool,
}

/// Plain conjugate gradient, no preconditioner. `x` is both the initial
/// guess (typically the previous step's pressure field) and the output.
pub fn solve_cg(matrix: &SparseMatrix, rhs: &[f64], x: &mut [f64], max_iter: usize, tol: f64) -> SolveReport {
    let n = matrix.len();
    if n == 0 {
        return SolveReport {
            iterations: 0,
            residual: 0.0,
            converged: true,
        };
    }

    let mut ax = vec![0.0; n];
    matrix.matvec(x, &mut ax);
    let mut r: Vec<f64> = rhs.iter().zip(&ax).map(|(b, a)| b - a).collect();
    let mut p = r.clone();
    let mut rs_old = dot(&r, &r);
    let bnorm = dot(rhs, rhs).sqrt().max(1.0e-300);

    if (rs_old.sqrt() / bnorm) < tol {
        return SolveReport {
            iterations: 0,
            residual: rs_old.sqrt(),
            converged: true,
        };
    }

    let mut ap = vec![0.0; n];
    for it in 0..max_iter {
        matrix.matvec(&p, &mut ap);
        let p_ap = dot(&p, &ap);
        if p_ap.abs() < 1.0e-30 {
            log::warn!("CG breakdown at iteration {it}: p.Ap = {p_ap:e}");
            return SolveReport {
                iterations: it,
                residual: rs_old.sqrt(),
                converged: false,
            };
        }
        let alpha = rs_old / p_ap;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * ap[i];
        }
        let rs_new = dot(&r, &r);
        let residual = rs_new.sqrt() / bnorm;
        if residual < tol {
            return SolveReport {
                iterations: it + 1,
                residual: rs_new.sqrt(),
                converged: true,
            };
        }
        let beta = rs_new / rs_old;
        for i in 0..n {
            p[i] = r[i] + beta * p[i];
        }
        rs_old = rs_new;
    }

    log::warn!("CG stalled after {max_iter} iterations, residual ratio {:e}", rs_old.sqrt() / bnorm);
    SolveReport {
        iterations: max_iter,
        residual: rs_old.sqrt(),
        converged: false,
    }
}

/// Incomplete Cholesky factor, `IC(0)`: `A ~= L L^T`, with `L`'s sparsity
/// pattern restricted to `A`'s lower-triangular pattern exactly (no fill-in
/// beyond what `A` already has). `lower[i]` holds `L`'s off-diagonal entries
/// in row `i` (columns `< i`, ascending); `diag[i]` is `L[i][i]`.
pub struct IncompleteCholesky {
    diag: Vec<f64>,
    lower: Vec<Vec<(u32, f64)>>,
    /// Transpose of `lower`, used by the back-substitution pass: `upper[j]`
    /// holds every `(k, L[k][j])` with `k > j`.
    upper: Vec<Vec<(u32, f64)>>,
}

/// Dot product of two columns stored as ascending `(col, val)` pairs,
/// restricted to the overlapping column range.
fn sparse_row_dot(a: &[(u32, f64)], b: &[(u32, f64)]) -> f64 {
    let mut i = 0;
    let mut j = 0;
    let mut acc = 0.0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                acc += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    acc
}

impl IncompleteCholesky {
    /// Factorize. `matrix.rows` must already be sorted ascending by column
    /// (true of anything produced by `assemble`).
    pub fn factorize(matrix: &SparseMatrix) -> Self {
        let n = matrix.len();
        let mut diag = vec![0.0; n];
        let mut lower: Vec<Vec<(u32, f64)>> = vec![Vec::new(); n];

        for i in 0..n {
            let mut row_l: Vec<(u32, f64)> = Vec::new();
            for &(j, a_ij) in matrix.rows[i].iter().filter(|&&(j, _)| (j as usize) < i) {
                let s = sparse_row_dot(&row_l, &lower[j as usize]);
                let l_jj = diag[j as usize];
                let l_ij = if l_jj.abs() > 1.0e-300 {
                    (a_ij - s) / l_jj
                } else {
                    0.0
                };
                row_l.push((j, l_ij));
            }
            let fill: f64 = row_l.iter().map(|&(_, v)| v * v).sum();
            let mut d = matrix.diag[i] - fill;
            if d <= 1.0e-12 {
                // Negative or vanishing pivot: the original falls back to
                // the unmodified diagonal rather than aborting, trading
                // preconditioner quality for robustness on a near-singular
                // local configuration (e.g. a nearly isolated fluid particle).
                d = matrix.diag[i].max(1.0e-12);
            }
            diag[i] = d.sqrt();
            lower[i] = row_l;
        }

        let mut upper: Vec<Vec<(u32, f64)>> = vec![Vec::new(); n];
        for i in 0..n {
            for &(j, v) in &lower[i] {
                upper[j as usize].push((i as u32, v));
            }
        }

        Self { diag, lower, upper }
    }

    /// Solve `M z = r` where `M = L L^T`, via forward then back substitution.
    pub fn solve(&self, r: &[f64], z: &mut [f64]) {
        let n = self.diag.len();
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut s = r[i];
            for &(j, l_ij) in &self.lower[i] {
                s -= l_ij * y[j as usize];
            }
            y[i] = s / self.diag[i];
        }
        for i in (0..n).rev() {
            let mut s = y[i];
            for &(k, l_ki) in &self.upper[i] {
                s -= l_ki * z[k as usize];
            }
            z[i] = s / self.diag[i];
        }
    }
}

/// IC(0)-preconditioned conjugate gradient.
pub fn solve_iccg(
    matrix: &SparseMatrix,
    preconditioner: &IncompleteCholesky,
    rhs: &[f64],
    x: &mut [f64],
    max_iter: usize,
    tol: f64,
) -> SolveReport {
    let n = matrix.len();
    if n == 0 {
        return SolveReport {
            iterations: 0,
            residual: 0.0,
            converged: true,
        };
    }

    let mut ax = vec![0.0; n];
    matrix.matvec(x, &mut ax);
    let mut r: Vec<f64> = rhs.iter().zip(&ax).map(|(b, a)| b - a).collect();
    let bnorm = dot(rhs, rhs).sqrt().max(1.0e-300);

    let mut z = vec![0.0; n];
    preconditioner.solve(&r, &mut z);
    let mut p = z.clone();
    let mut rz_old = dot(&r, &z);

    if (dot(&r, &r).sqrt() / bnorm) < tol {
        return SolveReport {
            iterations: 0,
            residual: dot(&r, &r).sqrt(),
            converged: true,
        };
    }

    let mut ap = vec![0.0; n];
    for it in 0..max_iter {
        matrix.matvec(&p, &mut ap);
        let p_ap = dot(&p, &ap);
        if p_ap.abs() < 1.0e-30 {
            log::warn!("ICCG breakdown at iteration {it}: p.Ap = {p_ap:e}");
            return SolveReport {
                iterations: it,
                residual: dot(&r, &r).sqrt(),
                converged: false,
            };
        }
        let alpha = rz_old / p_ap;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * ap[i];
        }
        let r_norm = dot(&r, &r).sqrt();
        if r_norm / bnorm < tol {
            return SolveReport {
                iterations: it + 1,
                residual: r_norm,
                converged: true,
            };
        }
        preconditioner.solve(&r, &mut z);
        let rz_new = dot(&r, &z);
        let beta = rz_new / rz_old;
        for i in 0..n {
            p[i] = z[i] + beta * p[i];
        }
        rz_old = rz_new;
    }

    log::warn!("ICCG stalled after {max_iter} iterations");
    SolveReport {
        iterations: max_iter,
        residual: dot(&r, &r).sqrt(),
        converged: false,
    }
}

/// Scatter solved equation pressures back into the particle system, leaving
/// surface/wall/ghost particles untouched (callers typically follow with
/// `boundary::apply_surface_pressure`). If `clamp_negative` is set, negative
/// pressures are floored to zero — common practice to suppress the
/// spurious tensile forces a slightly negative solved pressure would cause.
pub fn scatter_pressure<V: Vector>(
    system: &mut ParticleSystem<V>,
    map: &EquationMap,
    x: &[f64],
    clamp_negative: bool,
) {
    for (ei, &i) in map.particle_of_eq.iter().enumerate() {
        let mut p = x[ei];
        if clamp_negative && p < 0.0 {
            p = 0.0;
        }
        system.pressure[i] = p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1D chain A = tridiag(-1, 2, -1), n=5 — a simple, well-known SPD system.
    fn chain_matrix(n: usize) -> SparseMatrix {
        let mut m = SparseMatrix::new(n);
        for i in 0..n {
            m.diag[i] = 2.0;
            if i > 0 {
                m.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                m.push(i, i + 1, -1.0);
            }
        }
        m.finish_assembly();
        m
    }

    #[test]
    fn cg_solves_tridiagonal_system() {
        let m = chain_matrix(5);
        let rhs = vec![1.0; 5];
        let mut x = vec![0.0; 5];
        let report = solve_cg(&m, &rhs, &mut x, 100, 1e-10);
        assert!(report.converged);

        let mut check = vec![0.0; 5];
        m.matvec(&x, &mut check);
        for i in 0..5 {
            assert!((check[i] - rhs[i]).abs() < 1e-8, "row {i}: {} vs {}", check[i], rhs[i]);
        }
    }

    #[test]
    fn iccg_agrees_with_cg() {
        let m = chain_matrix(9);
        let rhs: Vec<f64> = (0..9).map(|i| (i as f64 + 1.0).sin()).collect();

        let mut x_cg = vec![0.0; 9];
        solve_cg(&m, &rhs, &mut x_cg, 500, 1e-12);

        let pre = IncompleteCholesky::factorize(&m);
        let mut x_iccg = vec![0.0; 9];
        let report = solve_iccg(&m, &pre, &rhs, &mut x_iccg, 500, 1e-12);
        assert!(report.converged);

        for i in 0..9 {
            assert!((x_cg[i] - x_iccg[i]).abs() < 1e-6, "index {i}: {} vs {}", x_cg[i], x_iccg[i]);
        }
    }

    #[test]
    fn iccg_converges_in_fewer_or_equal_iterations_than_cg() {
        let m = chain_matrix(20);
        let rhs: Vec<f64> = (0..20).map(|i| ((i * 3 + 1) as f64).cos()).collect();

        let mut x_cg = vec![0.0; 20];
        let cg_report = solve_cg(&m, &rhs, &mut x_cg, 1000, 1e-10);

        let pre = IncompleteCholesky::factorize(&m);
        let mut x_iccg = vec![0.0; 20];
        let iccg_report = solve_iccg(&m, &pre, &rhs, &mut x_iccg, 1000, 1e-10);

        assert!(cg_report.converged);
        assert!(iccg_report.converged);
        assert!(iccg_report.iterations <= cg_report.iterations);
    }

    #[test]
    fn empty_system_solves_trivially() {
        let m = SparseMatrix::new(0);
        let rhs: Vec<f64> = vec![];
        let mut x: Vec<f64> = vec![];
        let report = solve_cg(&m, &rhs, &mut x, 10, 1e-8);
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
    }

    /// A square fluid block ringed by wall particles, two particle layers
    /// thick on every side so the block's interior is free of surface
    /// particles. Assembling against this real geometry (rather than a
    /// hand-written tridiagonal matrix) exercises `assemble`'s own symmetry
    /// and diagonal-dominance properties (spec.md section 8).
    fn walled_block(n_interior: i32, l0: f64) -> crate::particle::ParticleSystem<glam::DVec2> {
        use crate::particle::Kind;
        let pad = 2;
        let total = n_interior + 2 * pad;
        let capacity = (total * total) as usize;
        let mut ps = crate::particle::ParticleSystem::new(capacity);
        for iy in 0..total {
            for ix in 0..total {
                let pos = glam::DVec2::new(ix as f64 * l0, iy as f64 * l0);
                let is_wall = ix < pad || iy < pad || ix >= total - pad || iy >= total - pad;
                let kind = if is_wall { Kind::Wall } else { Kind::Fluid };
                ps.add(pos, glam::DVec2::ZERO, kind).unwrap();
            }
        }
        ps
    }

    #[test]
    fn assemble_produces_symmetric_diagonally_dominant_matrix_on_real_geometry() {
        let l0 = 0.02;
        let re = 2.1 * l0;
        let mut ps = walled_block(6, l0);
        ps.calc_initial_params(re, re, l0, false).unwrap();

        let neighbours =
            crate::neighbors::neighbor_search_brute_force(&ps, re, 32).unwrap();
        crate::operators::number_density(&mut ps, &neighbours, re, l0);
        crate::operators::detect_free_surface(
            &mut ps,
            crate::particle::SurfaceDetection::Density { threshold: 0.97 },
        );

        let (matrix, rhs, map) = assemble(&ps, &neighbours, re, l0, 1000.0, 1.0e-3, 1.0);
        assert!(!map.particle_of_eq.is_empty(), "block interior should yield equations");

        // Every off-diagonal nonzero (ei, ej, v) must have a matching (ej, ei, v)
        // in the transpose row — `assemble` builds both sides independently by
        // walking each equation's own neighbour list.
        for ei in 0..matrix.len() {
            for &(ej, v) in &matrix.rows[ei] {
                let ej = ej as usize;
                let mirrored = matrix.rows[ej]
                    .iter()
                    .find(|&&(k, _)| k as usize == ei)
                    .map(|&(_, v)| v);
                assert_eq!(mirrored, Some(v), "row {ei} col {ej} has no symmetric counterpart");
            }
        }

        // Diagonal dominance: |A[i][i]| >= sum_j |A[i][j]| for every row, since
        // the off-diagonal weights and the diagonal both derive from the same
        // non-negative kernel sum.
        for ei in 0..matrix.len() {
            let off_sum: f64 = matrix.rows[ei].iter().map(|&(_, v)| v.abs()).sum();
            assert!(
                matrix.diag[ei] >= off_sum - 1.0e-8,
                "row {ei}: diag {} < off-diagonal sum {off_sum}",
                matrix.diag[ei]
            );
        }

        let mut x = vec![0.0; matrix.len()];
        let cg_report = solve_cg(&matrix, &rhs, &mut x, 2000, 1e-10);
        assert!(cg_report.converged, "CG failed to converge: {cg_report:?}");

        let mut check = vec![0.0; matrix.len()];
        matrix.matvec(&x, &mut check);
        for i in 0..matrix.len() {
            assert!(
                (check[i] - rhs[i]).abs() < 1e-6,
                "row {i}: {} vs {}",
                check[i],
                rhs[i]
            );
        }

        let pre = IncompleteCholesky::factorize(&matrix);
        let mut x_iccg = vec![0.0; matrix.len()];
        let iccg_report = solve_iccg(&matrix, &pre, &rhs, &mut x_iccg, 2000, 1e-10);
        assert!(iccg_report.converged, "ICCG failed to converge: {iccg_report:?}");
        assert!(iccg_report.iterations <= cg_report.iterations);
    }
}
