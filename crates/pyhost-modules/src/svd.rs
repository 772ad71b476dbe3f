//! Singular value decomposition
//!
//! One-sided Jacobi (Hestenes) rotations on the columns of a tall matrix.
//! Wide matrices are decomposed through their transpose. Singular values
//! come back in descending order; left and right bases are completed to
//! full orthonormal sets when requested.

use pyhost_bridge::Matrix;

const MAX_SWEEPS: usize = 60;

/// Columns whose norm falls below this are treated as null
const NULL_TOLERANCE: f64 = 1e-300;

/// `A = U · diag(S) · Vt`
#[derive(Debug, Clone, PartialEq)]
pub struct Svd {
    /// Left singular vectors, `m×m` (full) or `m×k` (reduced)
    pub u: Matrix,
    /// Singular values, descending, `k = min(m, n)` of them
    pub s: Vec<f64>,
    /// Right singular vectors transposed, `n×n` (full) or `k×n` (reduced)
    pub vt: Matrix,
}

impl Svd {
    /// Largest singular value
    pub fn max(&self) -> f64 {
        self.s.first().copied().unwrap_or(0.0)
    }

    /// Smallest singular value
    pub fn min(&self) -> f64 {
        self.s.last().copied().unwrap_or(0.0)
    }

    /// `U[:, :rank] · diag(S[:rank]) · Vt[:rank, :]`
    pub fn reconstruct(&self, rank: usize) -> Matrix {
        let m = self.u.rows();
        let n = self.vt.cols();
        let rank = rank.min(self.s.len());
        let mut out = Matrix::zeros(m, n);
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0;
                for (k, sigma) in self.s.iter().enumerate().take(rank) {
                    acc += self.u.row(i)[k] * sigma * self.vt.row(k)[j];
                }
                out.set(i, j, acc);
            }
        }
        out
    }
}

/// Decompose `a`. The matrix must be non-empty.
pub fn decompose(a: &Matrix, full_matrices: bool) -> Svd {
    if a.rows() >= a.cols() {
        decompose_tall(a, full_matrices)
    } else {
        // A^T = U' S V'^T  =>  A = V' S U'^T
        let t = decompose_tall(&a.transpose(), full_matrices);
        Svd {
            u: t.vt.transpose(),
            s: t.s,
            vt: t.u.transpose(),
        }
    }
}

fn decompose_tall(a: &Matrix, full_matrices: bool) -> Svd {
    let m = a.rows();
    let n = a.cols();

    let mut cols: Vec<Vec<f64>> = (0..n).map(|j| (0..m).map(|i| a.row(i)[j]).collect()).collect();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|j| (0..n).map(|i| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for _ in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n {
            for q in (p + 1)..n {
                let alpha = dot(&cols[p], &cols[p]);
                let beta = dot(&cols[q], &cols[q]);
                let gamma = dot(&cols[p], &cols[q]);
                if gamma == 0.0 || gamma.abs() <= f64::EPSILON * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                rotate(&mut cols, p, q, c, s);
                rotate(&mut v, p, q, c, s);
            }
        }
        if !rotated {
            break;
        }
    }

    let mut order: Vec<(f64, usize)> = cols.iter().enumerate().map(|(j, c)| (norm(c), j)).collect();
    order.sort_by(|a, b| b.0.total_cmp(&a.0));

    let s: Vec<f64> = order.iter().map(|(sigma, _)| *sigma).collect();
    // Directions of numerically null columns are noise; rebuild them instead
    let cutoff = (s.first().copied().unwrap_or(0.0) * m as f64 * f64::EPSILON).max(NULL_TOLERANCE);
    let mut u_cols: Vec<Vec<f64>> = order
        .iter()
        .map(|&(sigma, j)| {
            if sigma > cutoff {
                cols[j].iter().map(|x| x / sigma).collect()
            } else {
                Vec::new()
            }
        })
        .collect();
    let v_cols: Vec<Vec<f64>> = order.iter().map(|&(_, j)| v[j].clone()).collect();

    let u_width = if full_matrices { m } else { n };
    u_cols.resize(u_width, Vec::new());
    complete_basis(&mut u_cols, m);

    Svd {
        u: from_columns(&u_cols, m),
        s,
        vt: from_columns(&v_cols, n).transpose(),
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn rotate(cols: &mut [Vec<f64>], p: usize, q: usize, c: f64, s: f64) {
    for i in 0..cols[p].len() {
        let xp = cols[p][i];
        let xq = cols[q][i];
        cols[p][i] = c * xp - s * xq;
        cols[q][i] = s * xp + c * xq;
    }
}

/// Fill empty columns with unit vectors orthogonal to all others.
fn complete_basis(cols: &mut [Vec<f64>], dim: usize) {
    let mut candidate = 0;
    for j in 0..cols.len() {
        if !cols[j].is_empty() {
            continue;
        }
        while candidate < dim {
            let mut e = vec![0.0; dim];
            e[candidate] = 1.0;
            candidate += 1;
            // Two passes of Gram-Schmidt
            for _ in 0..2 {
                for other in cols.iter().filter(|c| !c.is_empty()) {
                    let proj = dot(&e, other);
                    for (x, o) in e.iter_mut().zip(other) {
                        *x -= proj * o;
                    }
                }
            }
            let len = norm(&e);
            if len > 1e-8 {
                cols[j] = e.into_iter().map(|x| x / len).collect();
                break;
            }
        }
    }
}

fn from_columns(cols: &[Vec<f64>], rows: usize) -> Matrix {
    let mut out = Matrix::zeros(rows, cols.len());
    for (j, col) in cols.iter().enumerate() {
        for (i, x) in col.iter().enumerate() {
            out.set(i, j, *x);
        }
    }
    out
}
