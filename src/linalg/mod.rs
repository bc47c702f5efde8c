//! Dense linear-algebra kernels for the spectral learner.
//!
//! Small, self-contained routines tuned for the sizes this pipeline actually
//! sees (snapshot windows of a few hundred columns, reduced operators of rank
//! ≤ ~100): a complex scalar, a cyclic Jacobi eigensolver for symmetric
//! matrices, a truncated SVD by the method of snapshots, and a shifted
//! complex QR iteration for the reduced operator's eigendecomposition.
//!
//! Everything computes in f64 internally; [`Complex32`] is the compact form
//! used in mode records and bus payloads.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Iteration budgets. Non-convergence surfaces as [`NonConvergence`] and is
/// handled by the caller (the learner counts it toward degradation).
const JACOBI_MAX_SWEEPS: usize = 64;
const QR_MAX_ITERS_PER_EIGENVALUE: usize = 64;

/// A numeric routine exceeded its iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonConvergence {
    /// Which routine gave up.
    pub stage: &'static str,
}

impl std::fmt::Display for NonConvergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} did not converge", self.stage)
    }
}

impl std::error::Error for NonConvergence {}

// ---------------------------------------------------------------------------
// Complex scalars
// ---------------------------------------------------------------------------

/// Compact complex scalar for persisted modes and bus payloads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Complex32 {
    pub re: f32,
    pub im: f32,
}

impl Complex32 {
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    /// Magnitude |z|.
    pub fn abs(self) -> f32 {
        (self.re * self.re + self.im * self.im).sqrt()
    }

    /// Distance |a − b|, used for eigenvalue-proximity merging.
    pub fn dist(self, other: Self) -> f32 {
        Complex32::new(self.re - other.re, self.im - other.im).abs()
    }
}

impl std::fmt::Display for Complex32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.im >= 0.0 {
            write!(f, "{:.4}+{:.4}i", self.re, self.im)
        } else {
            write!(f, "{:.4}-{:.4}i", self.re, -self.im)
        }
    }
}

/// Working-precision complex scalar.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct C64 {
    pub re: f64,
    pub im: f64,
}

impl C64 {
    pub const ZERO: C64 = C64 { re: 0.0, im: 0.0 };
    pub const ONE: C64 = C64 { re: 1.0, im: 0.0 };

    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn real(re: f64) -> Self {
        Self { re, im: 0.0 }
    }

    pub fn conj(self) -> Self {
        Self::new(self.re, -self.im)
    }

    pub fn abs(self) -> f64 {
        self.re.hypot(self.im)
    }

    /// Principal square root via polar form.
    pub fn sqrt(self) -> Self {
        let r = self.abs();
        if r == 0.0 {
            return C64::ZERO;
        }
        let theta = self.im.atan2(self.re) / 2.0;
        let root = r.sqrt();
        Self::new(root * theta.cos(), root * theta.sin())
    }

    pub fn to_c32(self) -> Complex32 {
        Complex32::new(self.re as f32, self.im as f32)
    }
}

impl std::ops::Add for C64 {
    type Output = C64;
    fn add(self, rhs: C64) -> C64 {
        C64::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl std::ops::Sub for C64 {
    type Output = C64;
    fn sub(self, rhs: C64) -> C64 {
        C64::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl std::ops::Mul for C64 {
    type Output = C64;
    fn mul(self, rhs: C64) -> C64 {
        C64::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl std::ops::Div for C64 {
    type Output = C64;
    fn div(self, rhs: C64) -> C64 {
        // Smith's algorithm avoids overflow for extreme magnitudes.
        if rhs.re.abs() >= rhs.im.abs() {
            let r = rhs.im / rhs.re;
            let d = rhs.re + rhs.im * r;
            C64::new((self.re + self.im * r) / d, (self.im - self.re * r) / d)
        } else {
            let r = rhs.re / rhs.im;
            let d = rhs.re * r + rhs.im;
            C64::new((self.re * r + self.im) / d, (self.im * r - self.re) / d)
        }
    }
}

impl std::ops::Neg for C64 {
    type Output = C64;
    fn neg(self) -> C64 {
        C64::new(-self.re, -self.im)
    }
}

impl std::ops::Mul<f64> for C64 {
    type Output = C64;
    fn mul(self, rhs: f64) -> C64 {
        C64::new(self.re * rhs, self.im * rhs)
    }
}

// ---------------------------------------------------------------------------
// Dense real matrices
// ---------------------------------------------------------------------------

/// Dense row-major f64 matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct DMat {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl DMat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    /// Build from column vectors, which must all share a length.
    pub fn from_columns(columns: &[Vec<f64>]) -> Self {
        let cols = columns.len();
        let rows = columns.first().map(|c| c.len()).unwrap_or(0);
        let mut m = Self::zeros(rows, cols);
        for (j, col) in columns.iter().enumerate() {
            debug_assert_eq!(col.len(), rows);
            for (i, &v) in col.iter().enumerate() {
                m.set(i, j, v);
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    pub fn column(&self, c: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, c)).collect()
    }

    pub fn transpose(&self) -> DMat {
        let mut t = DMat::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                t.set(c, r, self.get(r, c));
            }
        }
        t
    }

    /// Matrix product, parallelized over output rows.
    pub fn matmul(&self, other: &DMat) -> DMat {
        debug_assert_eq!(self.cols, other.rows);
        let rows = self.rows;
        let cols = other.cols;
        let inner = self.cols;
        let mut out = vec![0.0f64; rows * cols];
        out.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
            for k in 0..inner {
                let a = self.data[r * inner + k];
                if a == 0.0 {
                    continue;
                }
                let other_row = &other.data[k * cols..(k + 1) * cols];
                for (o, &b) in row.iter_mut().zip(other_row) {
                    *o += a * b;
                }
            }
        });
        DMat {
            rows,
            cols,
            data: out,
        }
    }

    /// `self * v` for a column vector.
    pub fn matvec(&self, v: &[f64]) -> Vec<f64> {
        debug_assert_eq!(self.cols, v.len());
        (0..self.rows)
            .map(|r| {
                let row = &self.data[r * self.cols..(r + 1) * self.cols];
                row.iter().zip(v).map(|(a, b)| a * b).sum()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Symmetric eigendecomposition (cyclic Jacobi)
// ---------------------------------------------------------------------------

/// Eigendecomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns `(eigenvalues, eigenvectors)` sorted by descending eigenvalue;
/// eigenvectors are the columns of the returned matrix.
pub fn sym_eig(a: &DMat) -> Result<(Vec<f64>, DMat), NonConvergence> {
    debug_assert_eq!(a.rows(), a.cols());
    let n = a.rows();
    if n == 0 {
        return Ok((Vec::new(), DMat::zeros(0, 0)));
    }
    let mut a = a.clone();
    let mut v = DMat::identity(n);

    let frobenius: f64 = (0..n)
        .flat_map(|r| (0..n).map(move |c| (r, c)))
        .map(|(r, c)| a.get(r, c) * a.get(r, c))
        .sum::<f64>()
        .sqrt();
    let tol = 1e-14 * frobenius.max(1.0);

    for _sweep in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0f64;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a.get(p, q) * a.get(p, q);
            }
        }
        if off.sqrt() <= tol {
            let mut pairs: Vec<(f64, usize)> =
                (0..n).map(|i| (a.get(i, i), i)).collect();
            pairs.sort_by(|x, y| y.0.partial_cmp(&x.0).unwrap_or(std::cmp::Ordering::Equal));
            let values: Vec<f64> = pairs.iter().map(|(val, _)| *val).collect();
            let mut vectors = DMat::zeros(n, n);
            for (new_col, (_, old_col)) in pairs.iter().enumerate() {
                for r in 0..n {
                    vectors.set(r, new_col, v.get(r, *old_col));
                }
            }
            return Ok((values, vectors));
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a.get(p, q);
                if apq.abs() <= tol / (n as f64) {
                    continue;
                }
                let app = a.get(p, p);
                let aqq = a.get(q, q);
                let theta = (aqq - app) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a.get(k, p);
                    let akq = a.get(k, q);
                    a.set(k, p, c * akp - s * akq);
                    a.set(k, q, s * akp + c * akq);
                }
                for k in 0..n {
                    let apk = a.get(p, k);
                    let aqk = a.get(q, k);
                    a.set(p, k, c * apk - s * aqk);
                    a.set(q, k, s * apk + c * aqk);
                }
                for k in 0..n {
                    let vkp = v.get(k, p);
                    let vkq = v.get(k, q);
                    v.set(k, p, c * vkp - s * vkq);
                    v.set(k, q, s * vkp + c * vkq);
                }
            }
        }
    }
    Err(NonConvergence { stage: "jacobi" })
}

// ---------------------------------------------------------------------------
// Truncated SVD (method of snapshots)
// ---------------------------------------------------------------------------

/// Thin, truncated singular value decomposition `X ≈ U Σ Vᵀ`.
pub struct Svd {
    /// Left singular vectors (columns), `rows(X) × k`.
    pub u: DMat,
    /// Singular values, descending, length `k`.
    pub sigma: Vec<f64>,
    /// Right singular vectors (columns), `cols(X) × k`.
    pub v: DMat,
}

/// Truncated SVD by the method of snapshots: eigendecompose the Gram
/// matrix on the *smaller* side (`XXᵀ` when rows ≤ cols, `XᵀX` otherwise)
/// and lift the other factor through `X`.
///
/// Ranks below `rank` may be returned when trailing singular values are
/// numerically zero.
pub fn truncated_svd(x: &DMat, rank: usize) -> Result<Svd, NonConvergence> {
    let (n, m) = (x.rows(), x.cols());
    if n == 0 || m == 0 {
        return Ok(Svd {
            u: DMat::zeros(n, 0),
            sigma: Vec::new(),
            v: DMat::zeros(m, 0),
        });
    }
    let small = n.min(m);
    let row_side = n <= m;
    let xt = x.transpose();
    let gram = if row_side {
        x.matmul(&xt)
    } else {
        xt.matmul(x)
    };
    let (vals, vecs) = sym_eig(&gram)?;

    let max_val = vals.first().copied().unwrap_or(0.0).max(0.0);
    let cutoff = max_val * 1e-12;
    let k = vals
        .iter()
        .take(rank.min(small))
        .filter(|&&v| v > cutoff)
        .count();

    let mut sigma = Vec::with_capacity(k);
    let mut u_cols = Vec::with_capacity(k);
    let mut v_cols = Vec::with_capacity(k);
    for i in 0..k {
        let s = vals[i].max(0.0).sqrt();
        let g_i = vecs.column(i);
        if row_side {
            // g is a left singular vector; lift v = Xᵀ u / σ.
            let v_i: Vec<f64> = xt.matvec(&g_i).iter().map(|&e| e / s).collect();
            u_cols.push(g_i);
            v_cols.push(v_i);
        } else {
            // g is a right singular vector; lift u = X v / σ.
            let u_i: Vec<f64> = x.matvec(&g_i).iter().map(|&e| e / s).collect();
            u_cols.push(u_i);
            v_cols.push(g_i);
        }
        sigma.push(s);
    }

    Ok(Svd {
        u: if u_cols.is_empty() {
            DMat::zeros(n, 0)
        } else {
            DMat::from_columns(&u_cols)
        },
        sigma,
        v: if v_cols.is_empty() {
            DMat::zeros(m, 0)
        } else {
            DMat::from_columns(&v_cols)
        },
    })
}

// ---------------------------------------------------------------------------
// General (complex) eigendecomposition: shifted QR + inverse iteration
// ---------------------------------------------------------------------------

/// Dense complex matrix, row-major, used only inside the eigensolver.
#[derive(Clone)]
struct CMat {
    n: usize,
    data: Vec<C64>,
}

impl CMat {
    fn from_real(a: &DMat) -> Self {
        let n = a.rows();
        let mut data = Vec::with_capacity(n * n);
        for r in 0..n {
            for c in 0..n {
                data.push(C64::real(a.get(r, c)));
            }
        }
        Self { n, data }
    }

    #[inline]
    fn get(&self, r: usize, c: usize) -> C64 {
        self.data[r * self.n + c]
    }

    #[inline]
    fn set(&mut self, r: usize, c: usize, v: C64) {
        self.data[r * self.n + c] = v;
    }
}

/// Wilkinson shift: the eigenvalue of the trailing 2×2 block closest to the
/// bottom-right entry.
fn wilkinson_shift(h: &CMat, m: usize) -> C64 {
    let a = h.get(m - 2, m - 2);
    let b = h.get(m - 2, m - 1);
    let c = h.get(m - 1, m - 2);
    let d = h.get(m - 1, m - 1);
    let tr = a + d;
    let disc = ((a - d) * (a - d) + b * c * 4.0).sqrt();
    let l1 = (tr + disc) * 0.5;
    let l2 = (tr - disc) * 0.5;
    if (l1 - d).abs() <= (l2 - d).abs() { l1 } else { l2 }
}

/// One shifted QR step on the leading `m × m` submatrix via modified
/// Gram-Schmidt: `H − σI = QR`, `H ← RQ + σI`.
fn qr_step(h: &mut CMat, m: usize, shift: C64) {
    // Columns of H − σI.
    let mut q: Vec<Vec<C64>> = (0..m)
        .map(|j| {
            (0..m)
                .map(|i| {
                    let v = h.get(i, j);
                    if i == j { v - shift } else { v }
                })
                .collect()
        })
        .collect();
    let mut r = vec![vec![C64::ZERO; m]; m];

    for j in 0..m {
        for i in 0..j {
            // r[i][j] = q_i^H · q_j against the partially reduced column.
            let mut dot = C64::ZERO;
            for k in 0..m {
                dot = dot + q[i][k].conj() * q[j][k];
            }
            r[i][j] = dot;
            for k in 0..m {
                let sub = dot * q[i][k];
                q[j][k] = q[j][k] - sub;
            }
        }
        let norm: f64 = q[j].iter().map(|z| z.abs() * z.abs()).sum::<f64>().sqrt();
        if norm > 1e-150 {
            r[j][j] = C64::real(norm);
            for z in q[j].iter_mut() {
                *z = *z * (1.0 / norm);
            }
        } else {
            // A shift equal to an exact eigenvalue makes this column
            // dependent. Substitute any unit vector orthogonal to the
            // previous columns; R keeps a zero diagonal there.
            r[j][j] = C64::ZERO;
            let mut replacement = vec![C64::ZERO; m];
            'basis: for e in 0..m {
                let mut cand = vec![C64::ZERO; m];
                cand[e] = C64::ONE;
                for prev in q.iter().take(j) {
                    let mut dot = C64::ZERO;
                    for k in 0..m {
                        dot = dot + prev[k].conj() * cand[k];
                    }
                    for k in 0..m {
                        let sub = dot * prev[k];
                        cand[k] = cand[k] - sub;
                    }
                }
                let cn: f64 = cand.iter().map(|z| z.abs() * z.abs()).sum::<f64>().sqrt();
                if cn > 1e-6 {
                    for z in cand.iter_mut() {
                        *z = *z * (1.0 / cn);
                    }
                    replacement = cand;
                    break 'basis;
                }
            }
            q[j] = replacement;
        }
    }

    // H ← R Q + σ I  (note q[j] holds column j of Q).
    for i in 0..m {
        for jj in 0..m {
            let mut sum = C64::ZERO;
            for k in i..m {
                sum = sum + r[i][k] * q[jj][k];
            }
            if i == jj {
                sum = sum + shift;
            }
            h.set(i, jj, sum);
        }
    }
}

/// Eigenvalues of a dense real matrix via shifted complex QR iteration with
/// bottom-row deflation. Suited to the small reduced operators the spectral
/// learner produces.
pub fn eigenvalues(a: &DMat) -> Result<Vec<C64>, NonConvergence> {
    debug_assert_eq!(a.rows(), a.cols());
    let n = a.rows();
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut h = CMat::from_real(a);
    let scale: f64 = (0..n)
        .flat_map(|r| (0..n).map(move |c| (r, c)))
        .map(|(r, c)| h.get(r, c).abs())
        .fold(0.0, f64::max)
        .max(1.0);
    let tol = 1e-12 * scale;

    let mut eigs = Vec::with_capacity(n);
    let mut m = n;
    let mut budget = QR_MAX_ITERS_PER_EIGENVALUE * n;

    while m > 0 {
        if m == 1 {
            eigs.push(h.get(0, 0));
            break;
        }
        // Deflate when the bottom row (left of the diagonal) has vanished.
        let off: f64 = (0..m - 1).map(|j| h.get(m - 1, j).abs()).sum();
        if off <= tol {
            eigs.push(h.get(m - 1, m - 1));
            m -= 1;
            continue;
        }
        if budget == 0 {
            return Err(NonConvergence { stage: "qr" });
        }
        budget -= 1;
        let shift = wilkinson_shift(&h, m);
        qr_step(&mut h, m, shift);
    }

    eigs.reverse();
    // Largest-magnitude first: callers keep the dominant modes.
    eigs.sort_by(|a, b| b.abs().partial_cmp(&a.abs()).unwrap_or(std::cmp::Ordering::Equal));
    Ok(eigs)
}

/// Solve `(A − λI) w = b` by complex LU with partial pivoting, in place.
fn solve_shifted(a: &DMat, lambda: C64, b: &mut [C64]) {
    let n = a.rows();
    let mut lu = CMat::from_real(a);
    for i in 0..n {
        let d = lu.get(i, i) - lambda;
        lu.set(i, i, d);
    }
    let mut perm: Vec<usize> = (0..n).collect();

    for k in 0..n {
        // Partial pivot.
        let (pivot_row, pivot_abs) = (k..n)
            .map(|r| (r, lu.get(r, k).abs()))
            .max_by(|x, y| x.1.partial_cmp(&y.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((k, 0.0));
        if pivot_row != k {
            for c in 0..n {
                let tmp = lu.get(k, c);
                lu.set(k, c, lu.get(pivot_row, c));
                lu.set(pivot_row, c, tmp);
            }
            perm.swap(k, pivot_row);
        }
        // λ is (nearly) an exact eigenvalue, so the matrix is near-singular;
        // a floor keeps elimination finite and inverse iteration converges to
        // the null direction regardless.
        let pivot = if pivot_abs < 1e-300 {
            C64::real(1e-300)
        } else {
            lu.get(k, k)
        };
        lu.set(k, k, pivot);
        for r in (k + 1)..n {
            let factor = lu.get(r, k) / pivot;
            lu.set(r, k, factor);
            for c in (k + 1)..n {
                let v = lu.get(r, c) - factor * lu.get(k, c);
                lu.set(r, c, v);
            }
        }
    }

    // Apply permutation, then forward/back substitution.
    let permuted: Vec<C64> = perm.iter().map(|&p| b[p]).collect();
    b.copy_from_slice(&permuted);
    for r in 1..n {
        for c in 0..r {
            let sub = lu.get(r, c) * b[c];
            b[r] = b[r] - sub;
        }
    }
    for r in (0..n).rev() {
        for c in (r + 1)..n {
            let sub = lu.get(r, c) * b[c];
            b[r] = b[r] - sub;
        }
        b[r] = b[r] / lu.get(r, r);
    }
}

/// Right eigenvector for `lambda` by inverse iteration.
pub fn eigenvector(a: &DMat, lambda: C64) -> Vec<C64> {
    let n = a.rows();
    if n == 0 {
        return Vec::new();
    }
    // A slightly perturbed shift keeps the LU factors finite.
    let shift = lambda + C64::new(1e-10 * (lambda.abs() + 1.0), 0.0);
    let mut w: Vec<C64> = (0..n)
        .map(|i| C64::real(1.0 / ((i + 1) as f64)))
        .collect();
    for _ in 0..3 {
        solve_shifted(a, shift, &mut w);
        let norm: f64 = w.iter().map(|z| z.abs() * z.abs()).sum::<f64>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            // Restart from a different direction.
            w = (0..n).map(|i| C64::real(((i % 7) + 1) as f64)).collect();
            continue;
        }
        for z in w.iter_mut() {
            *z = *z * (1.0 / norm);
        }
    }
    w
}
