/* src/model.rs */
//! # Substitution model builder
//!
//! Produces the stationary frequencies and the eigendecomposition
//! `Q = E · diag(λ) · E⁻¹` of a continuous-time Markov rate matrix for any
//! number of states.
//!
//! ## Paths
//!
//! - **Power of two** (`N = 2^n`): the equal-rates model. Its eigenvectors are
//!   the Sylvester–Hadamard matrix `H_n`, so the decomposition is written down
//!   in closed form with no solver: `E = H`, `E⁻¹ = Hᵀ / N`,
//!   `λ = (0, -N/(N-1), …, -N/(N-1))`.
//! - **General**: a random reversible model with `Q[i][j] = r(i,j) · π_j`.
//!   Reversibility makes `D·Q·D⁻¹` symmetric for `D = diag(√π)`, so faer's
//!   self-adjoint eigensolver yields a real spectrum. The left eigenvectors come
//!   from an LU inversion of the right ones.
//!
//! Any failure on the general path (bad frequencies, solver not converging,
//! singular eigenvectors, a positive eigenvalue) is reported as
//! [`PhyloBenchError::NumericalConstruction`]; no partial decomposition escapes.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use faer::linalg::solvers::DenseSolveCore;
use faer::{Mat, MatRef, Side};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::SeededStream;
use crate::error::{PhyloBenchError, Result};

/// Largest entry of `A·A⁻¹ − I` accepted from an inversion.
const INVERSE_RESIDUAL: f64 = 1e-8;

/// Largest eigenvalue, relative to the spectral radius, still accepted as zero.
const STATIONARY_TOLERANCE: f64 = 1e-10;

/// Eigendecomposition of an instantaneous rate matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigenDecomposition {
    /// Number of states
    pub state_count: usize,
    /// Eigenvalues, stationary (zero) eigenvalue first
    pub eigenvalues: Array1<f64>,
    /// Right eigenvectors, one per column
    pub eigenvectors: Array2<f64>,
    /// Inverse of [`Self::eigenvectors`] (left eigenvectors, one per row)
    pub inverse_eigenvectors: Array2<f64>,
}

impl EigenDecomposition {
    /// Rebuilds `E · diag(λ) · E⁻¹`.
    #[must_use]
    pub fn reconstruct(&self) -> Array2<f64> {
        let scaled = &self.eigenvectors * &self.eigenvalues;
        scaled.dot(&self.inverse_eigenvectors)
    }
}

/// Stationary frequencies plus the eigensystem of the rate matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstitutionModel {
    /// Stationary state frequencies (unnormalized on the general path)
    pub frequencies: Array1<f64>,
    /// Decomposition handed to the evaluation engine
    pub eigen: EigenDecomposition,
}

impl SubstitutionModel {
    /// Builds the model for `state_count` states.
    ///
    /// Only the general path draws from `stream`: `N` frequencies, then one
    /// exchangeability per unordered state pair in row-major order.
    pub fn build(state_count: usize, stream: &mut SeededStream) -> Result<Self> {
        if state_count < 2 {
            return Err(PhyloBenchError::Configuration(format!(
                "a substitution model needs at least 2 states, got {state_count}"
            )));
        }
        if state_count.is_power_of_two() {
            debug!(state_count, "Building closed-form Hadamard decomposition");
            return Ok(Self::equal_rates(state_count));
        }

        debug!(state_count, "Building random reversible model");
        let frequencies = Array1::from(stream.units(state_count));
        let exchangeabilities = stream.units(state_count * (state_count - 1) / 2);
        Self::reversible(frequencies, &exchangeabilities)
    }

    /// The equal-rates model for a power-of-two state count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn equal_rates(state_count: usize) -> Self {
        let n = state_count as f64;
        let h = hadamard(state_count);
        let inverse_eigenvectors = h.t().mapv(|x| x / n);
        let eigenvalues =
            Array1::from_shape_fn(state_count, |i| if i == 0 { 0.0 } else { -n / (n - 1.0) });

        Self {
            frequencies: Array1::from_elem(state_count, 1.0 / n),
            eigen: EigenDecomposition {
                state_count,
                eigenvalues,
                eigenvectors: h,
                inverse_eigenvectors,
            },
        }
    }

    /// Decomposes the reversible model defined by `frequencies` and the
    /// row-major upper-triangle `exchangeabilities`.
    pub fn reversible(frequencies: Array1<f64>, exchangeabilities: &[f64]) -> Result<Self> {
        let n = frequencies.len();
        if n < 2 {
            return Err(PhyloBenchError::Configuration(format!(
                "a substitution model needs at least 2 states, got {n}"
            )));
        }
        if exchangeabilities.len() != n * (n - 1) / 2 {
            return Err(PhyloBenchError::numerical(
                "rate matrix",
                format!(
                    "{} exchangeabilities supplied for {n} states",
                    exchangeabilities.len()
                ),
            ));
        }
        if let Some(bad) = frequencies.iter().find(|p| !(p.is_finite() && **p > 0.0)) {
            return Err(PhyloBenchError::numerical(
                "frequencies",
                format!("frequency {bad} is not strictly positive"),
            ));
        }

        let q = general_rate_matrix(&frequencies, exchangeabilities);
        let root = frequencies.mapv(f64::sqrt);
        let similar = Array2::from_shape_fn((n, n), |(i, j)| root[i] * q[[i, j]] / root[j]);
        let symmetric = (&similar + &similar.t()) * 0.5;

        let (values, vectors) = symmetric_eigen(&symmetric)?;

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

        let mut eigenvalues: Array1<f64> = order.iter().map(|&k| values[k]).collect();
        let radius = eigenvalues.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let tolerance = STATIONARY_TOLERANCE * radius.max(f64::MIN_POSITIVE);
        if eigenvalues[0] > tolerance {
            return Err(PhyloBenchError::numerical(
                "eigensolver",
                format!("positive eigenvalue {} in a generator matrix", eigenvalues[0]),
            ));
        }
        if eigenvalues[0].abs() <= tolerance {
            eigenvalues[0] = 0.0;
        }

        let eigenvectors = Array2::from_shape_fn((n, n), |(i, c)| vectors[[i, order[c]]] / root[i]);
        let inverse_eigenvectors = invert(&eigenvectors)?;

        let finite = eigenvalues
            .iter()
            .chain(eigenvectors.iter())
            .chain(inverse_eigenvectors.iter())
            .all(|x| x.is_finite());
        if !finite {
            return Err(PhyloBenchError::numerical(
                "eigensolver",
                "decomposition contains non-finite entries",
            ));
        }

        Ok(Self {
            frequencies,
            eigen: EigenDecomposition {
                state_count: n,
                eigenvalues,
                eigenvectors,
                inverse_eigenvectors,
            },
        })
    }
}

/// Sylvester–Hadamard matrix of a power-of-two order, built by `H_2k = [[H, H], [H, -H]]`.
#[must_use]
pub fn hadamard(order: usize) -> Array2<f64> {
    debug_assert!(order.is_power_of_two());
    let mut h = Array2::from_elem((1, 1), 1.0);
    while h.nrows() < order {
        let k = h.nrows();
        let mut next = Array2::zeros((2 * k, 2 * k));
        next.slice_mut(s![..k, ..k]).assign(&h);
        next.slice_mut(s![..k, k..]).assign(&h);
        next.slice_mut(s![k.., ..k]).assign(&h);
        next.slice_mut(s![k.., k..]).assign(&(-&h));
        h = next;
    }
    h
}

/// Reversible rate matrix `Q[i][j] = r(i,j) · π_j` with zero row sums.
///
/// The diagonal is the negated sum of the row's off-diagonal entries.
#[must_use]
pub fn general_rate_matrix(frequencies: &Array1<f64>, exchangeabilities: &[f64]) -> Array2<f64> {
    let n = frequencies.len();
    let mut q = Array2::zeros((n, n));
    let mut pair = 0;
    for i in 0..n {
        for j in i + 1..n {
            let r = exchangeabilities[pair];
            q[[i, j]] = r * frequencies[j];
            q[[j, i]] = r * frequencies[i];
            pair += 1;
        }
    }
    for i in 0..n {
        let off: f64 = (0..n).filter(|&j| j != i).map(|j| q[[i, j]]).sum();
        q[[i, i]] = -off;
    }
    q
}

fn to_faer(matrix: &Array2<f64>) -> Mat<f64> {
    Mat::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
}

fn from_faer(matrix: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((matrix.nrows(), matrix.ncols()), |(i, j)| matrix[(i, j)])
}

/// Eigendecomposition of a symmetric matrix: eigenvalues and eigenvectors as columns.
fn symmetric_eigen(matrix: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    if !matrix.iter().all(|x| x.is_finite()) {
        return Err(PhyloBenchError::numerical(
            "eigensolver",
            "rate matrix contains non-finite entries",
        ));
    }

    let eig = to_faer(matrix)
        .as_ref()
        .self_adjoint_eigen(Side::Lower)
        .map_err(|err| {
            PhyloBenchError::numerical("eigensolver", format!("decomposition failed: {err:?}"))
        })?;
    let diag = eig.S();
    let values = Array1::from_shape_fn(matrix.nrows(), |i| diag[i]);
    Ok((values, from_faer(eig.U())))
}

/// Inverse by partial-pivot LU.
///
/// LU itself never fails, so singularity is detected afterwards: a non-finite
/// inverse or a residual `‖A·A⁻¹ − I‖∞` above `INVERSE_RESIDUAL`.
pub fn invert(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return Err(PhyloBenchError::numerical(
            "inversion",
            format!("matrix is {n}x{}, not square", matrix.ncols()),
        ));
    }
    let scale = matrix.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
    if !(scale.is_finite() && scale > 0.0) {
        return Err(PhyloBenchError::numerical(
            "inversion",
            "matrix is zero or non-finite",
        ));
    }

    let inverse = from_faer(to_faer(matrix).as_ref().partial_piv_lu().inverse().as_ref());
    if !inverse.iter().all(|x| x.is_finite()) {
        return Err(PhyloBenchError::numerical(
            "inversion",
            "singular eigenvector matrix (non-finite inverse)",
        ));
    }

    let residual = (matrix.dot(&inverse) - Array2::<f64>::eye(n))
        .iter()
        .fold(0.0_f64, |m, x| m.max(x.abs()));
    if residual > INVERSE_RESIDUAL {
        return Err(PhyloBenchError::numerical(
            "inversion",
            format!("singular eigenvector matrix (residual {residual:e})"),
        ));
    }
    Ok(inverse)
}
