//! Memory-budgeted batching of the interpolation loop.
//!
//! Interpolating the coupling for a batch of destination points allocates
//! several transient tensors per point. Given the tensor extents and a byte
//! budget, [`estimate_batch_count`] computes how many sequential batches the
//! destination loop must use so that peak transient memory stays under
//! budget, and fails outright when not even a single destination point fits.

use crate::error::ResourceError;
use std::mem::size_of;
use std::ops::Range;

/// Bytes per double-precision real
pub const REAL_BYTES: u64 = size_of::<f64>() as u64;
/// Bytes per double-precision complex
pub const COMPLEX_BYTES: u64 = size_of::<num_complex::Complex<f64>>() as u64;

/// Extents of the coupling tensor as seen by one process
#[derive(Copy, Clone, Debug)]
pub struct CouplingDims {
    /// Electron-lattice vectors in this process's partition
    pub el_vectors: u64,
    /// Phonon-lattice vectors (replicated on every process)
    pub ph_vectors: u64,
    /// Vibrational modes
    pub modes: u64,
    /// Wannier (electronic) bands
    pub wannier: u64,
}

/// Bytes resident for the whole calculation: the coupling-tensor partition,
/// the cached partial transform, the lattice-vector lists with their
/// degeneracies, and the source rotation matrix.
fn fixed_cost(dims: &CouplingDims, source_bands: u64) -> u64 {
    let CouplingDims {
        el_vectors,
        ph_vectors,
        modes,
        wannier,
    } = *dims;
    COMPLEX_BYTES * wannier * wannier * modes * ph_vectors * el_vectors
        + COMPLEX_BYTES * source_bands * wannier * modes * ph_vectors
        + REAL_BYTES * 4 * (el_vectors + ph_vectors)
        + COMPLEX_BYTES * source_bands * wannier
}

/// Transient bytes per destination point.
///
/// The two intermediate contraction tensors are never simultaneously all
/// live: each is freed as soon as its successor is produced, so the cost is
/// the maximum over sums of adjacent pairs, not the sum of all stages.
fn transient_cost_per_point(dims: &CouplingDims, source_bands: u64) -> u64 {
    let CouplingDims {
        ph_vectors,
        modes,
        wannier,
        ..
    } = *dims;
    let eigenvectors = COMPLEX_BYTES * (wannier * wannier + modes * modes);
    let phases = COMPLEX_BYTES * ph_vectors;
    let g3 = 2 * COMPLEX_BYTES * modes * source_bands * wannier;
    let g4 = 2 * COMPLEX_BYTES * modes * source_bands * wannier;
    let g_final = 2 * COMPLEX_BYTES * modes * source_bands * wannier;
    let coupling = COMPLEX_BYTES * source_bands * wannier * modes;
    let polar = COMPLEX_BYTES * modes * source_bands * wannier;

    let peak = [phases + g3, g3 + g4, g4 + g_final, g_final + coupling]
        .into_iter()
        .max()
        .unwrap_or(0);
    eigenvectors + polar + peak
}

/// The number of sequential batches the destination loop must use.
///
/// Terminal failure when the budget cannot fit the resident data plus one
/// destination point's transients: there is no retry, the caller must rerun
/// with a larger budget or a smaller problem.
pub fn estimate_batch_count(
    destination_count: usize,
    source_bands: usize,
    dims: &CouplingDims,
    budget_bytes: u64,
) -> Result<usize, ResourceError> {
    let fixed = fixed_cost(dims, source_bands as u64);
    let available = budget_bytes
        .checked_sub(fixed)
        .ok_or(ResourceError::BudgetBelowFixedCost {
            budget: budget_bytes,
            fixed,
        })?;
    let per_point = transient_cost_per_point(dims, source_bands as u64);
    if available < per_point || available == 0 {
        return Err(ResourceError::SinglePointTooLarge {
            per_point,
            available,
        });
    }
    let transient_total = per_point * destination_count as u64;
    let batches = transient_total.div_ceil(available).max(1);
    Ok(batches as usize)
}

/// Splits `range` into `batches` contiguous chunks of near-equal size
pub fn divide_into_batches(range: Range<usize>, batches: usize) -> Vec<Range<usize>> {
    let n = range.end - range.start;
    (0..batches)
        .map(|b| {
            let chunk = crate::parallel::partition(n, b, batches);
            range.start + chunk.start..range.start + chunk.end
        })
        .filter(|r| !r.is_empty())
        .collect()
}

#[cfg(test)]
mod test {
    use super::{divide_into_batches, estimate_batch_count, CouplingDims};
    use crate::error::ResourceError;

    fn small_dims() -> CouplingDims {
        CouplingDims {
            el_vectors: 8,
            ph_vectors: 8,
            modes: 6,
            wannier: 4,
        }
    }

    #[test]
    fn generous_budget_uses_one_batch() {
        let batches = estimate_batch_count(100, 4, &small_dims(), 1 << 30).unwrap();
        assert_eq!(batches, 1);
    }

    #[test]
    fn batch_count_grows_as_budget_shrinks() {
        let dims = small_dims();
        let fixed = super::fixed_cost(&dims, 4);
        let few = estimate_batch_count(1000, 4, &dims, fixed + 40_000).unwrap();
        let many = estimate_batch_count(1000, 4, &dims, fixed + 10_000).unwrap();
        assert!(many > few, "{many} batches should exceed {few}");
    }

    #[test]
    fn budget_below_fixed_cost_fails_fast() {
        let result = estimate_batch_count(10, 4, &small_dims(), 64);
        assert!(matches!(
            result,
            Err(ResourceError::BudgetBelowFixedCost { .. })
        ));
    }

    #[test]
    fn budget_below_one_point_fails_fast() {
        // just above the fixed cost, well below one point's transients
        let dims = small_dims();
        let fixed = super::fixed_cost(&dims, 4);
        let result = estimate_batch_count(10, 4, &dims, fixed + 8);
        assert!(matches!(
            result,
            Err(ResourceError::SinglePointTooLarge { .. })
        ));
    }

    #[test]
    fn batches_tile_the_destination_range() {
        let ranges = divide_into_batches(3..23, 4);
        assert_eq!(ranges.first().map(|r| r.start), Some(3));
        assert_eq!(ranges.last().map(|r| r.end), Some(23));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}
