pub mod calibrator;
pub mod metrics;

/// Right-closed bin assignment over [0, 1]: bin `b` covers
/// `(b/num_bins, (b+1)/num_bins]`. A confidence of exactly 0.0 falls in no
/// bin; callers treat unassigned samples as absent from the binned stats.
#[inline]
pub(crate) fn bin_index(confidence: f64, num_bins: usize) -> Option<usize> {
    for bin in 0..num_bins {
        let lower = bin as f64 / num_bins as f64;
        let upper = (bin + 1) as f64 / num_bins as f64;
        if confidence > lower && confidence <= upper {
            return Some(bin);
        }
    }
    None
}

#[inline]
pub(crate) fn bin_midpoint(bin: usize, num_bins: usize) -> f64 {
    (bin as f64 + 0.5) / num_bins as f64
}
