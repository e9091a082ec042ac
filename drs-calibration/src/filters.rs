//! Post-processing applied to calibrated waveforms.
use cherenkov_common::Real;

/// Replaces isolated single-sample and double-sample spikes by the mean of their neighbours.
/// # Parameters
/// - samples: the calibrated samples, modified in place.
/// - threshold: the height by which a spike must exceed its neighbours.
/// - sensitive: sample positions at which `sensitive_threshold` applies instead.
/// - sensitive_threshold: the threshold at the `sensitive` positions.
pub fn remove_spikes(
    samples: &mut [Real],
    threshold: Real,
    sensitive: &[usize],
    sensitive_threshold: Real,
) {
    let threshold_at = |i: usize| {
        if sensitive.contains(&i) {
            sensitive_threshold
        } else {
            threshold
        }
    };

    let len = samples.len();
    for i in 1..len.saturating_sub(1) {
        let threshold = threshold_at(i);
        let (before, here, after) = (samples[i - 1], samples[i], samples[i + 1]);
        if here - before > threshold && here - after > threshold {
            samples[i] = (before + after) / 2.0;
            continue;
        }
        if i + 2 < len
            && here - before > threshold
            && (here - after).abs() < threshold
            && after - samples[i + 2] > threshold
        {
            let mean = (before + samples[i + 2]) / 2.0;
            samples[i] = mean;
            samples[i + 1] = mean;
        }
    }
}

/// Symmetric sliding average of odd width `window`.
///
/// Near the ends the window shrinks symmetrically, so that constants and linear ramps are left unchanged.
pub fn smooth(samples: &[Real], window: usize) -> Vec<Real> {
    let half = window / 2;
    if half == 0 {
        return samples.to_vec();
    }
    let mut cumulative = Vec::with_capacity(samples.len() + 1);
    cumulative.push(0.0);
    for &value in samples {
        cumulative.push(cumulative.last().copied().unwrap_or_default() + value);
    }

    let len = samples.len();
    (0..len)
        .map(|i| {
            let reach = half.min(i).min(len - 1 - i);
            let sum = cumulative[i + reach + 1] - cumulative[i - reach];
            sum / (2 * reach + 1) as Real
        })
        .collect()
}
