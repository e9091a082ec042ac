//! Natural cubic spline through unit-spaced samples.
use super::{Real, roots};
use thiserror::Error;

/// Tolerance with which a crossing may fall outside the bin it was searched in.
const CROSSING_TOLERANCE: Real = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum SplineError {
    #[error("A spline needs at least two samples, got {0}")]
    TooFewSamples(usize),
    #[error("Sample {0} is not finite")]
    NonFiniteSample(usize),
}

/// Which way [CubicSpline::search_crossing] walks from its starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards earlier samples, looking for the rising edge of a pulse.
    Down,
    /// Towards later samples, looking for the falling edge of a pulse.
    Up,
}

/// Interpolating cubic spline with zero curvature at both ends.
///
/// Sample `i` sits at abscissa `i`, bin `i` covers `[i, i + 1]`. Queries outside `[0, n - 1]`
/// extrapolate the polynomial of the first or last bin.
///
/// A spline may be rebuilt from new samples without reallocating, so one instance can serve
/// as the scratch buffer of a worker thread. An empty spline evaluates to zero everywhere.
#[derive(Default, Debug, Clone)]
pub struct CubicSpline {
    values: Vec<Real>,
    /// Forward-sweep terms of the tridiagonal solve.
    der1: Vec<Real>,
    /// Second derivatives at the knots, divided by six.
    der2: Vec<Real>,
    /// `cumulative[k]` is the integral from zero to `k`.
    cumulative: Vec<Real>,
}

impl CubicSpline {
    pub fn new(samples: &[Real]) -> Result<Self, SplineError> {
        let mut spline = Self::default();
        spline.rebuild(samples)?;
        Ok(spline)
    }

    /// Fits the spline to `samples`, reusing the existing allocation.
    ///
    /// On error the spline is left empty.
    pub fn rebuild(&mut self, samples: &[Real]) -> Result<(), SplineError> {
        self.values.clear();
        self.der1.clear();
        self.der2.clear();
        self.cumulative.clear();

        let n = samples.len();
        if n < 2 {
            return Err(SplineError::TooFewSamples(n));
        }
        if let Some(index) = samples.iter().position(|value| !value.is_finite()) {
            return Err(SplineError::NonFiniteSample(index));
        }

        self.values.extend_from_slice(samples);
        self.der1.resize(n, 0.0);
        self.der2.resize(n, 0.0);
        for i in 1..n - 1 {
            let pivot = self.der2[i - 1] + 4.0;
            self.der2[i] = -1.0 / pivot;
            let curvature = samples[i + 1] - 2.0 * samples[i] + samples[i - 1];
            self.der1[i] = (6.0 * curvature - self.der1[i - 1]) / pivot;
        }
        self.der2[n - 1] = 0.0;
        for k in (0..n - 1).rev() {
            self.der2[k] = self.der2[k] * self.der2[k + 1] + self.der1[k];
        }
        for d in &mut self.der2 {
            *d /= 6.0;
        }

        self.cumulative.reserve(n);
        let mut total = 0.0;
        self.cumulative.push(total);
        for i in 0..n - 1 {
            total += self.bin_integral(i);
            self.cumulative.push(total);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The sample values the spline was fitted to.
    pub fn values(&self) -> &[Real] {
        &self.values
    }

    /// Values and scaled second derivatives at both ends of `bin`, which must be at most `n - 2`.
    fn knots(&self, bin: usize) -> (Real, Real, Real, Real) {
        (
            self.values[bin],
            self.values[bin + 1],
            self.der2[bin],
            self.der2[bin + 1],
        )
    }

    /// Splits `x` into a bin and an offset within it, using the outermost bins beyond the ends.
    fn align(&self, x: Real) -> Option<(usize, Real)> {
        let last_bin = self.len().checked_sub(2)?;
        let floor = x.floor();
        let bin = if floor <= 0.0 {
            0
        } else {
            (floor as usize).min(last_bin)
        };
        Some((bin, x - bin as Real))
    }

    fn evaluate_in(&self, bin: usize, x: Real) -> Real {
        let (v0, v1, d0, d1) = self.knots(bin);
        let y = 1.0 - x;
        y * v0 + x * v1 + (y * y * y - y) * d0 + (x * x * x - x) * d1
    }

    fn first_derivative_in(&self, bin: usize, x: Real) -> Real {
        let (v0, v1, d0, d1) = self.knots(bin);
        3.0 * (d1 - d0) * x * x + (6.0 * x - 2.0) * d0 - d1 + (v1 - v0)
    }

    fn second_derivative_in(&self, bin: usize, x: Real) -> Real {
        let (_, _, d0, d1) = self.knots(bin);
        6.0 * (d1 * x + d0 * (1.0 - x))
    }

    /// Integral over `bin` from its left edge to `x`.
    fn primitive_in(&self, bin: usize, x: Real) -> Real {
        let (v0, v1, d0, d1) = self.knots(bin);
        let x2 = x * x;
        let y = 1.0 - x;
        (x - x2 / 2.0) * v0
            + x2 / 2.0 * v1
            + (0.25 - x + x2 / 2.0 - y * y * y * y / 4.0) * d0
            + (x2 * x2 / 4.0 - x2 / 2.0) * d1
    }

    fn bin_integral(&self, bin: usize) -> Real {
        let (v0, v1, d0, d1) = self.knots(bin);
        (v0 + v1) / 2.0 - (d0 + d1) / 4.0
    }

    /// Coefficients `(a, b, c, d)` of `a t^3 + b t^2 + c t + d`, the polynomial of `bin`.
    fn coefficients(&self, bin: usize) -> (Real, Real, Real, Real) {
        let (v0, v1, d0, d1) = self.knots(bin);
        (d1 - d0, 3.0 * d0, v1 - v0 - 2.0 * d0 - d1, v0)
    }

    pub fn evaluate(&self, x: Real) -> Real {
        self.align(x)
            .map(|(bin, x)| self.evaluate_in(bin, x))
            .unwrap_or_default()
    }

    pub fn first_derivative(&self, x: Real) -> Real {
        self.align(x)
            .map(|(bin, x)| self.first_derivative_in(bin, x))
            .unwrap_or_default()
    }

    pub fn second_derivative(&self, x: Real) -> Real {
        self.align(x)
            .map(|(bin, x)| self.second_derivative_in(bin, x))
            .unwrap_or_default()
    }

    /// Integral over whole bins, from sample `from` to sample `to`, in constant time.
    pub fn whole_bin_integral(&self, from: usize, to: usize) -> Real {
        let at = |k: usize| {
            self.cumulative
                .get(k.min(self.len().saturating_sub(1)))
                .copied()
                .unwrap_or_default()
        };
        at(to) - at(from)
    }

    /// Signed integral of the spline from `x0` to `x1`.
    pub fn integral(&self, x0: Real, x1: Real) -> Real {
        if x1 < x0 {
            return -self.integral(x1, x0);
        }
        let last = self.len().saturating_sub(1) as Real;
        if x0.fract() == 0.0 && x1.fract() == 0.0 && x0 >= 0.0 && x1 <= last {
            return self.whole_bin_integral(x0 as usize, x1 as usize);
        }
        let (Some((bin0, t0)), Some((bin1, t1))) = (self.align(x0), self.align(x1)) else {
            return 0.0;
        };
        if bin0 == bin1 {
            return self.primitive_in(bin0, t1) - self.primitive_in(bin0, t0);
        }
        let rest_of_first = self.bin_integral(bin0) - self.primitive_in(bin0, t0);
        let middle = ((bin0 + 1)..bin1)
            .map(|bin| self.bin_integral(bin))
            .sum::<Real>();
        rest_of_first + middle + self.primitive_in(bin1, t1)
    }

    /// Position and height of the highest point of `bin`.
    ///
    /// Takes the local maximum inside the bin if there is one, otherwise the higher of its two knots.
    pub fn find_maximum(&self, bin: usize) -> (Real, Real) {
        let bin = bin.min(self.len().saturating_sub(2));
        if self.len() < 2 {
            return (bin as Real, self.values.first().copied().unwrap_or_default());
        }
        let (v0, v1, d0, d1) = self.knots(bin);
        let knot = if v1 > v0 {
            (bin as Real + 1.0, v1)
        } else {
            (bin as Real, v0)
        };
        roots::quadratic(3.0 * (d1 - d0), 6.0 * d0, v1 - v0 - 2.0 * d0 - d1)
            .iter()
            .filter(|&t| (0.0..1.0).contains(&t) && self.second_derivative_in(bin, t) < 0.0)
            .map(|t| (bin as Real + t, self.evaluate_in(bin, t)))
            .fold(knot, |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            })
    }

    /// The highest point of the two bins adjacent to sample `index`.
    pub fn maximum_around(&self, index: usize) -> (Real, Real) {
        let last_bin = self.len().saturating_sub(2);
        let before = index.checked_sub(1).map(|bin| self.find_maximum(bin));
        let after = (index <= last_bin).then(|| self.find_maximum(index));
        match (before, after) {
            (Some(before), Some(after)) => {
                if after.1 > before.1 {
                    after
                } else {
                    before
                }
            }
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => (index as Real, self.evaluate(index as Real)),
        }
    }

    /// Crossings of `threshold` within `bin`, restricted to `[from, to]` and with a first
    /// derivative of the requested sign.
    fn crossings_in(
        &self,
        bin: usize,
        threshold: Real,
        from: Real,
        to: Real,
        rising: bool,
    ) -> Vec<Real> {
        let (a, b, c, d) = self.coefficients(bin);
        roots::cubic(a, b, c, d - threshold)
            .iter()
            .filter(move |&t| t >= from - CROSSING_TOLERANCE && t <= to + CROSSING_TOLERANCE)
            .map(move |t| t.clamp(from, to))
            .filter(move |&t| {
                let slope = self.first_derivative_in(bin, t);
                if rising { slope > 0.0 } else { slope < 0.0 }
            })
            .collect()
    }

    /// Finds where the spline crosses `threshold`, walking bin by bin from `start_x`.
    ///
    /// Walking [Direction::Down] returns the latest rising crossing at or before `start_x`,
    /// walking [Direction::Up] the earliest falling crossing at or after it. Returns [None]
    /// if the walk reaches the end of the samples first.
    pub fn search_crossing(
        &self,
        start_x: Real,
        threshold: Real,
        direction: Direction,
    ) -> Option<Real> {
        let last_bin = self.len().checked_sub(2)?;
        let x = start_x.clamp(0.0, (last_bin + 1) as Real);
        let start_bin = (x.floor() as usize).min(last_bin);
        let offset = x - start_bin as Real;

        match direction {
            Direction::Down => (0..=start_bin).rev().find_map(|bin| {
                let to = if bin == start_bin { offset } else { 1.0 };
                self.crossings_in(bin, threshold, 0.0, to, true)
                    .into_iter()
                    .max_by(|a, b| a.total_cmp(b))
                    .map(|t| bin as Real + t)
            }),
            Direction::Up => (start_bin..=last_bin).find_map(|bin| {
                let from = if bin == start_bin { offset } else { 0.0 };
                self.crossings_in(bin, threshold, from, 1.0, false)
                    .into_iter()
                    .min_by(|a, b| a.total_cmp(b))
                    .map(|t| bin as Real + t)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const SAMPLES: [Real; 8] = [0.0, 1.0, 5.0, 12.0, 9.0, 4.0, 1.5, 0.0];

    fn gaussian(len: usize, height: Real, centre: Real, sigma: Real) -> Vec<Real> {
        (0..len)
            .map(|i| {
                let z = (i as Real - centre) / sigma;
                height * (-0.5 * z * z).exp()
            })
            .collect()
    }

    #[test]
    fn rejects_short_or_non_finite_input() {
        assert_eq!(
            CubicSpline::new(&[1.0]).unwrap_err(),
            SplineError::TooFewSamples(1)
        );
        assert_eq!(
            CubicSpline::new(&[1.0, Real::NAN, 2.0]).unwrap_err(),
            SplineError::NonFiniteSample(1)
        );
    }

    #[test]
    fn interpolates_the_knots() {
        let spline = CubicSpline::new(&SAMPLES).unwrap();
        for (i, value) in SAMPLES.iter().enumerate() {
            assert_approx_eq!(spline.evaluate(i as Real), *value);
        }
        // Natural boundary conditions.
        assert_approx_eq!(spline.second_derivative(0.0), 0.0);
        assert_approx_eq!(spline.second_derivative(7.0), 0.0);
    }

    #[test]
    fn two_samples_form_a_line() {
        let spline = CubicSpline::new(&[2.0, 6.0]).unwrap();
        assert_approx_eq!(spline.evaluate(0.25), 3.0);
        assert_approx_eq!(spline.first_derivative(0.5), 4.0);
        assert_approx_eq!(spline.integral(0.0, 1.0), 4.0);
        assert_approx_eq!(spline.evaluate(1.5), 8.0);
    }

    #[test]
    fn derivatives_are_continuous_at_knots() {
        let spline = CubicSpline::new(&SAMPLES).unwrap();
        for bin in 1..6 {
            let left = spline.first_derivative_in(bin - 1, 1.0);
            let right = spline.first_derivative_in(bin, 0.0);
            assert_approx_eq!(left, right, 1e-9);
            let left = spline.second_derivative_in(bin - 1, 1.0);
            let right = spline.second_derivative_in(bin, 0.0);
            assert_approx_eq!(left, right, 1e-9);
        }
    }

    #[test]
    fn integral_is_antisymmetric_and_additive() {
        let spline = CubicSpline::new(&SAMPLES).unwrap();
        let forward = spline.integral(0.3, 5.6);
        assert_approx_eq!(spline.integral(5.6, 0.3), -forward);
        assert_approx_eq!(
            spline.integral(0.3, 2.2) + spline.integral(2.2, 5.6),
            forward,
            1e-9
        );
        assert_eq!(spline.integral(2.5, 2.5), 0.0);
    }

    #[test]
    fn whole_bin_fast_path_agrees_with_walking() {
        let spline = CubicSpline::new(&SAMPLES).unwrap();
        let fast = spline.integral(1.0, 6.0);
        let walked = spline.integral(1.0, 3.5) + spline.integral(3.5, 6.0);
        assert_approx_eq!(fast, walked, 1e-9);
        assert_approx_eq!(spline.whole_bin_integral(1, 6), fast);
    }

    #[test]
    fn integral_of_a_gaussian_matches_its_area() {
        let sigma = 3.0;
        let samples = gaussian(40, 100.0, 17.3, sigma);
        let spline = CubicSpline::new(&samples).unwrap();
        let expected = 100.0 * sigma * (2.0 * std::f64::consts::PI).sqrt();
        assert_approx_eq!(spline.integral(0.0, 39.0), expected, 0.5);
    }

    #[test]
    fn maximum_of_a_gaussian_is_found_between_samples() {
        let samples = gaussian(40, 100.0, 17.3, 3.0);
        let spline = CubicSpline::new(&samples).unwrap();
        let (position, height) = spline.maximum_around(17);
        assert_approx_eq!(position, 17.3, 0.05);
        assert_approx_eq!(height, 100.0, 0.5);
    }

    #[test]
    fn maximum_falls_back_to_the_higher_knot() {
        let spline = CubicSpline::new(&[0.0, 1.0, 2.0, 3.0]).unwrap();
        let (position, height) = spline.find_maximum(1);
        assert_approx_eq!(position, 2.0);
        assert_approx_eq!(height, 2.0);
    }

    #[test]
    fn crossings_are_found_on_the_correct_edge() {
        let samples = gaussian(40, 100.0, 17.3, 3.0);
        let spline = CubicSpline::new(&samples).unwrap();
        let half_width = 3.0 * (2.0 * Real::ln(2.0)).sqrt();

        let rising = spline.search_crossing(17.3, 50.0, Direction::Down).unwrap();
        assert_approx_eq!(rising, 17.3 - half_width, 0.05);
        assert_approx_eq!(spline.evaluate(rising), 50.0, 1e-6);

        let falling = spline.search_crossing(17.3, 50.0, Direction::Up).unwrap();
        assert_approx_eq!(falling, 17.3 + half_width, 0.05);
        assert!(spline.first_derivative(falling) < 0.0);
    }

    #[test]
    fn crossing_search_stops_at_the_ends() {
        let spline = CubicSpline::new(&SAMPLES).unwrap();
        assert_eq!(spline.search_crossing(3.0, 20.0, Direction::Down), None);
        assert_eq!(spline.search_crossing(3.0, 20.0, Direction::Up), None);
        // The rising edge to the left of the peak is ignored when walking up.
        let falling = spline.search_crossing(3.0, 6.0, Direction::Up).unwrap();
        assert!(falling > 3.0 && falling < 5.0);
    }

    #[test]
    fn rebuilding_replaces_previous_samples() {
        let mut spline = CubicSpline::new(&SAMPLES).unwrap();
        spline.rebuild(&[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(spline.len(), 3);
        assert_approx_eq!(spline.evaluate(1.5), 1.0);
        assert_approx_eq!(spline.integral(0.0, 2.0), 2.0);

        assert!(spline.rebuild(&[]).is_err());
        assert!(spline.is_empty());
        assert_eq!(spline.evaluate(1.0), 0.0);
        assert_eq!(spline.search_crossing(0.0, 1.0, Direction::Up), None);
    }
}
