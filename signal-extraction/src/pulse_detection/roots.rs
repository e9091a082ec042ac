//! Closed-form real roots of low-order polynomials.
use super::Real;
use std::f64::consts::TAU;

/// Coefficients smaller than this, relative to the largest one, are treated as zero.
const RELATIVE_EPSILON: Real = 1e-9;

/// Up to three real roots, in no particular order.
#[derive(Default, Debug, Clone, Copy)]
pub(crate) struct Roots {
    values: [Real; 3],
    len: usize,
}

impl Roots {
    fn push(&mut self, root: Real) {
        if root.is_finite() {
            if let Some(slot) = self.values.get_mut(self.len) {
                *slot = root;
                self.len += 1;
            }
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Real> + '_ {
        self.values.iter().take(self.len).copied()
    }

    /// Applies a Newton step to each root of the polynomial `p` with derivative `dp`.
    fn polished(mut self, p: impl Fn(Real) -> Real, dp: impl Fn(Real) -> Real) -> Self {
        for root in self.values.iter_mut().take(self.len) {
            for _ in 0..2 {
                let slope = dp(*root);
                if slope == 0.0 {
                    break;
                }
                let step = p(*root) / slope;
                if !step.is_finite() {
                    break;
                }
                *root -= step;
            }
        }
        self
    }
}

fn max_abs(coefficients: &[Real]) -> Real {
    coefficients.iter().fold(0.0, |max, c| max.max(c.abs()))
}

/// Roots of `b x + c`.
pub(crate) fn linear(b: Real, c: Real) -> Roots {
    let mut roots = Roots::default();
    if b.abs() > RELATIVE_EPSILON * c.abs() && b != 0.0 {
        roots.push(-c / b);
    }
    roots
}

/// Real roots of `a x^2 + b x + c`.
pub(crate) fn quadratic(a: Real, b: Real, c: Real) -> Roots {
    let scale = max_abs(&[a, b, c]);
    if scale == 0.0 {
        return Roots::default();
    }
    if a.abs() <= RELATIVE_EPSILON * scale {
        return linear(b, c);
    }
    let mut roots = Roots::default();
    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 {
        return roots;
    }
    // Avoids cancellation between b and the square root.
    let q = -0.5 * (b + b.signum() * discriminant.sqrt());
    roots.push(q / a);
    if q != 0.0 && discriminant > 0.0 {
        roots.push(c / q);
    }
    roots
}

/// Real roots of `a x^3 + b x^2 + c x + d`.
pub(crate) fn cubic(a: Real, b: Real, c: Real, d: Real) -> Roots {
    let scale = max_abs(&[a, b, c, d]);
    if scale == 0.0 {
        return Roots::default();
    }
    if a.abs() <= RELATIVE_EPSILON * scale {
        return quadratic(b, c, d);
    }

    let (p, q, r) = (b / a, c / a, d / a);
    let big_q = (p * p - 3.0 * q) / 9.0;
    let big_r = (2.0 * p * p * p - 9.0 * p * q + 27.0 * r) / 54.0;
    let big_q3 = big_q * big_q * big_q;
    let shift = p / 3.0;

    let mut roots = Roots::default();
    if big_r * big_r < big_q3 {
        let theta = (big_r / big_q3.sqrt()).clamp(-1.0, 1.0).acos();
        let m = -2.0 * big_q.sqrt();
        roots.push(m * (theta / 3.0).cos() - shift);
        roots.push(m * ((theta + TAU) / 3.0).cos() - shift);
        roots.push(m * ((theta - TAU) / 3.0).cos() - shift);
    } else {
        let big_a = -big_r.signum() * (big_r.abs() + (big_r * big_r - big_q3).sqrt()).cbrt();
        let big_b = if big_a == 0.0 { 0.0 } else { big_q / big_a };
        roots.push(big_a + big_b - shift);
    }
    roots.polished(
        |x| ((a * x + b) * x + c) * x + d,
        |x| (3.0 * a * x + 2.0 * b) * x + c,
    )
}
