/*!
Densities, distribution functions and proposal kernels used by the
transmission model.

- [`GammaInterval`]: Gamma-distributed generation and sampling intervals
  (log-density, CDF and sampling).
- [`NegBinomial`]: the offspring distribution, evaluated through its
  probability generating function and its derivatives.
- [`ln_beta_pdf`] / [`ln_exp_pdf`]: prior densities.
- [`Proposal`] and [`GaussianRandomWalk`]: scalar proposal kernels for
  parameter moves.

Everything is evaluated in log space.

# Examples

```rust
use transtree_mcmc::distributions::{GammaInterval, NegBinomial};

let w = GammaInterval::new(2.0, 1.0);
assert!((w.cdf(1.0) - (1.0 - 2.0 * (-1.0f64).exp())).abs() < 1e-10);

let off = NegBinomial::new(1.0, 0.5);
// G(1) = 1
assert!(off.ln_pgf(1.0).abs() < 1e-12);
```
*/

use rand::Rng;
use rand_distr::{Distribution, Gamma, Normal, Poisson};
use std::f64::consts::PI;

/// Natural log of the gamma function (Lanczos approximation, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507343278686905,
        -0.13857109526572012,
        9.984_369_578_019_572e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection: Γ(x) = π / (sin(πx) Γ(1-x))
        (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.999_999_999_999_809_9_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized lower incomplete gamma function P(a, x).
///
/// Series expansion for x < a + 1, continued fraction for the complement otherwise.
pub fn gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x.is_infinite() {
        return 1.0;
    }
    let value = if x < a + 1.0 {
        gamma_p_series(a, x)
    } else {
        1.0 - gamma_q_continued_fraction(a, x)
    };
    value.clamp(0.0, 1.0)
}

fn gamma_p_series(a: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 500;
    const EPS: f64 = 1e-14;
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    let mut sum = 1.0 / a;
    let mut term = 1.0 / a;
    for n in 1..=MAX_ITER {
        term *= x / (a + n as f64);
        sum += term;
        if term.abs() < sum.abs() * EPS {
            break;
        }
    }
    sum * ln_prefix.exp()
}

fn gamma_q_continued_fraction(a: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 500;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-300;
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    let mut b = x + 1.0 - a;
    let mut c = 1.0 / TINY;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < TINY {
            d = TINY;
        }
        c = b + an / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h * ln_prefix.exp()
}

/**
A Gamma distribution on positive intervals, parameterised by shape and scale.

Used for the generation time (`w.shape`, `w.scale`) and the time from
infection to sampling (`ws.shape`, `ws.scale`).
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaInterval {
    pub shape: f64,
    pub scale: f64,
    ln_norm: f64,
}

impl GammaInterval {
    /// Creates the distribution. Both parameters must be positive.
    pub fn new(shape: f64, scale: f64) -> Self {
        Self {
            shape,
            scale,
            ln_norm: ln_gamma(shape) + shape * scale.ln(),
        }
    }

    /// Log-density at `x`; `-inf` for non-positive intervals.
    pub fn ln_pdf(&self, x: f64) -> f64 {
        if !(x > 0.0) {
            return f64::NEG_INFINITY;
        }
        if x.is_infinite() {
            return f64::NEG_INFINITY;
        }
        (self.shape - 1.0) * x.ln() - x / self.scale - self.ln_norm
    }

    /// Probability that the interval is at most `x`.
    pub fn cdf(&self, x: f64) -> f64 {
        gamma_p(self.shape, x / self.scale)
    }

    /// Mean interval.
    pub fn mean(&self) -> f64 {
        self.shape * self.scale
    }

    /// Draws an interval.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match Gamma::new(self.shape, self.scale) {
            Ok(g) => g.sample(rng),
            Err(_) => f64::NAN,
        }
    }
}

/**
Negative-binomial offspring distribution with size `r` and probability `p`:
P(n) = Γ(n + r) / (n! Γ(r)) · pⁿ (1 − p)ʳ, with mean r·p / (1 − p).

The likelihood only needs the probability generating function
G(z) = ((1 − p) / (1 − p z))ʳ and its derivatives, which have closed forms.
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegBinomial {
    pub size: f64,
    pub prob: f64,
}

impl NegBinomial {
    pub fn new(size: f64, prob: f64) -> Self {
        Self { size, prob }
    }

    /// Mean number of offspring.
    pub fn mean(&self) -> f64 {
        self.size * self.prob / (1.0 - self.prob)
    }

    /// ln G(z) for z in [0, 1].
    pub fn ln_pgf(&self, z: f64) -> f64 {
        let z = z.clamp(0.0, 1.0);
        self.size * ((-self.prob).ln_1p() - (-self.prob * z).ln_1p())
    }

    /// G(z) for z in [0, 1].
    pub fn pgf(&self, z: f64) -> f64 {
        self.ln_pgf(z).exp()
    }

    /// ln of the k-th derivative of G at z:
    /// `lnΓ(r+k) − lnΓ(r) + r ln(1−p) + k ln p − (r+k) ln(1−pz)`.
    ///
    /// Equals ln Σₙ P(n) · n!/(n−k)! · z^(n−k): the probability of exactly
    /// `k` labelled offspring being observed while the rest are hidden.
    pub fn ln_pgf_derivative(&self, k: usize, z: f64) -> f64 {
        let z = z.clamp(0.0, 1.0);
        let k = k as f64;
        let (r, p) = (self.size, self.prob);
        ln_gamma(r + k) - ln_gamma(r) + r * (-p).ln_1p() + k * p.ln() - (r + k) * (-p * z).ln_1p()
    }

    /// Log-probability of `n` offspring.
    pub fn ln_pmf(&self, n: usize) -> f64 {
        let nf = n as f64;
        let (r, p) = (self.size, self.prob);
        ln_gamma(nf + r) - ln_gamma(nf + 1.0) - ln_gamma(r) + nf * p.ln() + r * (-p).ln_1p()
    }

    /// Draws an offspring count as a Gamma–Poisson mixture.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let rate = match Gamma::new(self.size, self.prob / (1.0 - self.prob)) {
            Ok(g) => g.sample(rng),
            Err(_) => return 0,
        };
        if !(rate > 0.0) {
            return 0;
        }
        match Poisson::new(rate) {
            Ok(poisson) => {
                let n: f64 = poisson.sample(rng);
                n as usize
            }
            Err(_) => 0,
        }
    }
}

/// Log-density of Beta(a, b) at x; `-inf` outside (0, 1).
pub fn ln_beta_pdf(x: f64, a: f64, b: f64) -> f64 {
    if !(x > 0.0 && x < 1.0) {
        return f64::NEG_INFINITY;
    }
    (a - 1.0) * x.ln() + (b - 1.0) * (-x).ln_1p() - (ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b))
}

/// Log-density of an exponential with the given rate; `-inf` for x <= 0.
pub fn ln_exp_pdf(x: f64, rate: f64) -> f64 {
    if !(x > 0.0) || x.is_infinite() {
        return f64::NEG_INFINITY;
    }
    rate.ln() - rate * x
}

/// A proposal kernel for a scalar parameter.
pub trait Proposal {
    /// Samples a new value from q(x' | x).
    fn sample<R: Rng + ?Sized>(&self, current: f64, rng: &mut R) -> f64;

    /// Evaluates log q(to | from).
    fn log_prob(&self, from: f64, to: f64) -> f64;
}

/**
A Gaussian random walk: adds N(0, `std`²) noise to the current value.

# Examples

```rust
use rand::SeedableRng;
use rand::rngs::SmallRng;
use transtree_mcmc::distributions::{GaussianRandomWalk, Proposal};

let kernel = GaussianRandomWalk::new(0.1);
let mut rng = SmallRng::seed_from_u64(1);
let x = kernel.sample(0.5, &mut rng);
assert_eq!(kernel.log_prob(0.5, x), kernel.log_prob(x, 0.5));
```
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianRandomWalk {
    pub std: f64,
}

impl GaussianRandomWalk {
    pub fn new(std: f64) -> Self {
        Self { std }
    }
}

impl Proposal for GaussianRandomWalk {
    fn sample<R: Rng + ?Sized>(&self, current: f64, rng: &mut R) -> f64 {
        match Normal::new(0.0, self.std) {
            Ok(normal) => current + normal.sample(rng),
            Err(_) => current,
        }
    }

    fn log_prob(&self, from: f64, to: f64) -> f64 {
        let diff = to - from;
        let var = self.std * self.std;
        -(diff * diff) / (2.0 * var) - 0.5 * (2.0 * PI * var).ln()
    }
}
