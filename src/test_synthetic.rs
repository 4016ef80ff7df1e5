//! Seeded synthetic fields for tests
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

enum Source {
    Star {
        x: f64,
        y: f64,
        flux: f64,
        sigma: f64,
    },
    Galaxy {
        x: f64,
        y: f64,
        flux: f64,
        sigma: f64,
        axis_ratio: f64,
        angle: f64,
    },
}

/// Builder for a noisy field with Gaussian stars and elliptical galaxies.
/// Positions are `(x, y)` = (column, row); fluxes are totals.
pub struct SyntheticField {
    rows: usize,
    cols: usize,
    seed: u64,
    background: f64,
    noise: f64,
    sources: Vec<Source>,
}

impl SyntheticField {
    pub fn new(rows: usize, cols: usize, seed: u64) -> Self {
        Self {
            rows,
            cols,
            seed,
            background: 0.0,
            noise: 0.0,
            sources: Vec::new(),
        }
    }

    pub fn background(mut self, level: f64) -> Self {
        self.background = level;
        self
    }

    pub fn noise(mut self, sigma: f64) -> Self {
        self.noise = sigma;
        self
    }

    pub fn star(mut self, x: f64, y: f64, flux: f64, sigma: f64) -> Self {
        self.sources.push(Source::Star { x, y, flux, sigma });
        self
    }

    pub fn galaxy(
        mut self,
        x: f64,
        y: f64,
        flux: f64,
        sigma: f64,
        axis_ratio: f64,
        angle: f64,
    ) -> Self {
        self.sources.push(Source::Galaxy {
            x,
            y,
            flux,
            sigma,
            axis_ratio,
            angle,
        });
        self
    }

    fn source_value(source: &Source, c: f64, r: f64) -> f64 {
        match *source {
            Source::Star { x, y, flux, sigma } => {
                let d2 = (c - x).powi(2) + (r - y).powi(2);
                flux / (2.0 * std::f64::consts::PI * sigma * sigma)
                    * (-d2 / (2.0 * sigma * sigma)).exp()
            }
            Source::Galaxy {
                x,
                y,
                flux,
                sigma,
                axis_ratio,
                angle,
            } => {
                let (s, co) = angle.sin_cos();
                let u = (c - x) * co + (r - y) * s;
                let v = -(c - x) * s + (r - y) * co;
                let minor = sigma * axis_ratio;
                flux / (2.0 * std::f64::consts::PI * sigma * minor)
                    * (-(u * u / (2.0 * sigma * sigma) + v * v / (2.0 * minor * minor))).exp()
            }
        }
    }

    /// Noise-free model of the field
    pub fn model(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.rows, self.cols), |(r, c)| {
            self.background
                + self
                    .sources
                    .iter()
                    .map(|s| Self::source_value(s, c as f64, r as f64))
                    .sum::<f64>()
        })
    }

    /// Model plus seeded Gaussian noise
    pub fn render(&self) -> Array2<f64> {
        let mut image = self.model();
        if self.noise > 0.0 {
            let mut rng = StdRng::seed_from_u64(self.seed);
            let normal = Normal::new(0.0, self.noise).unwrap();
            image.mapv_inplace(|v| v + normal.sample(&mut rng));
        }
        image
    }
}
