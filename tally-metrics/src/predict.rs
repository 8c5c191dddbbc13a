//! Linear regression forecasting of adder values.

/// A least-squares line fitted to the history.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinearFit {
    /// Intercept.
    pub a: f64,
    /// Slope per second.
    pub b: f64,
    /// Coefficient of determination, `0` for degenerate histories.
    pub fit: f64,
}

impl LinearFit {
    /// Fits a line through `(timestamp, value)` points.
    ///
    /// The mean timestamp is taken as the midpoint of `oldest` and `newest`, which is exact for
    /// evenly spaced ticks. A history with no spread in time yields a flat line.
    pub fn compute(points: &[(f64, f64)], oldest: f64, newest: f64) -> Self {
        if points.is_empty() {
            return Self::default();
        }

        let mean_y = points.iter().map(|&(_, y)| y).sum::<f64>() / points.len() as f64;
        let mean_x = (oldest + newest) / 2.0;

        let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
        for &(x, y) in points {
            let dx = x - mean_x;
            let dy = y - mean_y;
            sxy += dx * dy;
            sxx += dx * dx;
            syy += dy * dy;
        }

        let b = if sxx != 0.0 { sxy / sxx } else { 0.0 };
        let a = mean_y - b * mean_x;
        let xxyy = sxx * syy;
        let fit = if xxyy != 0.0 { sxy * sxy / xxyy } else { 0.0 };

        Self { a, b, fit }
    }

    /// Evaluates the line at timestamp `x`.
    pub fn at(&self, x: f64) -> f64 {
        self.a + self.b * x
    }
}

/// What a predictor reports for one tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Forecast {
    /// Previous prediction minus the observed value, if there was a valid prediction.
    pub diff: Option<f64>,
    /// The line fitted to the history.
    pub line: LinearFit,
    /// The value predicted for the next tick.
    pub prediction: f64,
}

/// Per-record forecaster over a circular history of observed values.
#[derive(Clone, Debug)]
pub struct Predictor {
    history: Vec<(f64, f64)>,
    size: usize,
    /// Index of the oldest point once the history has wrapped.
    next: usize,
    filled: usize,
    valid: bool,
    substituted: u32,
    substituting: bool,
    prediction: f64,
}

impl Predictor {
    /// Creates a predictor with room for `size` points.
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        Self {
            history: Vec::with_capacity(size),
            size,
            next: 0,
            filled: 0,
            valid: false,
            substituted: 0,
            substituting: false,
            prediction: 0.0,
        }
    }

    /// Returns `true` once the history has been filled.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The current prediction for the next tick.
    pub fn prediction(&self) -> f64 {
        self.prediction
    }

    /// Returns the prediction as a stand-in for a tick without data.
    ///
    /// Yields `None` if the predictor is not valid or has already substituted `pmax` values in a
    /// row.
    pub fn substitute(&mut self, pmax: u32) -> Option<f64> {
        if !self.valid || self.substituted >= pmax {
            return None;
        }

        self.substituted += 1;
        self.substituting = true;
        Some(self.prediction)
    }

    fn push(&mut self, point: (f64, f64)) {
        if self.history.len() < self.size {
            self.history.push(point);
        } else {
            self.history[self.next] = point;
            self.next = (self.next + 1) % self.size;
        }
    }

    fn oldest(&self) -> Option<(f64, f64)> {
        self.history.get(self.next).copied()
    }

    fn newest(&self) -> Option<(f64, f64)> {
        let index = (self.next + self.history.len() - 1) % self.history.len().max(1);
        self.history.get(index).copied()
    }

    /// Records the value observed at `ts` and predicts the value at `next_ts`.
    ///
    /// Returns `None` while the history is still filling. After `pmax` consecutive substituted
    /// values the predictor becomes invalid and starts refilling.
    pub fn observe(&mut self, ts: f64, value: f64, next_ts: f64, pmax: u32) -> Option<Forecast> {
        let was_valid = self.valid;

        self.push((ts, value));

        if self.substituting {
            self.substituting = false;
        } else {
            self.substituted = 0;
        }

        if !self.valid {
            self.filled += 1;
            if self.filled >= self.size {
                self.valid = true;
            }
        }

        if !self.valid {
            return None;
        }

        let diff = was_valid.then(|| self.prediction - value);

        let (oldest, newest) = match (self.oldest(), self.newest()) {
            (Some(oldest), Some(newest)) => (oldest.0, newest.0),
            _ => (ts, ts),
        };
        let line = LinearFit::compute(&self.history, oldest, newest);
        self.prediction = line.at(next_ts);

        let forecast = Forecast {
            diff,
            line,
            prediction: self.prediction,
        };

        if self.substituted >= pmax {
            self.valid = false;
            self.filled = 0;
            self.substituted = 0;
        }

        Some(forecast)
    }
}
