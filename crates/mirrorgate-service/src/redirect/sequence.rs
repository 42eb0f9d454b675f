use std::collections::VecDeque;

/// An endless, deterministic sequence of indices whose frequencies follow a set of weights.
///
/// Every slot `i` has a period `total / w_i`. On each tick all slots advance by the same
/// `unit`, and every slot that reached its period is emitted in ascending index order. The
/// initial ramps are staggered by `offset` so that slots with equal weights do not fire in
/// bursts. Over a long run, index `i` is emitted with frequency `w_i / total`.
///
/// A sequence cannot be rewound; build a new one to start over.
#[derive(Debug, Clone)]
pub struct WeightedSequence {
    periods: Vec<f64>,
    ramps: Vec<f64>,
    unit: f64,
    /// Indices emitted by the last tick that were not consumed yet.
    ready: VecDeque<usize>,
}

impl WeightedSequence {
    /// Creates a sequence for the given weights.
    ///
    /// All weights must be positive and finite, and there must be at least one.
    pub fn new(weights: &[f64]) -> Self {
        debug_assert!(!weights.is_empty());
        debug_assert!(weights.iter().all(|w| *w > 0.0 && w.is_finite()));

        let n = weights.len();
        if n <= 1 {
            return Self {
                periods: vec![1.0],
                ramps: vec![0.0],
                unit: 1.0,
                ready: VecDeque::new(),
            };
        }

        let total: f64 = weights.iter().sum();
        let periods: Vec<f64> = weights.iter().map(|w| total / w).collect();

        let shortest = periods.iter().copied().fold(f64::INFINITY, f64::min);
        let longest = periods.iter().copied().fold(0.0, f64::max);
        let unit = shortest / n as f64;
        let offset = longest / (n - 1) as f64;

        let ramps = periods
            .iter()
            .enumerate()
            .map(|(i, period)| (i as f64 * offset) % period)
            .collect();

        Self {
            periods,
            ramps,
            unit,
            ready: VecDeque::with_capacity(n),
        }
    }

    /// Advances all ramps by one unit and queues the slots that fired.
    fn tick(&mut self) {
        for (i, (ramp, period)) in self.ramps.iter_mut().zip(&self.periods).enumerate() {
            *ramp += self.unit;
            if *ramp >= *period {
                *ramp -= *period;
                self.ready.push_back(i);
            }
        }
    }
}

impl Iterator for WeightedSequence {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.periods.len() == 1 {
            return Some(0);
        }

        loop {
            if let Some(index) = self.ready.pop_front() {
                return Some(index);
            }
            self.tick();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::MAX, None)
    }
}
