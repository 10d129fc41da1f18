//! Two-dimensional correlation histograms between device pairs.

use nalgebra::Vector2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Transverse axis of a correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Axis {
    /// Column direction.
    X,
    /// Row direction.
    Y,
}

impl Axis {
    /// Both axes, in order.
    pub const ALL: [Axis; 2] = [Axis::X, Axis::Y];

    /// Component index (0 for x, 1 for y).
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
        }
    }

    /// Picks this axis' component of a transverse vector.
    #[must_use]
    pub fn of(self, v: &Vector2<f64>) -> f64 {
        v[self.index()]
    }
}

/// Uniform binning of one histogram axis.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Binning {
    /// Lower edge of the first bin.
    pub min: f64,
    /// Upper edge of the last bin.
    pub max: f64,
    /// Number of bins.
    pub bins: usize,
}

impl Binning {
    /// Creates a binning; `bins` is clamped to at least one.
    #[must_use]
    pub fn new(min: f64, max: f64, bins: usize) -> Self {
        Self {
            min,
            max,
            bins: bins.max(1),
        }
    }

    /// Bin width.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn width(&self) -> f64 {
        (self.max - self.min) / self.bins as f64
    }

    /// Bin index for a value, `None` outside the range.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn bin(&self, value: f64) -> Option<usize> {
        if !(value >= self.min && value < self.max) {
            return None;
        }
        let index = ((value - self.min) / self.width()) as usize;
        Some(index.min(self.bins - 1))
    }

    /// Centre of a bin.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn center(&self, bin: usize) -> f64 {
        self.min + (bin as f64 + 0.5) * self.width()
    }
}

/// Counts of event-matched hit pairs (reference value, device value) along one axis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CorrelationHistogram {
    /// Reference device id.
    pub reference: usize,
    /// Correlated device id.
    pub device: usize,
    /// Axis the histogram was filled for.
    pub axis: Axis,
    /// Binning of the reference device coordinate.
    pub reference_binning: Binning,
    /// Binning of the correlated device coordinate.
    pub device_binning: Binning,
    counts: Vec<u32>,
    entries: u64,
    events: usize,
}

impl CorrelationHistogram {
    /// Creates an empty histogram.
    #[must_use]
    pub fn new(
        reference: usize,
        device: usize,
        axis: Axis,
        reference_binning: Binning,
        device_binning: Binning,
    ) -> Self {
        Self {
            reference,
            device,
            axis,
            reference_binning,
            device_binning,
            counts: vec![0; reference_binning.bins * device_binning.bins],
            entries: 0,
            events: 0,
        }
    }

    /// Adds one pair; returns false if it falls outside the binning.
    pub fn fill(&mut self, reference_value: f64, device_value: f64) -> bool {
        match (
            self.reference_binning.bin(reference_value),
            self.device_binning.bin(device_value),
        ) {
            (Some(i), Some(j)) => {
                self.counts[i * self.device_binning.bins + j] += 1;
                self.entries += 1;
                true
            }
            _ => false,
        }
    }

    /// Records that one more event contributed pairs.
    pub fn add_event(&mut self) {
        self.events += 1;
    }

    /// Adds another histogram with identical binning.
    pub fn merge(&mut self, other: &CorrelationHistogram) {
        if self.counts.len() != other.counts.len() {
            return;
        }
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
        self.entries += other.entries;
        self.events += other.events;
    }

    /// Count in bin (reference bin `i`, device bin `j`).
    #[must_use]
    pub fn count(&self, i: usize, j: usize) -> u32 {
        self.counts[i * self.device_binning.bins + j]
    }

    /// Device-axis counts for one reference bin.
    #[must_use]
    pub fn row(&self, i: usize) -> &[u32] {
        let bins = self.device_binning.bins;
        &self.counts[i * bins..(i + 1) * bins]
    }

    /// Total number of filled pairs.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Number of events that contributed.
    #[must_use]
    pub fn events(&self) -> usize {
        self.events
    }

    /// True when no pair was filled (degenerate: alignment impossible for the device).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Projects the histogram onto the difference `device - reference`.
    ///
    /// The projection uses bin centres and a bin width equal to the finer of
    /// the two axes.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn difference_projection(&self) -> Projection {
        let width = self
            .reference_binning
            .width()
            .min(self.device_binning.width());
        // Half-bin shift so that differences of aligned bin centres land on centres.
        let min = self.device_binning.min - self.reference_binning.max - 0.5 * width;
        let max = self.device_binning.max - self.reference_binning.min + 0.5 * width;
        let bins = ((max - min) / width).ceil().max(1.0) as usize;
        let binning = Binning::new(min, min + bins as f64 * width, bins);
        let mut counts = vec![0.0; binning.bins];

        for i in 0..self.reference_binning.bins {
            let r = self.reference_binning.center(i);
            for (j, &c) in self.row(i).iter().enumerate() {
                if c == 0 {
                    continue;
                }
                let d = self.device_binning.center(j) - r;
                if let Some(k) = binning.bin(d) {
                    counts[k] += f64::from(c);
                }
            }
        }

        Projection { binning, counts }
    }
}

/// A one-dimensional projection of a correlation histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Binning of the projected coordinate.
    pub binning: Binning,
    /// Counts per bin.
    pub counts: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binning_edges() {
        let binning = Binning::new(-1.0, 1.0, 4);
        assert_eq!(binning.bin(-1.0), Some(0));
        assert_eq!(binning.bin(0.99), Some(3));
        assert_eq!(binning.bin(1.0), None);
        assert_eq!(binning.bin(f64::NAN), None);
        assert!((binning.center(1) + 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_fill_and_projection() {
        let mut hist = CorrelationHistogram::new(
            0,
            1,
            Axis::X,
            Binning::new(0.0, 10.0, 10),
            Binning::new(0.0, 10.0, 10),
        );
        assert!(hist.is_empty());
        for v in 0..8 {
            let r = f64::from(v) + 0.5;
            assert!(hist.fill(r, r + 2.0));
        }
        assert!(!hist.fill(-1.0, 1.0));
        assert_eq!(hist.entries(), 8);
        assert_eq!(hist.count(0, 2), 1);

        let projection = hist.difference_projection();
        let peak = projection
            .counts
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
            .unwrap();
        assert!((projection.binning.center(peak) - 2.0).abs() < 1e-9);
        assert!((projection.counts[peak] - 8.0).abs() < f64::EPSILON);
    }
}
