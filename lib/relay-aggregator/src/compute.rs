use std::{fmt, str::FromStr};

use crate::{
    bucket::Bucket,
    error::{AggregatorError, PercentileOutOfRange, UnknownComputeKind},
    invocation::InvocationTable,
    template::NameTemplate,
};

/// A statistic to calculate over each window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeKind {
    /// Sum of all samples.
    Sum,

    /// Number of samples.
    Count,

    /// Largest sample.
    Maximum,

    /// Smallest sample.
    Minimum,

    /// Arithmetic mean of all samples.
    Average,

    /// Middle sample, or the mean of the two middle samples when there is an even number of them.
    Median,

    /// Nearest-rank percentile.
    Percentile(u8),

    /// Population variance.
    Variance,

    /// Population standard deviation.
    StandardDeviation,
}

impl ComputeKind {
    /// Returns `true` if calculating this statistic requires every raw sample of the window.
    pub const fn needs_raw_samples(&self) -> bool {
        matches!(
            self,
            Self::Median | Self::Percentile(_) | Self::Variance | Self::StandardDeviation
        )
    }

    /// Calculates this statistic for the given bucket.
    ///
    /// Returns `None` for an empty bucket, as empty windows are never emitted.
    pub(crate) fn compute(&self, bucket: &mut Bucket) -> Option<f64> {
        if bucket.is_empty() {
            return None;
        }

        let count = bucket.count() as f64;
        let value = match self {
            Self::Sum => bucket.sum(),
            Self::Count => count,
            Self::Maximum => bucket.max(),
            Self::Minimum => bucket.min(),
            Self::Average => bucket.sum() / count,
            Self::Median => median(bucket.sorted_entries())?,
            Self::Percentile(p) => nearest_rank(bucket.sorted_entries(), *p)?,
            Self::Variance => population_variance(bucket.entries())?,
            Self::StandardDeviation => population_variance(bucket.entries())?.sqrt(),
        };

        Some(value)
    }
}

fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }

    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

fn nearest_rank(sorted: &[f64], percentile: u8) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }

    // Rank is 1-based: ceil(p/100 * n), clamped so that p0 picks the smallest sample.
    let rank = (usize::from(percentile) * n).div_ceil(100).clamp(1, n);
    Some(sorted[rank - 1])
}

fn population_variance(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let squared_deviations = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
    Some(squared_deviations / n)
}

impl FromStr for ComputeKind {
    type Err = AggregatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let kind = match lowered.as_str() {
            "sum" => Self::Sum,
            "count" | "cnt" => Self::Count,
            "max" | "maximum" => Self::Maximum,
            "min" | "minimum" => Self::Minimum,
            "avg" | "average" => Self::Average,
            "median" => Self::Median,
            "variance" => Self::Variance,
            "stddev" => Self::StandardDeviation,
            other => {
                let digits = other
                    .strip_prefix("percentile")
                    .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()));
                let Some(digits) = digits else {
                    return UnknownComputeKind { kind: s }.fail();
                };

                // Every character is a digit, so the only possible parse failure is overflow.
                let percentile = digits.parse::<u64>().unwrap_or(u64::MAX);
                if percentile > 100 {
                    return PercentileOutOfRange { kind: s, percentile }.fail();
                }
                Self::Percentile(percentile as u8)
            }
        };

        Ok(kind)
    }
}

impl fmt::Display for ComputeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => f.write_str("sum"),
            Self::Count => f.write_str("count"),
            Self::Maximum => f.write_str("max"),
            Self::Minimum => f.write_str("min"),
            Self::Average => f.write_str("average"),
            Self::Median => f.write_str("median"),
            Self::Percentile(p) => write!(f, "percentile{}", p),
            Self::Variance => f.write_str("variance"),
            Self::StandardDeviation => f.write_str("stddev"),
        }
    }
}

/// A statistic attached to an aggregator, along with the live state of every series it produces.
#[derive(Debug)]
pub(crate) struct Compute {
    kind: ComputeKind,
    template: NameTemplate,
    pub(crate) invocations: InvocationTable,
}

impl Compute {
    pub fn new(kind: ComputeKind, template: NameTemplate, table_capacity_bits: u8) -> Self {
        Self {
            kind,
            template,
            invocations: InvocationTable::with_capacity_bits(table_capacity_bits),
        }
    }

    pub const fn kind(&self) -> ComputeKind {
        self.kind
    }

    pub fn template(&self) -> &NameTemplate {
        &self.template
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::ApproxEqRatio as _;
    use proptest::prelude::*;

    use super::*;

    fn bucket_of(values: &[f64], keep_raw: bool) -> Bucket {
        let mut bucket = Bucket::new(0);
        for value in values {
            bucket.record(*value, keep_raw).unwrap();
        }
        bucket
    }

    fn compute(kind: ComputeKind, values: &[f64]) -> Option<f64> {
        let mut bucket = bucket_of(values, kind.needs_raw_samples());
        kind.compute(&mut bucket)
    }

    #[test]
    fn parse_kinds() {
        let cases = [
            ("sum", ComputeKind::Sum),
            ("count", ComputeKind::Count),
            ("cnt", ComputeKind::Count),
            ("max", ComputeKind::Maximum),
            ("maximum", ComputeKind::Maximum),
            ("min", ComputeKind::Minimum),
            ("minimum", ComputeKind::Minimum),
            ("avg", ComputeKind::Average),
            ("Average", ComputeKind::Average),
            ("median", ComputeKind::Median),
            ("percentile95", ComputeKind::Percentile(95)),
            ("percentile0", ComputeKind::Percentile(0)),
            ("percentile100", ComputeKind::Percentile(100)),
            ("variance", ComputeKind::Variance),
            ("stddev", ComputeKind::StandardDeviation),
        ];

        for (input, expected) in cases {
            assert_eq!(input.parse::<ComputeKind>().unwrap(), expected, "input: {}", input);
        }
    }

    #[test]
    fn parse_rejects_unknown_and_out_of_range() {
        for input in ["", "mean", "percentile", "percentile9x", "percentile-5", "p95"] {
            assert!(
                matches!(
                    input.parse::<ComputeKind>(),
                    Err(AggregatorError::UnknownComputeKind { .. })
                ),
                "input: {}",
                input
            );
        }

        for input in ["percentile101", "percentile99999999999999999999999"] {
            assert!(
                matches!(
                    input.parse::<ComputeKind>(),
                    Err(AggregatorError::PercentileOutOfRange { .. })
                ),
                "input: {}",
                input
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for kind in [
            ComputeKind::Sum,
            ComputeKind::Count,
            ComputeKind::Maximum,
            ComputeKind::Minimum,
            ComputeKind::Average,
            ComputeKind::Median,
            ComputeKind::Percentile(75),
            ComputeKind::Variance,
            ComputeKind::StandardDeviation,
        ] {
            assert_eq!(kind.to_string().parse::<ComputeKind>().unwrap(), kind);
        }
    }

    #[test]
    fn raw_samples_needed_only_for_distribution_statistics() {
        assert!(!ComputeKind::Sum.needs_raw_samples());
        assert!(!ComputeKind::Count.needs_raw_samples());
        assert!(!ComputeKind::Maximum.needs_raw_samples());
        assert!(!ComputeKind::Minimum.needs_raw_samples());
        assert!(!ComputeKind::Average.needs_raw_samples());
        assert!(ComputeKind::Median.needs_raw_samples());
        assert!(ComputeKind::Percentile(50).needs_raw_samples());
        assert!(ComputeKind::Variance.needs_raw_samples());
        assert!(ComputeKind::StandardDeviation.needs_raw_samples());
    }

    #[test]
    fn closed_form_statistics() {
        let values = [4.0, 2.0, 5.0, 1.0, 3.0];

        assert_eq!(compute(ComputeKind::Sum, &values), Some(15.0));
        assert_eq!(compute(ComputeKind::Count, &values), Some(5.0));
        assert_eq!(compute(ComputeKind::Maximum, &values), Some(5.0));
        assert_eq!(compute(ComputeKind::Minimum, &values), Some(1.0));
        assert_eq!(compute(ComputeKind::Average, &values), Some(3.0));
        assert_eq!(compute(ComputeKind::Median, &values), Some(3.0));
        assert_eq!(compute(ComputeKind::Percentile(50), &values), Some(3.0));
        assert_eq!(compute(ComputeKind::Variance, &values), Some(2.0));

        let stddev = compute(ComputeKind::StandardDeviation, &values).unwrap();
        assert!(stddev.approx_eq_ratio(&2.0_f64.sqrt(), 1e-12));
    }

    #[test]
    fn median_of_even_count_averages_middle_pair() {
        assert_eq!(compute(ComputeKind::Median, &[1.0, 2.0, 3.0, 4.0]), Some(2.5));
        assert_eq!(compute(ComputeKind::Median, &[10.0, -10.0]), Some(0.0));
    }

    #[test]
    fn percentile_is_nearest_rank() {
        let values = (1..=20).map(f64::from).collect::<Vec<_>>();

        assert_eq!(compute(ComputeKind::Percentile(0), &values), Some(1.0));
        assert_eq!(compute(ComputeKind::Percentile(5), &values), Some(1.0));
        assert_eq!(compute(ComputeKind::Percentile(6), &values), Some(2.0));
        assert_eq!(compute(ComputeKind::Percentile(50), &values), Some(10.0));
        assert_eq!(compute(ComputeKind::Percentile(95), &values), Some(19.0));
        assert_eq!(compute(ComputeKind::Percentile(100), &values), Some(20.0));

        // No interpolation: a single sample is every percentile.
        assert_eq!(compute(ComputeKind::Percentile(99), &[7.5]), Some(7.5));
    }

    #[test]
    fn empty_bucket_has_no_value() {
        for kind in [ComputeKind::Sum, ComputeKind::Average, ComputeKind::Median, ComputeKind::Variance] {
            assert_eq!(compute(kind, &[]), None);
        }
    }

    proptest! {
        #[test]
        fn property_test_running_values_match_raw(values in prop::collection::vec(-1.0e6..1.0e6_f64, 1..200)) {
            let mut bucket = bucket_of(&values, true);

            let expected_sum = values.iter().sum::<f64>();
            let expected_min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let expected_max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            prop_assert_eq!(bucket.count(), values.len() as u64);
            prop_assert_eq!(ComputeKind::Minimum.compute(&mut bucket), Some(expected_min));
            prop_assert_eq!(ComputeKind::Maximum.compute(&mut bucket), Some(expected_max));

            let sum = ComputeKind::Sum.compute(&mut bucket).unwrap();
            prop_assert!((sum - expected_sum).abs() <= 1e-6 * values.len() as f64);

            let avg = ComputeKind::Average.compute(&mut bucket).unwrap();
            prop_assert!((avg - sum / values.len() as f64).abs() <= 1e-9);

            let median = ComputeKind::Median.compute(&mut bucket).unwrap();
            prop_assert!(median >= expected_min && median <= expected_max);

            let variance = ComputeKind::Variance.compute(&mut bucket).unwrap();
            prop_assert!(variance >= 0.0);
        }
    }
}
