//! Histogram — parsing, subtraction, and percentile lookup over
//! Prometheus-style cumulative latency histograms exposed by backends.

use std::collections::BTreeMap;

use regex::Regex;

/// A bucket's upper bound: either a finite value or the `+Inf` bucket,
/// which is always present in any non-empty exposition.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum Bound {
    /// A finite bucket boundary, e.g. `le="0.5"`.
    Finite(f64),
    /// The `+Inf` bucket.
    Infinite,
}

impl Bound {
    fn sort_key(self) -> f64 {
        match self {
            Bound::Finite(v) => v,
            Bound::Infinite => f64::INFINITY,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        if raw == "+Inf" || raw == "inf" || raw == "+inf" {
            Some(Bound::Infinite)
        } else {
            raw.parse::<f64>().ok().map(Bound::Finite)
        }
    }
}

/// An ordered `upper_bound -> cumulative_count` mapping. Bounds compare by
/// numeric value with `+Inf` sorting last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    buckets: Vec<(Bound, i64)>,
}

impl Histogram {
    /// An empty histogram — callers treat this as "insufficient data".
    pub fn empty() -> Self {
        Self { buckets: Vec::new() }
    }

    /// True if no bucket line was ever matched.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Iterate buckets in ascending bound order.
    pub fn buckets(&self) -> impl Iterator<Item = (Bound, i64)> + '_ {
        self.buckets.iter().copied()
    }

    /// The cumulative count of the `+Inf` bucket (i.e. the total sample
    /// count), or `None` if empty.
    pub fn total(&self) -> Option<i64> {
        self.buckets.last().map(|(_, count)| *count)
    }

    /// Parse a Prometheus exposition text, extracting every line matched by
    /// `line_pattern`. Each matching line must contain an `le="<bound>"`
    /// label and a decimal count as the last whitespace-delimited token. If
    /// no line matches, returns [`Histogram::empty`].
    #[allow(clippy::expect_used)] // pattern is a fixed literal, compiles or the crate is broken
    pub fn parse(text: &str, line_pattern: &Regex) -> Histogram {
        let le_pattern = Regex::new(r#"le="([^"]+)""#).expect("static regex is valid");

        let mut buckets: BTreeMap<String, (Bound, i64)> = BTreeMap::new();
        for line in text.lines() {
            if !line_pattern.is_match(line) {
                continue;
            }
            let Some(le_caps) = le_pattern.captures(line) else {
                continue;
            };
            let Some(bound) = Bound::parse(&le_caps[1]) else {
                continue;
            };
            let Some(count_str) = line.split_whitespace().last() else {
                continue;
            };
            let Ok(count) = count_str.parse::<i64>() else {
                continue;
            };
            buckets.insert(le_caps[1].to_string(), (bound, count));
        }

        let mut entries: Vec<(Bound, i64)> = buckets.into_values().collect();
        entries.sort_by(|a, b| a.0.sort_key().total_cmp(&b.0.sort_key()));
        Histogram { buckets: entries }
    }

    /// Element-wise subtraction `a - b`, treating a missing key in either
    /// side as 0. Keys are the union of both histograms' bounds.
    pub fn diff(a: &Histogram, b: &Histogram) -> Histogram {
        let mut by_bound: BTreeMap<u64, (Bound, i64)> = BTreeMap::new();

        let key_of = |bound: Bound| bound.sort_key().to_bits();

        for &(bound, count) in &a.buckets {
            by_bound.entry(key_of(bound)).or_insert((bound, 0)).1 += count;
        }
        for &(bound, count) in &b.buckets {
            by_bound.entry(key_of(bound)).or_insert((bound, 0)).1 -= count;
        }

        let mut entries: Vec<(Bound, i64)> = by_bound.into_values().collect();
        entries.sort_by(|x, y| x.0.sort_key().total_cmp(&y.0.sort_key()));
        Histogram { buckets: entries }
    }

    /// The smallest bucket whose cumulative count covers at least `p *
    /// total`. Returns `(bucket_index, upper_bound)`, or `None` on an empty
    /// histogram.
    pub fn percentile(&self, p: f64) -> Option<(usize, Bound)> {
        let total = self.total()?;
        if total <= 0 {
            return None;
        }
        let threshold = p * total as f64;
        self.buckets
            .iter()
            .enumerate()
            .find(|(_, (_, count))| *count as f64 >= threshold)
            .map(|(idx, (bound, _))| (idx, *bound))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bucket_line_pattern() -> Regex {
        Regex::new(r#"^vllm:time_to_first_token_seconds_bucket\{"#).expect("valid regex")
    }

    const SAMPLE: &str = r#"
# HELP vllm:time_to_first_token_seconds histogram of ttft
vllm:time_to_first_token_seconds_bucket{le="0.1"} 10
vllm:time_to_first_token_seconds_bucket{le="0.5"} 18
vllm:time_to_first_token_seconds_bucket{le="+Inf"} 20
vllm:other_metric_bucket{le="0.1"} 999
"#;

    #[test]
    fn parse_extracts_only_matching_lines_with_inf_present() {
        let h = Histogram::parse(SAMPLE, &bucket_line_pattern());
        assert!(!h.is_empty());
        assert_eq!(h.total(), Some(20));
        let bounds: Vec<Bound> = h.buckets().map(|(b, _)| b).collect();
        assert_eq!(bounds.last(), Some(&Bound::Infinite));
    }

    #[test]
    fn parse_returns_empty_when_no_line_matches() {
        let h = Histogram::parse("nothing to see here", &bucket_line_pattern());
        assert!(h.is_empty());
        assert_eq!(h.total(), None);
    }

    #[test]
    fn diff_law_holds_for_chained_subtraction() {
        let a = Histogram::parse(SAMPLE, &bucket_line_pattern());
        let b = Histogram {
            buckets: vec![(Bound::Finite(0.1), 2), (Bound::Finite(0.5), 4), (Bound::Infinite, 5)],
        };
        let c = Histogram::empty();

        let ab = Histogram::diff(&a, &b);
        let bc = Histogram::diff(&b, &c);
        let ac = Histogram::diff(&a, &c);

        let sum = Histogram::diff(&ab, &Histogram::diff(&Histogram::empty(), &bc));
        // (a-b) + (b-c) == a-c, pointwise over the union of keys.
        for (bound, count) in ac.buckets() {
            let lhs = sum
                .buckets()
                .find(|(bnd, _)| (bnd.sort_key() - bound.sort_key()).abs() < f64::EPSILON)
                .map(|(_, c)| c)
                .unwrap_or(0);
            assert_eq!(lhs, count);
        }
    }

    #[test]
    fn percentile_returns_smallest_covering_bucket() {
        let h = Histogram::parse(SAMPLE, &bucket_line_pattern());
        let (idx, bound) = h.percentile(0.95).unwrap();
        // 0.95 * 20 == 19, smallest cumulative >= 19 is the +Inf bucket (20).
        assert_eq!(idx, 2);
        assert_eq!(bound, Bound::Infinite);
    }

    #[test]
    fn percentile_on_empty_histogram_is_none() {
        assert_eq!(Histogram::empty().percentile(0.95), None);
    }
}
