//! Latency statistics: a running [`Counter`] and a fixed-ladder [`Histogram`]
//! with interpolated percentiles.
//!
//! The bucket ladder is non-uniform (fine-grained near 1, coarse toward
//! 100000) so a single histogram covers sub-millisecond and multi-second
//! latencies at a fixed memory cost. Values are scaled by `(v - offset) /
//! divider` before bucketing, so the same ladder serves seconds,
//! milliseconds, or whatever unit the caller picked via `divider`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Occurrence map of per-call outcome keys ("OK", an HTTP status, an error
/// string) to how many calls ended with that key.
pub type ResultCodeMap = HashMap<String, i64>;

/// Merge `src` into `dst`, key-wise.
pub fn merge_result_codes(dst: &mut ResultCodeMap, src: &ResultCodeMap) {
    for (k, v) in src {
        *dst.entry(k.clone()).or_insert(0) += v;
    }
}

/// Records values and computes count, average, min, max and stddev in O(1)
/// per record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Counter {
    pub count: i64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    #[serde(skip)]
    sum_of_squares: f64,
}

impl Counter {
    /// Records a single data point.
    pub fn record(&mut self, v: f64) {
        self.record_n(v, 1);
    }

    /// Records the same value `n` times in O(1).
    ///
    /// The squared contribution is `(n*v)^2`, not `n*v^2`: n repetitions are
    /// folded into one compound sample. Downstream consumers depend on the
    /// resulting stddev, so this stays as is.
    pub fn record_n(&mut self, v: f64, n: i64) {
        let is_first = self.count == 0;
        self.count += n;
        if is_first {
            self.min = v;
            self.max = v;
        } else if v < self.min {
            self.min = v;
        } else if v > self.max {
            self.max = v;
        }
        let s = v * n as f64;
        self.sum += s;
        self.sum_of_squares += s * s;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.;
        }
        self.sum / self.count as f64
    }

    /// Population standard deviation. Floating-point cancellation can push
    /// the variance slightly negative; that case is clamped to 0.
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.;
        }
        let n = self.count as f64;
        let sigma = (self.sum_of_squares - self.sum * self.sum / n) / n;
        if sigma < 0. {
            tracing::warn!(?self, sigma, "negative variance clamped to 0");
            return 0.;
        }
        sigma.sqrt()
    }

    /// Back to the original no-data state.
    pub fn reset(&mut self) {
        *self = Counter::default();
    }

    /// Merges the data from `src` into this counter and clears `src`.
    pub fn transfer(&mut self, src: &mut Counter) {
        if src.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *src;
            src.reset();
            return;
        }
        self.count += src.count;
        if src.min < self.min {
            self.min = src.min;
        }
        if src.max > self.max {
            self.max = src.max;
        }
        self.sum += src.sum;
        self.sum_of_squares += src.sum_of_squares;
        src.reset();
    }
}

// Bucket upper bounds for the scaled value. Increments of 1 up to 11, then
// 2, 5, 10, ... out to 100000. Two extra buckets surround the ladder: index
// 0 holds everything <= 0 and the last bucket everything > 100000.
const BUCKET_VALUES: [i32; 56] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, //
    12, 14, 16, 18, 20, //
    25, 30, 35, 40, 45, 50, //
    60, 70, 80, 90, 100, //
    120, 140, 160, 180, 200, //
    250, 300, 350, 400, 450, 500, //
    600, 700, 800, 900, 1000, //
    2000, 3000, 4000, 5000, 7500, 10000, //
    20000, 30000, 40000, 50000, 75000, 100000,
];

const NUM_VALUES: usize = BUCKET_VALUES.len();
const NUM_BUCKETS: usize = NUM_VALUES + 1;
const FIRST_VALUE: f64 = BUCKET_VALUES[0] as f64;
const LAST_VALUE: f64 = BUCKET_VALUES[NUM_VALUES - 1] as f64;

// Scaled values below this are bucketed through a direct lookup table;
// larger ones fall back to a linear scan of the tail of the ladder.
const MAX_ARRAY_VALUE: usize = 1000;

const fn max_array_value_index() -> usize {
    let mut i = 0;
    while i < NUM_VALUES {
        if BUCKET_VALUES[i] as usize == MAX_ARRAY_VALUE {
            return i;
        }
        i += 1;
    }
    panic!("bucket ladder must contain the lookup-table boundary");
}

const MAX_ARRAY_VALUE_INDEX: usize = max_array_value_index();

const fn build_val_to_bucket() -> [u8; MAX_ARRAY_VALUE] {
    let mut table = [0u8; MAX_ARRAY_VALUE];
    let mut idx = 0usize;
    let mut i = 0usize;
    while i < MAX_ARRAY_VALUE {
        if i as i32 >= BUCKET_VALUES[idx] {
            idx += 1;
        }
        table[i] = idx as u8;
        i += 1;
    }
    table
}

static VAL_TO_BUCKET: [u8; MAX_ARRAY_VALUE] = build_val_to_bucket();

fn look_up_idx(scaled: usize) -> usize {
    if scaled < MAX_ARRAY_VALUE {
        return VAL_TO_BUCKET[scaled] as usize;
    }
    for i in MAX_ARRAY_VALUE_INDEX..NUM_VALUES {
        if BUCKET_VALUES[i] as usize > scaled {
            return i;
        }
    }
    // record() routes anything past the ladder to the overflow bucket
    // before getting here.
    NUM_VALUES - 1
}

/// A [`Counter`] plus a fixed-bucket distribution of the recorded values.
///
/// `offset` and `divider` are fixed for the histogram's lifetime; `divider`
/// must be non-zero. Intervals are left-open: a scaled value exactly on a
/// boundary falls in the bucket ending at that boundary.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub counter: Counter,
    offset: f64,
    divider: f64,
    hdata: [i32; NUM_BUCKETS],
}

impl Histogram {
    /// `divider == 0` is a construction error.
    pub fn new(offset: f64, divider: f64) -> anyhow::Result<Histogram> {
        if divider == 0. {
            anyhow::bail!("histogram divider must be non-zero");
        }
        Ok(Histogram {
            counter: Counter::default(),
            offset,
            divider,
            hdata: [0; NUM_BUCKETS],
        })
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn divider(&self) -> f64 {
        self.divider
    }

    pub fn record(&mut self, v: f64) {
        self.record_n(v, 1);
    }

    pub fn record_n(&mut self, v: f64, n: i64) {
        self.counter.record_n(v, n);
        self.bucketize(v, n);
    }

    fn bucketize(&mut self, v: f64, n: i64) {
        let scaled = (v - self.offset) / self.divider;
        let idx = if scaled <= FIRST_VALUE {
            0
        } else if scaled > LAST_VALUE {
            NUM_BUCKETS - 1
        } else {
            // The interval is open on the left, so a value sitting exactly
            // on an integer boundary belongs to the previous bucket; the
            // epsilon test stands in for an exact ceil()-1.
            let mut sv = scaled as i64;
            let delta = scaled - sv as f64;
            if delta < 1e-12 {
                sv -= 1;
            }
            look_up_idx(sv.max(0) as usize)
        };
        self.hdata[idx] += n as i32;
    }

    /// Clears the data, keeping offset and divider.
    pub fn reset(&mut self) {
        self.counter.reset();
        self.hdata = [0; NUM_BUCKETS];
    }

    // Keeps this histogram's own scale: bucket contents are re-recorded at
    // midpoints when the source scale differs.
    fn copy_from(&mut self, src: &Histogram) {
        self.counter = src.counter;
        self.add_bucket_data(src);
    }

    // When scales match buckets add up directly; otherwise each of src's
    // exported buckets is re-recorded at its midpoint under our scale.
    fn add_bucket_data(&mut self, src: &Histogram) {
        if self.divider == src.divider && self.offset == src.offset {
            for i in 0..NUM_BUCKETS {
                self.hdata[i] += src.hdata[i];
            }
            return;
        }
        let data = src.export();
        for b in &data.data {
            self.bucketize((b.start + b.end) / 2., b.count);
        }
    }

    /// Merges the data from `src` into this histogram and clears `src`.
    pub fn transfer(&mut self, src: &mut Histogram) {
        if src.counter.count == 0 {
            return;
        }
        if self.counter.count == 0 {
            self.copy_from(src);
            src.reset();
            return;
        }
        self.add_bucket_data(src);
        self.counter.transfer(&mut src.counter);
        src.reset();
    }

    /// Flattens the histogram into contiguous non-empty export buckets with
    /// cumulative percentages.
    pub fn export(&self) -> HistogramData {
        let mut res = HistogramData {
            count: self.counter.count,
            min: self.counter.min,
            max: self.counter.max,
            sum: self.counter.sum,
            avg: self.counter.avg(),
            std_dev: self.counter.std_dev(),
            data: Vec::new(),
            percentiles: Vec::new(),
        };
        let last_idx = match (0..NUM_BUCKETS).rev().find(|&i| self.hdata[i] > 0) {
            Some(i) => i,
            None => return res,
        };

        // Empty buckets are folded into the next non-empty region so the
        // exported intervals stay contiguous: each end is the next start.
        let mut prev = BUCKET_VALUES[0];
        let mut total = 0i64;
        let overall = self.counter.count as f64;
        for i in 0..=last_idx {
            if self.hdata[i] == 0 {
                continue;
            }
            total += i64::from(self.hdata[i]);
            let start = if res.data.is_empty() {
                self.counter.min
            } else {
                self.divider * prev as f64 + self.offset
            };
            let end = if i < NUM_VALUES {
                let cur = BUCKET_VALUES[i];
                prev = cur;
                self.divider * cur as f64 + self.offset
            } else {
                self.counter.max
            };
            res.data.push(Bucket {
                start,
                end,
                percent: 100. * total as f64 / overall,
                count: i64::from(self.hdata[i]),
            });
        }
        if let Some(last) = res.data.last_mut() {
            last.end = self.counter.max;
        }
        res
    }
}

/// Merge two histograms into a new one. The lowest offset and highest
/// divider win, which can cost resolution when the scales differ.
pub fn merge_histograms(h1: &Histogram, h2: &Histogram) -> Histogram {
    let divider = h1.divider.max(h2.divider);
    let offset = h1.offset.min(h2.offset);
    let mut out = Histogram {
        counter: Counter::default(),
        offset,
        divider,
        hdata: [0; NUM_BUCKETS],
    };
    let mut a = h1.clone();
    let mut b = h2.clone();
    out.transfer(&mut a);
    out.transfer(&mut b);
    out
}

/// One contiguous region of the exported distribution. `percent` is the
/// cumulative fraction of the data at or below `end`, in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bucket {
    pub start: f64,
    pub end: f64,
    pub percent: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Percentile {
    pub percentile: f64,
    pub value: f64,
}

/// Exported histogram: summary stats plus the non-empty buckets covering
/// [min, max], and any requested percentiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistogramData {
    pub count: i64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub avg: f64,
    pub std_dev: f64,
    pub data: Vec<Bucket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub percentiles: Vec<Percentile>,
}

impl HistogramData {
    /// Estimates the value below which `percentile` % of the data falls,
    /// interpolating linearly inside the containing bucket. With 3 points
    /// 10, 20, 30: p0-p33.33 == 10, p66.66 == 20, p50 == 15.
    pub fn calc_percentile(&self, percentile: f64) -> f64 {
        if self.data.is_empty() {
            tracing::error!(percentile, "percentile requested on empty histogram");
            return 0.;
        }
        if percentile >= 100. {
            return self.max;
        }
        // min is at least one point, so it covers the first 1/count %.
        let mut prev_percent = 100. / self.count as f64;
        if percentile <= prev_percent {
            return self.min;
        }
        for b in &self.data {
            if percentile <= b.percent {
                return b.start
                    + (percentile - prev_percent) / (b.percent - prev_percent)
                        * (b.end - b.start);
            }
            prev_percent = b.percent;
        }
        self.max
    }

    /// Computes the requested percentiles and stores them on the export.
    pub fn calc_percentiles(mut self, percentiles: &[f64]) -> HistogramData {
        if self.count == 0 {
            return self;
        }
        for &p in percentiles {
            self.percentiles.push(Percentile {
                percentile: p,
                value: self.calc_percentile(p),
            });
        }
        self
    }
}

/// Parses a comma-separated percentile list; each value must be in (0, 100).
pub fn parse_percentiles(percentiles: &str) -> anyhow::Result<Vec<f64>> {
    let mut res = Vec::new();
    for part in percentiles.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let p: f64 = part
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid percentile {part:?}: {e}"))?;
        if p <= 0. || p >= 100. {
            anyhow::bail!("percentile {p} must be > 0 and < 100");
        }
        res.push(p);
    }
    if res.is_empty() {
        anyhow::bail!("percentile list can't be empty");
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn counter_basics() {
        let mut c = Counter::default();
        assert_close(c.avg(), 0.);
        assert_close(c.std_dev(), 0.);
        c.record(10.);
        c.record(20.);
        c.record(30.);
        assert_eq!(c.count, 3);
        assert_close(c.min, 10.);
        assert_close(c.max, 30.);
        assert_close(c.avg(), 20.);
        // population stddev of {10,20,30}
        assert_close(c.std_dev(), (200.0f64 / 3.).sqrt());
    }

    #[test]
    fn counter_record_n_compound_squares() {
        // n repetitions enter the sum of squares as one compound sample, so
        // three identical values yield a non-zero stddev.
        let mut c = Counter::default();
        c.record_n(2., 3);
        assert_eq!(c.count, 3);
        assert_close(c.sum, 6.);
        assert_close(c.std_dev(), (36. / 3. - 4.0f64).sqrt());
    }

    #[test]
    fn counter_transfer_moves_and_resets() {
        let mut a = Counter::default();
        let mut b = Counter::default();
        a.record(1.);
        b.record(5.);
        b.record(-3.);
        a.transfer(&mut b);
        assert_eq!(a.count, 3);
        assert_close(a.min, -3.);
        assert_close(a.max, 5.);
        assert_eq!(b.count, 0);
        // transferring an empty counter is a no-op
        a.transfer(&mut b);
        assert_eq!(a.count, 3);
    }

    #[test]
    fn histogram_rejects_zero_divider() {
        assert!(Histogram::new(0., 0.).is_err());
    }

    #[test]
    fn histogram_bucket_boundaries() {
        let mut h = Histogram::new(0., 1.).unwrap();
        // exactly on a boundary lands in the bucket ending there
        h.record(1.);
        h.record(10.);
        h.record(10.01);
        h.record(0.);
        h.record(-5.);
        let data = h.export();
        assert_eq!(data.count, 5);
        let counts: i64 = data.data.iter().map(|b| b.count).sum();
        assert_eq!(counts, 5);
        // -5 and 0 share the <= 0 bucket; 10.01 spills past the 10 boundary
        assert_eq!(data.data[0].count, 2);
        assert_close(data.min, -5.);
        assert_close(data.max, 10.01);
    }

    #[test]
    fn histogram_overflow_bucket() {
        let mut h = Histogram::new(0., 1.).unwrap();
        h.record(150_000.);
        h.record(99_999.);
        h.record(100_000.);
        let data = h.export();
        assert_eq!(data.count, 3);
        assert_close(data.max, 150_000.);
        // 99999 and 100000 both fit the last ladder bucket, 150000 overflows
        assert_eq!(data.data.last().unwrap().count, 1);
        assert_close(data.data.last().unwrap().end, 150_000.);
    }

    #[test]
    fn export_contiguity_invariants() {
        let mut h = Histogram::new(0., 1.).unwrap();
        for v in [0.5, 1., 1., 5., 10., 50., 100., 1000.] {
            h.record(v);
        }
        let data = h.export();
        assert_eq!(data.count, 8);
        assert_close(data.min, 0.5);
        assert_close(data.max, 1000.);
        assert_close(data.data[0].start, 0.5);
        assert_close(data.data.last().unwrap().end, 1000.);
        for w in data.data.windows(2) {
            assert_close(w[0].end, w[1].start);
        }
        let last = data.data.last().unwrap();
        assert_close(last.percent, 100.);
    }

    #[test]
    fn percentile_interpolation() {
        // fixed values from a known-good run: {0.5, 1, 1, 5, 10, 50, 100, 1000}
        let mut h = Histogram::new(0., 1.).unwrap();
        for v in [0.5, 1., 1., 5., 10., 50., 100., 1000.] {
            h.record(v);
        }
        let data = h.export();
        let p50 = data.calc_percentile(50.);
        assert!((5. ..=10.).contains(&p50), "p50 = {p50}");
        assert_close(data.calc_percentile(100.), 1000.);
        assert_close(data.calc_percentile(0.1), 0.5);
    }

    #[test]
    fn percentile_monotonicity() {
        let mut h = Histogram::new(0., 0.001).unwrap();
        for i in 0..1000 {
            h.record(i as f64 * 0.0011);
        }
        let data = h.export();
        let mut prev = f64::NEG_INFINITY;
        for p in [1., 10., 25., 50., 75., 90., 99., 99.9] {
            let v = data.calc_percentile(p);
            assert!(v >= prev, "p{p}: {v} < {prev}");
            prev = v;
        }
    }

    #[test]
    fn three_point_interpolation_example() {
        let mut h = Histogram::new(0., 1.).unwrap();
        for v in [10., 20., 30.] {
            h.record(v);
        }
        let data = h.export();
        assert_close(data.calc_percentile(33.), 10.);
        assert_close(data.calc_percentile(50.), 15.);
        assert_close(data.calc_percentile(100.), 30.);
    }

    #[test]
    fn transfer_same_scale() {
        let mut a = Histogram::new(0., 1.).unwrap();
        let mut b = Histogram::new(0., 1.).unwrap();
        a.record(5.);
        b.record(50.);
        b.record(500.);
        a.transfer(&mut b);
        assert_eq!(a.counter.count, 3);
        assert_eq!(b.counter.count, 0);
        let data = a.export();
        assert_eq!(data.data.iter().map(|x| x.count).sum::<i64>(), 3);
    }

    #[test]
    fn merge_associative_on_equal_scales() {
        let mk = |vals: &[f64]| {
            let mut h = Histogram::new(0., 1.).unwrap();
            for &v in vals {
                h.record(v);
            }
            h
        };
        let a = mk(&[1., 2., 3.]);
        let b = mk(&[10., 20.]);
        let c = mk(&[100., 200., 300., 400.]);
        let left = merge_histograms(&merge_histograms(&a, &b), &c);
        let right = merge_histograms(&a, &merge_histograms(&b, &c));
        assert_eq!(left.counter, right.counter);
        assert_eq!(left.hdata, right.hdata);
    }

    #[test]
    fn merge_takes_min_offset_max_divider() {
        let mut a = Histogram::new(0., 1.).unwrap();
        let mut b = Histogram::new(-5., 10.).unwrap();
        a.record(3.);
        b.record(30.);
        let m = merge_histograms(&a, &b);
        assert_close(m.offset(), -5.);
        assert_close(m.divider(), 10.);
        assert_eq!(m.counter.count, 2);
    }

    #[test]
    fn lookup_table_matches_linear_scan() {
        // The O(1) table and the tail scan must agree on every boundary.
        for v in 0..MAX_ARRAY_VALUE {
            let idx = look_up_idx(v);
            assert!(BUCKET_VALUES[idx] as usize > v, "v={v} idx={idx}");
            if idx > 0 {
                assert!(BUCKET_VALUES[idx - 1] as usize <= v);
            }
        }
    }

    #[test]
    fn parse_percentiles_validates() {
        assert_eq!(parse_percentiles("50,90, 99.9").unwrap(), vec![50., 90., 99.9]);
        assert!(parse_percentiles("0").is_err());
        assert!(parse_percentiles("100").is_err());
        assert!(parse_percentiles("").is_err());
        assert!(parse_percentiles("abc").is_err());
    }

    #[test]
    fn export_serializes_pascal_case() {
        let mut h = Histogram::new(0., 1.).unwrap();
        h.record(1.);
        let json = serde_json::to_string(&h.export().calc_percentiles(&[50.])).unwrap();
        assert!(json.contains("\"Count\":1"));
        assert!(json.contains("\"Percentiles\""));
        assert!(json.contains("\"Start\""));
    }
}
