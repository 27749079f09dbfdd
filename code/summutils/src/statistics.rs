// Summary statistics: a one-pass accumulator for unbounded sample streams, a batch description of a
// materialized vector, and a time integrator for piecewise-constant signals.

use anyhow::{bail, Result};
use serde::Serialize;

/// Welford's method (B. P. Welford, Technometrics 4:3, 1962).  Values are appended one at a time
/// and never stored.

#[derive(Clone, Debug)]
pub struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RollingSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub cnt: u64,
    pub std: f64,
}

impl RollingStats {
    pub fn new() -> RollingStats {
        RollingStats {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn append(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn cov(&self) -> Option<f64> {
        if self.count > 0 && self.mean > 0.0 {
            Some(self.std() / self.mean)
        } else {
            None
        }
    }

    // min and max are reported as zero before the first append.

    pub fn min(&self) -> f64 {
        if self.count > 0 { self.min } else { 0.0 }
    }

    pub fn max(&self) -> f64 {
        if self.count > 0 { self.max } else { 0.0 }
    }

    pub fn get(&self) -> RollingSummary {
        RollingSummary {
            avg: self.mean(),
            min: self.min(),
            max: self.max(),
            cnt: self.count,
            std: self.std(),
        }
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        RollingStats::new()
    }
}

/// The two shapes of `describe`.  A vector whose values are all equal only gets its average and
/// count; consumers must accept either shape.

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Description {
    Empty {},
    Constant {
        avg: f64,
        cnt: usize,
    },
    Full {
        avg: f64,
        min: f64,
        max: f64,
        cnt: usize,
        med: f64,
        std: f64,
        skw: f64,
        krt: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        cov: Option<f64>,
    },
}

impl Description {
    pub fn avg(&self) -> Option<f64> {
        match self {
            Description::Empty {} => None,
            Description::Constant { avg, .. } | Description::Full { avg, .. } => Some(*avg),
        }
    }

    pub fn cnt(&self) -> usize {
        match self {
            Description::Empty {} => 0,
            Description::Constant { cnt, .. } | Description::Full { cnt, .. } => *cnt,
        }
    }
}

/// Batch statistics over `v`.  `std` is the sample standard deviation (n-1 in the denominator);
/// `skw` and `krt` are the population skewness and excess (Fisher) kurtosis; `cov` is `std/avg` and
/// present only when the average is positive.

pub fn describe(v: &[f64]) -> Description {
    if v.is_empty() {
        return Description::Empty {};
    }
    let n = v.len();
    let first = v[0];
    if v.iter().all(|x| *x == first) {
        return Description::Constant { avg: first, cnt: n };
    }

    let nf = n as f64;
    let avg = v.iter().sum::<f64>() / nf;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    for x in v {
        min = min.min(*x);
        max = max.max(*x);
        let d = x - avg;
        let d2 = d * d;
        m2 += d2;
        m3 += d2 * d;
        m4 += d2 * d2;
    }
    let std = (m2 / (nf - 1.0)).sqrt();
    let (pm2, pm3, pm4) = (m2 / nf, m3 / nf, m4 / nf);
    let skw = pm3 / pm2.powf(1.5);
    let krt = pm4 / (pm2 * pm2) - 3.0;

    Description::Full {
        avg,
        min,
        max,
        cnt: n,
        med: median(v),
        std,
        skw,
        krt,
        cov: if avg > 0.0 { Some(std / avg) } else { None },
    }
}

fn median(v: &[f64]) -> f64 {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Accumulates the area under a piecewise-constant function: each `add(x, y)` contributes
/// `y * (x - x0)` where `x0` is the previous abscissa.

#[derive(Clone, Debug)]
pub struct Integrator {
    x0: f64,
    total: f64,
    elapsed: f64,
}

impl Integrator {
    pub fn new(x0: f64) -> Integrator {
        Integrator {
            x0,
            total: 0.0,
            elapsed: 0.0,
        }
    }

    // The state is untouched when x moves backwards.

    pub fn add(&mut self, x: f64, y: f64) -> Result<()> {
        if x < self.x0 {
            bail!("Integrator abscissa moved backwards: {x} < {}", self.x0);
        }
        let delta = x - self.x0;
        self.total += y * delta;
        self.elapsed += delta;
        self.x0 = x;
        Ok(())
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn mean(&self) -> Option<f64> {
        if self.elapsed > 0.0 {
            Some(self.total / self.elapsed)
        } else {
            None
        }
    }
}

#[cfg(test)]
fn close(a: f64, b: f64, scale: f64) -> bool {
    (a - b).abs() <= 8.0 * f64::EPSILON * scale.max(1.0)
}

#[test]
fn test_welford_matches_describe() {
    let inputs: Vec<Vec<f64>> = vec![
        vec![0.1, 0.2, 0.3, 0.4, 0.4, 0.5, 0.1, 0.4],
        vec![1.0, 2.0, 3.0],
        vec![-5.0, 1e6, 3.25, 17.0, 17.0, -2.5],
        vec![4.0, 4.0, 4.0, 9.0],
    ];
    for v in inputs {
        let mut rs = RollingStats::new();
        for x in &v {
            rs.append(*x);
        }
        let scale = v.iter().fold(0.0f64, |m, x| m.max(x.abs()));
        match describe(&v) {
            Description::Full { avg, min, max, cnt, std, .. } => {
                assert!(close(rs.mean(), avg, scale));
                assert!(close(rs.variance(), std * std, scale * scale));
                assert!(rs.min() == min);
                assert!(rs.max() == max);
                assert!(rs.count() as usize == cnt);
            }
            _ => panic!("expected full description"),
        }
    }
}

#[test]
fn test_rolling_single_and_empty() {
    let mut rs = RollingStats::new();
    assert!(rs.get() == RollingSummary { avg: 0.0, min: 0.0, max: 0.0, cnt: 0, std: 0.0 });
    rs.append(7.5);
    assert!(rs.get() == RollingSummary { avg: 7.5, min: 7.5, max: 7.5, cnt: 1, std: 0.0 });
    assert!(rs.cov() == Some(0.0));
}

#[test]
fn test_describe_shapes() {
    assert!(describe(&[]) == Description::Empty {});
    assert!(describe(&[7.0]) == Description::Constant { avg: 7.0, cnt: 1 });
    assert!(describe(&[3.0, 3.0, 3.0]) == Description::Constant { avg: 3.0, cnt: 3 });
    assert!(serde_json::to_string(&describe(&[3.0, 3.0, 3.0])).unwrap() == r#"{"avg":3.0,"cnt":3}"#);
    assert!(serde_json::to_string(&describe(&[])).unwrap() == "{}");
    match describe(&[1.0, 2.0, 3.0]) {
        Description::Full { avg, min, max, cnt, med, std, skw, krt, cov } => {
            assert!(avg == 2.0);
            assert!(min == 1.0);
            assert!(max == 3.0);
            assert!(cnt == 3);
            assert!(med == 2.0);
            assert!(std == 1.0);
            assert!(skw == 0.0);
            assert!(close(krt, -1.5, 1.0));
            assert!(cov == Some(0.5));
        }
        _ => panic!("expected full description"),
    }
}

#[test]
fn test_describe_median_and_cov() {
    match describe(&[4.0, -1.0, 2.0, 1.0]) {
        Description::Full { med, cov, .. } => {
            assert!(med == 1.5);
            assert!(cov.is_some());
        }
        _ => panic!("expected full description"),
    }
    match describe(&[-4.0, -2.0]) {
        Description::Full { cov, .. } => assert!(cov.is_none()),
        _ => panic!("expected full description"),
    }
}

#[test]
fn test_integrator_constant() {
    let mut integ = Integrator::new(100.0);
    for x in [110.0, 125.0, 125.0, 190.5, 200.0] {
        integ.add(x, 3.5).unwrap();
    }
    assert!(integ.elapsed() == 100.0);
    assert!(integ.total() == 3.5 * integ.elapsed());
    assert!(integ.mean() == Some(3.5));
}

#[test]
fn test_integrator_rejects_backwards() {
    let mut integ = Integrator::new(10.0);
    integ.add(20.0, 2.0).unwrap();
    assert!(integ.add(15.0, 2.0).is_err());
    assert!(integ.total() == 20.0);
    assert!(integ.elapsed() == 10.0);
    assert!(Integrator::new(0.0).mean().is_none());
}
