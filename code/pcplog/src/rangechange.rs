/// Widen counters that the collector stores in registers narrower than 64 bits.
///
/// For a metric configured with a width of `bits`, the first observation is emitted unchanged and
/// remembered; after that each observation `v` adds `(v - last) mod 2^bits` to an accumulator and
/// the accumulator is emitted in its place.  Wraps are found arithmetically only; raw values are
/// never assumed to increase.  A step where the metric has no instances is skipped and leaves the
/// state alone.
///
use anyhow::{bail, Result};
use std::collections::HashMap;
use summutils::{ClassifiedError, ProcessingError};
use ustr::Ustr;

#[derive(Clone, Debug)]
struct Fixup {
    modulus: f64,
    accumulator: Option<Vec<f64>>,
    last: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct RangeChange {
    normalization: HashMap<String, u32>,
    metrics: Vec<Ustr>,
    fixups: Vec<Option<Fixup>>,
    passthrough: bool,
}

impl RangeChange {
    pub fn new(normalization: HashMap<String, u32>) -> RangeChange {
        RangeChange {
            normalization,
            metrics: vec![],
            fixups: vec![],
            passthrough: true,
        }
    }

    /// Bind to the metrics, in the order samples will present them, and reset all state.

    pub fn set_fetched_metrics(&mut self, metrics: &[Ustr]) {
        self.metrics = metrics.to_vec();
        self.fixups = metrics
            .iter()
            .map(|m| {
                self.normalization.get(m.as_str()).map(|bits| Fixup {
                    modulus: 2f64.powi(*bits as i32),
                    accumulator: None,
                    last: vec![],
                })
            })
            .collect::<Vec<Option<Fixup>>>();
        self.passthrough = self.fixups.iter().all(|f| f.is_none());
    }

    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn needs_fixup(&self, index: usize) -> bool {
        matches!(self.fixups.get(index), Some(Some(_)))
    }

    /// Rewrite the sample in place.  `data[i]` holds the instances of the i'th bound metric.

    pub fn normalise_data(&mut self, data: &mut [Vec<f64>]) -> Result<()> {
        if self.passthrough {
            return Ok(());
        }
        if data.len() != self.fixups.len() {
            bail!("Expected {} metrics in sample, got {}", self.fixups.len(), data.len());
        }
        for (i, datum) in data.iter_mut().enumerate() {
            let Some(fixup) = &mut self.fixups[i] else {
                continue;
            };
            if datum.is_empty() {
                continue;
            }
            match &mut fixup.accumulator {
                None => {
                    fixup.accumulator = Some(datum.clone());
                    fixup.last = datum.clone();
                }
                Some(acc) => {
                    if acc.len() != datum.len() {
                        return Err(ClassifiedError::new(
                            ProcessingError::IndomChanged,
                            format!(
                                "{} went from {} to {} instances",
                                self.metrics[i],
                                acc.len(),
                                datum.len()
                            ),
                        )
                        .into());
                    }
                    for k in 0..datum.len() {
                        acc[k] += (datum[k] - fixup.last[k]).rem_euclid(fixup.modulus);
                        fixup.last[k] = datum[k];
                        datum[k] = acc[k];
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
fn counter_fixup(bits: u32) -> RangeChange {
    let mut norm = HashMap::new();
    norm.insert("network.interface.in.bytes".to_string(), bits);
    let mut rc = RangeChange::new(norm);
    rc.set_fetched_metrics(&[Ustr::from("kernel.all.load"), Ustr::from("network.interface.in.bytes")]);
    rc
}

#[test]
fn test_passthrough() {
    let mut rc = RangeChange::new(HashMap::new());
    rc.set_fetched_metrics(&[Ustr::from("kernel.all.load")]);
    assert!(rc.passthrough());
    let mut data = vec![vec![1.0, 2.0]];
    rc.normalise_data(&mut data).unwrap();
    assert!(data == vec![vec![1.0, 2.0]]);

    let rc = counter_fixup(32);
    assert!(!rc.passthrough());
    assert!(!rc.needs_fixup(0));
    assert!(rc.needs_fixup(1));
}

#[test]
fn test_wraparound_sequence() {
    let two32 = 4294967296.0;
    let mut rc = counter_fixup(32);
    let input = [0.0, two32 - 5.0, two32 - 3.0, 4.0, 10.0];
    let expect = [0.0, two32 - 5.0, two32 - 3.0, two32 + 4.0, two32 + 10.0];
    for (raw, want) in input.iter().zip(expect.iter()) {
        let mut data = vec![vec![0.5], vec![*raw]];
        rc.normalise_data(&mut data).unwrap();
        assert!(data[0] == vec![0.5]);
        assert!(data[1] == vec![*want]);
    }
}

#[test]
fn test_restores_truncated_counter() {
    let two32 = 4294967296.0f64;
    // A true 64-bit counter with irregular steps, some larger than half the register.
    let mut truth = vec![123456789.0f64];
    for (k, step) in [1e9, 3.9e9, 17.0, 0.0, 4.2e9, 2.5e9, 1.0].iter().enumerate() {
        truth.push(truth[k] + step);
    }
    let mut rc = counter_fixup(32);
    for s in &truth {
        let mut data = vec![vec![], vec![s.rem_euclid(two32), s.rem_euclid(two32)]];
        rc.normalise_data(&mut data).unwrap();
        let restored = data[1][0] - truth[0].rem_euclid(two32);
        assert!(restored == s - truth[0]);
        assert!(data[1][0] == data[1][1]);
    }
}

#[test]
fn test_empty_sample_keeps_state() {
    let mut rc = counter_fixup(32);
    let mut data = vec![vec![1.0], vec![100.0]];
    rc.normalise_data(&mut data).unwrap();
    let before = format!("{:?}", rc);
    let mut empty: Vec<Vec<f64>> = vec![vec![], vec![]];
    rc.normalise_data(&mut empty).unwrap();
    assert!(empty == vec![Vec::<f64>::new(), vec![]]);
    assert!(format!("{:?}", rc) == before);
    let mut data = vec![vec![1.0], vec![150.0]];
    rc.normalise_data(&mut data).unwrap();
    assert!(data[1] == vec![150.0]);
}

#[test]
fn test_instance_change() {
    let mut rc = counter_fixup(32);
    rc.normalise_data(&mut vec![vec![], vec![1.0, 2.0]]).unwrap();
    let err = rc.normalise_data(&mut vec![vec![], vec![1.0]]).unwrap_err();
    assert!(summutils::classify(&err) == ProcessingError::IndomChanged);
    assert!(rc.normalise_data(&mut vec![Vec::<f64>::new()]).is_err());
}
