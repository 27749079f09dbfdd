/// Keeps a bounded subset of the (time, value) points of one series per host.
///
/// The first LEAD_IN_DATAPOINTS + 1 points of every host are always kept.  When the first host gets
/// past them, the spacing of its lead-in fixes a sample window such that the rest of the job fits in
/// the remaining budget, and from then on a point is kept only if it is at least one window after
/// the previous kept point, or falls in the lead-out period at the end of the job.  No host keeps
/// more than MAX_DATAPOINTS points.
///
pub const MAX_DATAPOINTS: usize = 100;
pub const LEAD_IN_DATAPOINTS: usize = 10;

pub struct TimeseriesAccumulator {
    totaltime: f64,
    samplewindow: Option<f64>,
    leadout: f64,
    data: Vec<Vec<(f64, f64)>>,
}

impl TimeseriesAccumulator {
    pub fn new(nhosts: usize, totaltime: f64) -> TimeseriesAccumulator {
        TimeseriesAccumulator {
            totaltime,
            samplewindow: None,
            leadout: 0.0,
            data: vec![vec![]; nhosts],
        }
    }

    /// Offer a point; returns the index it was stored at, if it was kept.

    pub fn add_data(&mut self, host: usize, timestamp: f64, value: f64) -> Option<usize> {
        if host >= self.data.len() {
            self.data.resize(host + 1, vec![]);
        }
        let count = self.data[host].len();
        if count <= LEAD_IN_DATAPOINTS {
            return Some(self.append(host, timestamp, value));
        }

        let series = &self.data[host];
        let window = match self.samplewindow {
            Some(w) => w,
            None => {
                let leadin = series[LEAD_IN_DATAPOINTS].0 - series[0].0;
                let w = (self.totaltime - 2.0 * leadin)
                    / (MAX_DATAPOINTS - 2 * LEAD_IN_DATAPOINTS) as f64;
                self.samplewindow = Some(w);
                self.leadout = series[0].0 + self.totaltime - leadin;
                w
            }
        };

        let last = self.data[host][count - 1].0;
        if (timestamp > self.leadout || timestamp > last + window) && count < MAX_DATAPOINTS {
            return Some(self.append(host, timestamp, value));
        }
        None
    }

    fn append(&mut self, host: usize, timestamp: f64, value: f64) -> usize {
        self.data[host].push((timestamp, value));
        self.data[host].len() - 1
    }

    pub fn host(&self, host: usize) -> &[(f64, f64)] {
        match self.data.get(host) {
            Some(series) => series,
            None => &[],
        }
    }

    pub fn nhosts(&self) -> usize {
        self.data.len()
    }

    /// Every host's series, truncated to the length of the shortest.

    pub fn get(&self) -> Vec<&[(f64, f64)]> {
        let n = self.data.iter().map(|s| s.len()).min().unwrap_or(0);
        self.data.iter().map(|s| &s[..n]).collect::<Vec<&[(f64, f64)]>>()
    }
}

#[test]
fn test_lead_in_is_kept() {
    let mut acc = TimeseriesAccumulator::new(2, 600.0);
    for k in 0..=LEAD_IN_DATAPOINTS {
        assert!(acc.add_data(0, k as f64, 1.0) == Some(k));
    }
    assert!(acc.host(0).len() == LEAD_IN_DATAPOINTS + 1);
    assert!(acc.host(1).is_empty());
    assert!(acc.get().iter().all(|s| s.is_empty()));
}

#[test]
fn test_subsampling_is_bounded() {
    // One point a second for a day.
    let total = 86400.0;
    let mut acc = TimeseriesAccumulator::new(1, total);
    let mut kept = vec![];
    for t in 0..86400 {
        if let Some(i) = acc.add_data(0, t as f64, t as f64) {
            kept.push(i);
        }
    }
    let series = acc.host(0);
    assert!(series.len() > 90 && series.len() <= MAX_DATAPOINTS);
    assert!(kept == (0..series.len()).collect::<Vec<usize>>());
    assert!(series.windows(2).all(|w| w[0].0 < w[1].0));

    // Between lead-in and lead-out, points are at least a window apart.
    let window = (total - 20.0) / 80.0;
    let leadout = total - 10.0;
    assert!(series[LEAD_IN_DATAPOINTS..]
        .windows(2)
        .filter(|w| w[1].0 <= leadout)
        .all(|w| w[1].0 - w[0].0 >= window));
    assert!(series.last().unwrap().0 > leadout);

    // A series that runs past the expected end is cut off at the cap.
    let mut acc = TimeseriesAccumulator::new(1, 200.0);
    for t in 0..1000 {
        acc.add_data(0, t as f64, 0.0);
    }
    assert!(acc.host(0).len() == MAX_DATAPOINTS);
}

#[test]
fn test_get_truncates_to_shortest() {
    let mut acc = TimeseriesAccumulator::new(2, 600.0);
    for t in 0..5 {
        acc.add_data(0, t as f64, 0.0);
    }
    for t in 0..3 {
        acc.add_data(1, t as f64, 0.0);
    }
    let all = acc.get();
    assert!(all.len() == 2);
    assert!(all[0].len() == 3 && all[1].len() == 3);
    assert!(acc.nhosts() == 2);
}
