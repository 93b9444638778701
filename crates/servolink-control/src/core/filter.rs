use std::collections::{BTreeMap, HashMap, VecDeque};

/// Median smoothing over per-channel action streams.
///
/// Each channel keeps a bounded FIFO of the last `window_size` values; the
/// filtered value is the running median, optionally blended with the
/// previous output. Channels absent from an incoming map are dropped and
/// forgotten.
pub struct MedianActionFilter {
    window_size: usize,
    blend_alpha: f64,
    histories: HashMap<String, VecDeque<f64>>,
    outputs: HashMap<String, f64>,
}

impl MedianActionFilter {
    pub fn new(window_size: usize, blend_alpha: f64) -> Self {
        Self {
            window_size: window_size.max(1),
            blend_alpha: blend_alpha.clamp(0.0, 1.0),
            histories: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    pub fn apply(
        &mut self,
        actions: &BTreeMap<String, f64>,
    ) -> BTreeMap<String, f64> {
        self.histories.retain(|key, _| actions.contains_key(key));
        self.outputs.retain(|key, _| actions.contains_key(key));

        let mut filtered = BTreeMap::new();
        for (key, value) in actions {
            let history = self.histories.entry(key.clone()).or_default();
            history.push_back(*value);
            while history.len() > self.window_size {
                history.pop_front();
            }

            let median = running_median(history);
            let output = match self.outputs.get(key) {
                Some(previous) => {
                    (1.0 - self.blend_alpha) * previous
                        + self.blend_alpha * median
                }
                None => median,
            };
            self.outputs.insert(key.clone(), output);
            filtered.insert(key.clone(), output);
        }
        filtered
    }
}

fn running_median(history: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = history.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::MedianActionFilter;

    fn action(value: f64) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), value);
        map
    }

    #[test]
    fn unit_window_full_alpha_is_identity() {
        let mut filter = MedianActionFilter::new(1, 1.0);
        for value in [0.0, 1.0, -3.5, 42.0] {
            let out = filter.apply(&action(value));
            assert_eq!(out.get("a"), Some(&value));
        }
    }

    #[test]
    fn median_suppresses_a_spike() {
        let mut filter = MedianActionFilter::new(3, 1.0);
        filter.apply(&action(1.0));
        filter.apply(&action(1.0));
        // A single outlier never wins a 3-wide median.
        let out = filter.apply(&action(100.0));
        assert_eq!(out.get("a"), Some(&1.0));
    }

    #[test]
    fn blending_tracks_previous_output() {
        let mut filter = MedianActionFilter::new(1, 0.5);
        let first = filter.apply(&action(2.0));
        // First sample initialises the output to the median itself.
        assert_eq!(first.get("a"), Some(&2.0));
        let second = filter.apply(&action(4.0));
        assert_eq!(second.get("a"), Some(&3.0));
    }

    #[test]
    fn absent_keys_are_dropped_and_forgotten() {
        let mut filter = MedianActionFilter::new(3, 1.0);
        filter.apply(&action(5.0));

        let mut other = BTreeMap::new();
        other.insert("b".to_string(), 1.0);
        let out = filter.apply(&other);
        assert!(!out.contains_key("a"));

        // "a" restarts from scratch: its old history is gone.
        let out = filter.apply(&action(9.0));
        assert_eq!(out.get("a"), Some(&9.0));
    }

    #[test]
    fn even_window_averages_the_middle_pair() {
        let mut filter = MedianActionFilter::new(2, 1.0);
        filter.apply(&action(1.0));
        let out = filter.apply(&action(2.0));
        assert_eq!(out.get("a"), Some(&1.5));
    }
}
