//! Incremental detokenization helpers.

/// Suffix of `current` that extends `previous`.
///
/// Re-decoding the full token list can change earlier characters (merged
/// multi-byte sequences), so fall back to the longest common char prefix.
pub fn text_delta(previous: &str, current: &str) -> String {
    if let Some(delta) = current.strip_prefix(previous) {
        return delta.to_string();
    }
    let common = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .count();
    current.chars().skip(common).collect()
}

/// Holds back text that might be the start of a stop sequence.
#[derive(Debug, Default)]
pub struct StopSequenceFilter {
    stops: Vec<String>,
    pending: String,
    stopped: bool,
}

impl StopSequenceFilter {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
            stopped: false,
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Feed a fragment; returns text that is safe to emit now.
    pub fn push(&mut self, fragment: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.pending.push_str(fragment);

        let earliest = self
            .stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()))
            .min();
        if let Some(pos) = earliest {
            self.stopped = true;
            let out = self.pending[..pos].to_string();
            self.pending.clear();
            return out;
        }

        let hold = self.held_suffix_len();
        let cut = self.pending.len() - hold;
        let out = self.pending[..cut].to_string();
        self.pending.drain(..cut);
        out
    }

    /// Release whatever is still held back once generation ends.
    pub fn finish(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }

    // Longest suffix of `pending` that is a proper prefix of some stop sequence.
    fn held_suffix_len(&self) -> usize {
        let mut best = 0;
        for (start, _) in self.pending.char_indices() {
            let suffix = &self.pending[start..];
            if self
                .stops
                .iter()
                .any(|stop| stop.len() > suffix.len() && stop.starts_with(suffix))
            {
                best = best.max(suffix.len());
            }
        }
        best
    }
}
