use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::EventSink;

/// Engine wide freeze flag.
///
/// While frozen, pausable sinks (timestamp buffer, histograms, hg2) receive no
/// events, so several reads return data of the same accumulation interval.
/// Coincidence counters keep running.
#[derive(Clone, Default)]
pub struct FreezeController {
    frozen: Arc<AtomicBool>,
}

impl FreezeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freeze(&self, freeze: bool) {
        let was = self.frozen.swap(freeze, Ordering::SeqCst);
        if was != freeze {
            debug!("buffers {}", if freeze { "frozen" } else { "released" });
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// If `sink` takes events right now.
    #[inline]
    pub fn admits(&self, sink: &dyn EventSink) -> bool {
        !(sink.pausable() && self.is_frozen())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdc_tools::coincidence::CoincidenceCounter;
    use crate::tdc_tools::startstop::HistogramEngine;

    #[test]
    fn gates_pausable_sinks_only() {
        let freeze = FreezeController::new();
        let histograms = HistogramEngine::new();
        let coincidences = CoincidenceCounter::new();
        assert!(freeze.admits(&histograms));

        let shared = freeze.clone();
        shared.freeze(true);
        assert!(freeze.is_frozen());
        assert!(!freeze.admits(&histograms));
        assert!(freeze.admits(&coincidences));

        freeze.freeze(false);
        assert!(freeze.admits(&histograms));
    }
}
