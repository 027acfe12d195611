use pumpflow_support::config::BackpressureThresholds;

/// What [`BackpressureController::decide`] told the caller to do after the
/// most recent batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ShrinkBatch { to_batch: usize },
    ShrinkWorkers { to_workers: usize },
    Recover,
    None,
}

/// Tracks the live `(batch_size, workers)` state for one file's worth of
/// COPY batches and decides how to adjust it after every batch, per the
/// congestion-response policy this is grounded on.
pub struct BackpressureController {
    batch_size: usize,
    workers: usize,
    thresholds: BackpressureThresholds,
}

impl BackpressureController {
    pub fn new(batch_size: usize, workers: usize, thresholds: BackpressureThresholds) -> Self {
        Self { batch_size, workers, thresholds }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Congestion (`p95 > p95_ms` or `fail_rate > fail_rate`) first halves
    /// `batch_size` (floored at `min_batch`); only once batch size can no
    /// longer shrink does it decrement `workers` (floored at `min_workers`).
    /// Outside congestion, signals `Recover` — reinflating batch size or
    /// worker count is the caller's decision, never automatic here.
    pub fn decide(&mut self, p95_ms: u64, fail_rate: f64) -> Action {
        let congested = p95_ms > self.thresholds.p95_ms || fail_rate > self.thresholds.fail_rate;
        if !congested {
            return Action::Recover;
        }

        let to_batch = self.thresholds.min_batch.max(self.batch_size / 2);
        if to_batch < self.batch_size {
            self.batch_size = to_batch;
            return Action::ShrinkBatch { to_batch };
        }

        if self.workers > self.thresholds.min_workers {
            let to_workers = self.thresholds.min_workers.max(self.workers - 1);
            if to_workers < self.workers {
                self.workers = to_workers;
                return Action::ShrinkWorkers { to_workers };
            }
        }

        Action::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> BackpressureThresholds {
        BackpressureThresholds { p95_ms: 2_000, fail_rate: 0.01, min_batch: 1_000, min_workers: 1 }
    }

    #[test]
    fn shrinks_batch_before_workers_under_congestion() {
        let mut ctl = BackpressureController::new(4_000, 4, thresholds());
        assert_eq!(ctl.decide(2_500, 0.0), Action::ShrinkBatch { to_batch: 2_000 });
        assert_eq!(ctl.decide(2_700, 0.0), Action::ShrinkBatch { to_batch: 1_000 });
        // batch size is now floored at min_batch; next congestion shrinks workers.
        assert_eq!(ctl.decide(2_800, 0.0), Action::ShrinkWorkers { to_workers: 3 });
    }

    #[test]
    fn scenario_batch_costs_shrink_then_hold_at_min_batch() {
        // Mirrors the documented batch-cost sequence with workers already
        // at their floor: only two shrinks happen, then `None` forever.
        let mut ctl = BackpressureController::new(4_000, 1, thresholds());
        let costs = [500u64, 900, 2500, 2700, 2800];
        let actions: Vec<Action> = costs.iter().map(|&c| ctl.decide(c, 0.0)).collect();
        assert_eq!(
            actions,
            vec![
                Action::Recover,
                Action::Recover,
                Action::ShrinkBatch { to_batch: 2_000 },
                Action::ShrinkBatch { to_batch: 1_000 },
                Action::None,
            ]
        );
    }

    #[test]
    fn recovers_when_not_congested() {
        let mut ctl = BackpressureController::new(4_000, 4, thresholds());
        assert_eq!(ctl.decide(500, 0.0), Action::Recover);
    }

    #[test]
    fn batch_size_never_drops_below_min_batch() {
        let mut ctl = BackpressureController::new(1_500, 1, thresholds());
        assert_eq!(ctl.decide(2_500, 0.0), Action::ShrinkBatch { to_batch: 1_000 });
        assert_eq!(ctl.decide(2_500, 0.0), Action::None);
        assert_eq!(ctl.batch_size(), 1_000);
    }
}
