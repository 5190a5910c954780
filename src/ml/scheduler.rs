// ============================================================
// Layer 5 — Learning-Rate Schedules
// ============================================================
// The learning rate is recomputed once per epoch, after
// validation, and passed to every optimizer step of the next
// epoch.
//
//   constant  lr = base
//   step      lr = base · gamma^⌊epoch / step_size⌋
//   cosine    lr = eta_min + (base − eta_min)·(1 + cos(π·t / T_max)) / 2
//   plateau   lr ← max(lr · factor, min_lr) once validation loss
//             has not improved for more than `patience` epochs
//
// Plateau uses a relative threshold: an epoch counts as better
// only if val_loss < best · (1 − 1e-4).
//
// Reference: Loshchilov & Hutter (2017) SGDR

use std::f64::consts::PI;

use crate::config::{Hyperparameters, SchedulerKind};

pub const PLATEAU_PATIENCE:  usize = 5;
pub const PLATEAU_THRESHOLD: f64   = 1e-4;

#[derive(Debug, Clone, PartialEq)]
pub enum LrScheduler {
    Constant {
        lr: f64,
    },
    Step {
        base:      f64,
        step_size: usize,
        gamma:     f64,
        epochs:    usize,
    },
    Cosine {
        base:    f64,
        eta_min: f64,
        t_max:   usize,
        epochs:  usize,
    },
    Plateau {
        lr:         f64,
        factor:     f64,
        min_lr:     f64,
        patience:   usize,
        best:       f64,
        bad_epochs: usize,
    },
}

impl LrScheduler {
    pub fn from_hyperparameters(hp: &Hyperparameters) -> Self {
        let base = hp.learning_rate;
        if !hp.use_scheduler {
            return Self::Constant { lr: base };
        }
        match hp.scheduler_type {
            SchedulerKind::Step => Self::Step {
                base,
                step_size: hp.step_size.max(1),
                gamma:     hp.gamma,
                epochs:    0,
            },
            SchedulerKind::Cosine => Self::Cosine {
                base,
                eta_min: hp.min_lr,
                t_max:   hp.num_epochs.max(1),
                epochs:  0,
            },
            SchedulerKind::Plateau => Self::Plateau {
                lr:         base,
                factor:     hp.gamma,
                min_lr:     hp.min_lr,
                patience:   PLATEAU_PATIENCE,
                best:       f64::INFINITY,
                bad_epochs: 0,
            },
        }
    }

    /// Learning rate to use for the current epoch.
    pub fn lr(&self) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::Step { base, step_size, gamma, epochs } => {
                base * gamma.powi((epochs / step_size) as i32)
            }
            Self::Cosine { base, eta_min, t_max, epochs } => {
                let t = (*epochs).min(*t_max) as f64;
                eta_min + (base - eta_min) * (1.0 + (PI * t / *t_max as f64).cos()) / 2.0
            }
            Self::Plateau { lr, .. } => *lr,
        }
    }

    /// Advance one epoch. `val_loss` only matters for plateau.
    pub fn step(&mut self, val_loss: f64) {
        match self {
            Self::Constant { .. } => {}
            Self::Step { epochs, .. } | Self::Cosine { epochs, .. } => *epochs += 1,
            Self::Plateau { lr, factor, min_lr, patience, best, bad_epochs } => {
                if val_loss < *best * (1.0 - PLATEAU_THRESHOLD) {
                    *best       = val_loss;
                    *bad_epochs = 0;
                } else {
                    *bad_epochs += 1;
                }
                if *bad_epochs > *patience {
                    let reduced = (*lr * *factor).max(*min_lr);
                    if reduced < *lr {
                        tracing::info!("Plateau: reducing learning rate {:.2e} → {:.2e}", lr, reduced);
                    }
                    *lr         = reduced;
                    *bad_epochs = 0;
                }
            }
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn hp(kind: SchedulerKind) -> Hyperparameters {
        Hyperparameters {
            learning_rate:  0.1,
            scheduler_type: kind,
            step_size:      2,
            gamma:          0.5,
            min_lr:         0.0,
            num_epochs:     4,
            ..Hyperparameters::default()
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_disabled_is_constant() {
        let mut s = LrScheduler::from_hyperparameters(&Hyperparameters {
            use_scheduler: false,
            ..hp(SchedulerKind::Step)
        });
        for _ in 0..10 { s.step(1.0); }
        assert!(close(s.lr(), 0.1));
    }

    #[test]
    fn test_step_decay() {
        let mut s = LrScheduler::from_hyperparameters(&hp(SchedulerKind::Step));
        let mut lrs = vec![s.lr()];
        for _ in 0..4 {
            s.step(0.0);
            lrs.push(s.lr());
        }
        let expected = [0.1, 0.1, 0.05, 0.05, 0.025];
        assert!(lrs.iter().zip(expected).all(|(a, b)| close(*a, b)), "{lrs:?}");
    }

    #[test]
    fn test_cosine_reaches_eta_min() {
        let mut s = LrScheduler::from_hyperparameters(&hp(SchedulerKind::Cosine));
        s.step(0.0);
        s.step(0.0);
        // halfway: (1 + cos(π/2)) / 2 = 0.5
        assert!(close(s.lr(), 0.05));
        s.step(0.0);
        s.step(0.0);
        assert!(s.lr().abs() < 1e-12);
    }

    #[test]
    fn test_plateau_waits_for_patience() {
        let mut s = LrScheduler::from_hyperparameters(&hp(SchedulerKind::Plateau));
        s.step(1.0); // first value is always an improvement
        for _ in 0..PLATEAU_PATIENCE {
            s.step(1.0);
            assert!(close(s.lr(), 0.1));
        }
        s.step(1.0);
        assert!(close(s.lr(), 0.05));
    }

    #[test]
    fn test_plateau_tiny_improvement_does_not_count() {
        let mut s = LrScheduler::from_hyperparameters(&hp(SchedulerKind::Plateau));
        s.step(1.0);
        for _ in 0..=PLATEAU_PATIENCE {
            s.step(1.0 - 1e-6);
        }
        assert!(close(s.lr(), 0.05));
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let mut s = LrScheduler::from_hyperparameters(&Hyperparameters {
            min_lr: 0.08,
            ..hp(SchedulerKind::Plateau)
        });
        for _ in 0..20 { s.step(1.0); }
        assert!(close(s.lr(), 0.08));
    }
}
