use crate::{common::*, config::LearningRateSchedule};

#[derive(Debug, Clone)]
pub enum LrScheduler {
    Constant {
        lr: R64,
    },
    StepWise {
        lr_cache: f64,
        step: usize,
        index: usize,
        steps: Vec<(usize, R64)>,
    },
    ExponentialDecay {
        step: usize,
        initial_lr: f64,
        decay_steps: usize,
        decay_rate: f64,
        staircase: bool,
    },
}

impl LrScheduler {
    pub fn new(config: &LearningRateSchedule, init_step: impl Into<Option<usize>>) -> Result<Self> {
        let init_step = init_step.into();

        let mut scheduler = match *config {
            LearningRateSchedule::Constant { lr } => {
                ensure!(lr >= 0.0, "the lr must be non-negative");
                Self::Constant { lr }
            }
            LearningRateSchedule::StepWise { ref steps } => {
                ensure!(
                    !steps.is_empty() && steps[0].0 == 0,
                    "the steps must start from zero"
                );

                steps.iter().try_fold(None, |prev_step, (curr_step, lr)| {
                    if let Some(prev_step) = prev_step {
                        ensure!(curr_step > prev_step, "the steps must be monotonic");
                    }
                    ensure!(lr.raw() > 0.0, "lr must be positive");
                    Fallible::Ok(Some(curr_step))
                })?;

                Self::StepWise {
                    lr_cache: steps[0].1.raw(),
                    step: 0,
                    index: 0,
                    steps: steps.clone(),
                }
            }
            LearningRateSchedule::ExponentialDecay {
                initial_lr,
                decay_steps,
                decay_rate,
                staircase,
            } => {
                ensure!(initial_lr > 0.0, "initial_lr must be positive");
                ensure!(
                    decay_rate > 0.0 && decay_rate <= 1.0,
                    "decay_rate must be in range (0, 1]"
                );

                Self::ExponentialDecay {
                    step: 0,
                    initial_lr: initial_lr.raw(),
                    decay_steps: decay_steps.get(),
                    decay_rate: decay_rate.raw(),
                    staircase,
                }
            }
        };

        if let Some(init_step) = init_step {
            scheduler.set_step(init_step);
        }

        Ok(scheduler)
    }

    pub fn set_step(&mut self, new_step: usize) {
        match self {
            Self::Constant { .. } => (),
            Self::StepWise {
                step,
                index,
                steps,
                lr_cache,
            } => {
                *step = new_step;
                let new_index = match steps
                    .binary_search_by_key(&new_step, |(step_thresh, _lr)| *step_thresh)
                {
                    Ok(new_index) => new_index,
                    Err(new_index) => new_index.saturating_sub(1),
                };
                *index = new_index;
                *lr_cache = steps[new_index].1.raw();
            }
            Self::ExponentialDecay { step, .. } => {
                *step = new_step;
            }
        }
    }

    /// The learning rate of the current step.
    pub fn lr(&self) -> f64 {
        match *self {
            Self::Constant { lr } => lr.raw(),
            Self::StepWise { lr_cache, .. } => lr_cache,
            Self::ExponentialDecay {
                step,
                initial_lr,
                decay_steps,
                decay_rate,
                staircase,
            } => {
                let exponent = step as f64 / decay_steps as f64;
                let exponent = if staircase {
                    exponent.floor()
                } else {
                    exponent
                };
                initial_lr * decay_rate.powf(exponent)
            }
        }
    }

    /// Returns the learning rate of the current step and advances one step.
    pub fn next(&mut self) -> f64 {
        let lr = self.lr();

        match self {
            Self::Constant { .. } => (),
            Self::StepWise {
                step,
                index,
                steps,
                lr_cache,
            } => {
                *step += 1;
                let next_index = *index + 1;
                if next_index < steps.len() && *step == steps[next_index].0 {
                    *index = next_index;
                    *lr_cache = steps[next_index].1.raw();
                }
            }
            Self::ExponentialDecay { step, .. } => {
                *step += 1;
            }
        }

        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn step_wise_schedule() -> Result<()> {
        let config = LearningRateSchedule::StepWise {
            steps: vec![(0, r64(0.1)), (2, r64(0.01)), (5, r64(0.001))],
        };
        let mut scheduler = LrScheduler::new(&config, None)?;
        let lrs: Vec<_> = (0..6).map(|_| scheduler.next()).collect();
        assert_eq!(lrs, vec![0.1, 0.1, 0.01, 0.01, 0.01, 0.001]);

        let scheduler = LrScheduler::new(&config, 3usize)?;
        assert_abs_diff_eq!(scheduler.lr(), 0.01);

        let config = LearningRateSchedule::StepWise {
            steps: vec![(1, r64(0.1))],
        };
        assert!(LrScheduler::new(&config, None).is_err());
        Ok(())
    }

    #[test]
    fn exponential_decay_schedule() -> Result<()> {
        let config = LearningRateSchedule::ExponentialDecay {
            initial_lr: r64(1e-3),
            decay_steps: NonZeroUsize::new(3000).unwrap(),
            decay_rate: r64(0.96),
            staircase: true,
        };
        let mut scheduler = LrScheduler::new(&config, None)?;
        assert_abs_diff_eq!(scheduler.next(), 1e-3);

        scheduler.set_step(2999);
        assert_abs_diff_eq!(scheduler.lr(), 1e-3);
        scheduler.set_step(3000);
        assert_abs_diff_eq!(scheduler.lr(), 0.96e-3, epsilon = 1e-12);
        scheduler.set_step(7500);
        assert_abs_diff_eq!(scheduler.lr(), 1e-3 * 0.96f64.powi(2), epsilon = 1e-12);

        let config = LearningRateSchedule::ExponentialDecay {
            initial_lr: r64(1e-3),
            decay_steps: NonZeroUsize::new(3000).unwrap(),
            decay_rate: r64(0.96),
            staircase: false,
        };
        let scheduler = LrScheduler::new(&config, 1500usize)?;
        assert_abs_diff_eq!(scheduler.lr(), 1e-3 * 0.96f64.sqrt(), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn constant_schedule() -> Result<()> {
        let mut scheduler = LrScheduler::new(&LearningRateSchedule::Constant { lr: r64(0.5) }, 10usize)?;
        assert_abs_diff_eq!(scheduler.next(), 0.5);
        assert_abs_diff_eq!(scheduler.next(), 0.5);
        Ok(())
    }
}
