// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MomentumContrast — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use mc_tensor::{Tensor, TensorError, TensorResult};
use std::collections::HashMap;
use std::f32::consts::PI;

/// Stochastic gradient descent with classical momentum and L2 weight decay.
///
/// Velocity buffers are keyed by parameter name, so one optimizer instance can
/// drive several modules as long as their parameter names stay distinct.
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: HashMap<String, Tensor>,
}

impl Sgd {
    /// Creates a new optimizer, validating every hyperparameter.
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> TensorResult<Self> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "sgd_learning_rate",
            });
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(TensorError::InvalidValue {
                label: "sgd_momentum",
            });
        }
        if weight_decay < 0.0 || !weight_decay.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "sgd_weight_decay",
            });
        }
        Ok(Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
        })
    }

    /// Returns the current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Overrides the learning rate, typically from a scheduler.
    pub fn set_learning_rate(&mut self, learning_rate: f32) -> TensorResult<()> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "sgd_learning_rate",
            });
        }
        self.learning_rate = learning_rate;
        Ok(())
    }

    /// Applies one update to every parameter carrying a gradient, consuming
    /// (zeroing) the gradients in the process.
    pub fn step<M: Module>(&mut self, module: &mut M) -> TensorResult<()> {
        let lr = self.learning_rate;
        let momentum = self.momentum;
        let weight_decay = self.weight_decay;
        let velocity = &mut self.velocity;
        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = param.gradient() else {
                return Ok(());
            };
            let (rows, cols) = grad.shape();
            let mut update = grad.clone();
            if weight_decay > 0.0 {
                update.add_scaled(param.value(), weight_decay)?;
            }
            let slot = match velocity.entry(param.name().to_string()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(Tensor::zeros(rows, cols)?)
                }
            };
            if slot.shape() != update.shape() {
                return Err(TensorError::ShapeMismatch {
                    left: slot.shape(),
                    right: update.shape(),
                });
            }
            for (v, g) in slot.data_mut().iter_mut().zip(update.data().iter()) {
                *v = *v * momentum + g;
            }
            let step = slot.clone();
            param.value_mut().add_scaled(&step, -lr)?;
            param.zero_gradient();
            Ok(())
        })
    }

    /// Clears accumulated gradients without stepping.
    pub fn zero_grad<M: Module>(&self, module: &mut M) -> TensorResult<()> {
        module.zero_gradients()
    }
}

/// Trait implemented by learning-rate schedules that cooperate with [`Sgd`].
pub trait LrScheduler {
    /// Advances the schedule returning the new learning rate.
    fn step(&mut self) -> f32;
    /// Returns the most recent learning rate produced by [`LrScheduler::step`].
    fn current_lr(&self) -> f32;
    /// Resets the scheduler to its initial state.
    fn reset(&mut self);
}

/// Cosine annealing over a fixed number of epochs, decaying from the base
/// learning rate down to `min_lr`.
#[derive(Debug, Clone)]
pub struct CosineAnnealingLr {
    base_lr: f32,
    min_lr: f32,
    total_epochs: u32,
    epoch: u32,
    last_lr: f32,
}

impl CosineAnnealingLr {
    /// Creates a new schedule spanning `total_epochs` epochs.
    pub fn new(base_lr: f32, min_lr: f32, total_epochs: u32) -> TensorResult<Self> {
        if base_lr <= 0.0 || !base_lr.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "scheduler_base_lr",
            });
        }
        if min_lr < 0.0 || min_lr > base_lr || !min_lr.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "scheduler_min_lr",
            });
        }
        if total_epochs == 0 {
            return Err(TensorError::InvalidValue {
                label: "scheduler_total_epochs",
            });
        }
        Ok(Self {
            base_lr,
            min_lr,
            total_epochs,
            epoch: 0,
            last_lr: base_lr,
        })
    }

    /// Advances the schedule and pushes the resulting rate into the optimizer.
    pub fn step_optimizer(&mut self, optimizer: &mut Sgd) -> TensorResult<f32> {
        let lr = self.step();
        optimizer.set_learning_rate(lr)?;
        Ok(lr)
    }
}

impl LrScheduler for CosineAnnealingLr {
    fn step(&mut self) -> f32 {
        let progress = (self.epoch.min(self.total_epochs)) as f32 / self.total_epochs as f32;
        let cosine = 0.5 * (1.0 + (PI * progress).cos());
        self.last_lr = self.min_lr + (self.base_lr - self.min_lr) * cosine;
        self.epoch = self.epoch.saturating_add(1);
        self.last_lr
    }

    fn current_lr(&self) -> f32 {
        self.last_lr
    }

    fn reset(&mut self) {
        self.epoch = 0;
        self.last_lr = self.base_lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::module::Module;

    #[test]
    fn sgd_step_matches_manual_update() {
        let mut layer = Linear::new("opt", 1, 1).unwrap();
        let w0 = layer.weight().value().data()[0];
        let mut optimizer = Sgd::new(0.1, 0.9, 0.0).unwrap();

        let input = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let grad_out = Tensor::from_vec(1, 1, vec![2.0]).unwrap();
        layer.backward(&input, &grad_out).unwrap();
        optimizer.step(&mut layer).unwrap();
        // First step: v = g, w -= lr * v.
        let w1 = layer.weight().value().data()[0];
        assert!((w1 - (w0 - 0.1 * 2.0)).abs() < 1e-6);

        layer.backward(&input, &grad_out).unwrap();
        optimizer.step(&mut layer).unwrap();
        // Second step: v = 0.9 * 2 + 2 = 3.8.
        let w2 = layer.weight().value().data()[0];
        assert!((w2 - (w1 - 0.1 * 3.8)).abs() < 1e-6);
    }

    #[test]
    fn sgd_applies_weight_decay() {
        let mut layer = Linear::new("decay", 1, 1).unwrap();
        let w0 = layer.weight().value().data()[0];
        let mut optimizer = Sgd::new(0.1, 0.0, 0.5).unwrap();

        let input = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let grad_out = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        layer.backward(&input, &grad_out).unwrap();
        optimizer.step(&mut layer).unwrap();
        let w1 = layer.weight().value().data()[0];
        assert!((w1 - (w0 - 0.1 * (1.0 + 0.5 * w0))).abs() < 1e-6);
    }

    #[test]
    fn sgd_step_consumes_gradients() {
        let mut layer = Linear::new("consume", 2, 2).unwrap();
        let mut optimizer = Sgd::new(0.05, 0.9, 1e-4).unwrap();
        let input = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        let grad_out = Tensor::from_vec(1, 2, vec![0.3, 0.7]).unwrap();
        layer.backward(&input, &grad_out).unwrap();
        optimizer.step(&mut layer).unwrap();
        layer
            .visit_parameters(&mut |param| {
                if let Some(grad) = param.gradient() {
                    assert_eq!(grad.squared_l2_norm(), 0.0);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cosine_schedule_decays_to_min() {
        let mut schedule = CosineAnnealingLr::new(0.03, 0.0, 10).unwrap();
        let first = schedule.step();
        assert!((first - 0.03).abs() < 1e-7);
        let mut last = first;
        for _ in 0..10 {
            last = schedule.step();
        }
        assert!(last.abs() < 1e-7);
        schedule.reset();
        assert!((schedule.current_lr() - 0.03).abs() < 1e-7);
    }

    #[test]
    fn invalid_hyperparameters_are_rejected() {
        assert!(Sgd::new(0.0, 0.9, 0.0).is_err());
        assert!(Sgd::new(0.1, 1.0, 0.0).is_err());
        assert!(Sgd::new(0.1, 0.9, -1.0).is_err());
        assert!(CosineAnnealingLr::new(0.1, 0.2, 10).is_err());
        assert!(CosineAnnealingLr::new(0.1, 0.0, 0).is_err());
    }
}
