//! AdamW optimizer with checkpointable state
//!
//! Operates on the named variables of a `VarMap` so that the first and second
//! moment estimates can round-trip through the checkpoint store under stable
//! names, reproducing the exact optimizer trajectory on resume.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{Error, Result};

/// AdamW hyperparameters
#[derive(Debug, Clone)]
pub struct ParamsAdamW {
    /// Learning rate
    pub learning_rate: f64,
    /// Exponential decay rate for the first moment
    pub beta1: f64,
    /// Exponential decay rate for the second moment
    pub beta2: f64,
    /// Numerical stability constant
    pub eps: f64,
    /// Decoupled weight decay coefficient
    pub weight_decay: f64,
}

impl Default for ParamsAdamW {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// AdamW optimizer bound to a network's trainable variables
pub struct AdamW {
    /// Named variables in deterministic order
    vars: Vec<(String, Var)>,
    params: ParamsAdamW,
    step_count: usize,
    first_moment: HashMap<String, Tensor>,
    second_moment: HashMap<String, Tensor>,
}

impl AdamW {
    /// Bind the optimizer to every variable currently in `varmap`.
    pub fn new(varmap: &VarMap, params: ParamsAdamW) -> Self {
        let data = varmap.data().lock().unwrap();
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        drop(data);

        Self {
            vars,
            params,
            step_count: 0,
            first_moment: HashMap::new(),
            second_moment: HashMap::new(),
        }
    }

    /// Number of update steps applied so far.
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Apply one AdamW update from the gradients of a backward pass.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_count += 1;
        let lr = self.params.learning_rate;
        let b1 = self.params.beta1;
        let b2 = self.params.beta2;
        let bias1 = 1.0 - b1.powi(self.step_count as i32);
        let bias2 = 1.0 - b2.powi(self.step_count as i32);

        for (name, var) in &self.vars {
            let grad = match grads.get(var.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };

            // m_t = b1 * m_{t-1} + (1 - b1) * g_t
            let m = match self.first_moment.get(name) {
                Some(m) => ((m * b1)? + (grad * (1.0 - b1))?)?,
                None => (grad * (1.0 - b1))?,
            };
            // v_t = b2 * v_{t-1} + (1 - b2) * g_t^2
            let v = match self.second_moment.get(name) {
                Some(v) => ((v * b2)? + (grad.sqr()? * (1.0 - b2))?)?,
                None => (grad.sqr()? * (1.0 - b2))?,
            };

            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.params.eps)?)?;

            let mut next = (var.as_tensor() - (update * lr)?)?;
            if self.params.weight_decay > 0.0 {
                next = (next - (var.as_tensor() * (lr * self.params.weight_decay))?)?;
            }
            var.set(&next)?;

            self.first_moment.insert(name.clone(), m);
            self.second_moment.insert(name.clone(), v);
        }

        Ok(())
    }

    /// Snapshot the moment estimates under stable names for checkpointing.
    pub fn export_state(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::new();
        for (name, m) in &self.first_moment {
            out.insert(format!("{name}.exp_avg"), m.clone());
        }
        for (name, v) in &self.second_moment {
            out.insert(format!("{name}.exp_avg_sq"), v.clone());
        }
        out
    }

    /// Restore moment estimates from a checkpoint snapshot.
    ///
    /// Any tensor naming an unknown parameter or carrying the wrong shape is
    /// fatal; there is no partial restore.
    pub fn import_state(
        &mut self,
        tensors: HashMap<String, Tensor>,
        step_count: usize,
    ) -> Result<()> {
        self.first_moment.clear();
        self.second_moment.clear();

        for (key, tensor) in tensors {
            let (name, slot) = if let Some(name) = key.strip_suffix(".exp_avg_sq") {
                (name, &mut self.second_moment)
            } else if let Some(name) = key.strip_suffix(".exp_avg") {
                (name, &mut self.first_moment)
            } else {
                return Err(Error::checkpoint(format!(
                    "unrecognized optimizer tensor `{key}`"
                )));
            };

            let var = self
                .vars
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    Error::checkpoint(format!("optimizer state for unknown parameter `{name}`"))
                })?;
            if var.shape() != tensor.shape() {
                return Err(Error::checkpoint(format!(
                    "optimizer state shape mismatch for `{name}`: {:?} vs {:?}",
                    tensor.shape(),
                    var.shape()
                )));
            }
            slot.insert(name.to_string(), tensor);
        }

        self.step_count = step_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn quadratic_setup() -> (VarMap, Var, Tensor) {
        let varmap = VarMap::new();
        let x = Var::zeros((2,), DType::F32, &Device::Cpu).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .insert("x".to_string(), x.clone());
        let target = Tensor::new(&[3.0f32, -2.0], &Device::Cpu).unwrap();
        (varmap, x, target)
    }

    fn distance(x: &Var, target: &Tensor) -> f32 {
        (x.as_tensor() - target)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_step_descends_quadratic() {
        let (varmap, x, target) = quadratic_setup();
        let mut optimizer = AdamW::new(
            &varmap,
            ParamsAdamW {
                learning_rate: 0.1,
                ..Default::default()
            },
        );

        let initial = distance(&x, &target);
        for _ in 0..50 {
            let loss = (x.as_tensor() - &target).unwrap().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            optimizer.step(&grads).unwrap();
        }
        assert_eq!(optimizer.step_count(), 50);
        assert!(distance(&x, &target) < initial / 2.0);
    }

    #[test]
    fn test_state_round_trip() {
        let (varmap, x, target) = quadratic_setup();
        let mut optimizer = AdamW::new(&varmap, ParamsAdamW::default());

        for _ in 0..3 {
            let loss = (x.as_tensor() - &target).unwrap().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            optimizer.step(&grads).unwrap();
        }

        let exported = optimizer.export_state();
        assert_eq!(exported.len(), 2);

        let mut restored = AdamW::new(&varmap, ParamsAdamW::default());
        restored.import_state(exported, optimizer.step_count()).unwrap();
        assert_eq!(restored.step_count(), 3);

        let original = optimizer.first_moment.get("x").unwrap().to_vec1::<f32>().unwrap();
        let loaded = restored.first_moment.get("x").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_import_rejects_unknown_parameter() {
        let (varmap, _x, _target) = quadratic_setup();
        let mut optimizer = AdamW::new(&varmap, ParamsAdamW::default());

        let mut tensors = HashMap::new();
        tensors.insert(
            "ghost.exp_avg".to_string(),
            Tensor::zeros((2,), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(optimizer.import_state(tensors, 1).is_err());
    }

    #[test]
    fn test_import_rejects_shape_mismatch() {
        let (varmap, _x, _target) = quadratic_setup();
        let mut optimizer = AdamW::new(&varmap, ParamsAdamW::default());

        let mut tensors = HashMap::new();
        tensors.insert(
            "x.exp_avg".to_string(),
            Tensor::zeros((3,), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(optimizer.import_state(tensors, 1).is_err());
    }
}
