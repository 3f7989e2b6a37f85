//! Exponential moving average of model parameters.

use super::config::Precision;
use crate::model::{Parameterized, Tensor};
use crate::{Result, SeqTrainError};
use half::f16;
use serde::{Deserialize, Serialize};

/// Blend weight given to the fresh parameters at `step`.
///
/// Starts at 0.9 and shrinks towards `floor` as training progresses.
pub fn decay_for_step(floor: f64, step: u64) -> f64 {
    let step = step as f64;
    floor.max(1.0 - (step + 1.0) / (step + 10.0))
}

/// Full-precision parameter snapshots, index-aligned with
/// [`Parameterized::parameters`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovingAverage {
    params: Vec<Tensor>,
}

impl MovingAverage {
    /// Verbatim detached copy of the current parameters.
    pub fn from_parameters(model: &dyn Parameterized) -> Self {
        Self {
            params: model.parameters().iter().map(|p| p.value.clone()).collect(),
        }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// `avg = avg * (1 - decay) + current * decay`, for every parameter.
    pub fn blend(&mut self, model: &dyn Parameterized, decay: f64) -> Result<()> {
        let current = model.parameters();
        self.check_alignment(current.iter().map(|p| &p.value))?;
        let keep = (1.0 - decay) as f32;
        let take = decay as f32;
        for (avg, param) in self.params.iter_mut().zip(current) {
            avg.zip_mut_with(&param.value, |a, &c| *a = *a * keep + c * take);
        }
        Ok(())
    }

    /// Overwrite `model`'s parameters with the averaged values, cast to the
    /// model's working precision.
    pub fn apply_to(&self, model: &mut dyn Parameterized, precision: Precision) -> Result<()> {
        let mut params = model.parameters_mut();
        self.check_alignment(params.iter().map(|p| &p.value))?;
        for (param, avg) in params.iter_mut().zip(&self.params) {
            param.value = match precision {
                Precision::Fp32 => avg.clone(),
                Precision::Fp16 => avg.mapv(|v| f16::from_f32(v).to_f32()),
            };
        }
        Ok(())
    }

    fn check_alignment<'a>(&self, values: impl ExactSizeIterator<Item = &'a Tensor>) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(SeqTrainError::Contract(format!(
                "moving average holds {} tensors but the model has {} parameters",
                self.params.len(),
                values.len()
            )));
        }
        for (avg, value) in self.params.iter().zip(values) {
            if avg.shape() != value.shape() {
                return Err(SeqTrainError::ShapeMismatch {
                    expected: avg.shape().to_vec(),
                    actual: value.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

/// Moving-average strategy, chosen once when the trainer is built.
pub trait ParameterAverager: Send {
    /// Called after the optimizer step of accumulation cycle `cycle`
    /// (0-based); `step` is the step that cycle completed.
    fn on_cycle(&mut self, cycle: u64, step: u64, model: &dyn Parameterized) -> Result<()>;

    /// Current snapshot, absent until the first update.
    fn average(&self) -> Option<&MovingAverage>;
}

/// Averaging disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAverage;

impl ParameterAverager for NoAverage {
    fn on_cycle(&mut self, _cycle: u64, _step: u64, _model: &dyn Parameterized) -> Result<()> {
        Ok(())
    }

    fn average(&self) -> Option<&MovingAverage> {
        None
    }
}

/// Exponential moving average updated every `every` cycles.
#[derive(Clone, Debug)]
pub struct ExponentialAverage {
    floor: f64,
    every: u64,
    average: Option<MovingAverage>,
}

impl ExponentialAverage {
    pub fn new(floor: f64, every: u64) -> Self {
        Self {
            floor,
            every: every.max(1),
            average: None,
        }
    }

    /// Initialize from `model` on first use, blend afterwards.
    pub fn update(&mut self, step: u64, model: &dyn Parameterized) -> Result<()> {
        match self.average {
            None => {
                self.average = Some(MovingAverage::from_parameters(model));
                tracing::debug!(step, "Initialized moving average");
            }
            Some(ref mut avg) => {
                avg.blend(model, decay_for_step(self.floor, step))?;
            }
        }
        Ok(())
    }
}

impl ParameterAverager for ExponentialAverage {
    fn on_cycle(&mut self, cycle: u64, step: u64, model: &dyn Parameterized) -> Result<()> {
        if cycle % self.every == 0 {
            self.update(step, model)?;
        }
        Ok(())
    }

    fn average(&self) -> Option<&MovingAverage> {
        self.average.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameter;
    use ndarray::IxDyn;

    struct Scalar(Vec<Parameter>);

    impl Scalar {
        fn new(v: f32) -> Self {
            Self(vec![Parameter::new("w", Tensor::from_elem(IxDyn(&[1]), v))])
        }
        fn set(&mut self, v: f32) {
            self.0[0].value[[0]] = v;
        }
    }

    impl Parameterized for Scalar {
        fn parameters(&self) -> Vec<&Parameter> {
            self.0.iter().collect()
        }
        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            self.0.iter_mut().collect()
        }
    }

    #[test]
    fn test_decay_schedule() {
        assert!((decay_for_step(0.0, 0) - 0.9).abs() < 1e-12);
        assert!((decay_for_step(0.0, 8) - (1.0 - 9.0 / 18.0)).abs() < 1e-12);
        // the floor wins late in training
        assert_eq!(decay_for_step(0.01, 10_000), 0.01);
        let mut last = 1.0;
        for step in 0..100 {
            let d = decay_for_step(0.0, step);
            assert!(d < last);
            last = d;
        }
    }

    #[test]
    fn test_blend_matches_formula_over_five_steps() {
        let mut model = Scalar::new(1.0);
        let mut ema = ExponentialAverage::new(0.0, 1);
        ema.update(0, &model).unwrap();

        let mut expected = 1.0f64;
        for step in 1..=5u64 {
            let current = step as f32 * 2.0;
            model.set(current);
            ema.update(step, &model).unwrap();

            let d = 1.0 - (step as f64 + 1.0) / (step as f64 + 10.0);
            expected = expected * (1.0 - d) + current as f64 * d;
            let got = ema.average().unwrap().tensors()[0][[0]] as f64;
            assert!((got - expected).abs() < 1e-5, "step {}: {} vs {}", step, got, expected);
        }
    }

    #[test]
    fn test_first_update_is_verbatim_copy() {
        let model = Scalar::new(3.25);
        let mut ema = ExponentialAverage::new(0.5, 1);
        assert!(ema.average().is_none());
        ema.update(42, &model).unwrap();
        assert_eq!(ema.average().unwrap().tensors()[0][[0]], 3.25);
    }

    #[test]
    fn test_cadence() {
        let model = Scalar::new(1.0);
        let mut ema = ExponentialAverage::new(0.0, 3);
        ema.on_cycle(1, 2, &model).unwrap();
        assert!(ema.average().is_none());
        ema.on_cycle(3, 4, &model).unwrap();
        assert!(ema.average().is_some());

        let mut none = NoAverage;
        none.on_cycle(0, 1, &model).unwrap();
        assert!(none.average().is_none());
    }

    #[test]
    fn test_apply_to_casts_precision() {
        let model = Scalar::new(0.1);
        let avg = MovingAverage::from_parameters(&model);

        let mut copy = Scalar::new(0.0);
        avg.apply_to(&mut copy, Precision::Fp32).unwrap();
        assert_eq!(copy.0[0].value[[0]], 0.1);

        avg.apply_to(&mut copy, Precision::Fp16).unwrap();
        let half = copy.0[0].value[[0]];
        assert_eq!(half, f16::from_f32(0.1).to_f32());
        assert_ne!(half, 0.1);
    }

    #[test]
    fn test_misaligned_model_is_rejected() {
        let avg = MovingAverage::from_parameters(&Scalar::new(1.0));
        let mut other = Scalar(vec![]);
        assert!(matches!(
            avg.apply_to(&mut other, Precision::Fp32),
            Err(SeqTrainError::Contract(_))
        ));
    }
}
