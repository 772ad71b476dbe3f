//! `ml.regression`: a trainable regression model kept between calls
//!
//! Stateful. `train_regression_sample` must run before `predict_dict`, and
//! every training run replaces the model and bumps its generation. On the
//! host side the ordering is carried by types: [`Regression::train`]
//! returns a [`TrainedRegression`] handle, and predicting through a handle
//! whose generation has been replaced fails with
//! [`BridgeError::StaleHandle`].

use pyhost_bridge::{
    BridgeError, BridgeResult, CallArgs, InvocationRequest, Mapping, ModuleContract, NativeModule,
    PyDictBuilder, PyValue, RuntimeFault, RuntimeSession, Value,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Dotted module name
pub const MODULE: &str = "ml.regression";

/// Features per sample
pub const INPUT_SIZE: usize = 2;

const FUNCTIONS: &[&str] = &["train_regression_sample", "predict_dict", "device_info"];

const DATA_SEED: u64 = 42;

/// State contract for [`MODULE`]
pub fn contract() -> ModuleContract {
    ModuleContract::stateful(MODULE, FUNCTIONS, &["train_regression_sample", "predict_dict"])
}

/// Linear model `y = w·x + b`
#[derive(Debug, Clone, PartialEq)]
struct LinearModel {
    weights: [f64; INPUT_SIZE],
    bias: f64,
}

impl LinearModel {
    fn predict(&self, x: &[f64; INPUT_SIZE]) -> f64 {
        self.weights.iter().zip(x).map(|(w, x)| w * x).sum::<f64>() + self.bias
    }
}

/// Adam optimizer state for a flat parameter vector
struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

impl Adam {
    fn new(lr: f64, params: usize) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: vec![0.0; params],
            v: vec![0.0; params],
            t: 0,
        }
    }

    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        self.t += 1;
        let c1 = 1.0 - self.beta1.powi(self.t);
        let c2 = 1.0 - self.beta2.powi(self.t);
        for i in 0..params.len() {
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * grads[i];
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * grads[i] * grads[i];
            let m_hat = self.m[i] / c1;
            let v_hat = self.v[i] / c2;
            params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// `y = 2*x1 + 3*x2 + 1 + 0.1*noise`, `x` uniform in `[-2, 2]`
fn synthetic_data(n_samples: usize) -> (Vec<[f64; INPUT_SIZE]>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(DATA_SEED);
    let xs: Vec<[f64; INPUT_SIZE]> = (0..n_samples)
        .map(|_| [rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0)])
        .collect();
    let ys = xs
        .iter()
        .map(|x| 2.0 * x[0] + 3.0 * x[1] + 1.0 + 0.1 * standard_normal(&mut rng))
        .collect();
    (xs, ys)
}

/// Box-Muller transform
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Full-batch training on mean squared error. Returns the model and the
/// loss of the last epoch (measured before its update).
fn fit(epochs: usize, learning_rate: f64, n_samples: usize) -> (LinearModel, f64) {
    let (xs, ys) = synthetic_data(n_samples);
    let n = n_samples as f64;

    // [w1, w2, b]
    let mut params = [0.0; INPUT_SIZE + 1];
    let mut adam = Adam::new(learning_rate, params.len());
    let mut loss = 0.0;

    for _ in 0..epochs {
        let mut grads = [0.0; INPUT_SIZE + 1];
        loss = 0.0;
        for (x, y) in xs.iter().zip(&ys) {
            let err = params[0] * x[0] + params[1] * x[1] + params[2] - y;
            loss += err * err;
            grads[0] += 2.0 * err * x[0];
            grads[1] += 2.0 * err * x[1];
            grads[2] += 2.0 * err;
        }
        loss /= n;
        for g in grads.iter_mut() {
            *g /= n;
        }
        adam.step(&mut params, &grads);
    }

    let model = LinearModel {
        weights: [params[0], params[1]],
        bias: params[2],
    };
    (model, loss)
}

/// Native implementation of `ml.regression`.
#[derive(Debug, Default)]
pub struct RegressionModule {
    model: Option<LinearModel>,
    generation: i64,
}

impl RegressionModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn train(&mut self, args: CallArgs<'_>) -> Result<PyValue, RuntimeFault> {
        let args = args.at_most(3)?;
        let epochs: usize = args.optional(0, "epochs", 200)?;
        let learning_rate: f64 = args.optional(1, "learning_rate", 0.01)?;
        let n_samples: usize = args.optional(2, "n_samples", 200)?;

        if epochs == 0 || n_samples == 0 {
            return Err(RuntimeFault::value_error("epochs and n_samples must be positive"));
        }
        if learning_rate.is_nan() || learning_rate <= 0.0 {
            return Err(RuntimeFault::value_error(format!(
                "learning_rate must be positive, got {}",
                learning_rate
            )));
        }

        let (model, final_loss) = fit(epochs, learning_rate, n_samples);
        self.model = Some(model);
        self.generation += 1;
        debug!(generation = self.generation, final_loss, "regression model trained");

        Ok(PyDictBuilder::new()
            .insert("final_loss", final_loss)
            .insert("epochs", epochs as f64)
            .insert("generation", self.generation)
            .build())
    }

    fn predict(&self, args: CallArgs<'_>) -> Result<PyValue, RuntimeFault> {
        let model = self.model.as_ref().ok_or_else(|| {
            RuntimeFault::runtime_error(
                "model has not been trained yet; call train_regression_sample() first",
            )
        })?;
        let args = args.at_most(1)?;
        let raw = args
            .raw(0)
            .ok_or_else(|| RuntimeFault::type_error("predict_dict() missing required argument: 'features'"))?;

        // One sample [x1, x2] or many [[x1, x2], ...]
        let single = raw
            .as_sequence()
            .and_then(|items| items.first())
            .map_or(false, PyValue::is_number);
        let samples: Vec<Vec<f64>> = if single {
            vec![args.required(0, "features")?]
        } else {
            args.required(0, "features")?
        };

        let result = samples
            .iter()
            .map(|sample| {
                let x: [f64; INPUT_SIZE] = sample.as_slice().try_into().map_err(|_| {
                    RuntimeFault::value_error(format!(
                        "each sample needs {} features, got {}",
                        INPUT_SIZE,
                        sample.len()
                    ))
                })?;
                Ok(model.predict(&x))
            })
            .collect::<Result<Vec<f64>, RuntimeFault>>()?;

        Ok(PyDictBuilder::new()
            .insert("result", result)
            .insert("generation", self.generation)
            .build())
    }
}

impl NativeModule for RegressionModule {
    fn name(&self) -> &str {
        MODULE
    }

    fn functions(&self) -> &[&'static str] {
        FUNCTIONS
    }

    fn call(&mut self, function: &str, args: &[PyValue]) -> Result<PyValue, RuntimeFault> {
        let args = CallArgs::new(function, args);
        match function {
            "train_regression_sample" => self.train(args),
            "predict_dict" => self.predict(args),
            "device_info" => {
                args.at_most(0)?;
                Ok(PyDictBuilder::new()
                    .insert("cuda_available", "False")
                    .insert("device_name", "cpu")
                    .build())
            }
            other => Err(RuntimeFault::attribute_error(MODULE, other)),
        }
    }
}

// ============================================================================
// Host wrappers
// ============================================================================

/// Training parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainParams {
    pub epochs: u32,
    pub learning_rate: f64,
    pub n_samples: u32,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            epochs: 200,
            learning_rate: 0.01,
            n_samples: 200,
        }
    }
}

/// Compute device reported by the module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub cuda_available: bool,
    pub device_name: String,
}

/// Entry point to the `ml.regression` protocol.
pub struct Regression;

impl Regression {
    /// Train a fresh model, replacing any earlier one.
    pub fn train(session: &RuntimeSession, params: TrainParams) -> BridgeResult<TrainedRegression<'_>> {
        let request = InvocationRequest::new(MODULE, "train_regression_sample")
            .arg(Value::Int(params.epochs.into()))
            .arg(params.learning_rate)
            .arg(Value::Int(params.n_samples.into()));
        let result = session.invoke(&request)?;
        Ok(TrainedRegression {
            session,
            generation: result.get_as("generation")?,
            final_loss: result.get_as("final_loss")?,
            epochs: result.get_as("epochs")?,
        })
    }

    /// Device the module computes on
    pub fn device_info(session: &RuntimeSession) -> BridgeResult<DeviceInfo> {
        let result = session.invoke(&InvocationRequest::new(MODULE, "device_info"))?;
        Ok(DeviceInfo {
            cuda_available: result.get_as::<String>("cuda_available")? == "True",
            device_name: result.get_as("device_name")?,
        })
    }
}

/// A trained model generation.
#[derive(Debug, Clone, Copy)]
pub struct TrainedRegression<'s> {
    session: &'s RuntimeSession,
    generation: i64,
    final_loss: f64,
    epochs: f64,
}

impl TrainedRegression<'_> {
    /// Generation of the model this handle refers to
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Mean squared error of the last epoch
    pub fn final_loss(&self) -> f64 {
        self.final_loss
    }

    /// Epochs run
    pub fn epochs(&self) -> u32 {
        self.epochs as u32
    }

    /// Predict a batch of samples.
    ///
    /// Fails with [`BridgeError::StaleHandle`] if the model was retrained
    /// since this handle was issued.
    pub fn predict(&self, samples: &[[f64; INPUT_SIZE]]) -> BridgeResult<Vec<f64>> {
        let features = Value::Sequence(samples.iter().map(|s| Value::floats(*s)).collect());
        let result = self
            .session
            .invoke(&InvocationRequest::new(MODULE, "predict_dict").arg(features))?;
        self.check_generation(&result)?;
        result.get_as("result")
    }

    /// Predict a single sample
    pub fn predict_one(&self, sample: [f64; INPUT_SIZE]) -> BridgeResult<f64> {
        self.predict(&[sample])?
            .first()
            .copied()
            .ok_or_else(|| BridgeError::marshalling("empty prediction result"))
    }

    fn check_generation(&self, result: &Mapping) -> BridgeResult<()> {
        let current: i64 = result.get_as("generation")?;
        if current != self.generation {
            return Err(BridgeError::StaleHandle {
                module: MODULE.to_string(),
                held: self.generation,
                current,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_data_is_seeded() {
        let (xa, ya) = synthetic_data(50);
        let (xb, yb) = synthetic_data(50);
        assert_eq!(xa, xb);
        assert_eq!(ya, yb);
        assert!(xa.iter().flatten().all(|x| (-2.0..2.0).contains(x)));
    }

    #[test]
    fn test_fit_recovers_coefficients() {
        let (model, loss) = fit(3000, 0.01, 200);
        assert!((model.weights[0] - 2.0).abs() < 0.05, "{:?}", model);
        assert!((model.weights[1] - 3.0).abs() < 0.05, "{:?}", model);
        assert!((model.bias - 1.0).abs() < 0.05, "{:?}", model);
        assert!(loss < 0.05);
    }

    #[test]
    fn test_predict_before_train() {
        let mut module = RegressionModule::new();
        let fault = module
            .call("predict_dict", &[PyValue::List(vec![PyValue::Float(1.0), PyValue::Float(0.0)])])
            .unwrap_err();
        assert_eq!(fault.kind, "RuntimeError");
    }

    #[test]
    fn test_single_and_batch_features() {
        let mut module = RegressionModule::new();
        module.call("train_regression_sample", &[PyValue::Int(50)]).unwrap();

        let one = module
            .call("predict_dict", &[PyValue::List(vec![PyValue::Float(1.0), PyValue::Float(0.0)])])
            .unwrap();
        let dict = one.as_dict().unwrap();
        assert_eq!(dict["result"].as_sequence().unwrap().len(), 1);
        assert_eq!(dict["generation"], PyValue::Int(1));

        let batch = PyValue::List(vec![
            PyValue::List(vec![PyValue::Float(1.0), PyValue::Float(0.0)]),
            PyValue::List(vec![PyValue::Float(0.0), PyValue::Float(1.0)]),
        ]);
        let many = module.call("predict_dict", &[batch]).unwrap();
        assert_eq!(many.as_dict().unwrap()["result"].as_sequence().unwrap().len(), 2);

        let wrong = PyValue::List(vec![PyValue::Float(1.0)]);
        assert_eq!(module.call("predict_dict", &[wrong]).unwrap_err().kind, "ValueError");
    }

    #[test]
    fn test_invalid_training_parameters() {
        let mut module = RegressionModule::new();
        let fault = module.call("train_regression_sample", &[PyValue::Int(0)]).unwrap_err();
        assert_eq!(fault.kind, "ValueError");
        let fault = module
            .call("train_regression_sample", &[PyValue::Int(10), PyValue::Float(-1.0)])
            .unwrap_err();
        assert_eq!(fault.kind, "ValueError");
        let fault = module.call("train_regression_sample", &[PyValue::Int(-5)]).unwrap_err();
        assert_eq!(fault.kind, "TypeError");
    }
}
