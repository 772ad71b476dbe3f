//! `linalg.decomposition`: SVD-based matrix routines
//!
//! Stateless: every call is independent and calls may be reordered or run
//! in parallel processes.

use pyhost_bridge::{
    BridgeResult, CallArgs, InvocationRequest, Mapping, Matrix, ModuleContract, NativeModule,
    PyDictBuilder, PyValue, RuntimeFault, RuntimeSession, ToPython, Value,
};

use crate::svd::{decompose, Svd};

/// Dotted module name
pub const MODULE: &str = "linalg.decomposition";

const FUNCTIONS: &[&str] = &[
    "svd_dict",
    "svd_reduced",
    "matrix_rank",
    "condition_number",
    "low_rank_approximation",
];

/// State contract for [`MODULE`]
pub fn contract() -> ModuleContract {
    ModuleContract::stateless(MODULE, FUNCTIONS)
}

/// Native implementation of `linalg.decomposition`.
#[derive(Debug, Default)]
pub struct DecompositionModule;

impl DecompositionModule {
    pub fn new() -> Self {
        Self
    }
}

impl NativeModule for DecompositionModule {
    fn name(&self) -> &str {
        MODULE
    }

    fn functions(&self) -> &[&'static str] {
        FUNCTIONS
    }

    fn call(&mut self, function: &str, args: &[PyValue]) -> Result<PyValue, RuntimeFault> {
        let args = CallArgs::new(function, args);
        match function {
            "svd_dict" => {
                let args = args.at_most(2)?;
                let a = matrix_arg(&args)?;
                let full = args.optional(1, "full_matrices", true)?;
                Ok(svd_to_python(&decompose(&a, full)))
            }
            "svd_reduced" => {
                let a = matrix_arg(&args.at_most(1)?)?;
                Ok(svd_to_python(&decompose(&a, false)))
            }
            "matrix_rank" => {
                let args = args.at_most(2)?;
                let a = matrix_arg(&args)?;
                let tolerance: Option<f64> = args.optional(1, "tolerance", None)?;
                Ok(PyValue::Int(rank(&a, tolerance) as i64))
            }
            "condition_number" => {
                let a = matrix_arg(&args.at_most(1)?)?;
                Ok(PyValue::Float(condition(&a)))
            }
            "low_rank_approximation" => {
                let args = args.at_most(2)?;
                let a = matrix_arg(&args)?;
                let k: i64 = args.required(1, "rank")?;
                let limit = a.rows().min(a.cols());
                if k < 1 || k as usize > limit {
                    return Err(RuntimeFault::value_error(format!(
                        "rank must be between 1 and {}, got {}",
                        limit, k
                    )));
                }
                Ok(decompose(&a, false).reconstruct(k as usize).to_python())
            }
            other => Err(RuntimeFault::attribute_error(MODULE, other)),
        }
    }
}

fn matrix_arg(args: &CallArgs<'_>) -> Result<Matrix, RuntimeFault> {
    let a: Matrix = args.required(0, "matrix")?;
    if a.is_empty() {
        return Err(RuntimeFault::value_error("matrix must have at least one row and one column"));
    }
    Ok(a)
}

fn svd_to_python(svd: &Svd) -> PyValue {
    PyDictBuilder::new()
        .insert("U", svd.u.clone())
        .insert("S", svd.s.clone())
        .insert("Vt", svd.vt.clone())
        .build()
}

fn rank(a: &Matrix, tolerance: Option<f64>) -> usize {
    let svd = decompose(a, true);
    let tolerance =
        tolerance.unwrap_or_else(|| svd.max() * a.rows().max(a.cols()) as f64 * f64::EPSILON);
    svd.s.iter().filter(|s| **s > tolerance).count()
}

fn condition(a: &Matrix) -> f64 {
    let svd = decompose(a, true);
    if svd.min() == 0.0 {
        f64::INFINITY
    } else {
        svd.max() / svd.min()
    }
}

// ============================================================================
// Host wrappers
// ============================================================================

fn call(session: &RuntimeSession, function: &str, args: Vec<Value>) -> BridgeResult<Value> {
    session.invoke_value(&InvocationRequest::new(MODULE, function).args(args))
}

fn svd_from_mapping(result: &Mapping) -> BridgeResult<Svd> {
    Ok(Svd {
        u: result.get_as("U")?,
        s: result.get_as("S")?,
        vt: result.get_as("Vt")?,
    })
}

/// Full SVD through the session
pub fn svd(session: &RuntimeSession, matrix: &Matrix, full_matrices: bool) -> BridgeResult<Svd> {
    let result = call(
        session,
        "svd_dict",
        vec![matrix.clone().into(), full_matrices.into()],
    )?
    .into_mapping()?;
    svd_from_mapping(&result)
}

/// Reduced SVD (`k = min(m, n)`) through the session
pub fn svd_reduced(session: &RuntimeSession, matrix: &Matrix) -> BridgeResult<Svd> {
    let result = call(session, "svd_reduced", vec![matrix.clone().into()])?.into_mapping()?;
    svd_from_mapping(&result)
}

/// Numerical rank
pub fn matrix_rank(
    session: &RuntimeSession,
    matrix: &Matrix,
    tolerance: Option<f64>,
) -> BridgeResult<usize> {
    let tolerance = tolerance.map_or(Value::None, Value::Float);
    let value = call(session, "matrix_rank", vec![matrix.clone().into(), tolerance])?;
    let rank = i64::try_from(&value)?;
    usize::try_from(rank).map_err(|_| pyhost_bridge::BridgeError::numeric_overflow(rank, "usize"))
}

/// Ratio of the largest to the smallest singular value
pub fn condition_number(session: &RuntimeSession, matrix: &Matrix) -> BridgeResult<f64> {
    let value = call(session, "condition_number", vec![matrix.clone().into()])?;
    f64::try_from(&value)
}

/// Best approximation of `matrix` with the given rank
pub fn low_rank_approximation(
    session: &RuntimeSession,
    matrix: &Matrix,
    rank: usize,
) -> BridgeResult<Matrix> {
    let value = call(
        session,
        "low_rank_approximation",
        vec![matrix.clone().into(), Value::Int(rank as i64)],
    )?;
    Matrix::try_from(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(rows: &[&[f64]]) -> PyValue {
        Matrix::from_rows(rows).unwrap().to_python()
    }

    #[test]
    fn test_matrix_rank() {
        let mut module = DecompositionModule::new();
        let out = module.call("matrix_rank", &[m(&[&[1.0, 2.0], &[2.0, 4.0]])]).unwrap();
        assert_eq!(out, PyValue::Int(1));
        let out = module.call("matrix_rank", &[m(&[&[1.0, 0.0], &[0.0, 1.0]])]).unwrap();
        assert_eq!(out, PyValue::Int(2));
        let out = module
            .call("matrix_rank", &[m(&[&[1.0, 0.0], &[0.0, 1e-3]]), PyValue::Float(0.01)])
            .unwrap();
        assert_eq!(out, PyValue::Int(1));
    }

    #[test]
    fn test_condition_number() {
        let mut module = DecompositionModule::new();
        match module.call("condition_number", &[m(&[&[1.0, 0.0], &[0.0, 0.001]])]).unwrap() {
            PyValue::Float(c) => assert!((c - 1000.0).abs() < 1e-6),
            other => panic!("expected float, got {:?}", other),
        }
        let zero = module.call("condition_number", &[m(&[&[0.0, 0.0], &[0.0, 0.0]])]).unwrap();
        assert_eq!(zero, PyValue::Float(f64::INFINITY));
    }

    #[test]
    fn test_low_rank_bounds() {
        let mut module = DecompositionModule::new();
        let a = m(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
        for bad in [0, 3] {
            let fault = module
                .call("low_rank_approximation", &[a.clone(), PyValue::Int(bad)])
                .unwrap_err();
            assert_eq!(fault.kind, "ValueError");
        }
        assert!(module
            .call("low_rank_approximation", &[a, PyValue::Int(2)])
            .is_ok());
    }

    #[test]
    fn test_argument_errors() {
        let mut module = DecompositionModule::new();
        let fault = module.call("svd_dict", &[]).unwrap_err();
        assert_eq!(fault.kind, "TypeError");

        let ragged = PyValue::List(vec![
            PyValue::List(vec![PyValue::Float(1.0), PyValue::Float(2.0)]),
            PyValue::List(vec![PyValue::Float(3.0)]),
        ]);
        let fault = module.call("svd_dict", &[ragged]).unwrap_err();
        assert_eq!(fault.kind, "TypeError");

        let fault = module.call("svd_dict", &[PyValue::List(vec![])]).unwrap_err();
        assert_eq!(fault.kind, "ValueError");
    }

    #[test]
    fn test_svd_dict_fields() {
        let mut module = DecompositionModule::new();
        let out = module
            .call("svd_dict", &[m(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]), PyValue::Bool(false)])
            .unwrap();
        let dict = out.as_dict().unwrap();
        let keys: Vec<&str> = dict.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["U", "S", "Vt"]);
        assert_eq!(dict["Vt"].as_sequence().unwrap().len(), 2);
    }
}
