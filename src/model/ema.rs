//! Exponential moving average of model parameters
//!
//! The teacher never receives gradients. After each optimizer step its
//! parameters move towards the student's:
//!
//! ```text
//! teacher = alpha * student + (1 - alpha) * teacher
//! ```
//!
//! Parameters are paired by module-visit order, which follows the field
//! declaration order of the module and is therefore identical for two
//! instances of the same architecture.

use burn::module::{Module, ModuleMapper, ModuleVisitor, Param};
use burn::tensor::{backend::Backend, Tensor};

use crate::utils::error::{Result, SslError};

/// Default EMA factor
pub const DEFAULT_EMA_ALPHA: f64 = 0.001;

/// `alpha * student + (1 - alpha) * teacher`
pub fn ema_blend<B: Backend, const D: usize>(
    student: Tensor<B, D>,
    teacher: Tensor<B, D>,
    alpha: f64,
) -> Tensor<B, D> {
    student.mul_scalar(alpha) + teacher.mul_scalar(1.0 - alpha)
}

/// Flattened float parameters of a module, in visit order
struct ParamCollector<B: Backend> {
    params: Vec<(Vec<usize>, Tensor<B, 1>)>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        let dims = tensor.dims().to_vec();
        let numel = dims.iter().product::<usize>();
        self.params.push((dims, tensor.reshape([numel])));
    }
}

/// Blends teacher parameters with the collected student ones
struct EmaMapper<B: Backend> {
    student: std::vec::IntoIter<(Vec<usize>, Tensor<B, 1>)>,
    alpha: f64,
    index: usize,
    error: Option<String>,
}

impl<B: Backend> ModuleMapper<B> for EmaMapper<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let index = self.index;
        self.index += 1;

        let Some((student_dims, student)) = self.student.next() else {
            self.error
                .get_or_insert_with(|| format!("teacher has more parameters than student ({}+)", index + 1));
            return param;
        };

        let teacher_dims = param.val().dims();
        if student_dims.as_slice() != teacher_dims.as_slice() {
            self.error.get_or_insert_with(|| {
                format!(
                    "parameter {} shape mismatch: student {:?}, teacher {:?}",
                    index, student_dims, teacher_dims
                )
            });
            return param;
        }

        let alpha = self.alpha;
        param.map(move |teacher| {
            let student: Tensor<B, D> = student.reshape(teacher_dims);
            ema_blend(student, teacher, alpha)
        })
    }
}

/// Move every teacher parameter towards the matching student parameter
///
/// Both modules must share the architecture; a differing parameter count or
/// shape is reported as [`SslError::Model`] and the teacher is not returned.
pub fn ema_update<B: Backend, M: Module<B>>(student: &M, teacher: M, alpha: f64) -> Result<M> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(SslError::InvalidInput(format!(
            "EMA alpha must be in [0, 1], got {}",
            alpha
        )));
    }

    let mut collector = ParamCollector { params: Vec::new() };
    student.visit(&mut collector);
    let student_count = collector.params.len();

    let mut mapper = EmaMapper {
        student: collector.params.into_iter(),
        alpha,
        index: 0,
        error: None,
    };
    let teacher = teacher.map(&mut mapper);

    if let Some(error) = mapper.error {
        return Err(SslError::Model(error));
    }
    if mapper.index != student_count {
        return Err(SslError::Model(format!(
            "parameter count mismatch: student {}, teacher {}",
            student_count, mapper.index
        )));
    }

    Ok(teacher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn values(module: &Linear<TestBackend>) -> Vec<f32> {
        let mut collector = ParamCollector { params: Vec::new() };
        module.visit(&mut collector);
        collector
            .params
            .into_iter()
            .flat_map(|(_, t)| t.into_data().to_vec::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_single_update() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let teacher: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let s = values(&student);
        let t = values(&teacher);

        let updated = ema_update(&student, teacher, DEFAULT_EMA_ALPHA).unwrap();
        let t_new = values(&updated);

        assert_eq!(t_new.len(), s.len());
        for ((tn, sv), tv) in t_new.iter().zip(&s).zip(&t) {
            let expected = 0.001 * sv + 0.999 * tv;
            assert!((tn - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_converges_to_constant_student() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);
        let mut teacher: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);
        for _ in 0..200 {
            teacher = ema_update(&student, teacher, 0.1).unwrap();
        }
        for (t, s) in values(&teacher).iter().zip(values(&student)) {
            assert!((t - s).abs() < 1e-4);
        }
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);
        let teacher: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let err = ema_update(&student, teacher, 0.5).unwrap_err();
        assert!(matches!(err, SslError::Model(_)));
    }

    #[test]
    fn test_count_mismatch_is_error() {
        let device = Default::default();
        let student: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);
        let teacher: Linear<TestBackend> = LinearConfig::new(2, 2).with_bias(false).init(&device);
        assert!(ema_update(&student, teacher, 0.5).is_err());
    }

    #[test]
    fn test_blend() {
        let device = Default::default();
        let s = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0], &device);
        let out: Vec<f32> = ema_blend(s, t, 0.25).into_data().to_vec().unwrap();
        assert_eq!(out, vec![0.25, 0.5]);
    }
}
