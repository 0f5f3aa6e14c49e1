use super::{expect_arity, gemm, reshaped, transposed, Unit, UnitCache};
use crate::compute;
use crate::error::Error;
use crate::graph::backward_fn;
use crate::registry::Tensor;
use crate::session::Session;
use crate::shape::Shape;

const TRANSPOSED_WEIGHT: &str = "transposed_weight";
const ONES: &str = "ones";
const EXPANDED_BIAS: &str = "expanded_bias";

/// Fully connected layer: `y = x · Wᵀ + b`.
///
/// Called with `[x, weight, bias]` where `weight` is `[out, in]` and `bias`
/// is `[out]` or `[1, out]`. Every dimension of `x` in front of the last one
/// is folded into rows, so `x` may have any rank. The transposed weight, a
/// column of ones and the bias expanded to one row per input row are kept in
/// the unit's cache between calls.
#[derive(Debug)]
pub struct Linear {
    name: String,
    in_features: usize,
    out_features: usize,
    cache: UnitCache,
}

impl Linear {
    pub fn new(session: &mut Session, in_features: usize, out_features: usize) -> Self {
        Self {
            name: format!("Linear{}", session.next_unit_id()),
            in_features,
            out_features,
            cache: UnitCache::new(),
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn cache(&self) -> &UnitCache {
        &self.cache
    }

    fn mismatch(&self, detail: String) -> Error {
        Error::ArgumentShapeMismatch {
            unit: self.name.clone(),
            detail,
        }
    }
}

impl Unit for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_arguments(&self, session: &Session, inputs: &[Tensor]) -> Result<(), Error> {
        expect_arity(&self.name, inputs, 3)?;
        let x = session.storage(inputs[0])?;
        if x.shape().cols() != self.in_features {
            return Err(self.mismatch(format!(
                "Shape mismatch: input {} for {} input features",
                x.shape(),
                self.in_features
            )));
        }
        let weight = session.shape(inputs[1])?;
        if weight.dims() != [self.out_features, self.in_features].as_slice() {
            return Err(self.mismatch(format!(
                "weight {weight}, expected [{}, {}]",
                self.out_features, self.in_features
            )));
        }
        let bias = session.shape(inputs[2])?;
        if bias.cols() != self.out_features || bias.size() != self.out_features {
            return Err(self.mismatch(format!(
                "bias {bias}, expected {} values",
                self.out_features
            )));
        }
        for param in &inputs[1..] {
            let mode = session.storage(*param)?.mode();
            if mode != x.mode() {
                return Err(Error::ModeMismatch {
                    op: self.name.clone(),
                    expected: x.mode(),
                    actual: mode,
                });
            }
        }
        Ok(())
    }

    fn forward(&mut self, session: &mut Session, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arguments(session, inputs)?;
        let batched = session.config().batched_gemm_fast_path;
        let (in_features, out_features) = (self.in_features, self.out_features);
        let x = session.storage(inputs[0])?;
        let weight = session.storage(inputs[1])?;
        let bias = session.storage(inputs[2])?;

        let x_shape = x.shape().clone();
        let rows = x_shape.outer_count();
        let x2 = reshaped(x, Shape::new(&[rows, in_features])?)?;
        let bias_row = reshaped(bias, Shape::new(&[1, out_features])?)?;

        let transposed_weight =
            self.cache
                .get_or_create(TRANSPOSED_WEIGHT, &Shape::new(&[in_features, out_features])?, weight)?;
        compute::transpose(transposed_weight, weight)?;

        let ones = self.cache.get_or_create(ONES, &Shape::new(&[rows, 1])?, x)?;
        ones.fill(1.0)?;
        let ones = ones.clone();

        let expanded_bias = self
            .cache
            .get_or_create(EXPANDED_BIAS, &Shape::new(&[rows, out_features])?, x)?;
        gemm(batched, expanded_bias, &ones, &bias_row, None)?;

        let (transposed_weight, expanded_bias) = match (
            self.cache.get(TRANSPOSED_WEIGHT),
            self.cache.get(EXPANDED_BIAS),
        ) {
            (Some(w), Some(b)) => (w, b),
            _ => {
                return Err(Error::InternalLogicError(format!(
                    "{} lost its cache entries",
                    self.name
                )))
            }
        };
        let mut y = x.zeros_with_shape(Shape::new(&[rows, out_features])?)?;
        gemm(batched, &mut y, &x2, transposed_weight, Some(expanded_bias))?;
        y.reshape(x_shape.with_cols(out_features))?;

        tracing::debug!(unit = %self.name, rows, in_features, out_features, "linear forward");
        session.record(
            &self.name,
            inputs,
            y,
            backward_fn(move |ctx| {
                let (x, weight, bias) = (ctx.input(0)?, ctx.input(1)?, ctx.input(2)?);
                let dy = reshaped(ctx.output_grad(0)?, Shape::new(&[rows, out_features])?)?;
                let x2 = reshaped(x, Shape::new(&[rows, in_features])?)?;

                // dx = dy · W
                let mut dx = x2.zeros_like()?;
                gemm(batched, &mut dx, &dy, weight, None)?;
                dx.reshape(x.shape().clone())?;

                // dW = dyᵀ · x
                let mut dw = weight.zeros_like()?;
                gemm(batched, &mut dw, &transposed(&dy)?, &x2, None)?;

                // db = onesᵀ · dy
                let mut db = dy.zeros_with_shape(Shape::new(&[1, out_features])?)?;
                gemm(batched, &mut db, &transposed(&ones)?, &dy, None)?;
                db.reshape(bias.shape().clone())?;

                Ok(vec![Some(dx), Some(dw), Some(db)])
            }),
        )
    }
}
