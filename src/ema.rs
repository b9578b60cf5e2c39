use crate::error::{Result, TrainError};
use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, Param};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::marker::PhantomData;

/// Exponential moving average of a model's parameters.
///
/// The shadow copy lives on the inner (non-autodiff) backend, so it can never
/// be the target of backpropagation or of an optimizer step. Any module whose
/// parameters can be visited in a stable order can be tracked.
#[derive(Debug)]
pub struct EmaTracker<B: AutodiffBackend, M: AutodiffModule<B>> {
    shadow: M::InnerModule,
    updates: usize,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> EmaTracker<B, M> {
    /// Seed the shadow copy with the live model's current parameters.
    pub fn new(live: &M) -> Self {
        Self {
            shadow: live.valid(),
            updates: 0,
            _backend: PhantomData,
        }
    }

    /// `shadow <- decay * shadow + (1 - decay) * live`, parameter-wise.
    pub fn update(&mut self, live: &M, decay: f64) -> Result<()> {
        let mut collector = ParamCollector::default();
        live.valid().visit(&mut collector);

        let mut blender = EmaBlender {
            live: collector.params,
            cursor: 0,
            decay,
            mismatch: false,
        };
        let shadow = self.shadow.clone().map(&mut blender);
        if blender.mismatch || blender.cursor != blender.live.len() {
            return Err(TrainError::Configuration(
                "EMA shadow does not match the live model's parameters".to_string(),
            ));
        }

        self.shadow = shadow;
        self.updates += 1;
        Ok(())
    }

    /// Force the shadow back to an exact copy of `live`.
    pub fn reset(&mut self, live: &M) {
        self.shadow = live.valid();
    }

    pub fn shadow(&self) -> &M::InnerModule {
        &self.shadow
    }

    pub fn updates(&self) -> usize {
        self.updates
    }
}

/// Flattened copy of every float parameter, in visiting order.
pub fn parameter_snapshot<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<Vec<f32>>> {
    let mut collector = ParamCollector::default();
    module.visit(&mut collector);
    collector
        .params
        .into_iter()
        .map(|tensor| {
            tensor
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|err| TrainError::Tensor(format!("failed to read parameter data: {err:?}")))
        })
        .collect()
}

struct ParamCollector<B: Backend> {
    params: Vec<Tensor<B, 1>>,
}

impl<B: Backend> Default for ParamCollector<B> {
    fn default() -> Self {
        Self { params: Vec::new() }
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        let elements = tensor.shape().num_elements();
        self.params.push(tensor.reshape([elements]));
    }
}

struct EmaBlender<B: Backend> {
    live: Vec<Tensor<B, 1>>,
    cursor: usize,
    decay: f64,
    mismatch: bool,
}

impl<B: Backend> ModuleMapper<B> for EmaBlender<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(live) = self.live.get(self.cursor).cloned() else {
            self.mismatch = true;
            return param;
        };
        self.cursor += 1;

        let dims = param.val().dims();
        if dims.iter().product::<usize>() != live.dims()[0] {
            self.mismatch = true;
            return param;
        }

        let decay = self.decay;
        param.map(|shadow| {
            let live = live.reshape(dims);
            shadow.mul_scalar(decay).add(live.mul_scalar(1.0 - decay))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Generator, GeneratorConfig};
    use approx::assert_relative_eq;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_generator(device: &<TestBackend as Backend>::Device) -> Generator<TestBackend> {
        GeneratorConfig::new(3, 3, 4, 1, 1).init(device)
    }

    #[test]
    fn shadow_starts_equal_to_live() {
        let device = Default::default();
        let live = tiny_generator(&device);
        let ema = EmaTracker::new(&live);

        assert_eq!(parameter_snapshot(ema.shadow()).unwrap(), parameter_snapshot(&live).unwrap());
    }

    #[test]
    fn snapshot_covers_every_parameter_value() {
        let device = Default::default();
        let live = tiny_generator(&device);

        let snapshot = parameter_snapshot(&live).unwrap();

        assert!(!snapshot.is_empty());
        assert!(snapshot.iter().all(|values| !values.is_empty()));
        let total: usize = snapshot.iter().map(Vec::len).sum();
        assert_eq!(total, live.num_params());
    }

    #[test]
    fn update_blends_parameters() {
        let device = Default::default();
        let first = tiny_generator(&device);
        let second = tiny_generator(&device);
        let mut ema = EmaTracker::new(&first);

        ema.update(&second, 0.75).unwrap();

        let old = parameter_snapshot(&first).unwrap();
        let live = parameter_snapshot(&second).unwrap();
        let blended = parameter_snapshot(ema.shadow()).unwrap();
        assert_eq!(blended.len(), old.len());
        for ((b, o), l) in blended.iter().zip(old.iter()).zip(live.iter()) {
            for ((bv, ov), lv) in b.iter().zip(o.iter()).zip(l.iter()) {
                assert_relative_eq!(*bv, 0.75 * ov + 0.25 * lv, epsilon = 1e-6);
            }
        }
        assert_eq!(ema.updates(), 1);
    }

    #[test]
    fn decay_one_freezes_shadow() {
        let device = Default::default();
        let first = tiny_generator(&device);
        let second = tiny_generator(&device);
        let mut ema = EmaTracker::new(&first);

        ema.update(&second, 1.0).unwrap();

        assert_eq!(parameter_snapshot(ema.shadow()).unwrap(), parameter_snapshot(&first).unwrap());
    }

    #[test]
    fn structural_mismatch_is_rejected() {
        let device = Default::default();
        let small = tiny_generator(&device);
        let large: Generator<TestBackend> = GeneratorConfig::new(3, 3, 4, 1, 2).init(&device);
        let mut ema = EmaTracker::new(&small);

        assert!(ema.update(&large, 0.5).is_err());
    }
}
