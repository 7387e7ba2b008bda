//! Continuous-time samplers in the style of k-diffusion.
//!
//! The noise levels come from the training schedule of a discrete-time
//! (CompVis) model: `sigma = sqrt((1 - alpha_cumprod) / alpha_cumprod)`. The
//! network is still queried with a discrete timestep, recovered from sigma by
//! interpolating the log-sigma table.

use burn::tensor::backend::Backend;
use burn::tensor::{Data, Shape, Tensor};
use tracing::debug;

use super::ddim::DDIMSchedulerConfig;
use super::{linspace, ContinuousSampler};
use crate::error::{DiffusionError, Result};
use crate::guidance::DynamicGuidance;
use crate::pipelines::stepper::StepExecutor;
use crate::utils::{duplicate_batch, ensure_device, to_f64_vec};

/// Exponent of the Karras et al. (2022) noise schedule.
const KARRAS_RHO: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KMethod {
    /// First order, one evaluation per step.
    Euler,
    /// Second order, two evaluations per step except the last one.
    Heun,
    /// DPM-Solver++(2M), one evaluation per step.
    Dpmpp2m,
}

impl KMethod {
    pub fn model_evaluations(&self, steps: usize) -> usize {
        match self {
            KMethod::Euler | KMethod::Dpmpp2m => steps,
            KMethod::Heun => (2 * steps).saturating_sub(1),
        }
    }
}

#[derive(Debug)]
pub struct KSampler<B: Backend> {
    method: KMethod,
    sigmas: Tensor<B, 1>,
    log_sigmas: Tensor<B, 1>,
    use_karras_sigmas: bool,
}

impl<B: Backend> KSampler<B> {
    pub fn new(method: KMethod, config: &DDIMSchedulerConfig, device: &B::Device) -> Self {
        let sigmas: Vec<f32> = config
            .alphas_cumprod()
            .into_iter()
            .map(|alpha| ((1.0 - alpha) / alpha).sqrt() as f32)
            .collect();
        let log_sigmas: Vec<f32> = sigmas.iter().map(|sigma| sigma.ln()).collect();
        let shape = Shape::new([sigmas.len()]);

        Self {
            method,
            sigmas: Tensor::from_floats(Data::new(sigmas, shape.clone()), device),
            log_sigmas: Tensor::from_floats(Data::new(log_sigmas, shape), device),
            use_karras_sigmas: false,
        }
    }

    pub fn with_karras_sigmas(mut self, use_karras_sigmas: bool) -> Self {
        self.use_karras_sigmas = use_karras_sigmas;
        self
    }

    pub fn method(&self) -> KMethod {
        self.method
    }

    pub fn device(&self) -> B::Device {
        self.sigmas.device()
    }

    fn schedule(&self, steps: usize, log_sigmas: &[f64]) -> Vec<f64> {
        let mut sigmas = if self.use_karras_sigmas {
            let sigma_min = log_sigmas.first().copied().unwrap_or_default().exp();
            let sigma_max = log_sigmas.last().copied().unwrap_or_default().exp();
            karras_sigmas(steps, sigma_min, sigma_max)
        } else {
            let last = log_sigmas.len().saturating_sub(1) as f64;
            linspace(last, 0.0, steps)
                .into_iter()
                .map(|t| t_to_sigma(t, log_sigmas))
                .collect()
        };
        sigmas.push(0.0);
        sigmas
    }

    // Denoised estimate of `x` at noise level `sigma`, with guidance.
    fn denoise(
        &self,
        executor: &StepExecutor<'_, B>,
        guidance: &mut DynamicGuidance,
        x: Tensor<B, 4>,
        sigma: f64,
        log_sigmas: &[f64],
        evaluation: usize,
    ) -> Result<Tensor<B, 4>> {
        let c_in = 1.0 / (sigma * sigma + 1.0).sqrt();
        let timestep = sigma_to_t(sigma, log_sigmas);
        let model_input = duplicate_batch(x.clone()).mul_scalar(c_in);
        let eps = executor.guided_noise(model_input, timestep, guidance, evaluation)?;
        Ok(x - eps.mul_scalar(sigma))
    }
}

impl<B: Backend> ContinuousSampler<B> for KSampler<B> {
    fn to_device(&mut self, device: &B::Device) {
        self.sigmas = self.sigmas.clone().to_device(device);
        self.log_sigmas = self.log_sigmas.clone().to_device(device);
    }

    fn sigmas(&self, steps: usize) -> Vec<f64> {
        self.schedule(steps, &to_f64_vec(self.log_sigmas.clone()))
    }

    fn model_evaluations(&self, steps: usize) -> usize {
        self.method.model_evaluations(steps)
    }

    fn sample(
        &self,
        steps: usize,
        initial: Tensor<B, 4>,
        executor: &StepExecutor<'_, B>,
        guidance: &mut DynamicGuidance,
    ) -> Result<Tensor<B, 4>> {
        ensure_device::<B>("sigma table", &initial.device(), &self.sigmas.device())?;
        if steps == 0 {
            return Err(DiffusionError::EmptySchedule);
        }
        let log_sigmas = to_f64_vec(self.log_sigmas.clone());
        let sigmas = self.schedule(steps, &log_sigmas);
        guidance.set_timesteps(self.method.model_evaluations(steps));

        let mut x = initial.mul_scalar(sigmas[0]);
        let mut evaluation = 0;
        let mut old_denoised: Option<Tensor<B, 4>> = None;

        for i in 0..steps {
            let (sigma, sigma_next) = (sigmas[i], sigmas[i + 1]);
            debug!(step = i, sigma, sigma_next, method = ?self.method, "Sampling step");

            let denoised =
                self.denoise(executor, guidance, x.clone(), sigma, &log_sigmas, evaluation)?;
            evaluation += 1;

            x = match self.method {
                KMethod::Euler => {
                    let d = (x.clone() - denoised).div_scalar(sigma);
                    x + d.mul_scalar(sigma_next - sigma)
                }
                KMethod::Heun => {
                    let d = (x.clone() - denoised).div_scalar(sigma);
                    let dt = sigma_next - sigma;
                    if sigma_next == 0.0 {
                        x + d.mul_scalar(dt)
                    } else {
                        let x_2 = x.clone() + d.clone().mul_scalar(dt);
                        let denoised_2 = self.denoise(
                            executor,
                            guidance,
                            x_2.clone(),
                            sigma_next,
                            &log_sigmas,
                            evaluation,
                        )?;
                        evaluation += 1;
                        let d_2 = (x_2 - denoised_2).div_scalar(sigma_next);
                        x + (d + d_2).mul_scalar(dt / 2.0)
                    }
                }
                KMethod::Dpmpp2m => {
                    let next = if sigma_next == 0.0 {
                        denoised.clone()
                    } else {
                        let (t, t_next) = (-sigma.ln(), -sigma_next.ln());
                        let h = t_next - t;
                        let target = match &old_denoised {
                            Some(old) if i > 0 => {
                                let h_last = t + sigmas[i - 1].ln();
                                let r = h_last / h;
                                denoised.clone().mul_scalar(1.0 + 1.0 / (2.0 * r))
                                    - old.clone().mul_scalar(1.0 / (2.0 * r))
                            }
                            _ => denoised.clone(),
                        };
                        x.mul_scalar(sigma_next / sigma) - target.mul_scalar((-h).exp_m1())
                    };
                    old_denoised = Some(denoised);
                    next
                }
            };
        }

        Ok(x)
    }
}

/// Karras et al. (2022) noise levels from `sigma_max` down to `sigma_min`.
pub fn karras_sigmas(steps: usize, sigma_min: f64, sigma_max: f64) -> Vec<f64> {
    let min_inv_rho = sigma_min.powf(1.0 / KARRAS_RHO);
    let max_inv_rho = sigma_max.powf(1.0 / KARRAS_RHO);
    linspace(0.0, 1.0, steps)
        .into_iter()
        .map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(KARRAS_RHO))
        .collect()
}

/// Sigma at the fractional training timestep `t`.
fn t_to_sigma(t: f64, log_sigmas: &[f64]) -> f64 {
    let last = log_sigmas.len().saturating_sub(1);
    let t = t.clamp(0.0, last as f64);
    let low = t.floor() as usize;
    let high = (t.ceil() as usize).min(last);
    let w = t - low as f64;
    ((1.0 - w) * log_sigmas[low] + w * log_sigmas[high]).exp()
}

/// Fractional training timestep of `sigma`, the inverse of `t_to_sigma`.
fn sigma_to_t(sigma: f64, log_sigmas: &[f64]) -> f64 {
    if log_sigmas.len() < 2 {
        return 0.0;
    }
    let log_sigma = sigma.ln();
    let below = log_sigmas.iter().filter(|&&ls| ls <= log_sigma).count();
    let low = below.saturating_sub(1).min(log_sigmas.len() - 2);
    let high = low + 1;
    let w = ((log_sigmas[low] - log_sigma) / (log_sigmas[low] - log_sigmas[high])).clamp(0.0, 1.0);
    (1.0 - w) * low as f64 + w * high as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::GuidanceKind;
    use crate::pipelines::stepper::Conditioning;
    use crate::testing::ConstantDenoiser;
    use crate::TestBackend;

    fn sampler(method: KMethod) -> KSampler<TestBackend> {
        let device = <TestBackend as Backend>::Device::default();
        KSampler::new(method, &DDIMSchedulerConfig::new(), &device)
    }

    #[test]
    fn test_evaluation_counts() {
        assert_eq!(KMethod::Euler.model_evaluations(20), 20);
        assert_eq!(KMethod::Dpmpp2m.model_evaluations(20), 20);
        assert_eq!(KMethod::Heun.model_evaluations(20), 39);
        assert_eq!(KMethod::Heun.model_evaluations(0), 0);
    }

    #[test]
    fn test_sigmas_descend_to_zero() {
        for karras in [false, true] {
            let sampler = sampler(KMethod::Euler).with_karras_sigmas(karras);

            let sigmas = sampler.sigmas(10);

            assert_eq!(sigmas.len(), 11);
            assert_eq!(sigmas[10], 0.0);
            assert!(sigmas.windows(2).all(|w| w[0] > w[1]), "{sigmas:?}");
            // sigma_max of the SD 1.x schedule
            assert!((sigmas[0] - 14.61).abs() < 0.05, "{}", sigmas[0]);
        }
    }

    #[test]
    fn test_sigma_to_t_inverts_the_table() {
        let log_sigmas = to_f64_vec(sampler(KMethod::Euler).log_sigmas);

        for t in [0.0, 1.0, 17.5, 500.0, 998.25, 999.0] {
            let sigma = t_to_sigma(t, &log_sigmas);
            assert!((sigma_to_t(sigma, &log_sigmas) - t).abs() < 1e-3, "{t}");
        }
    }

    #[test]
    fn test_karras_endpoints() {
        let sigmas = karras_sigmas(5, 0.03, 14.6);

        assert!((sigmas[0] - 14.6).abs() < 1e-9);
        assert!((sigmas[4] - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_guidance_follows_model_evaluations() {
        let device = <TestBackend as Backend>::Device::default();
        let denoiser = ConstantDenoiser::new(4, 0.0, 0.0);
        let conditioning = Conditioning::<TestBackend>::zeros(3, 2, &device);
        let executor = StepExecutor::new(&denoiser, &conditioning);

        for method in [KMethod::Euler, KMethod::Heun, KMethod::Dpmpp2m] {
            let mut guidance = DynamicGuidance::constant(GuidanceKind::Baseline.transform(), 7.5);
            let initial = Tensor::ones([1, 4, 2, 2], &device);

            sampler(method)
                .sample(6, initial, &executor, &mut guidance)
                .unwrap();

            assert_eq!(guidance.timesteps(), Some(method.model_evaluations(6)));
            guidance.finish().unwrap();
        }
    }

    #[test]
    fn test_zero_noise_keeps_the_sample() {
        let device = <TestBackend as Backend>::Device::default();
        let denoiser = ConstantDenoiser::new(4, 0.0, 0.0);
        let conditioning = Conditioning::<TestBackend>::zeros(3, 2, &device);
        let executor = StepExecutor::new(&denoiser, &conditioning);

        // With eps = 0 every denoised estimate is the scaled initial sample.
        for method in [KMethod::Euler, KMethod::Heun, KMethod::Dpmpp2m] {
            let sampler = sampler(method);
            let sigma_max = sampler.sigmas(4)[0];
            let mut guidance = DynamicGuidance::constant(GuidanceKind::Baseline.transform(), 7.5);
            let initial = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);

            let latents = sampler
                .sample(4, initial, &executor, &mut guidance)
                .unwrap();

            for value in to_f64_vec(latents) {
                assert!((value - sigma_max).abs() < 1e-3, "{method:?}: {value}");
            }
        }
    }

    #[test]
    fn test_zero_steps_is_an_error() {
        let device = <TestBackend as Backend>::Device::default();
        let denoiser = ConstantDenoiser::new(4, 0.0, 0.0);
        let conditioning = Conditioning::<TestBackend>::zeros(3, 2, &device);
        let executor = StepExecutor::new(&denoiser, &conditioning);
        let mut guidance = DynamicGuidance::constant(GuidanceKind::Baseline.transform(), 7.5);

        let err = sampler(KMethod::Euler)
            .sample(0, Tensor::ones([1, 4, 2, 2], &device), &executor, &mut guidance)
            .unwrap_err();

        assert!(matches!(err, DiffusionError::EmptySchedule));
    }
}
