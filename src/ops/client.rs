//! Accelerator implementation of MemoryEfficientAttentionOps, delegating to `ops::fmha`.

use crate::error::Result;
use crate::ops::fmha::{self, BackwardOptions, BackwardOutput, ForwardOptions, ForwardOutput};
use crate::ops::traits::MemoryEfficientAttentionOps;
use crate::runtime::FmhaClient;
use crate::tensor::Tensor;

impl MemoryEfficientAttentionOps for FmhaClient {
    fn efficient_attention_forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        opts: &ForwardOptions<'_>,
    ) -> Result<ForwardOutput> {
        fmha::efficient_attention_forward(query, key, value, opts, self.config(), self.stream())
    }

    fn efficient_attention_backward(
        &self,
        grad_out: &Tensor,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        logsumexp: &Tensor,
        out: &Tensor,
        opts: &BackwardOptions<'_>,
    ) -> Result<BackwardOutput> {
        fmha::efficient_attention_backward(
            grad_out,
            query,
            key,
            value,
            logsumexp,
            out,
            opts,
            self.config(),
            self.stream(),
        )
    }

    fn efficient_attention_forward_decoder(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        seq_positions: &Tensor,
        scale: Option<f64>,
    ) -> Result<Tensor> {
        fmha::efficient_attention_forward_decoder(
            query,
            key,
            value,
            seq_positions,
            scale,
            self.config(),
            self.stream(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{accelerator_setup, sine_tensor};
    use crate::tensor::DType;

    #[test]
    fn test_decoder_agrees_with_forward_on_full_cache() {
        let (client, device) = accelerator_setup();
        let (b, t, h, d) = (2, 9, 2, 64);
        let q = sine_tensor(&[b, 1, h, d], 0.0, DType::F16, device);
        let k = sine_tensor(&[b, t, h, d], 3.0, DType::F16, device);
        let v = sine_tensor(&[b, t, h, d], 7.0, DType::F16, device);
        let lens = Tensor::from_i32(&[t as i32; 2], &[b], device).unwrap();

        let fwd = client
            .efficient_attention_forward(&q, &k, &v, &ForwardOptions::default())
            .unwrap();
        let dec = client
            .efficient_attention_forward_decoder(&q, &k, &v, &lens, None)
            .unwrap();
        client.synchronize().unwrap();

        let (a, c) = (fwd.out.to_vec_f32().unwrap(), dec.to_vec_f32().unwrap());
        let diff = a.iter().zip(&c).map(|(x, y)| (x - y).abs()).fold(0.0f32, f32::max);
        assert!(diff < 2e-3, "max diff {diff}");
        assert!(fwd.logsumexp.is_none());
    }
}
