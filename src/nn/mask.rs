use crate::error::{Error, Result};
use crate::tensor::Tensor;
use ndarray::{Array2, Array4};

/// Additive score bias for masked-out positions.
pub const MASK_VALUE: f32 = -1.0e9;

/// All-ones padding mask.
pub fn full_mask(batch: usize, len: usize) -> Array2<f32> {
    Array2::ones((batch, len))
}

/// Turns a `(batch, key_len)` 0/1 padding mask into an additive bias of
/// shape `(batch, 1, query_len, key_len)`.
///
/// With `causal`, the queries are the last `query_len` positions of the key
/// range and each may only attend to keys at or before itself.
pub fn extended_attention_mask(
    mask: &Array2<f32>,
    query_len: usize,
    causal: bool,
) -> Result<Tensor> {
    let (batch, key_len) = mask.dim();
    if query_len > key_len {
        return Err(Error::Shape(format!(
            "attention mask covers {} keys but {} queries were given",
            key_len, query_len
        )));
    }
    let past = key_len - query_len;
    let rows = if causal { query_len } else { 1 };
    let out = Array4::from_shape_fn((batch, 1, rows, key_len), |(b, _, q, k)| {
        let visible = mask[[b, k]] > 0.0 && (!causal || k <= past + q);
        if visible {
            0.0
        } else {
            MASK_VALUE
        }
    });
    Ok(Tensor::new(out.into_dyn(), false))
}

/// Additive bias `(batch, 1, 1, key_len)` for attending over encoder states.
pub fn invert_attention_mask(mask: &Array2<f32>) -> Tensor {
    let (batch, key_len) = mask.dim();
    let out = Array4::from_shape_fn((batch, 1, 1, key_len), |(b, _, _, k)| {
        (1.0 - mask[[b, k]]) * MASK_VALUE
    });
    Tensor::new(out.into_dyn(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn causal_mask_respects_past_length() {
        let m = extended_attention_mask(&full_mask(1, 3), 1, true).unwrap();
        assert_eq!(m.shape(), vec![1, 1, 1, 3]);
        assert!(m.array().iter().all(|&v| v == 0.0));

        let m = extended_attention_mask(&full_mask(1, 3), 3, true).unwrap().array();
        assert_eq!(m[[0, 0, 0, 1]], MASK_VALUE);
        assert_eq!(m[[0, 0, 2, 1]], 0.0);
    }

    #[test]
    fn padding_is_masked_for_every_query() {
        let m = extended_attention_mask(&arr2(&[[1.0, 0.0]]), 2, false)
            .unwrap()
            .array();
        assert_eq!(m.shape(), &[1, 1, 1, 2]);
        assert_eq!(m[[0, 0, 0, 1]], MASK_VALUE);
        let inv = invert_attention_mask(&arr2(&[[1.0, 0.0]])).array();
        assert_eq!(inv[[0, 0, 0, 0]], 0.0);
        assert_eq!(inv[[0, 0, 0, 1]], MASK_VALUE);
    }
}
