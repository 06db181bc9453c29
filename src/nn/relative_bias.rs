use crate::error::Result;
use crate::nn::{init_uniform, Module};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// T5 relative position bias table, `(num_buckets, num_heads)`.
///
/// Bidirectional tables (encoder) split the buckets between earlier and later
/// keys; causal tables (decoder) only see keys at or before the query.
pub struct RelativePositionBias {
    pub table: Tensor,
    pub num_buckets: usize,
    pub max_distance: usize,
    pub num_heads: usize,
    pub bidirectional: bool,
}

impl RelativePositionBias {
    pub fn new(
        num_buckets: usize,
        max_distance: usize,
        num_heads: usize,
        bidirectional: bool,
        rng: &mut StdRng,
    ) -> Self {
        RelativePositionBias {
            table: init_uniform(&[num_buckets, num_heads], 0.1, rng),
            num_buckets,
            max_distance,
            num_heads,
            bidirectional,
        }
    }

    /// Maps `memory_position - query_position` to a bucket. Small distances
    /// get one bucket each; larger ones share log-spaced buckets up to
    /// `max_distance`, beyond which everything lands in the last bucket.
    pub fn bucket(&self, relative_position: i64) -> usize {
        relative_position_bucket(
            relative_position,
            self.bidirectional,
            self.num_buckets,
            self.max_distance,
        )
    }

    /// Bias of shape `(1, heads, query_len, key_len)` where query `i` sits at
    /// absolute position `i` and key `j` at position `j`.
    pub fn compute_bias(&self, query_len: usize, key_len: usize) -> Result<Tensor> {
        let mut ids = Vec::with_capacity(query_len * key_len);
        for q in 0..query_len {
            for k in 0..key_len {
                ids.push(self.bucket(k as i64 - q as i64));
            }
        }
        let values = self.table.embedding(&ids, vec![query_len, key_len])?;
        values
            .permute(vec![2, 0, 1])?
            .reshape(vec![1, self.num_heads, query_len, key_len])
    }
}

impl Module for RelativePositionBias {
    fn parameters(&self) -> Vec<Tensor> {
        vec![self.table.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![(format!("{}relative_attention_bias", prefix), self.table.clone())]
    }
}

pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> usize {
    let mut buckets = num_buckets;
    let mut offset = 0usize;
    let distance = if bidirectional {
        buckets /= 2;
        if relative_position > 0 {
            offset = buckets;
        }
        relative_position.unsigned_abs() as usize
    } else {
        (-relative_position).max(0) as usize
    };

    let max_exact = buckets / 2;
    if distance < max_exact {
        return offset + distance;
    }
    let scaled = ((distance as f64 / max_exact as f64).ln()
        / (max_distance as f64 / max_exact as f64).ln()
        * (buckets - max_exact) as f64) as usize;
    offset + max_exact + scaled.min(buckets - max_exact - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidirectional_buckets_split_by_direction() {
        assert_eq!(relative_position_bucket(0, true, 32, 128), 0);
        assert_eq!(relative_position_bucket(-3, true, 32, 128), 3);
        assert_eq!(relative_position_bucket(3, true, 32, 128), 19);
        assert_eq!(relative_position_bucket(-1000, true, 32, 128), 15);
        assert_eq!(relative_position_bucket(1000, true, 32, 128), 31);
    }

    #[test]
    fn causal_buckets_ignore_future() {
        assert_eq!(relative_position_bucket(5, false, 32, 128), 0);
        assert_eq!(relative_position_bucket(-5, false, 32, 128), 5);
        assert_eq!(relative_position_bucket(-1000, false, 32, 128), 31);
    }
}
