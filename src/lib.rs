//! A T5-style encoder-decoder execution engine with a structural gating
//! overlay, incremental key/value caching, gradient checkpointing and
//! per-layer device placement, running on a small ndarray autograd tensor.
//!
//! ```no_run
//! use gated_t5::{nn::Seq2SeqEngine, nn::Seq2SeqInput, T5Config};
//! use ndarray::array;
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let model = Seq2SeqEngine::new(T5Config::tiny(10), &mut rng)?;
//! let ids = array![[1usize, 2, 3, 4]];
//! let labels = array![[2i64, 3, 4, 5]];
//! let out = model.forward(Seq2SeqInput {
//!     input_ids: Some(&ids),
//!     labels: Some(&labels),
//!     ..Default::default()
//! })?;
//! out.loss.unwrap().backward();
//! # Ok::<(), gated_t5::Error>(())
//! ```

pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod nn;
pub mod ops;
pub mod tensor;

pub use config::{ForwardFlags, T5Config};
pub use device::{Device, DeviceMap};
pub use dtype::DType;
pub use error::{Error, Result};
pub use tensor::Tensor;
