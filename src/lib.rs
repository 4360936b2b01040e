//! Batched molecular graph encoder for retrosynthesis.
//!
//! Molecules arrive as one concatenated sparse batch (node rows, directed
//! bond edges, and a `ptr` array marking where each molecule starts). Every
//! encoder layer runs two branches over the same node features:
//!
//! - sparse message passing along bonds ([`conv`], GIN or GAT variant)
//! - dense multi-head self-attention inside each molecule ([`attention`]),
//!   reached through the padded batch form ([`batch`])
//!
//! and fuses them ([`mix`]) before normalization, dropout and an edge
//! feature refresh ([`edge_update`]). The stack lives in [`encoder`].
//!
//! # Example
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use retrograph_nn::{BatchIndex, EdgeIndex, Encoder, EncoderConfig, GraphBatch, Variant};
//!
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//!
//! let config = EncoderConfig::default()
//!     .with_emb_dim(16)
//!     .with_n_layers(2)
//!     .with_variant(Variant::Gat);
//! let encoder = Encoder::new(config, vb)?;
//!
//! // Two molecules: 3 atoms and 2 atoms.
//! let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0), (1, 2), (2, 1), (3, 4), (4, 3)], 5)?;
//! let batch = BatchIndex::from_ptr(&[0, 3, 5], &device)?;
//! let x = Tensor::randn(0f32, 1.0, (5, 16), &device)?;
//! let e = Tensor::randn(0f32, 1.0, (6, 16), &device)?;
//!
//! let graph = GraphBatch::new(x, e, edges, batch)?;
//! // `None` runs inference; pass `Some(&mut rng)` to train with dropout.
//! let out = encoder.forward(&graph, None)?;
//! assert_eq!(out.node_features.dims(), &[5, 16]);
//! assert_eq!(out.edge_features.dims(), &[6, 16]);
//! # Ok::<(), retrograph_nn::Error>(())
//! ```

pub mod attention;
pub mod batch;
pub mod config;
pub mod conv;
pub mod dropout;
pub mod edge_update;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod heads;
pub mod interaction;
pub mod mix;
pub mod norm;
pub mod segment;

pub use attention::{DenseMultiHeadAttention, DenseSelfAttention};
pub use batch::{to_sparse_masked, BatchIndex};
pub use config::{Backbone, EncoderConfig, Fusion, Variant};
pub use conv::{EdgeProjector, GatConv, GinConv, MessageGraph, MessagePassing, SparseConv};
pub use dropout::Dropout;
pub use edge_update::EdgeUpdateLayer;
pub use encoder::{Encoder, EncoderOutput, GraphBatch};
pub use error::{Error, Result};
pub use graph::{EdgeIndex, SelfLoopPlan};
pub use heads::{graph_summed_cross_entropy, SynthonHead, SynthonLogits};
pub use interaction::{GraphInteraction, PairInteraction};
pub use mix::MixLayer;
pub use norm::{layer_norm, LayerNorm};
pub use segment::{segment_softmax, SegmentIndex};
