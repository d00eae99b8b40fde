//! The context-economy engine: four-layer request assembly and the
//! incremental compression protocol.

pub mod builder;
pub mod compressor;

pub use builder::{BuildInput, BuiltContext, ContextBuilder, ContextError, TurnEstimate};
pub use compressor::{CompressionBatch, CompressionPrompt, Compressor};
