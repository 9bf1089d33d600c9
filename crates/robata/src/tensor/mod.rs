//! # Batch Buffers
//!
//! Row-addressed buffer operations shared by ingest, filter, merge and step.
//!
//! Every buffer is a [`candle_core::Tensor`] whose dimension [`constant::BATCH_DIM`]
//! indexes rows and whose dimension [`constant::SEQ_DIM`] indexes sequence
//! positions. Reshaping a batch never aliases a previous buffer's rows; each
//! operation produces a freshly gathered or padded tensor.

pub mod constant;
pub(crate) mod operations;
