//! # Constants with reserved meanings in robata's batch buffers

/// Every batch buffer reserves the `0th` dimension for rows
pub const BATCH_DIM: usize = 0;

/// Every batch buffer reserves the `1st` dimension for sequence positions
pub const SEQ_DIM: usize = 1;

/// Position index written for left-padding columns instead of a negative value
pub const POSITION_SENTINEL: i64 = 1;

/// How far behind the read offset incremental decoding starts at ingest
pub const PREFIX_OFFSET_WINDOW: usize = 5;
