//! Target-file output: backend abstraction and the multi-point writer
//! that serializes concurrent per-block writes with batched fsync.

pub mod multi_point;
pub mod output;

pub use multi_point::MultiPointOutputStream;
pub use output::{FileOutputStream, FileOutputStreamFactory, OutputStream, OutputStreamFactory};
