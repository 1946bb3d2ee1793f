mod buffer_index;

pub use buffer_index::{BufferIndex, IndexError};
