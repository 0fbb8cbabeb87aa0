//! Parallel, device-aware I/O
//!
//! Reads and writes are funneled through per-device controllers which bound
//! the amount of concurrent streams, so spinning disks are not thrashed and
//! fast devices can still be saturated.

pub mod multi_writer;
pub mod reader;
pub mod writer;

pub use multi_writer::{ParallelMultiWriter, UncheckedParallelMultiWriter};
pub use reader::{
    device_read_controllers, ChannelReader, ReadChannelController,
    RootedReadController,
};
pub use writer::{
    device_write_controllers, ChannelWriter, LazyFileWriter, RootedWriteController,
    WriteChannelController,
};

/// Size of the transfer buffer each gather worker owns
pub const BUF_SIZE: usize = 512 * 1024;
