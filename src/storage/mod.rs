//! Storage layer - backing files for dumped buffers.
//!
//! - [`DumpStore`] - Write / read / delete interface used by the manager
//! - [`FileDumpStore`] - One checksummed file per dump in a directory

mod dump_store;

pub use dump_store::{read_raw_file, DumpHandle, DumpStore, FileDumpStore, DUMP_HEADER_SIZE};
