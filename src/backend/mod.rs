//! The file back-end: the lowest storage layer, where one shard equals one `.va` file on disk
//! (§4.B). Everything above this module (the naming factory, the manager, the multiplexer)
//! composes many of these into a virtual, unbounded-in-time stream.

pub mod file;
pub mod header;
pub mod record;

pub use file::FileBackEnd;
