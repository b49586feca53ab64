//! Block exchange between peers sharing one file.
//!
//! A seeder holds the complete file and serves its blocks. Leechers download the blocks they are
//! missing from their neighbors, verify every block against the file's metadata and, once the
//! whole file checks out, start seeding it themselves.

pub mod block_picker;
pub mod cli;
pub mod config;
pub mod metainfo;
pub mod node;
pub mod peer_protocol;
pub mod peers;
pub mod prelude;
pub mod sample_file;
pub mod storage;
