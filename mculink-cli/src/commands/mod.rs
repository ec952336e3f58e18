//! Subcommand implementations

pub mod checksum;
pub mod decode;
pub mod emulate;
pub mod encode;
pub mod listen;
pub mod send;
