// Core modules: value model, type grammar, cell parsing, table reading, encoding, output.
pub mod cell;
pub mod encode;
pub mod error;
pub mod func;
pub mod grammar;
pub mod output;
pub mod table;
pub mod value;
