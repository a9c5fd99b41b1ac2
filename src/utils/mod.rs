pub mod codec;
mod seq;

pub use seq::*;
