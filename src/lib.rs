pub mod layer;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod utils;

pub use layer::Datapack;
pub use session::{Session, SessionBuilder, SessionError, Stat};
