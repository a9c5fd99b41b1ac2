mod hosts;
mod inbound;
mod outbound;

pub use hosts::*;
pub use inbound::*;
pub use outbound::*;
