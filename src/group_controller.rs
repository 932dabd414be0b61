mod group;
mod main;

pub use group::*;
pub use main::*;
