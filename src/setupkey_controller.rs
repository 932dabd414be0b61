mod main;
mod setupkey;

pub use main::*;
pub use setupkey::*;
