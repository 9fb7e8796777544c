mod event;
mod run;
mod wire;

pub use event::*;
pub use run::*;
pub use wire::*;
