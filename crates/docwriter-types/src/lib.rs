mod diagram;
mod intake;
mod job;
mod memory;
mod message;
mod plan;
mod review;

pub use diagram::*;
pub use intake::*;
pub use job::*;
pub use memory::*;
pub use message::*;
pub use plan::*;
pub use review::*;
