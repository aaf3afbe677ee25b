//! Type definitions

pub mod batch;
pub mod driver;
pub mod events;
pub mod messages;
pub mod order;

pub use batch::*;
pub use driver::*;
pub use events::*;
pub use messages::*;
pub use order::*;
