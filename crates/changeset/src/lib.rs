mod changeset;
mod event;
mod reference;
mod value;

pub use changeset::*;
pub use event::*;
pub use reference::*;
pub use value::*;
