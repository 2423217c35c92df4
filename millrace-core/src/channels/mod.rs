//! Record ports and the cursor views over them
mod cursor;
pub mod operator_io;
mod port;

pub use cursor::{InputCursor, OutputCursor};
pub use operator_io::{port_pair, ChannelInput, ChannelOutput};
pub use port::{PortError, PortInput, PortOutput, RowInput, RowOutput};
pub(crate) use port::check_arity;
