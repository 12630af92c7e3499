pub mod control;
pub mod exec;
pub mod frame;

pub use control::{ControlEvent, InitFrame};
pub use exec::{ExecOptions, ExecRequest, TermSize};
pub use frame::{Frame, FrameReader, FramingError, StreamType};
