//! Everything that talks to a single engine process: the line protocol, reply
//! assembly, request sanitizing, and the subprocess handle itself.

pub mod assembler;
pub mod process;
pub mod protocol;
pub mod sanitizer;

pub use assembler::ReplyAssembler;
pub use process::{EngineCommand, EngineProcess};
pub use protocol::{classify, ReplyLine};
pub use sanitizer::{RequestSanitizer, RequestTransform, TransformError};
