//! tasklink: client-side task dispatch and push routing over a long-lived
//! network transport.

mod cmd_table;
mod completion;
mod config;
mod payload;
mod task;
mod version;

pub mod codec;
pub mod dispatcher;
pub mod push;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use cmd_table::CmdIdTable;
pub use codec::{BinaryCodec, CodecError, JsonCodec, NoHooks, TaskCodec, TaskHooks};
pub use completion::{AlreadyResolved, Completer, TaskError, TaskHandle, TaskResult};
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherSnapshot};
pub use push::{PushHandler, PushMessage, PushRouter};
pub use task::{Task, TaskId, TaskKey, TaskPriority, TaskProperties, TaskRef, TaskState};
pub use transport::{
    CompletionDisposition, CompletionReceipt, ErrType, LOCAL_CANCEL_CODE, Transport,
    TransportError, TransportEvents,
};
pub use version::{TASKLINK_VERSION, VersionInfo};
