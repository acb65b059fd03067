//! # Messaging Module
//!
//! Wire contracts, the task envelope codec and the transport abstraction
//! for queue/topic based orchestration.

pub mod codec;
pub mod errors;
pub mod messages;
pub mod transport;

pub use codec::{CommandRegistry, CommandResources, CoreCommand, DecodedCommand};
pub use errors::{CodecError, MessagingError};
pub use messages::{
    BusMessage, CreateOperationCommand, ErrorData, OperationEvent, OperationTaskAcceptedEvent,
    OperationTaskProgressEvent, OperationTaskStatusEvent, StartOperation, TaskEnvelope,
    TaskOutcome,
};
pub use transport::{DeadLetter, InMemoryTransport, MessageHandler, MessageTransport};
