pub mod config;
pub mod dispatcher;
pub mod job;
pub mod ops;
pub mod runner;
pub mod sink;
pub mod stream_buffer;

pub use config::EngineConfig;
pub use dispatcher::{Collaborators, Dispatcher, QueryPhase};
pub use job::{
    Job, JobContext, JobError, JobEvent, JobInput, JobLease, Operation, SlotName, TerminalEvent,
};
pub use ops::{QueryClient, SelectionSource, TextRecognizer};
pub use runner::{JobRunner, JoinOutcome};
pub use sink::ResultSink;
pub use stream_buffer::StreamBuffer;
