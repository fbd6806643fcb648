//! Background task queue
//!
//! Producer side (`TaskDistributor`), consumer side (`TaskProcessor`) and the
//! brokers that sit between them.

mod broker;
mod distributor;
mod error;
mod memory_broker;
mod pg_broker;
mod processor;
mod retry;
mod send_verify_email;
mod task;

pub use broker::Broker;
pub use distributor::{BrokerTaskDistributor, TaskDistributor};
pub use error::{DistributeError, TaskError};
pub use memory_broker::{MemoryBroker, TaskRecord};
pub use pg_broker::PgBroker;
pub(crate) use pg_broker::insert_task;
pub use processor::{
    ErrorSink, LogErrorSink, ServeMux, TaskHandler, TaskOutcome, TaskProcessor, WorkerConfig,
};
pub use retry::RetryPolicy;
pub use send_verify_email::{
    random_string, PayloadSendVerifyEmail, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL,
};
pub use task::{
    LeasedTask, Task, TaskInfo, TaskOptions, TaskRequest, TaskState, QUEUE_CRITICAL,
    QUEUE_DEFAULT,
};
