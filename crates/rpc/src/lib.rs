//! Request/response correlation over a message broker.
//!
//! An [`RpcMaster`] publishes requests through a [`Transport`] and matches
//! replies back to [`RpcTask`]s by correlation id. Tasks that never hear back
//! are evicted by a [`TimeoutMonitor`]; [`RpcMaster::close`] drains whatever is
//! still in flight before releasing the transport.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod checker;
pub mod config;
pub mod countdown;
pub mod error;
pub mod info;
pub mod master;
pub mod message;
pub mod monitor;
pub mod pubsub;
pub mod task;
pub mod watcher;
pub mod worker;

pub use checker::{
    CheckReport, CheckStatus, DEFAULT_PROBE_TIMEOUT, MasterChecker, PING_ROUTINE, Ping, Pong,
    RpcChecker, run_check,
};
pub use config::{DeliveryMode, PubsubConfig, RequestOptions, RpcMasterConfig, RpcWorkerConfig};
pub use countdown::Countdown;
pub use error::{Error, Result};
pub use info::{InfoCollector, Scope};
pub use master::RpcMaster;
pub use message::{Message, Payload};
pub use monitor::{TimeoutMonitor, Timeoutable};
pub use pubsub::{PubsubHandler, PubsubListener};
pub use task::{CompletionCause, ResponsePolicy, RpcTask, TaskEvent, TaskListener, TaskState};
pub use watcher::TimeoutWatcher;
pub use worker::{RoutineHandler, RpcWorker};

#[doc(no_inline)]
pub use courier_transport::Transport;
