//! bobbin-core
//!
//! Client-side distributed task processing on top of a shared document store.
//! Processes lease due tasks with fencing tokens, run user handlers on them and
//! write back the outcome, coordinating only through the store's optimistic
//! concurrency.
//!
//! # モジュール構成
//! - **domain**: task records, ids, schedule, status projection, errors, events
//! - **ports**: TaskStore, Clock, IdGenerator
//! - **impls**: in-memory store, retrying store wrapper
//! - **lease**: batch lease acquisition, LeaseHolder state machine, retry policy
//! - **patch**: JSON merge patch, two-lane serial queue, TaskDataController
//! - **app**: Listener polling loop, handler trait, config, builder

pub mod app;
pub mod domain;
pub mod impls;
pub mod lease;
pub mod patch;
pub mod ports;

pub use crate::app::{Listener, ListenerBuilder, ListenerConfig, TaskHandler, handler_fn};
pub use crate::domain::{BobbinError, TaskOptions, TaskRecord, TaskStatus, TaskType};
pub use crate::lease::{FinishOptions, LeaseHolder};
