//! Task lifecycle: CRUD, status machine, dependencies and unblocking

mod service;

pub use service::{detect_cycle, CreateTaskSpec, TaskService};
