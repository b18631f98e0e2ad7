//! Seguimiento de jobs particionados en fragmentos equivalentes.
//!
//! Un [`Task`] reparte un job en N fragmentos y controla su ciclo de vida
//! (pick, reporte, reintento, cancelación). Un [`Container`] agrupa tareas
//! por nombre y permite buscar trabajo entre todas ellas.

pub mod container;
pub mod error;
pub mod fragment;
pub mod task;
pub mod wire;

pub use container::{Container, ContainerEvent, NewTask, TaskFragment};
pub use error::{Error, Result, WireError};
pub use fragment::{Fragment, FragmentId, FragmentMut, FragmentState};
pub use task::{
    FragmentChange, PickFilter, SubscriptionId, Task, TaskEvent, TaskId, TaskSummary,
};
pub use wire::{FragmentRecord, TaskRecord, WireFormat};

pub type JobId = String;
pub type WorkerId = String;
