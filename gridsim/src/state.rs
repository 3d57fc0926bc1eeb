use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{ResultId, SessionId, TaskId, TaskOptions};

/// Estado interno de una tarea dentro del simulador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStatus {
    /// Creada, a la espera de que sus dependencias terminen.
    Queued,
    Running,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub options: TaskOptions,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
}

/// Una tarea registrada en el grid. `output` es el slot de resultado:
/// None mientras está pendiente, después bytes o mensajes de error.
/// La transición es única y definitiva.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub id: TaskId,
    pub session_id: SessionId,
    pub payload: Vec<u8>,
    pub dependencies: Vec<TaskId>,
    pub expected_outputs: Vec<ResultId>,
    /// Si la salida propia es descargable por el cliente; los
    /// expected_output_ids pre-generados lo son siempre.
    pub mark_output_as_result: bool,
    pub status: SimStatus,
    pub attempt: u32,
    pub output: Option<Result<Vec<u8>, String>>,
}

#[derive(Default)]
pub struct GridState {
    pub sessions: HashMap<SessionId, SessionMeta>,
    pub tasks: HashMap<TaskId, TaskEntry>,
    /// Alias de slot de resultado → tarea propietaria. El id propio de
    /// cada tarea siempre direcciona su slot, y los expected_output_ids
    /// pre-generados por el cliente se registran aquí al crearla.
    pub results: HashMap<ResultId, TaskId>,
    /// Tareas actualmente en ejecución (para el límite de concurrencia).
    pub running_count: usize,
}
