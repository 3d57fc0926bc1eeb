use async_trait::async_trait;

use crate::error::ProtocolError;
use crate::ids::{ResultId, SessionId, TaskId, TaskOptions, TaskRequest};

/// Estado terminal (o no) de un resultado según el plano de control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// El resultado está disponible y se puede descargar.
    Available,
    /// La tarea productora terminó en error.
    Error { task_id: TaskId, messages: String },
    /// La tarea no completó. No debería ocurrir en una llamada que
    /// bloquea hasta completar: el que espera lo trata como violación
    /// de protocolo.
    NotCompleted,
}

/// Estado de una tarea a efectos de conteo por sesión.
/// Los estados no terminales (en cola, ejecutando) cuentan como Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Cancelled,
    Error,
}

/// Interfaz con el plano de control remoto. El núcleo del protocolo la
/// consume, nunca la implementa: el transporte y la codificación de cable
/// son colaboradores externos.
#[async_trait]
pub trait GridClient: Send + Sync {
    /// Crea una sesión con las opciones por defecto para sus tareas.
    async fn create_session(&self, options: TaskOptions) -> Result<SessionId, ProtocolError>;

    /// Crea un lote de tareas, todas con las mismas dependencias.
    /// Devuelve los ids asignados por el grid, en el orden del lote.
    async fn create_tasks(
        &self,
        session_id: &SessionId,
        dependencies: &[TaskId],
        requests: Vec<TaskRequest>,
    ) -> Result<Vec<TaskId>, ProtocolError>;

    /// Crea una tarea declarando sus dependencias. Las dependencias deben
    /// existir ya en el grid: las referencias hacia adelante se rechazan.
    async fn submit_with_dependencies(
        &self,
        session_id: &SessionId,
        payload: Vec<u8>,
        dependencies: Vec<TaskId>,
        mark_output_as_result: bool,
    ) -> Result<TaskId, ProtocolError>;

    /// Espera bloqueante (long-poll) hasta que el resultado alcance un
    /// estado terminal. No debe devolver `NotCompleted` si el grid cumple
    /// su contrato.
    async fn wait_for_availability(
        &self,
        session_id: &SessionId,
        id: &ResultId,
    ) -> Result<Availability, ProtocolError>;

    /// Descarga los bytes de un resultado ya disponible.
    async fn get_result(
        &self,
        session_id: &SessionId,
        id: &ResultId,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Cancela toda la sesión. Mejor esfuerzo y asíncrona: las tareas ya
    /// en ejecución pueden terminar igualmente.
    async fn cancel_session(&self, session_id: &SessionId) -> Result<(), ProtocolError>;

    /// Cuenta las tareas de la sesión en el estado dado.
    async fn count_tasks_by_status(
        &self,
        session_id: &SessionId,
        status: TaskStatus,
    ) -> Result<u32, ProtocolError>;
}
