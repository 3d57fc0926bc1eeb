use thiserror::Error;

use crate::ids::TaskId;

/// Taxonomía de errores del protocolo de grafos de tareas.
///
/// Los fallos transitorios de transporte son asunto del cliente externo
/// (aparecen como `Grid` y los reintenta quien llama, nunca esta capa).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Agregación por pares invocada sin el resultado de su dependencia.
    #[error("agregación sin el resultado de la dependencia {task_id}")]
    MissingDependencyResult { task_id: TaskId },

    /// Agregación fan-in con cero dependencias: error de programación.
    #[error("agregación fan-in invocada sin dependencias")]
    EmptyAggregationSet,

    /// Una tarea remota de la que dependemos terminó en error.
    /// Se propaga hacia arriba, nunca se enmascara con un valor por defecto.
    #[error("la tarea remota {task_id} falló: {messages}")]
    RemoteTaskError { task_id: TaskId, messages: String },

    /// El remoto reportó "no completada" en una llamada definida como
    /// bloqueante hasta completar. Fatal, no se reintenta.
    #[error("violación de protocolo: {detail}")]
    ProtocolViolation { detail: String },

    /// La cadena de reenvíos superó el límite de indirecciones.
    #[error("cadena de reenvío supera el límite tras {depth} saltos")]
    IndirectionLoop { depth: usize },

    /// Payload que no se pudo codificar o decodificar.
    #[error("payload inválido: {0}")]
    Codec(#[from] serde_json::Error),

    /// Error reportado por el plano de control.
    #[error("error del plano de control: {detail}")]
    Grid { detail: String },

    /// Fallo dentro del cuerpo de una tarea (p. ej. fallo inyectado).
    #[error("fallo en la tarea: {detail}")]
    TaskFailure { detail: String },

    /// Espera del lado del cliente cancelada por timeout local,
    /// independiente de la cancelación del lado del servidor.
    #[error("espera agotada tras {secs} s sin resultado")]
    WaitTimeout { secs: u64 },
}

impl ProtocolError {
    pub fn grid(detail: impl Into<String>) -> Self {
        ProtocolError::Grid {
            detail: detail.into(),
        }
    }

    pub fn violation(detail: impl Into<String>) -> Self {
        ProtocolError::ProtocolViolation {
            detail: detail.into(),
        }
    }
}
