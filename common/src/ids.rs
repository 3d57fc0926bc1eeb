use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type TaskId = String;

/// Identificador de un slot de resultado. El id propio de una tarea
/// siempre direcciona su slot de salida por defecto, así que un TaskId
/// vale también como ResultId.
pub type ResultId = String;

/// Genera un ResultId nuevo del lado del cliente, antes de que exista
/// el valor (el grid acepta ids pre-generados en la creación de tareas).
pub fn new_result_id() -> ResultId {
    uuid::Uuid::new_v4().to_string()
}

/// Opciones por defecto de las tareas de una sesión.
/// `max_retries` gobierna la re-ejecución del lado del servidor;
/// el protocolo cliente nunca reintenta por su cuenta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    pub max_duration_secs: u64,
    pub max_retries: u32,
    pub priority: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_duration_secs: 300,
            max_retries: 2,
            priority: 1,
        }
    }
}

/// Petición de creación de una tarea: payload serializado más los ids
/// de salida que la tarea declara que va a producir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub payload: Vec<u8>,
    pub expected_output_ids: Vec<ResultId>,
}

impl TaskRequest {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            expected_output_ids: Vec::new(),
        }
    }
}
