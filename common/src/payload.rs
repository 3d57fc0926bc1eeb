use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::ids::TaskId;

/// Operador escalar que aplica una tarea de cómputo a cada elemento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeOp {
    Square,
    Cube,
}

impl ComputeOp {
    /// Aplica el operador con aritmética comprobada: un desbordamiento de
    /// i64 es el fallo de la tarea, no un pánico del worker.
    pub fn apply(self, n: i64) -> Result<i64, ProtocolError> {
        let out = match self {
            ComputeOp::Square => n.checked_mul(n),
            ComputeOp::Cube => n.checked_mul(n).and_then(|sq| sq.checked_mul(n)),
        };
        out.ok_or_else(|| ProtocolError::TaskFailure {
            detail: format!("desbordamiento de i64 aplicando {self:?} a {n}"),
        })
    }
}

/// Payload de una tarea: unión cerrada con una variante por tipo de tarea.
/// Cada variante lleva sólo los campos que necesita; añadir un tipo nuevo
/// obliga a cubrirlo en todos los `match` del worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPayload {
    /// Petición de cómputo sobre una secuencia de valores.
    Compute { op: ComputeOp, numbers: Vec<i64> },

    /// Resultado terminal.
    Value { result: i64 },

    /// Agregación por pares: lleva la contribución parcial ya calculada;
    /// el otro operando llega como resultado de su única dependencia.
    Aggregate { partial: i64 },

    /// Agregación fan-in: combina los resultados de un conjunto de
    /// dependencias de aridad arbitraria.
    AggregateMany,

    /// Reenvío: "mi resultado real es el resultado de la tarea `task_id`".
    /// Lo usa una tarea cuyo trabajo fue sólo lanzar subtareas.
    Forward { task_id: TaskId },

    /// Tarea que duerme y devuelve un valor fijo (carga simulada).
    Sleep { secs: u64 },

    /// Tarea que falla con la probabilidad indicada (fallo inyectado).
    RandomFailure { percent: u32 },

    /// Fan-out dirigido por el worker: lanza `tasks` tareas hoja y una
    /// agregación fan-in que depende de todas.
    JobOfTasks { tasks: u32, sleep_secs: u64 },
}

impl TaskPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
