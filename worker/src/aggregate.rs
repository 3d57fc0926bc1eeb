use std::collections::BTreeMap;

use common::{ProtocolError, TaskId, TaskPayload};

use crate::decompose::checked_sum;

/// Decodifica el resultado de una dependencia como valor terminal.
fn decode_value(task_id: &TaskId, bytes: &[u8]) -> Result<i64, ProtocolError> {
    match TaskPayload::from_bytes(bytes)? {
        TaskPayload::Value { result } => Ok(result),
        other => Err(ProtocolError::violation(format!(
            "la dependencia {task_id} no produjo un resultado terminal sino {other:?}"
        ))),
    }
}

/// Agregación por pares: combina la contribución parcial propia con el
/// resultado de la única dependencia.
///
/// Mapa vacío o bytes de longitud cero → `MissingDependencyResult`:
/// el error se convierte en el resultado Error de la propia tarea,
/// nunca en un valor por defecto.
pub fn aggregate_pair(
    partial: i64,
    dependencies: &BTreeMap<TaskId, Vec<u8>>,
) -> Result<i64, ProtocolError> {
    if dependencies.len() > 1 {
        return Err(ProtocolError::violation(format!(
            "agregación por pares con {} dependencias en vez de una",
            dependencies.len()
        )));
    }

    let (task_id, bytes) = dependencies.iter().next().ok_or_else(|| {
        ProtocolError::MissingDependencyResult {
            task_id: "<ninguna>".to_string(),
        }
    })?;

    if bytes.is_empty() {
        return Err(ProtocolError::MissingDependencyResult {
            task_id: task_id.clone(),
        });
    }

    let value = decode_value(task_id, bytes)?;
    checked_sum(partial, value)
}

/// Agregación fan-in: pliega los resultados de un conjunto de dependencias
/// de aridad arbitraria con el operador suma.
///
/// El grid entrega el mapa en orden arbitrario; aquí el plegado es en
/// orden ascendente de TaskId (orden de iteración del BTreeMap). Con la
/// suma el orden es irrelevante; si algún día el operador no conmuta,
/// este es el orden al que atenerse.
pub fn aggregate_many(dependencies: &BTreeMap<TaskId, Vec<u8>>) -> Result<i64, ProtocolError> {
    if dependencies.is_empty() {
        return Err(ProtocolError::EmptyAggregationSet);
    }

    let mut acc = 0i64;
    for (task_id, bytes) in dependencies {
        if bytes.is_empty() {
            return Err(ProtocolError::MissingDependencyResult {
                task_id: task_id.clone(),
            });
        }
        acc = checked_sum(acc, decode_value(task_id, bytes)?)?;
    }
    Ok(acc)
}
