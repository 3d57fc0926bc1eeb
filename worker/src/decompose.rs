use common::{ComputeOp, ProtocolError};

/// Elemento neutro de la reducción (suma de contribuciones).
pub const IDENTITY: i64 = 0;

/// Resultado de descomponer una secuencia de entrada.
#[derive(Debug, Clone, PartialEq)]
pub enum Decomposition {
    /// Caso base: se resuelve en el acto, sin lanzar nada al grid.
    Immediate(i64),

    /// Caso recursivo: `partial` es la contribución del primer elemento;
    /// `rest` es la secuencia restante, que va en la tarea hija.
    Split { partial: i64, rest: Vec<i64> },
}

/// Decide si una secuencia se resuelve directamente o se parte en
/// tarea hija + tarea de agregación.
///
/// Construcción por valores: `rest` es siempre un Vec nuevo, nunca una
/// vista mutable compartida, para que cadenas concurrentes no se pisen.
pub fn decompose(op: ComputeOp, numbers: &[i64]) -> Result<Decomposition, ProtocolError> {
    match numbers {
        [] => Ok(Decomposition::Immediate(IDENTITY)),
        [n] => Ok(Decomposition::Immediate(op.apply(*n)?)),
        [head, rest @ ..] => Ok(Decomposition::Split {
            partial: op.apply(*head)?,
            rest: rest.to_vec(),
        }),
    }
}

/// Suma acumulada con aritmética comprobada: el desbordamiento es un
/// fallo de la tarea, no un pánico.
pub(crate) fn checked_sum(acc: i64, value: i64) -> Result<i64, ProtocolError> {
    acc.checked_add(value).ok_or_else(|| ProtocolError::TaskFailure {
        detail: format!("desbordamiento de i64 acumulando {value} sobre {acc}"),
    })
}

/// Plegado directo de referencia: lo que debe valer el resultado terminal
/// de cualquier descomposición de la misma secuencia.
pub fn direct_fold(op: ComputeOp, numbers: &[i64]) -> Result<i64, ProtocolError> {
    numbers
        .iter()
        .try_fold(IDENTITY, |acc, n| checked_sum(acc, op.apply(*n)?))
}
