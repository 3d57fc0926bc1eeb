use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::info;

use common::{
    ComputeOp, GridClient, ProtocolError, SessionId, TaskPayload, TaskRequest,
};

use crate::controller::{SessionController, TaskTally};
use crate::waiter::ResultWaiter;

/// Cuadrado con subtareas: somete la secuencia entera como tarea raíz y
/// deja que el worker la parta recursivamente en hija + agregación. El
/// resultado de la raíz llega por reenvío hasta la última agregación.
pub async fn square_with_subtasking(
    grid: &dyn GridClient,
    session_id: &SessionId,
    numbers: Vec<i64>,
) -> Result<i64, ProtocolError> {
    let payload = TaskPayload::Compute {
        op: ComputeOp::Square,
        numbers,
    };
    let root = grid
        .submit_with_dependencies(session_id, payload.to_bytes()?, Vec::new(), true)
        .await?;
    info!("tarea raíz {} sometida", root);

    ResultWaiter::new(grid, session_id.clone())
        .wait_and_fetch_value(&root)
        .await
}

/// Un cubo directo: una sola tarea, sin descomposición. La espera lleva
/// un plazo máximo para no colgar la demo si el grid no responde.
pub async fn cube_direct(
    grid: &dyn GridClient,
    session_id: &SessionId,
    value: i64,
) -> Result<i64, ProtocolError> {
    let payload = TaskPayload::Compute {
        op: ComputeOp::Cube,
        numbers: vec![value],
    };
    let id = grid
        .submit_with_dependencies(session_id, payload.to_bytes()?, Vec::new(), true)
        .await?;

    let bytes = ResultWaiter::new(grid, session_id.clone())
        .wait_and_fetch_timeout(&id, Duration::from_secs(30))
        .await?;
    match TaskPayload::from_bytes(&bytes)? {
        TaskPayload::Value { result } => Ok(result),
        other => Err(ProtocolError::violation(format!(
            "resultado terminal inesperado: {other:?}"
        ))),
    }
}

/// N jobs de una tarea cada uno, esperados en paralelo con un límite de
/// concurrencia para no saturar el plano de control. Las cadenas son
/// independientes: el protocolo no impone orden entre ellas.
pub async fn n_jobs_of_one_task(
    grid: Arc<dyn GridClient>,
    session_id: &SessionId,
    jobs: u32,
    max_parallel: usize,
) -> Result<i64, ProtocolError> {
    let sem = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut handles = Vec::with_capacity(jobs as usize);

    for _ in 0..jobs {
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::grid("semáforo de concurrencia cerrado"))?;
        let grid = grid.clone();
        let session_id = session_id.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let payload = TaskPayload::Compute {
                op: ComputeOp::Cube,
                numbers: vec![2],
            };
            let id = grid
                .submit_with_dependencies(&session_id, payload.to_bytes()?, Vec::new(), true)
                .await?;
            ResultWaiter::new(grid.as_ref(), session_id)
                .wait_and_fetch_value(&id)
                .await
        }));
    }

    let mut total = 0i64;
    for handle in handles {
        total += handle
            .await
            .map_err(|e| ProtocolError::grid(format!("cadena abortada: {e}")))??;
    }

    info!("{} jobs de 1 tarea: resultado agregado {}", jobs, total);
    Ok(total)
}

/// 1 job de N tareas: fan-out de N hojas primero y una sola agregación
/// fan-in que depende de todas (los ids de las hojas se conocen antes de
/// declarar la dependencia).
pub async fn one_job_of_n_tasks(
    grid: &dyn GridClient,
    session_id: &SessionId,
    tasks: u32,
) -> Result<i64, ProtocolError> {
    let leaf = TaskPayload::Compute {
        op: ComputeOp::Cube,
        numbers: vec![2],
    }
    .to_bytes()?;
    let requests = (0..tasks)
        .map(|_| TaskRequest::new(leaf.clone()))
        .collect::<Vec<_>>();

    let leaf_ids = grid.create_tasks(session_id, &[], requests).await?;
    let agg = grid
        .submit_with_dependencies(
            session_id,
            TaskPayload::AggregateMany.to_bytes()?,
            leaf_ids,
            true,
        )
        .await?;

    let total = ResultWaiter::new(grid, session_id.clone())
        .wait_and_fetch_value(&agg)
        .await?;
    info!("1 job de {} tareas: resultado agregado {}", tasks, total);
    Ok(total)
}

/// Fan-out dirigido por el worker: la raíz lanza las hojas y la
/// agregación desde dentro del grid.
pub async fn job_of_tasks(
    grid: &dyn GridClient,
    session_id: &SessionId,
    tasks: u32,
) -> Result<i64, ProtocolError> {
    let payload = TaskPayload::JobOfTasks {
        tasks,
        sleep_secs: 0,
    };
    let root = grid
        .submit_with_dependencies(session_id, payload.to_bytes()?, Vec::new(), true)
        .await?;

    ResultWaiter::new(grid, session_id.clone())
        .wait_and_fetch_value(&root)
        .await
}

/// Somete un lote de tareas lentas, cancela la sesión en vuelo y sondea
/// el saldo hasta la quiescencia.
pub async fn cancel_in_flight(
    grid: &dyn GridClient,
    session_id: &SessionId,
    tasks: u32,
) -> Result<TaskTally, ProtocolError> {
    let payload = TaskPayload::Sleep { secs: 1 }.to_bytes()?;
    let requests = (0..tasks)
        .map(|_| TaskRequest::new(payload.clone()))
        .collect::<Vec<_>>();
    grid.create_tasks(session_id, &[], requests).await?;

    let controller = SessionController::new(grid, session_id.clone());
    controller.cancel_session().await?;

    controller
        .await_quiescence(Duration::from_millis(100), 100)
        .await
}
