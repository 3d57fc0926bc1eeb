use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::info;

use common::{
    ComputeOp, GridClient, ProtocolError, SessionId, TaskId, TaskPayload, TaskRequest,
};

use crate::aggregate::{aggregate_many, aggregate_pair};
use crate::decompose::{decompose, Decomposition};

/// Contexto con el que el grid invoca una tarea: su payload serializado
/// y los resultados de sus dependencias ya materializados.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub payload: Vec<u8>,
    pub dependency_ids: Vec<TaskId>,
    pub dependencies: BTreeMap<TaskId, Vec<u8>>,
}

/// Contenedor de servicio del worker: despacha cada invocación según la
/// variante del payload. La fuente de aleatoriedad es sembrable y la posee
/// el contexto que construye el contenedor, no el proceso.
pub struct ServiceContainer {
    rng: Mutex<StdRng>,
}

impl ServiceContainer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Punto de entrada de ejecución de una tarea. Devuelve el payload
    /// que se convierte en el resultado declarado de la tarea; un Err se
    /// convierte en el resultado Error de la propia tarea.
    pub async fn on_invoke(
        &self,
        grid: &dyn GridClient,
        ctx: TaskContext,
    ) -> Result<TaskPayload, ProtocolError> {
        let payload = TaskPayload::from_bytes(&ctx.payload)?;

        match payload {
            TaskPayload::Compute { op, numbers } => self.compute(grid, &ctx, op, &numbers).await,

            // un valor precomputado se devuelve tal cual
            TaskPayload::Value { result } => Ok(TaskPayload::Value { result }),

            TaskPayload::Aggregate { partial } => {
                info!(
                    "agregando tarea {} con dependencias [{}]",
                    ctx.task_id,
                    ctx.dependency_ids.join(", ")
                );
                let value = aggregate_pair(partial, &ctx.dependencies)?;
                Ok(TaskPayload::Value { result: value })
            }

            TaskPayload::AggregateMany => {
                let value = aggregate_many(&ctx.dependencies)?;
                Ok(TaskPayload::Value { result: value })
            }

            // una tarea de reenvío declara como resultado la referencia
            TaskPayload::Forward { task_id } => Ok(TaskPayload::Forward { task_id }),

            TaskPayload::Sleep { secs } => {
                if secs > 0 {
                    sleep(Duration::from_secs(secs)).await;
                }
                Ok(TaskPayload::Value { result: 42 })
            }

            TaskPayload::RandomFailure { percent } => {
                let roll: f64 = self.rng.lock().unwrap().gen();
                if roll < f64::from(percent) / 100.0 {
                    return Err(ProtocolError::TaskFailure {
                        detail: format!("fallo aleatorio inyectado ({percent}%)"),
                    });
                }
                Ok(TaskPayload::Value { result: 42 })
            }

            TaskPayload::JobOfTasks { tasks, sleep_secs } => {
                self.job_of_tasks(grid, &ctx, tasks, sleep_secs).await
            }
        }
    }

    /// Cómputo sobre una secuencia: o se resuelve en el acto, o lanza la
    /// tarea hija con el resto y una tarea de agregación que depende de
    /// ella. El id de la hija se conoce antes de declarar la dependencia:
    /// el grid rechaza referencias hacia adelante.
    async fn compute(
        &self,
        grid: &dyn GridClient,
        ctx: &TaskContext,
        op: ComputeOp,
        numbers: &[i64],
    ) -> Result<TaskPayload, ProtocolError> {
        match decompose(op, numbers)? {
            Decomposition::Immediate(value) => {
                info!("tarea {} resuelve directo: {}", ctx.task_id, value);
                Ok(TaskPayload::Value { result: value })
            }

            Decomposition::Split { partial, rest } => {
                let child_payload = TaskPayload::Compute { op, numbers: rest };
                let child_id = grid
                    .submit_with_dependencies(
                        &ctx.session_id,
                        child_payload.to_bytes()?,
                        Vec::new(),
                        false,
                    )
                    .await?;
                info!(
                    "tarea {} lanzó subtarea {} (parcial={})",
                    ctx.task_id, child_id, partial
                );

                // la agregación se crea con su valor pendiente: se calcula
                // cuando el grid la invoque con el resultado de la hija
                let agg_payload = TaskPayload::Aggregate { partial };
                let agg_id = grid
                    .submit_with_dependencies(
                        &ctx.session_id,
                        agg_payload.to_bytes()?,
                        vec![child_id.clone()],
                        true,
                    )
                    .await?;
                info!(
                    "tarea {} lanzó agregación {} dependiente de {}",
                    ctx.task_id, agg_id, child_id
                );

                Ok(TaskPayload::Forward { task_id: agg_id })
            }
        }
    }

    /// Fan-out dirigido por el worker: N tareas hoja primero, después una
    /// sola agregación fan-in que depende de todas.
    async fn job_of_tasks(
        &self,
        grid: &dyn GridClient,
        ctx: &TaskContext,
        tasks: u32,
        sleep_secs: u64,
    ) -> Result<TaskPayload, ProtocolError> {
        let leaf = TaskPayload::Sleep { secs: sleep_secs }.to_bytes()?;
        let requests = (0..tasks)
            .map(|_| TaskRequest::new(leaf.clone()))
            .collect::<Vec<_>>();

        let leaf_ids = grid.create_tasks(&ctx.session_id, &[], requests).await?;
        info!(
            "tarea {} lanzó {} tareas hoja para fan-in",
            ctx.task_id,
            leaf_ids.len()
        );

        let agg_id = grid
            .submit_with_dependencies(
                &ctx.session_id,
                TaskPayload::AggregateMany.to_bytes()?,
                leaf_ids,
                true,
            )
            .await?;

        Ok(TaskPayload::Forward { task_id: agg_id })
    }
}
