use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use common::{GridClient, ProtocolError, SessionId, TaskStatus};

/// Recuento de tareas de una sesión por estado terminal (y Running).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTally {
    pub completed: u32,
    pub cancelled: u32,
    pub errored: u32,
    pub running: u32,
}

impl TaskTally {
    pub fn total(&self) -> u32 {
        self.completed + self.cancelled + self.errored + self.running
    }
}

/// Orquesta la cancelación de un grafo en vuelo y el recuento agregado.
/// La cancelación es mejor esfuerzo y asíncrona: quien necesite el saldo
/// final tiene que sondear hasta la quiescencia, no asumir consistencia
/// inmediata tras cancelar.
pub struct SessionController<'a> {
    grid: &'a dyn GridClient,
    session_id: SessionId,
}

impl<'a> SessionController<'a> {
    pub fn new(grid: &'a dyn GridClient, session_id: SessionId) -> Self {
        Self { grid, session_id }
    }

    pub async fn cancel_session(&self) -> Result<(), ProtocolError> {
        info!("cancelando la sesión {}", self.session_id);
        self.grid.cancel_session(&self.session_id).await
    }

    pub async fn count(&self, status: TaskStatus) -> Result<u32, ProtocolError> {
        self.grid
            .count_tasks_by_status(&self.session_id, status)
            .await
    }

    pub async fn task_tally(&self) -> Result<TaskTally, ProtocolError> {
        Ok(TaskTally {
            completed: self.count(TaskStatus::Completed).await?,
            cancelled: self.count(TaskStatus::Cancelled).await?,
            errored: self.count(TaskStatus::Error).await?,
            running: self.count(TaskStatus::Running).await?,
        })
    }

    /// Sondea, duerme y vuelve a sondear hasta que no quede nada en
    /// ejecución. Devuelve el saldo final; si no converge en `max_polls`
    /// sondeos, corta con timeout en vez de bloquear al caller.
    pub async fn await_quiescence(
        &self,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Result<TaskTally, ProtocolError> {
        let mut tally = self.task_tally().await?;
        for _ in 0..max_polls {
            if tally.running == 0 {
                info!(
                    "sesión {} quiescente: completadas={} canceladas={} error={}",
                    self.session_id, tally.completed, tally.cancelled, tally.errored
                );
                return Ok(tally);
            }
            sleep(poll_interval).await;
            tally = self.task_tally().await?;
        }

        Err(ProtocolError::WaitTimeout {
            secs: (poll_interval * max_polls).as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{TaskOptions, TaskPayload};
    use gridsim::{GridSim, GridSimConfig};

    /// Tras cancelar, los recuentos convergen: running baja a cero y
    /// completadas + canceladas + error suman el total sometido.
    #[tokio::test]
    async fn cancelar_sesion_converge_y_cuadra_el_saldo() {
        let sim = GridSim::new(GridSimConfig {
            max_concurrency: 2,
            seed: 1,
        });
        let session = sim.create_session(TaskOptions::default()).await.unwrap();

        let payload = TaskPayload::Sleep { secs: 1 }.to_bytes().unwrap();
        for _ in 0..6 {
            sim.submit_with_dependencies(&session, payload.clone(), Vec::new(), false)
                .await
                .unwrap();
        }

        let controller = SessionController::new(&sim, session.clone());
        controller.cancel_session().await.unwrap();

        // convergencia eventual, no inmediata: lo que ya ejecutaba puede
        // terminar igualmente
        let tally = controller
            .await_quiescence(Duration::from_millis(100), 50)
            .await
            .unwrap();

        assert_eq!(tally.running, 0);
        assert_eq!(tally.total(), 6);
        // con 2 slots de ejecución, al menos 4 no habían arrancado
        assert!(tally.cancelled >= 4, "saldo: {tally:?}");
        assert_eq!(tally.completed + tally.cancelled + tally.errored, 6);
    }

    /// Sin cancelar nada, una sesión corta termina con todo completado.
    #[tokio::test]
    async fn sesion_sin_cancelar_completa_todo() {
        let sim = GridSim::new(GridSimConfig::default());
        let session = sim.create_session(TaskOptions::default()).await.unwrap();

        let payload = TaskPayload::Value { result: 3 }.to_bytes().unwrap();
        for _ in 0..5 {
            sim.submit_with_dependencies(&session, payload.clone(), Vec::new(), false)
                .await
                .unwrap();
        }

        let controller = SessionController::new(&sim, session);
        let tally = controller
            .await_quiescence(Duration::from_millis(50), 100)
            .await
            .unwrap();

        assert_eq!(
            tally,
            TaskTally {
                completed: 5,
                cancelled: 0,
                errored: 0,
                running: 0,
            }
        );
    }
}
