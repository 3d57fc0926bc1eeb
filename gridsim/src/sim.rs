use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use tracing::{info, warn};

use common::{
    Availability, GridClient, ProtocolError, ResultId, SessionId, TaskId, TaskOptions,
    TaskPayload, TaskRequest, TaskStatus,
};
use worker::{ServiceContainer, TaskContext};

use crate::state::{GridState, SessionMeta, SimStatus, TaskEntry};

/// Saltos máximos que el grid sigue al resolver reenvíos del lado del
/// servidor antes de dar la dependencia por irresoluble.
const MAX_FORWARD_HOPS: usize = 16;

/// Intervalo de re-chequeo interno del long-poll de disponibilidad.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct GridSimConfig {
    /// Tareas ejecutando a la vez como máximo (slots del "worker pool").
    pub max_concurrency: usize,
    /// Semilla del generador de fallos inyectados del worker.
    pub seed: u64,
}

impl Default for GridSimConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            seed: 42,
        }
    }
}

/// Resultado efectivo de una dependencia, siguiendo reenvíos.
enum Effective {
    Pending,
    Bytes(Vec<u8>),
    Failed { task_id: TaskId, messages: String },
}

/// Sigue la cadena de reenvíos de un slot hasta bytes terminales, un
/// error, o algo todavía pendiente. Acotado para que un reenvío cíclico
/// no cuelgue el scheduler.
fn effective_result(state: &GridState, id: &ResultId) -> Effective {
    let mut current = id.clone();

    for _ in 0..MAX_FORWARD_HOPS {
        let Some(owner) = state.results.get(&current) else {
            return Effective::Failed {
                task_id: current,
                messages: "resultado desconocido".to_string(),
            };
        };
        let Some(entry) = state.tasks.get(owner) else {
            return Effective::Failed {
                task_id: owner.clone(),
                messages: "tarea desconocida".to_string(),
            };
        };

        match entry.status {
            SimStatus::Queued | SimStatus::Running => return Effective::Pending,
            SimStatus::Cancelled => {
                return Effective::Failed {
                    task_id: entry.id.clone(),
                    messages: "tarea cancelada con la sesión".to_string(),
                }
            }
            SimStatus::Error => {
                let messages = match &entry.output {
                    Some(Err(m)) => m.clone(),
                    _ => "error sin detalle".to_string(),
                };
                return Effective::Failed {
                    task_id: entry.id.clone(),
                    messages,
                };
            }
            SimStatus::Completed => {
                let Some(Ok(bytes)) = &entry.output else {
                    // una tarea Completed siempre tiene bytes; si no, algo
                    // muy raro pasó en el simulador
                    return Effective::Failed {
                        task_id: entry.id.clone(),
                        messages: "tarea completada sin resultado".to_string(),
                    };
                };
                if let Ok(TaskPayload::Forward { task_id }) = TaskPayload::from_bytes(bytes) {
                    current = task_id;
                    continue;
                }
                return Effective::Bytes(bytes.clone());
            }
        }
    }

    Effective::Failed {
        task_id: current,
        messages: format!("cadena de reenvío de más de {MAX_FORWARD_HOPS} saltos en el grid"),
    }
}

struct Inner {
    state: Mutex<GridState>,
    container: ServiceContainer,
    max_concurrency: usize,
}

/// Plano de control en memoria: implementa la interfaz de grid que el
/// protocolo consume y ejecuta las tareas invocando el contenedor del
/// worker. Doble de pruebas y demos, no un scheduler de producción.
#[derive(Clone)]
pub struct GridSim {
    inner: Arc<Inner>,
}

impl GridSim {
    pub fn new(config: GridSimConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(GridState::default()),
                container: ServiceContainer::new(config.seed),
                max_concurrency: config.max_concurrency.max(1),
            }),
        }
    }

    /// Total de tareas registradas en una sesión, en cualquier estado.
    pub fn total_tasks(&self, session_id: &SessionId) -> u32 {
        let state = self.inner.state.lock().unwrap();
        state
            .tasks
            .values()
            .filter(|t| &t.session_id == session_id)
            .count() as u32
    }

    fn insert_task(
        state: &mut GridState,
        session_id: &SessionId,
        payload: Vec<u8>,
        dependencies: Vec<TaskId>,
        expected_outputs: Vec<ResultId>,
        mark_output_as_result: bool,
    ) -> Result<TaskId, ProtocolError> {
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| ProtocolError::grid(format!("sesión desconocida {session_id}")))?;
        if session.cancelled {
            return Err(ProtocolError::grid(format!(
                "la sesión {session_id} está cancelada"
            )));
        }

        // referencias hacia adelante: toda dependencia tiene que existir ya
        for dep in &dependencies {
            if !state.tasks.contains_key(dep) {
                return Err(ProtocolError::grid(format!(
                    "dependencia desconocida {dep}: las dependencias se someten antes que sus dependientes"
                )));
            }
        }

        let id: TaskId = uuid::Uuid::new_v4().to_string();
        state.results.insert(id.clone(), id.clone());
        for out in &expected_outputs {
            state.results.insert(out.clone(), id.clone());
        }
        state.tasks.insert(
            id.clone(),
            TaskEntry {
                id: id.clone(),
                session_id: session_id.clone(),
                payload,
                dependencies,
                expected_outputs,
                mark_output_as_result,
                status: SimStatus::Queued,
                attempt: 0,
                output: None,
            },
        );
        Ok(id)
    }

    /// Pasa a Error toda tarea encolada cuya dependencia ya falló, y lanza
    /// las que quedaron listas, respetando el límite de concurrencia.
    fn schedule(&self) {
        let mut contexts: Vec<TaskContext> = Vec::new();

        {
            let mut state = self.inner.state.lock().unwrap();

            // propagar fallos de dependencias hasta punto fijo: el error de
            // una tarea puede dejar sin opciones a sus dependientes
            loop {
                let mut newly_failed: Vec<(TaskId, TaskId, String)> = Vec::new();
                for entry in state.tasks.values() {
                    if entry.status != SimStatus::Queued {
                        continue;
                    }
                    for dep in &entry.dependencies {
                        if let Effective::Failed { task_id, messages } =
                            effective_result(&state, dep)
                        {
                            newly_failed.push((entry.id.clone(), task_id, messages));
                            break;
                        }
                    }
                }
                if newly_failed.is_empty() {
                    break;
                }
                for (id, dep_id, messages) in newly_failed {
                    if let Some(entry) = state.tasks.get_mut(&id) {
                        entry.status = SimStatus::Error;
                        entry.output =
                            Some(Err(format!("la dependencia {dep_id} falló: {messages}")));
                        warn!("tarea {} pasa a Error por su dependencia {}", id, dep_id);
                    }
                }
            }

            // tareas listas: encoladas con todas sus dependencias resueltas
            let ready: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|e| e.status == SimStatus::Queued)
                .filter(|e| {
                    e.dependencies
                        .iter()
                        .all(|d| matches!(effective_result(&state, d), Effective::Bytes(_)))
                })
                .map(|e| e.id.clone())
                .collect();

            for id in ready {
                if state.running_count >= self.inner.max_concurrency {
                    break;
                }

                let entry = match state.tasks.get(&id) {
                    Some(e) => e.clone(),
                    None => continue,
                };

                // materializar los resultados de las dependencias
                let mut dependencies = BTreeMap::new();
                for dep in &entry.dependencies {
                    if let Effective::Bytes(bytes) = effective_result(&state, dep) {
                        dependencies.insert(dep.clone(), bytes);
                    }
                }

                if let Some(e) = state.tasks.get_mut(&id) {
                    e.status = SimStatus::Running;
                }
                state.running_count += 1;

                contexts.push(TaskContext {
                    session_id: entry.session_id,
                    task_id: id,
                    payload: entry.payload,
                    dependency_ids: entry.dependencies,
                    dependencies,
                });
            }
        }

        for ctx in contexts {
            let sim = self.clone();
            tokio::spawn(async move {
                sim.run_task(ctx).await;
            });
        }
    }

    /// Ejecuta una tarea invocando el contenedor del worker y registra su
    /// desenlace. Un fallo consume un reintento del lado del servidor
    /// (MaxRetries de las opciones de la sesión) antes de quedar en Error.
    async fn run_task(&self, ctx: TaskContext) {
        let task_id = ctx.task_id.clone();
        let grid: &dyn GridClient = self;
        let outcome = self.inner.container.on_invoke(grid, ctx).await;

        {
            let mut state = self.inner.state.lock().unwrap();
            state.running_count = state.running_count.saturating_sub(1);

            let (max_retries, session_cancelled) = state
                .tasks
                .get(&task_id)
                .and_then(|e| state.sessions.get(&e.session_id))
                .map(|s| (s.options.max_retries, s.cancelled))
                .unwrap_or((0, false));

            if let Some(entry) = state.tasks.get_mut(&task_id) {
                match outcome {
                    Ok(payload) => match payload.to_bytes() {
                        Ok(bytes) => {
                            entry.status = SimStatus::Completed;
                            entry.output = Some(Ok(bytes));
                            info!("tarea {} completada", task_id);
                        }
                        Err(e) => {
                            entry.status = SimStatus::Error;
                            entry.output = Some(Err(e.to_string()));
                        }
                    },
                    Err(e) => {
                        // una sesión cancelada no re-encola: el reintento
                        // resucitaría la tarea y la sesión nunca quedaría
                        // quiescente
                        if session_cancelled {
                            entry.status = SimStatus::Cancelled;
                            info!(
                                "tarea {} cancelada con la sesión tras fallar: {}",
                                task_id, e
                            );
                        } else if entry.attempt + 1 <= max_retries {
                            entry.attempt += 1;
                            entry.status = SimStatus::Queued;
                            info!(
                                "re-encolando tarea {} tras fallo (intento {}): {}",
                                task_id, entry.attempt, e
                            );
                        } else {
                            entry.status = SimStatus::Error;
                            entry.output = Some(Err(e.to_string()));
                            warn!("tarea {} agotó reintentos: {}", task_id, e);
                        }
                    }
                }
            }
        }

        self.schedule();
    }
}

#[async_trait]
impl GridClient for GridSim {
    async fn create_session(&self, options: TaskOptions) -> Result<SessionId, ProtocolError> {
        let id: SessionId = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let mut state = self.inner.state.lock().unwrap();
        state.sessions.insert(
            id.clone(),
            SessionMeta {
                options,
                created_at,
                cancelled: false,
            },
        );
        info!("sesión {} creada a las {}", id, created_at);
        Ok(id)
    }

    async fn create_tasks(
        &self,
        session_id: &SessionId,
        dependencies: &[TaskId],
        requests: Vec<TaskRequest>,
    ) -> Result<Vec<TaskId>, ProtocolError> {
        let mut ids = Vec::with_capacity(requests.len());
        {
            let mut state = self.inner.state.lock().unwrap();
            for req in requests {
                let id = Self::insert_task(
                    &mut state,
                    session_id,
                    req.payload,
                    dependencies.to_vec(),
                    req.expected_output_ids,
                    false,
                )?;
                ids.push(id);
            }
        }
        info!("creadas {} tareas en la sesión {}", ids.len(), session_id);
        self.schedule();
        Ok(ids)
    }

    async fn submit_with_dependencies(
        &self,
        session_id: &SessionId,
        payload: Vec<u8>,
        dependencies: Vec<TaskId>,
        mark_output_as_result: bool,
    ) -> Result<TaskId, ProtocolError> {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            Self::insert_task(
                &mut state,
                session_id,
                payload,
                dependencies,
                Vec::new(),
                mark_output_as_result,
            )?
        };
        self.schedule();
        Ok(id)
    }

    async fn wait_for_availability(
        &self,
        _session_id: &SessionId,
        id: &ResultId,
    ) -> Result<Availability, ProtocolError> {
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                let owner = state
                    .results
                    .get(id)
                    .ok_or_else(|| ProtocolError::grid(format!("resultado desconocido {id}")))?;
                let entry = state.tasks.get(owner).ok_or_else(|| {
                    ProtocolError::grid(format!("tarea desconocida {owner}"))
                })?;

                match entry.status {
                    SimStatus::Completed => return Ok(Availability::Available),
                    SimStatus::Error => {
                        let messages = match &entry.output {
                            Some(Err(m)) => m.clone(),
                            _ => "error sin detalle".to_string(),
                        };
                        return Ok(Availability::Error {
                            task_id: entry.id.clone(),
                            messages,
                        });
                    }
                    SimStatus::Cancelled => {
                        return Ok(Availability::Error {
                            task_id: entry.id.clone(),
                            messages: "tarea cancelada con la sesión".to_string(),
                        });
                    }
                    SimStatus::Queued | SimStatus::Running => {}
                }
            }

            // la "conexión" se queda abierta: re-chequeo interno acotado,
            // nunca devolvemos NotCompleted
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn get_result(
        &self,
        _session_id: &SessionId,
        id: &ResultId,
    ) -> Result<Vec<u8>, ProtocolError> {
        let state = self.inner.state.lock().unwrap();
        let owner = state
            .results
            .get(id)
            .ok_or_else(|| ProtocolError::grid(format!("resultado desconocido {id}")))?;
        let entry = state
            .tasks
            .get(owner)
            .ok_or_else(|| ProtocolError::grid(format!("tarea desconocida {owner}")))?;

        // la salida propia sólo se descarga si la tarea la declaró como
        // resultado; los expected_output_ids pre-generados siempre valen
        if id == &entry.id && !entry.mark_output_as_result {
            return Err(ProtocolError::grid(format!(
                "la tarea {id} no declaró su salida como resultado descargable"
            )));
        }

        match &entry.output {
            Some(Ok(bytes)) => Ok(bytes.clone()),
            Some(Err(m)) => Err(ProtocolError::grid(format!(
                "el resultado {id} está en error: {m}"
            ))),
            None => Err(ProtocolError::grid(format!(
                "el resultado {id} todavía no está disponible"
            ))),
        }
    }

    async fn cancel_session(&self, session_id: &SessionId) -> Result<(), ProtocolError> {
        let mut cancelled_tasks = 0u32;
        {
            let mut state = self.inner.state.lock().unwrap();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| ProtocolError::grid(format!("sesión desconocida {session_id}")))?;
            session.cancelled = true;

            // mejor esfuerzo: lo encolado se cancela, lo que ya ejecuta
            // puede terminar igualmente
            for entry in state.tasks.values_mut() {
                if &entry.session_id == session_id && entry.status == SimStatus::Queued {
                    entry.status = SimStatus::Cancelled;
                    cancelled_tasks += 1;
                }
            }
        }
        info!(
            "sesión {} cancelada: {} tareas encoladas pasan a Cancelled",
            session_id, cancelled_tasks
        );
        Ok(())
    }

    async fn count_tasks_by_status(
        &self,
        session_id: &SessionId,
        status: TaskStatus,
    ) -> Result<u32, ProtocolError> {
        let state = self.inner.state.lock().unwrap();
        let count = state
            .tasks
            .values()
            .filter(|t| &t.session_id == session_id)
            .filter(|t| {
                // lo no terminal cuenta como Running
                match t.status {
                    SimStatus::Queued | SimStatus::Running => status == TaskStatus::Running,
                    SimStatus::Completed => status == TaskStatus::Completed,
                    SimStatus::Cancelled => status == TaskStatus::Cancelled,
                    SimStatus::Error => status == TaskStatus::Error,
                }
            })
            .count() as u32;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sim_y_sesion() -> (GridSim, SessionId) {
        let sim = GridSim::new(GridSimConfig::default());
        let session = sim
            .create_session(TaskOptions::default())
            .await
            .unwrap();
        (sim, session)
    }

    /// Una tarea hoja completa y su resultado se descarga.
    #[tokio::test]
    async fn tarea_hoja_completa_y_entrega_bytes() {
        let (sim, session) = sim_y_sesion().await;

        let payload = TaskPayload::Value { result: 7 }.to_bytes().unwrap();
        let id = sim
            .submit_with_dependencies(&session, payload, Vec::new(), true)
            .await
            .unwrap();

        let av = sim.wait_for_availability(&session, &id).await.unwrap();
        assert_eq!(av, Availability::Available);

        let bytes = sim.get_result(&session, &id).await.unwrap();
        assert_eq!(
            TaskPayload::from_bytes(&bytes).unwrap(),
            TaskPayload::Value { result: 7 }
        );
    }

    /// Las referencias hacia adelante se rechazan en la creación.
    #[tokio::test]
    async fn dependencia_inexistente_se_rechaza() {
        let (sim, session) = sim_y_sesion().await;

        let payload = TaskPayload::AggregateMany.to_bytes().unwrap();
        let res = sim
            .submit_with_dependencies(&session, payload, vec!["no-existe".to_string()], false)
            .await;

        assert!(matches!(res, Err(ProtocolError::Grid { .. })));
    }

    /// No se aceptan tareas nuevas en una sesión cancelada.
    #[tokio::test]
    async fn sesion_cancelada_rechaza_submissions() {
        let (sim, session) = sim_y_sesion().await;
        sim.cancel_session(&session).await.unwrap();

        let payload = TaskPayload::Value { result: 1 }.to_bytes().unwrap();
        let res = sim
            .submit_with_dependencies(&session, payload, Vec::new(), false)
            .await;
        assert!(matches!(res, Err(ProtocolError::Grid { .. })));
    }

    /// La agregación no arranca hasta que su dependencia produce resultado,
    /// y al llegar lo combina con su parcial.
    #[tokio::test]
    async fn agregacion_espera_a_su_dependencia() {
        let (sim, session) = sim_y_sesion().await;

        let child = sim
            .submit_with_dependencies(
                &session,
                TaskPayload::Value { result: 13 }.to_bytes().unwrap(),
                Vec::new(),
                false,
            )
            .await
            .unwrap();
        let agg = sim
            .submit_with_dependencies(
                &session,
                TaskPayload::Aggregate { partial: 1 }.to_bytes().unwrap(),
                vec![child],
                true,
            )
            .await
            .unwrap();

        let av = sim.wait_for_availability(&session, &agg).await.unwrap();
        assert_eq!(av, Availability::Available);

        let bytes = sim.get_result(&session, &agg).await.unwrap();
        assert_eq!(
            TaskPayload::from_bytes(&bytes).unwrap(),
            TaskPayload::Value { result: 14 }
        );
    }

    /// Un id de salida pre-generado por el cliente direcciona el resultado
    /// de su tarea productora.
    #[tokio::test]
    async fn expected_output_id_direcciona_el_resultado() {
        let (sim, session) = sim_y_sesion().await;

        let out_id = common::new_result_id();
        let req = TaskRequest {
            payload: TaskPayload::Value { result: 5 }.to_bytes().unwrap(),
            expected_output_ids: vec![out_id.clone()],
        };
        sim.create_tasks(&session, &[], vec![req]).await.unwrap();

        let av = sim.wait_for_availability(&session, &out_id).await.unwrap();
        assert_eq!(av, Availability::Available);
        let bytes = sim.get_result(&session, &out_id).await.unwrap();
        assert_eq!(
            TaskPayload::from_bytes(&bytes).unwrap(),
            TaskPayload::Value { result: 5 }
        );
    }

    /// Una tarea que no declaró su salida como resultado no es
    /// descargable por su propio id, aunque la espera sí resuelva.
    #[tokio::test]
    async fn salida_no_declarada_no_se_descarga() {
        let (sim, session) = sim_y_sesion().await;

        let payload = TaskPayload::Value { result: 7 }.to_bytes().unwrap();
        let id = sim
            .submit_with_dependencies(&session, payload, Vec::new(), false)
            .await
            .unwrap();

        let av = sim.wait_for_availability(&session, &id).await.unwrap();
        assert_eq!(av, Availability::Available);

        let res = sim.get_result(&session, &id).await;
        assert!(matches!(res, Err(ProtocolError::Grid { .. })));
    }

    /// Una dependencia que agota reintentos deja a sus dependientes en
    /// Error con el fallo encadenado, nunca con un valor por defecto.
    #[tokio::test]
    async fn fallo_de_dependencia_se_encadena_al_dependiente() {
        let (sim, session) = sim_y_sesion().await;

        let roto = sim
            .submit_with_dependencies(
                &session,
                TaskPayload::RandomFailure { percent: 100 }.to_bytes().unwrap(),
                Vec::new(),
                false,
            )
            .await
            .unwrap();
        let agg = sim
            .submit_with_dependencies(
                &session,
                TaskPayload::Aggregate { partial: 1 }.to_bytes().unwrap(),
                vec![roto.clone()],
                true,
            )
            .await
            .unwrap();

        let av = sim.wait_for_availability(&session, &agg).await.unwrap();
        match av {
            Availability::Error { task_id, messages } => {
                assert_eq!(task_id, agg);
                assert!(messages.contains(&roto));
                assert!(messages.contains("falló"));
            }
            otro => panic!("esperaba Error, llegó {otro:?}"),
        }

        let errored = sim
            .count_tasks_by_status(&session, TaskStatus::Error)
            .await
            .unwrap();
        assert_eq!(errored, 2);
    }

    /// Cancelar la sesión corta también los reintentos: una tarea que
    /// falla tras la cancelación pasa a Cancelled en vez de re-encolarse,
    /// aunque le queden reintentos por consumir.
    #[tokio::test]
    async fn reintentos_no_resucitan_tareas_de_sesion_cancelada() {
        let sim = GridSim::new(GridSimConfig::default());
        let opciones = TaskOptions {
            max_retries: u32::MAX,
            ..TaskOptions::default()
        };
        let session = sim.create_session(opciones).await.unwrap();

        sim.submit_with_dependencies(
            &session,
            TaskPayload::RandomFailure { percent: 100 }.to_bytes().unwrap(),
            Vec::new(),
            false,
        )
        .await
        .unwrap();

        sleep(Duration::from_millis(20)).await;
        sim.cancel_session(&session).await.unwrap();

        // convergencia eventual: el intento en vuelo puede fallar una vez
        // más, pero el siguiente desenlace ya no re-encola
        let mut corriendo = 1;
        for _ in 0..100 {
            corriendo = sim
                .count_tasks_by_status(&session, TaskStatus::Running)
                .await
                .unwrap();
            if corriendo == 0 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(corriendo, 0);

        let canceladas = sim
            .count_tasks_by_status(&session, TaskStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(canceladas, 1);
    }
}
