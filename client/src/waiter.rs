use std::time::Duration;

use tracing::info;

use common::{Availability, GridClient, ProtocolError, ResultId, SessionId, TaskPayload};

/// Saltos de reenvío que se siguen antes de rendirse. Protege contra un
/// remoto mal portado que monte una cadena cíclica de indirecciones.
pub const DEFAULT_MAX_FORWARD_DEPTH: usize = 16;

/// Resuelve la salida lógica de una tarea: o los bytes finales, o el
/// error propagado de la tarea productora, o una indirección de reenvío
/// que se re-resuelve de manera transparente.
pub struct ResultWaiter<'a> {
    grid: &'a dyn GridClient,
    session_id: SessionId,
    max_forward_depth: usize,
}

impl<'a> ResultWaiter<'a> {
    pub fn new(grid: &'a dyn GridClient, session_id: SessionId) -> Self {
        Self {
            grid,
            session_id,
            max_forward_depth: DEFAULT_MAX_FORWARD_DEPTH,
        }
    }

    pub fn with_max_forward_depth(mut self, depth: usize) -> Self {
        self.max_forward_depth = depth;
        self
    }

    /// Espera bloqueante hasta el estado terminal del resultado y lo
    /// descarga. La espera en sí es el long-poll del grid; aquí no se
    /// reintenta nada: un "no completada" del remoto es violación de
    /// protocolo, no un caso a repetir en silencio.
    pub async fn wait_and_fetch(&self, id: &ResultId) -> Result<Vec<u8>, ProtocolError> {
        let mut current = id.clone();

        for _ in 0..self.max_forward_depth {
            match self
                .grid
                .wait_for_availability(&self.session_id, &current)
                .await?
            {
                Availability::Available => {}
                Availability::Error { task_id, messages } => {
                    return Err(ProtocolError::RemoteTaskError { task_id, messages });
                }
                Availability::NotCompleted => {
                    return Err(ProtocolError::violation(format!(
                        "el grid reportó 'no completada' para {current} en una espera definida como bloqueante"
                    )));
                }
            }

            let bytes = self.grid.get_result(&self.session_id, &current).await?;

            // los bytes son opacos salvo que lleven el tag de reenvío
            match TaskPayload::from_bytes(&bytes) {
                Ok(TaskPayload::Forward { task_id }) => {
                    info!("resultado {} reenvía a la tarea {}", current, task_id);
                    current = task_id;
                }
                _ => return Ok(bytes),
            }
        }

        Err(ProtocolError::IndirectionLoop {
            depth: self.max_forward_depth,
        })
    }

    /// Igual que `wait_and_fetch` pero decodifica un valor terminal.
    pub async fn wait_and_fetch_value(&self, id: &ResultId) -> Result<i64, ProtocolError> {
        let bytes = self.wait_and_fetch(id).await?;
        match TaskPayload::from_bytes(&bytes)? {
            TaskPayload::Value { result } => Ok(result),
            other => Err(ProtocolError::violation(format!(
                "el resultado {id} no es un valor terminal sino {other:?}"
            ))),
        }
    }

    /// Espera cancelable del lado del cliente, independiente de la
    /// cancelación del servidor: si la señal remota se pierde, el caller
    /// no se queda bloqueado para siempre.
    pub async fn wait_and_fetch_timeout(
        &self,
        id: &ResultId,
        limit: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        match tokio::time::timeout(limit, self.wait_and_fetch(id)).await {
            Ok(res) => res,
            Err(_) => Err(ProtocolError::WaitTimeout {
                secs: limit.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{TaskId, TaskOptions, TaskRequest, TaskStatus};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Grid de mentira con resultados precargados por id. Permite elegir
    /// los ids a mano, cosa que el simulador real no deja (asigna uuids),
    /// y con eso armar cadenas de reenvío cíclicas.
    #[derive(Default)]
    struct FixedGrid {
        results: HashMap<ResultId, (Availability, Vec<u8>)>,
        waits: AtomicU32,
    }

    impl FixedGrid {
        fn with_value(mut self, id: &str, payload: TaskPayload) -> Self {
            self.results.insert(
                id.to_string(),
                (Availability::Available, payload.to_bytes().unwrap()),
            );
            self
        }

        fn with_availability(mut self, id: &str, av: Availability) -> Self {
            self.results.insert(id.to_string(), (av, Vec::new()));
            self
        }
    }

    #[async_trait]
    impl GridClient for FixedGrid {
        async fn create_session(&self, _: TaskOptions) -> Result<SessionId, ProtocolError> {
            Ok("s".to_string())
        }

        async fn create_tasks(
            &self,
            _: &SessionId,
            _: &[TaskId],
            _: Vec<TaskRequest>,
        ) -> Result<Vec<TaskId>, ProtocolError> {
            Err(ProtocolError::grid("no soportado"))
        }

        async fn submit_with_dependencies(
            &self,
            _: &SessionId,
            _: Vec<u8>,
            _: Vec<TaskId>,
            _: bool,
        ) -> Result<TaskId, ProtocolError> {
            Err(ProtocolError::grid("no soportado"))
        }

        async fn wait_for_availability(
            &self,
            _: &SessionId,
            id: &ResultId,
        ) -> Result<Availability, ProtocolError> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            match self.results.get(id) {
                Some((av, _)) => Ok(av.clone()),
                // un id sin cargar simula una espera que nunca termina
                None => {
                    loop {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                }
            }
        }

        async fn get_result(
            &self,
            _: &SessionId,
            id: &ResultId,
        ) -> Result<Vec<u8>, ProtocolError> {
            self.results
                .get(id)
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| ProtocolError::grid(format!("sin resultado {id}")))
        }

        async fn cancel_session(&self, _: &SessionId) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn count_tasks_by_status(
            &self,
            _: &SessionId,
            _: TaskStatus,
        ) -> Result<u32, ProtocolError> {
            Ok(0)
        }
    }

    fn waiter(grid: &FixedGrid) -> ResultWaiter<'_> {
        ResultWaiter::new(grid, "s".to_string())
    }

    /// Resultado disponible: se descargan y decodifican los bytes.
    #[tokio::test]
    async fn wait_and_fetch_devuelve_valor_disponible() {
        let grid = FixedGrid::default().with_value("a", TaskPayload::Value { result: 8 });
        let v = waiter(&grid).wait_and_fetch_value(&"a".to_string()).await;
        assert_eq!(v.unwrap(), 8);
    }

    /// Error de la tarea productora: se propaga como RemoteTaskError.
    #[tokio::test]
    async fn wait_and_fetch_propaga_error_remoto() {
        let grid = FixedGrid::default().with_availability(
            "a",
            Availability::Error {
                task_id: "t-roto".to_string(),
                messages: "se rompió".to_string(),
            },
        );
        let res = waiter(&grid).wait_and_fetch(&"a".to_string()).await;
        match res {
            Err(ProtocolError::RemoteTaskError { task_id, messages }) => {
                assert_eq!(task_id, "t-roto");
                assert_eq!(messages, "se rompió");
            }
            otro => panic!("esperaba RemoteTaskError, llegó {otro:?}"),
        }
    }

    /// "No completada" en una espera bloqueante: violación de protocolo,
    /// fatal y sin reintentos silenciosos.
    #[tokio::test]
    async fn wait_and_fetch_trata_not_completed_como_violacion() {
        let grid = FixedGrid::default().with_availability("a", Availability::NotCompleted);
        let res = waiter(&grid).wait_and_fetch(&"a".to_string()).await;
        assert!(matches!(
            res,
            Err(ProtocolError::ProtocolViolation { .. })
        ));
        // exactamente una consulta: nada de reintentar
        assert_eq!(grid.waits.load(Ordering::SeqCst), 1);
    }

    /// Una cadena de reenvíos corta se re-resuelve de forma transparente.
    #[tokio::test]
    async fn wait_and_fetch_sigue_cadena_de_reenvio() {
        let grid = FixedGrid::default()
            .with_value(
                "a",
                TaskPayload::Forward {
                    task_id: "b".to_string(),
                },
            )
            .with_value(
                "b",
                TaskPayload::Forward {
                    task_id: "c".to_string(),
                },
            )
            .with_value("c", TaskPayload::Value { result: 14 });

        let v = waiter(&grid).wait_and_fetch_value(&"a".to_string()).await;
        assert_eq!(v.unwrap(), 14);
    }

    /// Un ciclo de reenvíos se corta con IndirectionLoop al llegar al
    /// límite, en vez de colgarse.
    #[tokio::test]
    async fn wait_and_fetch_corta_ciclo_de_reenvio() {
        let grid = FixedGrid::default()
            .with_value(
                "a",
                TaskPayload::Forward {
                    task_id: "b".to_string(),
                },
            )
            .with_value(
                "b",
                TaskPayload::Forward {
                    task_id: "a".to_string(),
                },
            );

        let res = waiter(&grid).wait_and_fetch(&"a".to_string()).await;
        assert!(matches!(
            res,
            Err(ProtocolError::IndirectionLoop { depth: 16 })
        ));
    }

    /// Profundidad justo por debajo del límite: todavía resuelve.
    #[tokio::test]
    async fn wait_and_fetch_resuelve_profundidad_limite_menos_uno() {
        let mut grid = FixedGrid::default();
        // cadena f0 -> f1 -> ... -> f14 -> terminal: 15 saltos, 16 fetches
        for i in 0..15 {
            let next = if i == 14 {
                "terminal".to_string()
            } else {
                format!("f{}", i + 1)
            };
            grid = grid.with_value(&format!("f{i}"), TaskPayload::Forward { task_id: next });
        }
        grid = grid.with_value("terminal", TaskPayload::Value { result: 99 });

        let v = waiter(&grid).wait_and_fetch_value(&"f0".to_string()).await;
        assert_eq!(v.unwrap(), 99);
    }

    /// La espera del cliente es cancelable por timeout local aunque el
    /// grid nunca conteste.
    #[tokio::test]
    async fn wait_and_fetch_timeout_corta_espera_infinita() {
        let grid = FixedGrid::default();
        let res = waiter(&grid)
            .wait_and_fetch_timeout(&"nunca".to_string(), Duration::from_millis(50))
            .await;
        assert!(matches!(res, Err(ProtocolError::WaitTimeout { .. })));
    }
}
