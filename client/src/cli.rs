use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use common::{GridClient, TaskOptions};
use gridsim::{GridSim, GridSimConfig};

use crate::runs;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Demos del protocolo de grafos de tareas contra un grid en memoria")]
struct Cli {
    /// Semilla del generador de fallos inyectados del worker
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Tareas ejecutando a la vez en el grid simulado
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Suma de cuadrados con subtareas recursivas
    Square {
        #[arg(value_name = "NUMEROS", num_args = 1.., default_values_t = vec![1i64, 2, 3])]
        numbers: Vec<i64>,
    },
    /// Cubo directo de un valor, sin descomposición
    Cube {
        #[arg(value_name = "VALOR", default_value_t = 2)]
        value: i64,
    },
    /// 1 job de N tareas hoja con agregación fan-in
    Fanin {
        #[arg(value_name = "TAREAS", default_value_t = 5)]
        tasks: u32,
    },
    /// N jobs independientes de 1 tarea, esperados en paralelo
    Batch {
        #[arg(value_name = "JOBS", default_value_t = 10)]
        jobs: u32,

        /// Cadenas en vuelo a la vez como máximo
        #[arg(long, default_value_t = 4)]
        parallel: usize,
    },
    /// Fan-out dirigido por el worker desde una tarea raíz
    JobOfTasks {
        #[arg(value_name = "TAREAS", default_value_t = 5)]
        tasks: u32,
    },
    /// Cancela una sesión en vuelo y sondea el saldo final
    Cancel {
        #[arg(value_name = "TAREAS", default_value_t = 10)]
        tasks: u32,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let sim = GridSim::new(GridSimConfig {
        max_concurrency: cli.concurrency,
        seed: cli.seed,
    });
    let session = sim.create_session(TaskOptions::default()).await?;
    info!("sesión nueva: {}", session);

    match cli.command {
        Commands::Square { numbers } => {
            let v = runs::square_with_subtasking(&sim, &session, numbers.clone()).await?;
            println!("Suma de cuadrados de {:?}:", numbers);
            println!("  resultado: {}", v);
        }

        Commands::Cube { value } => {
            let v = runs::cube_direct(&sim, &session, value).await?;
            println!("Cubo de {}:", value);
            println!("  resultado: {}", v);
        }

        Commands::Fanin { tasks } => {
            let v = runs::one_job_of_n_tasks(&sim, &session, tasks).await?;
            println!("1 job de {} tareas con fan-in:", tasks);
            println!("  resultado agregado: {}", v);
        }

        Commands::Batch { jobs, parallel } => {
            let grid: Arc<dyn GridClient> = Arc::new(sim);
            let v = runs::n_jobs_of_one_task(grid, &session, jobs, parallel).await?;
            println!("{} jobs de 1 tarea (paralelo={}):", jobs, parallel);
            println!("  resultado agregado: {}", v);
        }

        Commands::JobOfTasks { tasks } => {
            let v = runs::job_of_tasks(&sim, &session, tasks).await?;
            println!("Fan-out del worker con {} tareas hoja:", tasks);
            println!("  resultado agregado: {}", v);
        }

        Commands::Cancel { tasks } => {
            let tally = runs::cancel_in_flight(&sim, &session, tasks).await?;
            println!("Sesión cancelada con {} tareas sometidas:", tasks);
            println!("  completadas: {}", tally.completed);
            println!("  canceladas : {}", tally.cancelled);
            println!("  en error   : {}", tally.errored);
            println!("  corriendo  : {}", tally.running);
            println!("  total      : {}", tally.total());
        }
    }

    Ok(())
}
