use super::open_database;
use anyhow::{bail, Result};
use gsched::config::Config;
use gsched::core::scheduler::{cancel_job, CancelOutcome};

pub fn handle_cancel(config: &Config, id: u32) -> Result<()> {
    let db = open_database(config)?;
    match cancel_job(&*db, id)? {
        CancelOutcome::Cancelled {
            previous,
            signalled,
        } => {
            if signalled {
                println!("Job {id} cancelled (was {previous}, process group signalled)");
            } else {
                println!("Job {id} cancelled (was {previous})");
            }
        }
        CancelOutcome::AlreadyFinished(state) => {
            println!("Job {id} is already {state}");
        }
        CancelOutcome::NotFound => bail!("Job {id} not found"),
    }
    Ok(())
}
