//! Database migration runner for Vellum.
//!
//! Usage:
//!   migrator up [N]     - Apply pending migrations (all, or the next N)
//!   migrator down [N]   - Roll back the last N migrations (default 1)
//!   migrator status     - Show migration status
//!   migrator fresh      - Drop all tables and re-apply every migration
//!
//! The connection is read from configuration: `config/default`,
//! `config/{RUN_MODE}`, then `VELLUM__DATABASE__URL`.

use anyhow::{Context, Result, bail};
use sea_orm_migration::MigratorTrait;
use tracing::info;
use vellum_db::migration::Migrator;
use vellum_shared::AppConfig;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Up(Option<u32>),
    Down(u32),
    Status,
    Fresh,
}

impl Command {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let command = args.next().unwrap_or_else(|| "up".to_string());
        let steps = args
            .next()
            .map(|n| {
                n.parse::<u32>()
                    .with_context(|| format!("invalid step count '{n}'"))
            })
            .transpose()?;

        match command.as_str() {
            "up" => Ok(Self::Up(steps)),
            "down" => Ok(Self::Down(steps.unwrap_or(1))),
            "status" => Ok(Self::Status),
            "fresh" => Ok(Self::Fresh),
            other => bail!("unknown command '{other}', expected up, down, status or fresh"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();
    vellum_shared::telemetry::init_tracing("info");

    let command = Command::parse(std::env::args().skip(1))?;
    let config = AppConfig::load().context("failed to load configuration")?;
    let db = vellum_db::connect_with(&config.database)
        .await
        .context("failed to connect to database")?;

    match command {
        Command::Up(steps) => {
            Migrator::up(&db, steps).await?;
            info!(?steps, "migrations applied");
        }
        Command::Down(steps) => {
            Migrator::down(&db, Some(steps)).await?;
            info!(steps, "migrations rolled back");
        }
        Command::Status => Migrator::status(&db).await?,
        Command::Fresh => {
            Migrator::fresh(&db).await?;
            info!("database recreated");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        Command::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn test_defaults_to_up() {
        assert_eq!(parse(&[]).expect("parses"), Command::Up(None));
    }

    #[test]
    fn test_step_counts() {
        assert_eq!(parse(&["up", "2"]).expect("parses"), Command::Up(Some(2)));
        assert_eq!(parse(&["down"]).expect("parses"), Command::Down(1));
        assert_eq!(parse(&["down", "3"]).expect("parses"), Command::Down(3));
    }

    #[test]
    fn test_rejects_unknown_input() {
        assert!(parse(&["sideways"]).is_err());
        assert!(parse(&["up", "many"]).is_err());
    }
}
