//! CLI definitions for the `warden` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use warden_scheduler::ActiveHours;

/// Warden: recurring scraping jobs and browser process cleanup.
#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Durable job scheduler with browser process reaping")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (falls back to WARDEN_CONFIG, then ~/.warden/warden.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler and reaper in the foreground (default)
    Run,

    /// Manage persisted schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Sweep managed browser processes once
    Reap {
        /// Report what would be killed without signalling anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum ScheduleAction {
    /// Create a schedule
    Add {
        /// Subject the job runs for
        #[arg(long)]
        subject: String,

        /// Job type tag, routed to a `[tasks.<job_type>]` command
        #[arg(long)]
        job_type: String,

        /// Hours between runs
        #[arg(long)]
        interval_hours: f64,

        /// Hourly firing restricted to a UTC window, e.g. `8-18`
        #[arg(long, value_parser = parse_active_hours)]
        active_hours: Option<ActiveHours>,

        /// Store the schedule without activating it
        #[arg(long)]
        disabled: bool,
    },

    /// List every schedule with its derived status
    List,

    /// Show one schedule
    Status {
        /// Schedule ID
        id: String,
    },

    /// Show recent executions, newest first
    History {
        /// Schedule ID
        id: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Change a schedule's trigger or enabled flag
    Update(UpdateArgs),

    /// Delete a schedule and its history
    Remove {
        /// Schedule ID
        id: String,
    },
}

#[derive(Args)]
pub(crate) struct UpdateArgs {
    /// Schedule ID
    pub id: String,

    #[arg(long)]
    pub interval_hours: Option<f64>,

    #[arg(long, value_parser = parse_active_hours, conflicts_with = "clear_active_hours")]
    pub active_hours: Option<ActiveHours>,

    /// Go back to plain interval firing
    #[arg(long)]
    pub clear_active_hours: bool,

    #[arg(long, conflicts_with = "disable")]
    pub enable: bool,

    #[arg(long)]
    pub disable: bool,
}

/// Parse `S-E` into an active-hours window.
pub(crate) fn parse_active_hours(raw: &str) -> Result<ActiveHours, String> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got `{raw}`"))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u8>()
            .map_err(|e| format!("invalid hour `{s}`: {e}"))
    };
    let hours = ActiveHours::new(parse(start)?, parse(end)?);
    hours.validate().map_err(|e| e.to_string())?;
    Ok(hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn active_hours_parse() {
        assert_eq!(parse_active_hours("8-18").unwrap(), ActiveHours::new(8, 18));
        assert_eq!(parse_active_hours(" 0 - 23 ").unwrap(), ActiveHours::new(0, 23));
        assert!(parse_active_hours("18-8").is_err());
        assert!(parse_active_hours("8").is_err());
        assert!(parse_active_hours("8-24").is_err());
    }

    #[test]
    fn update_flags_conflict() {
        let parsed =
            Cli::try_parse_from(["warden", "schedule", "update", "x", "--enable", "--disable"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "warden",
            "schedule",
            "update",
            "x",
            "--active-hours",
            "6-9",
            "--clear-active-hours",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn add_parses_window() {
        let cli = Cli::try_parse_from([
            "warden",
            "schedule",
            "add",
            "--subject",
            "acme",
            "--job-type",
            "scrape",
            "--interval-hours",
            "1.5",
            "--active-hours",
            "9-17",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Schedule {
                action:
                    ScheduleAction::Add {
                        active_hours,
                        interval_hours,
                        disabled,
                        ..
                    },
            }) => {
                assert_eq!(active_hours, Some(ActiveHours::new(9, 17)));
                assert_eq!(interval_hours, 1.5);
                assert!(!disabled);
            }
            _ => panic!("expected schedule add"),
        }
    }
}
