//! `livemap marker put|delete|list`

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use livemap_core::source::MarkerRepository;
use livemap_core::types::{Marker, MarkerData, MarkerId};
use livemap_daemon::paths::{database_path, livemap_root};
use livemap_daemon::{request_create_or_update_marker, request_delete_marker, MarkerInput};
use livemap_db::Database;

use crate::CallerArgs;

#[derive(Subcommand, Debug)]
pub enum MarkerCommand {
    /// Create a marker, or update one with `--id`.
    Put(PutArgs),

    /// Soft-delete a marker.
    Delete(DeleteArgs),

    /// List visible markers straight from the database.
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct PutArgs {
    #[command(flatten)]
    pub caller: CallerArgs,

    /// Existing marker to overwrite.
    #[arg(long)]
    pub id: Option<u64>,

    /// Owning job; defaults to the caller's job.
    #[arg(long = "marker-job")]
    pub marker_job: Option<String>,

    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long, allow_hyphen_values = true)]
    pub x: f64,

    #[arg(long, allow_hyphen_values = true)]
    pub y: f64,

    #[arg(long)]
    pub color: Option<String>,

    /// Circle marker radius.
    #[arg(long, conflicts_with = "icon")]
    pub radius: Option<f64>,

    #[arg(long, requires = "radius")]
    pub opacity: Option<f32>,

    /// Icon marker name.
    #[arg(long)]
    pub icon: Option<String>,

    /// Expire the marker after this many minutes.
    #[arg(long = "expires-in")]
    pub expires_in_mins: Option<i64>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub id: u64,

    #[command(flatten)]
    pub caller: CallerArgs,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Restrict to these jobs (repeatable). Lists every job by default.
    #[arg(long = "job")]
    pub jobs: Vec<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(command: MarkerCommand) -> Result<()> {
    match command {
        MarkerCommand::Put(args) => put(args),
        MarkerCommand::Delete(args) => delete(args),
        MarkerCommand::List(args) => list(args),
    }
}

fn put(args: PutArgs) -> Result<()> {
    let home = super::home()?;
    let data = match (args.radius, args.icon) {
        (Some(radius), None) => MarkerData::Circle {
            radius,
            opacity: args.opacity,
        },
        (None, Some(icon)) => MarkerData::Icon { icon },
        _ => bail!("pass either --radius (circle) or --icon (icon)"),
    };
    let input = MarkerInput {
        id: args.id.map(MarkerId),
        job: args
            .marker_job
            .unwrap_or_else(|| args.caller.job.clone()),
        x: args.x,
        y: args.y,
        name: args.name,
        description: args.description,
        color: args.color,
        data,
        expires_at: args
            .expires_in_mins
            .map(|mins| Utc::now() + Duration::minutes(mins)),
    };

    let marker = request_create_or_update_marker(&home, args.caller.into(), input)
        .context("failed to save marker")?;
    println!("saved marker #{} ({})", marker.id, marker.name);
    Ok(())
}

fn delete(args: DeleteArgs) -> Result<()> {
    let home = super::home()?;
    let marker = request_delete_marker(&home, args.caller.into(), MarkerId(args.id))
        .context("failed to delete marker")?;
    println!("deleted marker #{}", marker.id);
    Ok(())
}

#[derive(Tabled)]
struct MarkerRow {
    #[tabled(rename = "id")]
    id: u64,
    #[tabled(rename = "job")]
    job: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "kind")]
    kind: &'static str,
    #[tabled(rename = "position")]
    position: String,
    #[tabled(rename = "creator")]
    creator: String,
    #[tabled(rename = "expires")]
    expires: String,
}

impl From<&Marker> for MarkerRow {
    fn from(marker: &Marker) -> Self {
        Self {
            id: marker.id.0,
            job: marker.job.clone(),
            name: marker.name.clone(),
            kind: marker.data.kind(),
            position: format!("{:.1}, {:.1}", marker.x, marker.y),
            creator: marker
                .creator
                .as_ref()
                .map(|c| c.user_id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            expires: marker
                .expires_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string()),
        }
    }
}

fn list(args: ListArgs) -> Result<()> {
    let home = super::home()?;
    let root = livemap_root(&home);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    let db = Database::open(database_path(&home)).context("failed to open database")?;

    let now = Utc::now();
    let markers: Vec<Marker> = db
        .list_markers(&args.jobs, now)
        .context("failed to list markers")?
        .into_iter()
        .filter(|m| m.is_visible_at(now))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&markers)?);
        return Ok(());
    }
    if markers.is_empty() {
        println!("No markers.");
        return Ok(());
    }

    let rows: Vec<MarkerRow> = markers.iter().map(MarkerRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
